//! Port for the external stats collector. Failures here are logged and
//! dropped per the propagation policy — they never abort a state
//! transition.

use async_trait::async_trait;

/// Events the scheduler emits. Mirrors the five events named in the
/// external interfaces section.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Schedule { request_id: u64 },
    Reap { request_id: u64, try_number: u32, bot_id: String },
    Complete { request_id: u64, try_number: u32, failure: bool },
    Expire { request_id: u64 },
    BotDied { request_id: u64, try_number: u32, bot_id: String },
}

#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn emit(&self, event: SchedulerEvent) -> anyhow::Result<()>;
}
