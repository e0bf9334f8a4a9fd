//! `StatsSink` implementation that records every event as a structured
//! `tracing` span, for deployments with no external metrics collector.

use async_trait::async_trait;
use tracing::info;

use crate::domain::ports::{SchedulerEvent, StatsSink};

#[derive(Debug, Clone, Default)]
pub struct LoggingStatsSink;

impl LoggingStatsSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StatsSink for LoggingStatsSink {
    async fn emit(&self, event: SchedulerEvent) -> anyhow::Result<()> {
        match event {
            SchedulerEvent::Schedule { request_id } => {
                info!(request_id, "schedule");
            }
            SchedulerEvent::Reap { request_id, try_number, bot_id } => {
                info!(request_id, try_number, %bot_id, "reap");
            }
            SchedulerEvent::Complete { request_id, try_number, failure } => {
                info!(request_id, try_number, failure, "complete");
            }
            SchedulerEvent::Expire { request_id } => {
                info!(request_id, "expire");
            }
            SchedulerEvent::BotDied { request_id, try_number, bot_id } => {
                info!(request_id, try_number, %bot_id, "bot_died");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_never_fails() {
        let sink = LoggingStatsSink::new();
        sink.emit(SchedulerEvent::Schedule { request_id: 1 }).await.unwrap();
    }
}
