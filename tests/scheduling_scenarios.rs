//! End-to-end scenarios: one test per numbered scenario in the scheduling
//! engine's behavioral specification.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use swarmsched::adapters::sqlite::{create_migrated_test_pool, SqliteRequestStore, SqliteResultTracker, SqliteRunQueue};
use swarmsched::adapters::stats::LoggingStatsSink;
use swarmsched::domain::models::{DataRef, NewTaskRequest, TaskProperties, TaskState};
use swarmsched::domain::ports::{AllowAll, CallerContext, ResultTracker, RunQueue, SchedulerSettings};
use swarmsched::Scheduler;

struct Harness {
    scheduler: Scheduler,
    results: Arc<SqliteResultTracker>,
    queue: Arc<SqliteRunQueue>,
    pool: SqlitePool,
}

async fn harness(settings: SchedulerSettings) -> Harness {
    let pool = create_migrated_test_pool().await.unwrap();
    let requests = Arc::new(SqliteRequestStore::new(pool.clone()));
    let queue = Arc::new(SqliteRunQueue::new(pool.clone()));
    let results = Arc::new(SqliteResultTracker::new(pool.clone()));
    let scheduler = Scheduler::new(requests, queue.clone(), results.clone(), Arc::new(LoggingStatsSink), settings).unwrap();
    Harness { scheduler, results, queue, pool }
}

fn dims(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn bot_dims(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
        .collect()
}

fn request(idempotent: bool, exp_secs: i64) -> NewTaskRequest {
    NewTaskRequest {
        name: "build".into(),
        user: "alice".into(),
        priority: 50,
        properties: TaskProperties {
            commands: vec![vec!["make".into()]],
            data: Vec::<DataRef>::new(),
            dimensions: dims(&[("OS", "Win-3.1.1")]),
            env: BTreeMap::new(),
            execution_timeout_secs: 60,
            io_timeout_secs: 60,
            idempotent,
        },
        scheduling_expiration_secs: exp_secs,
        parent_task_id: None,
        tags: Vec::new(),
    }
}

#[tokio::test]
async fn scenario_1_happy_path() {
    let h = harness(SchedulerSettings::default()).await;
    let caller = CallerContext::new("alice");

    h.scheduler.schedule_request(request(false, 60), &caller, &AllowAll).await.unwrap();

    let bot = bot_dims(&[("OS", &["Win", "Win-3.1.1"])]);
    let (req, run) = h.scheduler.bot_reap_task(&bot, "bot-1", "v1").await.unwrap().unwrap();

    let (accepted, terminal) = h
        .scheduler
        .bot_update_task(req.id, run.try_number, "bot-1", b"ok", 0, 0, Some(0), Some(0.1), false, false, 0.1)
        .await
        .unwrap();
    assert!(accepted);
    assert!(terminal);

    let summary = h.results.get_summary(req.id).await.unwrap();
    assert_eq!(summary.state, TaskState::Completed);
    assert!(!summary.failure);
    assert_eq!(summary.try_number, Some(1));
    assert_eq!(summary.costs_usd, vec![0.1]);
    assert_eq!(summary.exit_codes, vec![0]);
    assert_eq!(summary.durations, vec![0.1]);
}

#[tokio::test]
async fn scenario_2_dedup_within_window() {
    let h = harness(SchedulerSettings::default()).await;
    let caller = CallerContext::new("alice");

    h.scheduler.schedule_request(request(true, 60), &caller, &AllowAll).await.unwrap();
    let bot = bot_dims(&[("OS", &["Win", "Win-3.1.1"])]);
    let (req1, run1) = h.scheduler.bot_reap_task(&bot, "bot-1", "v1").await.unwrap().unwrap();
    h.scheduler
        .bot_update_task(req1.id, run1.try_number, "bot-1", b"ok", 0, 0, Some(0), Some(0.1), false, false, 0.1)
        .await
        .unwrap();

    let second = h.scheduler.schedule_request(request(true, 60), &caller, &AllowAll).await.unwrap();
    assert_eq!(second.state, TaskState::Completed);
    assert_eq!(second.try_number, Some(0));
    assert!(second.deduped_from.is_some());
    assert_eq!(second.cost_saved_usd, Some(0.1));
    assert!(second.properties_hash.is_none());

    // A dedup hit must never materialize a TaskToRun: claim() finds nothing to win.
    let claimed = h.queue.claim(second.request_id).await.unwrap();
    assert!(!claimed, "no TaskToRun should exist for a dedup hit");
}

#[tokio::test]
async fn scenario_3_dedup_stale_schedules_fresh() {
    let settings = SchedulerSettings { reusable_task_age_secs: 0, ..SchedulerSettings::default() };
    let h = harness(settings).await;
    let caller = CallerContext::new("alice");

    h.scheduler.schedule_request(request(true, 60), &caller, &AllowAll).await.unwrap();
    let bot = bot_dims(&[("OS", &["Win", "Win-3.1.1"])]);
    let (req1, run1) = h.scheduler.bot_reap_task(&bot, "bot-1", "v1").await.unwrap().unwrap();
    h.scheduler
        .bot_update_task(req1.id, run1.try_number, "bot-1", b"ok", 0, 0, Some(0), Some(0.1), false, false, 0.1)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = h.scheduler.schedule_request(request(true, 60), &caller, &AllowAll).await.unwrap();
    assert_eq!(second.try_number, None);
    assert!(second.deduped_from.is_none());
    assert_eq!(second.state, TaskState::Pending);

    let claimed = h.queue.claim(second.request_id).await.unwrap();
    assert!(claimed, "a fresh TaskToRun should exist");
}

#[tokio::test]
async fn scenario_4_bot_died_then_succeeds() {
    let settings = SchedulerSettings { bot_ping_tolerance_secs: 0, ..SchedulerSettings::default() };
    let h = harness(settings).await;
    let caller = CallerContext::new("alice");

    h.scheduler.schedule_request(request(false, 3600), &caller, &AllowAll).await.unwrap();
    let bot = bot_dims(&[("OS", &["Win", "Win-3.1.1"])]);
    let (req, run1) = h.scheduler.bot_reap_task(&bot, "bot-1", "v1").await.unwrap().unwrap();
    assert_eq!(run1.try_number, 1);

    let (retried, terminal, denied) = h.scheduler.cron_handle_bot_died().await.unwrap();
    assert_eq!(retried, 1);
    assert_eq!(terminal, 0);
    assert_eq!(denied, 1);

    let (_, run2) = h.scheduler.bot_reap_task(&bot, "bot-2", "v1").await.unwrap().unwrap();
    assert_eq!(run2.try_number, 2);
    let (_, terminal) = h
        .scheduler
        .bot_update_task(req.id, run2.try_number, "bot-2", b"ok", 0, 0, Some(0), Some(0.1), false, false, 0.1)
        .await
        .unwrap();
    assert!(terminal);

    let summary = h.results.get_summary(req.id).await.unwrap();
    assert_eq!(summary.state, TaskState::Completed);
    assert_eq!(summary.try_number, Some(2));
    assert_eq!(summary.costs_usd, vec![0.0, 0.1]);
}

#[tokio::test]
async fn scenario_4_same_bot_is_never_handed_the_retry() {
    let settings = SchedulerSettings { bot_ping_tolerance_secs: 0, ..SchedulerSettings::default() };
    let h = harness(settings).await;
    let caller = CallerContext::new("alice");

    h.scheduler.schedule_request(request(false, 3600), &caller, &AllowAll).await.unwrap();
    let bot = bot_dims(&[("OS", &["Win", "Win-3.1.1"])]);
    h.scheduler.bot_reap_task(&bot, "bot-1", "v1").await.unwrap().unwrap();
    h.scheduler.cron_handle_bot_died().await.unwrap();

    let reaped = h.scheduler.bot_reap_task(&bot, "bot-1", "v1").await.unwrap();
    assert!(reaped.is_none(), "the bot that just died on this request must not be handed the retry");
}

#[tokio::test]
async fn scenario_5_expire() {
    let h = harness(SchedulerSettings::default()).await;
    let caller = CallerContext::new("alice");

    let summary = h.scheduler.schedule_request(request(false, 60), &caller, &AllowAll).await.unwrap();

    // Force the TaskToRun's expiration into the past instead of sleeping 61s.
    sqlx::query("UPDATE task_to_run SET expiration_ts = ? WHERE request_id = ?")
        .bind((Utc::now() - chrono::Duration::seconds(1)).to_rfc3339())
        .bind(summary.request_id as i64)
        .execute(&h.pool)
        .await
        .unwrap();

    let aborted = h.scheduler.cron_abort_expired_task_to_run().await.unwrap();
    assert_eq!(aborted, 1);

    let summary = h.results.get_summary(summary.request_id).await.unwrap();
    assert_eq!(summary.state, TaskState::Expired);
    assert!(summary.abandoned_ts.is_some());
    assert_eq!(summary.try_number, None);
}

#[tokio::test]
async fn scenario_6_output_reassembly_with_holes() {
    let h = harness(SchedulerSettings::default()).await;
    let caller = CallerContext::new("alice");

    h.scheduler.schedule_request(request(false, 60), &caller, &AllowAll).await.unwrap();
    let bot = bot_dims(&[("OS", &["Win", "Win-3.1.1"])]);
    let (req, run) = h.scheduler.bot_reap_task(&bot, "bot-1", "v1").await.unwrap().unwrap();

    // Write "Bar" at offset 0 and "Foo" at offset 10, leaving a 7-byte hole.
    h.scheduler
        .bot_update_task(req.id, run.try_number, "bot-1", b"Foo", 0, 10, None, None, false, false, 0.0)
        .await
        .unwrap();
    h.scheduler
        .bot_update_task(req.id, run.try_number, "bot-1", b"Bar", 0, 0, None, None, false, false, 0.0)
        .await
        .unwrap();

    let output = h.results.get_output(req.id, run.try_number, 0, 1024 * 1024).await.unwrap();
    let mut expected = b"Bar".to_vec();
    expected.extend(std::iter::repeat(0u8).take(7));
    expected.extend(b"Foo");
    assert_eq!(output, expected);
}
