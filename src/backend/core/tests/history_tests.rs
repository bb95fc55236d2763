//! History retention through the `system.history_retention` job.

use cadence_core::clock::{Clock, ManualClock};
use cadence_core::config::Config;
use cadence_core::jobs::builtin::HISTORY_RETENTION_JOB;
use cadence_core::jobs::{handler_fn, JobEngine, JobId, JobOutcome, JobStatus, NewJob};
use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio_test::assert_err;

fn engine_with(clock: Arc<ManualClock>, retention_days: u32, batch_size: usize) -> JobEngine {
    let mut config = Config::default();
    config.system_jobs.auto_init = false;
    config.history.retention_days = retention_days;
    config.history.batch_size = batch_size;

    JobEngine::builder(config)
        .with_clock(clock)
        .register("emails.send", handler_fn(|_ctx| async { JobOutcome::Success }))
        .build()
        .unwrap()
}

async fn run_once(engine: &JobEngine, job_type: &str) -> JobId {
    let id = engine.enqueue(NewJob::new(job_type)).await.unwrap();
    engine.tick().await.unwrap();
    engine.pool().join_all().await;
    id
}

#[tokio::test]
async fn test_sweep_removes_history_older_than_thirty_days() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()));
    let engine = engine_with(clock.clone(), 30, 500);

    let old = run_once(&engine, "emails.send").await;
    clock.advance(Duration::days(20));
    let recent = run_once(&engine, "emails.send").await;
    clock.advance(Duration::days(20));

    assert_eq!(engine.executions(old).await.unwrap().len(), 1);

    let sweep = run_once(&engine, HISTORY_RETENTION_JOB).await;
    assert_eq!(engine.get(sweep).await.unwrap().status, JobStatus::Succeeded);

    // 40 days old: gone with its execution records
    assert_err!(engine.get(old).await);
    assert!(engine.executions(old).await.unwrap().is_empty());

    // 20 days old: kept
    assert_eq!(engine.get(recent).await.unwrap().status, JobStatus::Succeeded);
    assert_eq!(engine.executions(recent).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_retention_window_is_configurable() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()));
    let engine = engine_with(clock.clone(), 7, 500);

    let week_old = run_once(&engine, "emails.send").await;
    clock.advance(Duration::days(8));

    run_once(&engine, HISTORY_RETENTION_JOB).await;
    assert_err!(engine.get(week_old).await);
}

#[tokio::test]
async fn test_backlog_is_deleted_in_batches() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()));
    let engine = engine_with(clock.clone(), 30, 3);

    let mut old = Vec::new();
    for _ in 0..10 {
        old.push(engine.enqueue(NewJob::new("emails.send")).await.unwrap());
    }
    // default capacity is 10
    engine.tick().await.unwrap();
    engine.pool().join_all().await;
    clock.advance(Duration::days(31));

    run_once(&engine, HISTORY_RETENTION_JOB).await;

    for id in old {
        assert_err!(engine.get(id).await);
    }
}

#[tokio::test]
async fn test_pending_jobs_survive_sweep() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()));
    let engine = engine_with(clock.clone(), 30, 500);

    let far_future = clock.now() + Duration::days(365);
    let waiting = engine
        .enqueue(NewJob::new("emails.send").scheduled_for(far_future))
        .await
        .unwrap();
    clock.advance(Duration::days(60));

    run_once(&engine, HISTORY_RETENTION_JOB).await;
    assert_eq!(engine.get(waiting).await.unwrap().status, JobStatus::Pending);
}
