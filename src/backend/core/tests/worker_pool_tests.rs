//! Worker pool behaviour through the engine.
//!
//! Tests cover:
//! - Capacity bound under load
//! - Retry budget exhaustion (three retries, then dead on attempt four)
//! - Deadline enforcement freeing the slot
//! - Payload decoding failures

use cadence_core::clock::{Clock, ManualClock};
use cadence_core::config::Config;
use cadence_core::jobs::{
    handler_fn, ExecutionOutcome, FailureKind, JobEngine, JobFilter, JobOutcome, JobStatus, NewJob,
};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_config(capacity: usize) -> Config {
    let mut config = Config::default();
    config.system_jobs.auto_init = false;
    config.scheduler.max_concurrent_jobs = capacity;
    config.retry.base_delay_secs = 1;
    config.retry.max_delay_secs = 10;
    config
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_jobs_never_exceed_capacity() {
    let active = Arc::new(AtomicUsize::new(0));
    let observed_max = Arc::new(AtomicUsize::new(0));

    let handler = {
        let active = Arc::clone(&active);
        let observed_max = Arc::clone(&observed_max);
        handler_fn(move |_ctx| {
            let active = Arc::clone(&active);
            let observed_max = Arc::clone(&observed_max);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                JobOutcome::Success
            }
        })
    };

    let engine = JobEngine::builder(test_config(2))
        .register("work", handler)
        .build()
        .unwrap();

    for _ in 0..6 {
        engine.enqueue(NewJob::new("work")).await.unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let report = engine.tick().await.unwrap();
        assert!(report.claimed <= 2);

        let done = engine
            .list(&JobFilter::new().with_status(JobStatus::Succeeded))
            .await
            .unwrap();
        if done.len() == 6 {
            break;
        }
        assert!(Instant::now() < deadline, "jobs did not finish in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.pool().join_all().await;

    assert!(observed_max.load(Ordering::SeqCst) <= 2);
    let stats = engine.pool().stats();
    assert!(stats.peak <= 2);
    assert_eq!(stats.succeeded, 6);
    assert_eq!(engine.pool().available(), 2);
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_three_retries_then_dead() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()));
    let engine = JobEngine::builder(test_config(1))
        .with_clock(clock.clone())
        .register(
            "flaky",
            handler_fn(|_ctx| async { JobOutcome::retryable("upstream unavailable") }),
        )
        .build()
        .unwrap();

    let id = engine.enqueue(NewJob::new("flaky")).await.unwrap();
    assert_eq!(engine.get(id).await.unwrap().max_retries, 3);

    for expected_attempt in 1..=4u32 {
        let report = engine.tick().await.unwrap();
        assert_eq!(report.claimed, 1, "attempt {} was not dispatched", expected_attempt);
        engine.pool().join_all().await;

        let job = engine.get(id).await.unwrap();
        assert_eq!(job.attempt, expected_attempt);
        if expected_attempt < 4 {
            assert_eq!(job.status, JobStatus::Pending);
            assert!(job.scheduled_at > clock.now());
        }
        clock.advance(chrono::Duration::minutes(5));
    }

    let job = engine.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempt, 4);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Retryable);

    let records = engine.executions(id).await.unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.outcome == ExecutionOutcome::Failed));
    assert_eq!(
        records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );

    // dead jobs are never picked up again
    clock.advance(chrono::Duration::days(1));
    assert_eq!(engine.tick().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn test_fatal_failure_skips_retries() {
    let engine = JobEngine::builder(test_config(1))
        .register("broken", handler_fn(|_ctx| async { JobOutcome::fatal("bad input") }))
        .build()
        .unwrap();

    let id = engine.enqueue(NewJob::new("broken").with_max_retries(5)).await.unwrap();
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    let job = engine.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn test_undecodable_payload_is_fatal() {
    #[derive(Deserialize)]
    struct Report {
        #[allow(dead_code)]
        report_id: u64,
    }

    let engine = JobEngine::builder(test_config(1))
        .register(
            "reports.generate",
            handler_fn(|ctx| async move {
                match ctx.payload_as::<Report>() {
                    Ok(_) => JobOutcome::Success,
                    Err(e) => JobOutcome::Fatal(e),
                }
            }),
        )
        .build()
        .unwrap();

    let id = engine
        .enqueue(NewJob::new("reports.generate").with_payload(serde_json::json!({"report_id": "seven"})))
        .await
        .unwrap();
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    let job = engine.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.last_error.unwrap().code.as_deref(), Some("BAD_PAYLOAD"));
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test]
async fn test_timeout_frees_slot() {
    let engine = JobEngine::builder(test_config(1))
        .register(
            "hang",
            handler_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                JobOutcome::Success
            }),
        )
        .register("quick", handler_fn(|_ctx| async { JobOutcome::Success }))
        .build()
        .unwrap();

    let hung = engine
        .enqueue(NewJob::new("hang").with_timeout(1).with_max_retries(0))
        .await
        .unwrap();

    let started = Instant::now();
    assert_eq!(engine.tick().await.unwrap().claimed, 1);
    assert_eq!(engine.pool().available(), 0);
    engine.pool().join_all().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(engine.pool().available(), 1);

    let job = engine.get(hung).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Timeout);
    let records = engine.executions(hung).await.unwrap();
    assert_eq!(records[0].outcome, ExecutionOutcome::TimedOut);

    // the freed slot is usable
    let next = engine.enqueue(NewJob::new("quick")).await.unwrap();
    assert_eq!(engine.tick().await.unwrap().claimed, 1);
    engine.pool().join_all().await;
    assert_eq!(engine.get(next).await.unwrap().status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_timed_out_job_is_retried() {
    let engine = JobEngine::builder(test_config(1))
        .register(
            "slow",
            handler_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                JobOutcome::Success
            }),
        )
        .build()
        .unwrap();

    let id = engine
        .enqueue(NewJob::new("slow").with_timeout(1).with_max_retries(2))
        .await
        .unwrap();
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    let job = engine.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.last_error.unwrap().kind, FailureKind::Timeout);
}
