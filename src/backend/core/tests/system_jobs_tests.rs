//! System job and recurrence tests.
//!
//! Tests cover:
//! - Recurring jobs re-enqueued at the next fire time
//! - System job seeding and execution through the engine
//! - Default resolution for system job timeouts
//! - Caller handlers replacing built-in ones
//! - Replaced maintenance handlers keeping their exclusivity

use async_trait::async_trait;
use cadence_core::clock::ManualClock;
use cadence_core::config::{Config, JobTypeConfig};
use cadence_core::db::MaintenanceBackend;
use cadence_core::jobs::builtin::{DB_MAINTENANCE_JOB, HEALTH_CHECK_JOB, HISTORY_RETENTION_JOB};
use cadence_core::jobs::{handler_fn, JobEngine, JobFilter, JobOutcome, JobStatus, NewJob};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

#[derive(Default)]
struct RecordingMaintenance {
    calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl MaintenanceBackend for RecordingMaintenance {
    async fn vacuum(&self, full: bool) -> cadence_core::Result<()> {
        self.calls.lock().push(if full { "vacuum_full" } else { "vacuum" });
        Ok(())
    }

    async fn reindex(&self) -> cadence_core::Result<()> {
        self.calls.lock().push("reindex");
        Ok(())
    }
}

async fn pending_of(engine: &JobEngine, job_type: &str) -> Vec<cadence_core::jobs::Job> {
    engine
        .list(&JobFilter::new().with_status(JobStatus::Pending).with_type(job_type))
        .await
        .unwrap()
}

// ============================================================================
// Recurrence
// ============================================================================

#[tokio::test]
async fn test_hourly_job_recurs_at_next_boundary() {
    let clock = Arc::new(ManualClock::new(at(2024, 5, 6, 10, 20)));
    let mut config = Config::default();
    config.system_jobs.auto_init = false;

    let engine = JobEngine::builder(config)
        .with_clock(clock.clone())
        .register("reports.hourly", handler_fn(|_ctx| async { JobOutcome::Success }))
        .build()
        .unwrap();

    let first = engine
        .enqueue(NewJob::new("reports.hourly").with_schedule("@hourly"))
        .await
        .unwrap();
    assert_eq!(engine.get(first).await.unwrap().scheduled_at, at(2024, 5, 6, 11, 0));

    // not due yet
    assert_eq!(engine.tick().await.unwrap().due, 0);

    clock.set(at(2024, 5, 6, 11, 0));
    assert_eq!(engine.tick().await.unwrap().claimed, 1);
    engine.pool().join_all().await;

    assert_eq!(engine.get(first).await.unwrap().status, JobStatus::Succeeded);

    let next = pending_of(&engine, "reports.hourly").await;
    assert_eq!(next.len(), 1);
    assert_ne!(next[0].id, first);
    assert_eq!(next[0].scheduled_at, at(2024, 5, 6, 12, 0));
    assert_eq!(next[0].cron_expression.as_deref(), Some("@hourly"));
}

#[tokio::test]
async fn test_dead_recurring_job_still_recurs() {
    let clock = Arc::new(ManualClock::new(at(2024, 5, 6, 10, 0)));
    let mut config = Config::default();
    config.system_jobs.auto_init = false;

    let engine = JobEngine::builder(config)
        .with_clock(clock.clone())
        .register("feeds.poll", handler_fn(|_ctx| async { JobOutcome::fatal("feed gone") }))
        .build()
        .unwrap();

    let first = engine
        .enqueue(NewJob::new("feeds.poll").with_schedule("*/15 * * * *"))
        .await
        .unwrap();

    clock.set(at(2024, 5, 6, 10, 15));
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    assert_eq!(engine.get(first).await.unwrap().status, JobStatus::Dead);
    let next = pending_of(&engine, "feeds.poll").await;
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].scheduled_at, at(2024, 5, 6, 10, 30));
}

#[tokio::test]
async fn test_one_off_job_does_not_recur() {
    let mut config = Config::default();
    config.system_jobs.auto_init = false;
    let engine = JobEngine::builder(config)
        .register("once", handler_fn(|_ctx| async { JobOutcome::Success }))
        .build()
        .unwrap();

    engine.enqueue(NewJob::new("once")).await.unwrap();
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    assert!(pending_of(&engine, "once").await.is_empty());
}

// ============================================================================
// System jobs
// ============================================================================

#[tokio::test]
async fn test_system_jobs_seed_and_run() {
    let clock = Arc::new(ManualClock::new(at(2024, 3, 14, 9, 2)));
    let maintenance = Arc::new(RecordingMaintenance::default());
    let mut config = Config::default();
    config.system_jobs.maintenance.reindex = true;

    let engine = JobEngine::builder(config)
        .with_clock(clock.clone())
        .with_maintenance(maintenance.clone())
        .build()
        .unwrap();

    let seeded = engine.system_jobs().initialize().await.unwrap();
    assert_eq!(seeded.len(), 3);

    let health = engine.get(seeded[HEALTH_CHECK_JOB]).await.unwrap();
    assert_eq!(health.scheduled_at, at(2024, 3, 14, 9, 5));
    let vacuum = engine.get(seeded[DB_MAINTENANCE_JOB]).await.unwrap();
    assert_eq!(vacuum.scheduled_at, at(2024, 3, 15, 3, 0));
    let retention = engine.get(seeded[HISTORY_RETENTION_JOB]).await.unwrap();
    assert_eq!(retention.scheduled_at, at(2024, 3, 15, 2, 30));

    // seeding twice does not duplicate
    assert!(engine.system_jobs().initialize().await.unwrap().is_empty());

    clock.set(at(2024, 3, 15, 4, 0));
    let report = engine.tick().await.unwrap();
    assert_eq!(report.claimed, 3);
    engine.pool().join_all().await;

    for id in seeded.values() {
        assert_eq!(engine.get(*id).await.unwrap().status, JobStatus::Succeeded);
    }
    assert_eq!(*maintenance.calls.lock(), vec!["vacuum", "reindex"]);

    assert_eq!(
        pending_of(&engine, HEALTH_CHECK_JOB).await[0].scheduled_at,
        at(2024, 3, 15, 4, 5)
    );
    assert_eq!(
        pending_of(&engine, DB_MAINTENANCE_JOB).await[0].scheduled_at,
        at(2024, 3, 16, 3, 0)
    );
    assert_eq!(
        pending_of(&engine, HISTORY_RETENTION_JOB).await[0].scheduled_at,
        at(2024, 3, 16, 2, 30)
    );
}

#[tokio::test]
async fn test_only_enabled_system_jobs_are_seeded() {
    let mut config = Config::default();
    config.system_jobs.enabled = vec![HEALTH_CHECK_JOB.to_string()];

    let engine = JobEngine::builder(config).build().unwrap();
    let seeded = engine.system_jobs().initialize().await.unwrap();

    assert_eq!(seeded.len(), 1);
    assert!(seeded.contains_key(HEALTH_CHECK_JOB));
    assert!(pending_of(&engine, DB_MAINTENANCE_JOB).await.is_empty());
}

#[tokio::test]
async fn test_system_job_timeout_precedence() {
    let mut config = Config::default();
    config.scheduler.default_timeout_secs = 900;
    config.system_jobs.health_check.timeout_secs = 45;
    config.system_jobs.maintenance.timeout_secs = 1800;
    config.job_types.insert(
        DB_MAINTENANCE_JOB.to_string(),
        JobTypeConfig {
            timeout_secs: Some(120),
            ..Default::default()
        },
    );

    let engine = JobEngine::builder(config)
        .register("plain", handler_fn(|_ctx| async { JobOutcome::Success }))
        .build()
        .unwrap();
    let seeded = engine.system_jobs().initialize().await.unwrap();

    // job_types override beats the feature section
    assert_eq!(engine.get(seeded[DB_MAINTENANCE_JOB]).await.unwrap().timeout_secs, 120);
    // feature section beats the global default
    assert_eq!(engine.get(seeded[HEALTH_CHECK_JOB]).await.unwrap().timeout_secs, 45);
    // no section, no override
    assert_eq!(engine.get(seeded[HISTORY_RETENTION_JOB]).await.unwrap().timeout_secs, 900);

    // explicit value beats everything
    let explicit = engine
        .enqueue(NewJob::new(DB_MAINTENANCE_JOB).with_timeout(30))
        .await
        .unwrap();
    assert_eq!(engine.get(explicit).await.unwrap().timeout_secs, 30);

    let plain = engine.enqueue(NewJob::new("plain")).await.unwrap();
    assert_eq!(engine.get(plain).await.unwrap().timeout_secs, 900);
}

#[tokio::test]
async fn test_user_handler_replaces_system_handler() {
    let clock = Arc::new(ManualClock::new(at(2024, 3, 14, 9, 2)));
    let mut config = Config::default();
    config.system_jobs.enabled = vec![HEALTH_CHECK_JOB.to_string()];

    let engine = JobEngine::builder(config)
        .with_clock(clock.clone())
        .register(
            HEALTH_CHECK_JOB,
            handler_fn(|_ctx| async { JobOutcome::fatal("custom check") }),
        )
        .build()
        .unwrap();

    let seeded = engine.system_jobs().initialize().await.unwrap();
    clock.set(at(2024, 3, 14, 9, 5));
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    let job = engine.get(seeded[HEALTH_CHECK_JOB]).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.last_error.unwrap().message, "custom check");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_maintenance_handler_stays_exclusive() {
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    let handler = {
        let gate = Arc::clone(&gate);
        let started = Arc::clone(&started);
        handler_fn(move |_ctx| {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                match gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return JobOutcome::retryable("gate closed"),
                }
                JobOutcome::Success
            }
        })
    };

    let mut config = Config::default();
    config.system_jobs.auto_init = false;
    let engine = JobEngine::builder(config)
        .register(DB_MAINTENANCE_JOB, handler)
        .build()
        .unwrap();
    assert!(engine.registry().is_exclusive(DB_MAINTENANCE_JOB));

    let first = engine.enqueue(NewJob::new(DB_MAINTENANCE_JOB)).await.unwrap();
    let second = engine.enqueue(NewJob::new(DB_MAINTENANCE_JOB)).await.unwrap();

    let report = engine.tick().await.unwrap();
    assert_eq!(report.due, 2);
    assert_eq!(report.claimed, 1);
    assert_eq!(report.skipped_exclusive, 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while started.load(Ordering::SeqCst) < 1 {
        assert!(Instant::now() < deadline, "maintenance handler never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let statuses = [
        engine.get(first).await.unwrap().status,
        engine.get(second).await.unwrap().status,
    ];
    assert!(statuses.contains(&JobStatus::Running));
    assert!(statuses.contains(&JobStatus::Cancelled));

    gate.add_permits(2);
    engine.pool().join_all().await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
}
