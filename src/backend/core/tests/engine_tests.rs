//! Engine lifecycle tests.
//!
//! Tests cover:
//! - Cancelling running jobs
//! - Cancelling in the gap between claim and hand-off to the pool
//! - Graceful shutdown and the grace period
//! - Lifecycle events
//! - Health reporting with failing probes

use async_trait::async_trait;
use cadence_core::config::Config;
use cadence_core::health::{ComponentHealth, HealthProbe, HealthStatus};
use cadence_core::jobs::builtin::HEALTH_CHECK_JOB;
use cadence_core::jobs::{
    handler_fn, CancelResult, ExclusiveClaim, ExecutionOutcome, ExecutionRecord, InMemoryJobStore,
    Job, JobEngine, JobFilter, JobId, JobOutcome, JobStatus, JobStore, NewJob,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_config() -> Config {
    let mut config = Config::default();
    config.system_jobs.auto_init = false;
    config.scheduler.max_concurrent_jobs = 2;
    config
}

/// Handler that waits for cancellation and reports it.
fn cooperative() -> Arc<dyn cadence_core::jobs::JobHandler> {
    handler_fn(|ctx| async move {
        ctx.cancelled().await;
        JobOutcome::Cancelled
    })
}

async fn wait_for_status(engine: &JobEngine, id: JobId, status: JobStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.get(id).await.unwrap().status != status {
        assert!(Instant::now() < deadline, "job never reached {}", status);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct DownProbe;

#[async_trait]
impl HealthProbe for DownProbe {
    fn name(&self) -> &str {
        "mail_relay"
    }

    async fn check(&self) -> ComponentHealth {
        ComponentHealth::unhealthy("mail_relay").with_error("connection refused")
    }
}

/// In-memory store that yields to other tasks right after claiming a job to `Running`,
/// widening the window before the scheduler hands the job to the pool.
#[derive(Default)]
struct YieldAfterClaim {
    inner: InMemoryJobStore,
}

#[async_trait]
impl JobStore for YieldAfterClaim {
    fn next_id(&self) -> JobId {
        self.inner.next_id()
    }

    async fn insert(&self, job: Job) -> cadence_core::Result<()> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: JobId) -> cadence_core::Result<Option<Job>> {
        self.inner.get(id).await
    }

    async fn claim(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
        at: DateTime<Utc>,
    ) -> cadence_core::Result<Option<Job>> {
        let claimed = self.inner.claim(id, expected, new, at).await?;
        if new == JobStatus::Running {
            tokio::task::yield_now().await;
        }
        Ok(claimed)
    }

    async fn claim_exclusive(&self, id: JobId, at: DateTime<Utc>) -> cadence_core::Result<ExclusiveClaim> {
        let claimed = self.inner.claim_exclusive(id, at).await?;
        tokio::task::yield_now().await;
        Ok(claimed)
    }

    async fn update_if(&self, job: &Job, expected: JobStatus) -> cadence_core::Result<bool> {
        self.inner.update_if(job, expected).await
    }

    async fn append_execution(&self, record: ExecutionRecord) -> cadence_core::Result<()> {
        self.inner.append_execution(record).await
    }

    async fn executions(&self, job_id: JobId) -> cadence_core::Result<Vec<ExecutionRecord>> {
        self.inner.executions(job_id).await
    }

    async fn query(&self, filter: &JobFilter) -> cadence_core::Result<Vec<Job>> {
        self.inner.query(filter).await
    }

    async fn delete(&self, ids: &[JobId]) -> cadence_core::Result<u64> {
        self.inner.delete(ids).await
    }

    async fn delete_executions_before(&self, cutoff: DateTime<Utc>, limit: usize) -> cadence_core::Result<u64> {
        self.inner.delete_executions_before(cutoff, limit).await
    }

    async fn count_by_status(&self) -> cadence_core::Result<HashMap<JobStatus, u64>> {
        self.inner.count_by_status().await
    }

    async fn ping(&self) -> cadence_core::Result<()> {
        self.inner.ping().await
    }
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_running_job_signals_handler() {
    let engine = JobEngine::builder(test_config())
        .register("long", cooperative())
        .build()
        .unwrap();

    let id = engine.enqueue(NewJob::new("long")).await.unwrap();
    engine.tick().await.unwrap();
    assert_eq!(engine.get(id).await.unwrap().status, JobStatus::Running);
    assert_eq!(engine.pool().available(), 1);

    assert_eq!(engine.cancel(id).await.unwrap(), CancelResult::Signalled);
    engine.pool().join_all().await;

    let job = engine.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(engine.pool().available(), 2);

    let records = engine.executions(id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ExecutionOutcome::Cancelled);

    assert_eq!(engine.cancel(id).await.unwrap(), CancelResult::AlreadyTerminal);
}

#[tokio::test]
async fn test_cancelled_pending_job_never_runs() {
    let engine = JobEngine::builder(test_config())
        .register("never", handler_fn(|_ctx| async { JobOutcome::fatal("should not run") }))
        .build()
        .unwrap();

    let id = engine.enqueue(NewJob::new("never")).await.unwrap();
    assert_eq!(engine.cancel(id).await.unwrap(), CancelResult::Cancelled);

    assert_eq!(engine.tick().await.unwrap().due, 0);
    assert!(engine.executions(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_between_claim_and_submit_skips_handler() {
    let runs = Arc::new(AtomicUsize::new(0));
    let handler = {
        let runs = Arc::clone(&runs);
        handler_fn(move |_ctx| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                JobOutcome::Success
            }
        })
    };
    let engine = JobEngine::builder(test_config())
        .with_store(Arc::new(YieldAfterClaim::default()))
        .register("report", handler)
        .build()
        .unwrap();

    let id = engine.enqueue(NewJob::new("report")).await.unwrap();

    let (tick, cancel) = tokio::join!(engine.tick(), async {
        while engine.get(id).await.unwrap().status != JobStatus::Running {
            tokio::task::yield_now().await;
        }
        engine.cancel(id).await
    });
    assert_eq!(tick.unwrap().claimed, 1);
    // the claim was committed but the pool had not registered the job yet
    assert_eq!(cancel.unwrap(), CancelResult::Cancelled);

    engine.pool().join_all().await;

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get(id).await.unwrap().status, JobStatus::Cancelled);
    assert_eq!(engine.pool().available(), 2);

    let records = engine.executions(id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ExecutionOutcome::Cancelled);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_waits_for_short_jobs() {
    let mut config = test_config();
    config.scheduler.poll_interval_ms = 10;

    let engine = JobEngine::builder(config)
        .register(
            "short",
            handler_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                JobOutcome::Success
            }),
        )
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let id = engine.enqueue(NewJob::new("short")).await.unwrap();
    wait_for_status(&engine, id, JobStatus::Running).await;

    engine.shutdown_with(Duration::from_secs(5)).await;

    assert_eq!(engine.get(id).await.unwrap().status, JobStatus::Succeeded);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_shutdown_cancels_jobs_past_grace() {
    let mut config = test_config();
    config.scheduler.poll_interval_ms = 10;

    let engine = JobEngine::builder(config)
        .register("long", cooperative())
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let id = engine.enqueue(NewJob::new("long")).await.unwrap();
    wait_for_status(&engine, id, JobStatus::Running).await;

    let started = Instant::now();
    engine.shutdown_with(Duration::from_millis(100)).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(engine.get(id).await.unwrap().status, JobStatus::Cancelled);
    assert_eq!(engine.pool().running(), 0);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let engine = JobEngine::builder(test_config()).build().unwrap();
    engine.start().await.unwrap();
    engine.start().await.unwrap();
    assert!(engine.is_running());

    engine.shutdown().await;
    assert!(!engine.is_running());
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let engine = JobEngine::builder(test_config())
        .register("quick", handler_fn(|_ctx| async { JobOutcome::Success }))
        .build()
        .unwrap();
    let mut events = engine.subscribe();

    let id = engine.enqueue(NewJob::new("quick")).await.unwrap();
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, id);
        transitions.push((event.from, event.to));
    }

    assert_eq!(
        transitions,
        vec![
            (None, JobStatus::Pending),
            (Some(JobStatus::Pending), JobStatus::Running),
            (Some(JobStatus::Running), JobStatus::Succeeded),
        ]
    );
}

#[tokio::test]
async fn test_retry_emits_intermediate_states() {
    let engine = JobEngine::builder(test_config())
        .register("flaky", handler_fn(|_ctx| async { JobOutcome::retryable("try later") }))
        .build()
        .unwrap();
    let mut events = engine.subscribe();

    engine.enqueue(NewJob::new("flaky")).await.unwrap();
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        statuses.push(event.to);
    }

    assert_eq!(
        statuses,
        vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Failed,
            JobStatus::Retrying,
            JobStatus::Pending,
        ]
    );
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_reports_failing_probe() {
    let engine = JobEngine::builder(test_config())
        .with_probe(Arc::new(DownProbe))
        .build()
        .unwrap();

    let health = engine.health().await.unwrap();
    assert_eq!(health.components.status, HealthStatus::Unhealthy);
    assert_eq!(health.components.failing(), vec!["mail_relay"]);
    assert!(health
        .components
        .get_component("job_store")
        .map_or(false, |c| c.is_healthy()));
}

#[tokio::test]
async fn test_health_check_job_fails_when_dependency_down() {
    let engine = JobEngine::builder(test_config())
        .with_probe(Arc::new(DownProbe))
        .build()
        .unwrap();

    let id = engine
        .enqueue(NewJob::new(HEALTH_CHECK_JOB).with_max_retries(0))
        .await
        .unwrap();
    engine.tick().await.unwrap();
    engine.pool().join_all().await;

    let job = engine.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.last_error.unwrap().code.as_deref(), Some("HEALTH_CHECK_FAILED"));
}
