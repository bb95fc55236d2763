//! Bounded worker pool.
//!
//! The pool owns the capacity state: one semaphore permit per busy slot. Each accepted
//! job runs its handler on a dedicated task and the pool waits on whichever comes
//! first of handler completion, the job deadline, or external cancellation. On deadline
//! or cancellation the handler task is detached, never awaited, and its slot is freed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::job::{
    ExecutionOutcome, ExecutionRecord, FailureKind, Job, JobContext, JobError, JobEvent, JobId,
    JobOutcome, JobStatus,
};
use super::registry::{JobHandler, JobRegistry};
use super::retry::{RetryDecision, RetryPolicy};
use super::store::JobStore;
use crate::clock::Clock;
use crate::error::Result;
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Terminal Hook
// ═══════════════════════════════════════════════════════════════════════════════

/// Called once for every job that reaches `Succeeded`, `Dead` or `Cancelled`, by
/// whichever party committed that transition.
#[async_trait]
pub trait TerminalHook: Send + Sync {
    async fn on_terminal(&self, job: &Job);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    pub capacity: usize,
    pub running: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Highest number of simultaneously executing jobs observed
    pub peak: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// How one attempt ended, before it is committed to the store.
#[derive(Debug)]
enum Attempt {
    Succeeded,
    Failed(JobError),
    TimedOut(JobError),
    Cancelled,
}

impl Attempt {
    fn execution_outcome(&self) -> ExecutionOutcome {
        match self {
            Self::Succeeded => ExecutionOutcome::Succeeded,
            Self::Failed(_) => ExecutionOutcome::Failed,
            Self::TimedOut(_) => ExecutionOutcome::TimedOut,
            Self::Cancelled => ExecutionOutcome::Cancelled,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes claimed jobs under a fixed concurrency budget.
pub struct WorkerPool {
    capacity: usize,
    slots: Arc<Semaphore>,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<JobEvent>,
    hook: Option<Arc<dyn TerminalHook>>,
    running: DashMap<JobId, CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: PoolCounters,
}

impl WorkerPool {
    /// Create a pool with `capacity` slots (at least one).
    pub fn new(
        capacity: usize,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(256);
        Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            store,
            registry,
            retry: RetryPolicy::default(),
            clock,
            events,
            hook: None,
            running: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            counters: PoolCounters::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publish status transitions on an existing channel.
    pub fn with_events(mut self, events: broadcast::Sender<JobEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_terminal_hook(mut self, hook: Arc<dyn TerminalHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held by executing jobs.
    pub fn running(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.running.contains_key(&id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let c = &self.counters;
        WorkerPoolStats {
            capacity: self.capacity,
            running: self.running(),
            submitted: c.submitted.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            peak: c.peak.load(Ordering::Relaxed),
        }
    }

    /// Hand a claimed (`Running`) job to the pool.
    ///
    /// Waits only for a free slot; execution continues in the background.
    pub async fn submit(self: &Arc<Self>, job: Job) -> Result<()> {
        let permit = Arc::clone(&self.slots).acquire_owned().await?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        JobMetrics::set_slots_busy(self.running());

        let token = CancellationToken::new();
        self.running.insert(job.id, token.clone());

        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt
        );
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move { pool.execute(job, token, permit).await }.instrument(span));

        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        Ok(())
    }

    /// Signal a running job to stop and free its slot. Returns `false` if the job is
    /// not executing in this pool.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.running.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every running job to stop.
    pub fn cancel_all(&self) {
        for entry in self.running.iter() {
            entry.value().cancel();
        }
    }

    /// Wait until every accepted execution has been finalized.
    pub async fn join_all(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
            if handles.is_empty() {
                break;
            }
            for joined in join_all(handles).await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Worker task ended abnormally");
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    async fn execute(self: Arc<Self>, job: Job, token: CancellationToken, _permit: OwnedSemaphorePermit) {
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);

        let started = Instant::now();
        if self.still_claimed(&job, &token).await {
            let attempt = match self.registry.get(&job.job_type) {
                Some(handler) => self.run_handler(handler, &job, &token).await,
                None => {
                    tracing::error!("No handler registered for job type");
                    Attempt::Failed(JobError::unknown_type(&job.job_type))
                }
            };
            let elapsed = started.elapsed();

            self.finalize(job.clone(), attempt, elapsed).await;
        } else {
            // cancelled between the claim and the submit; the handler never starts
            tracing::info!("Job left Running before its handler started");
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            self.record_execution(
                &job,
                ExecutionOutcome::Cancelled,
                self.clock.now(),
                started.elapsed(),
                None,
            )
            .await;
        }

        self.running.remove(&job.id);
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        // the permit is released when this function returns
        JobMetrics::set_slots_busy(self.running().saturating_sub(1));
    }

    /// Whether the store still holds this attempt's claim.
    ///
    /// The token is registered before the task is spawned, so a cancel that lands
    /// after this check always finds it.
    async fn still_claimed(&self, job: &Job, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        match self.store.get(job.id).await {
            Ok(Some(current)) => current.status == JobStatus::Running && current.attempt == job.attempt,
            Ok(None) => false,
            Err(e) => {
                // finalize will surface a store outage; do not drop the attempt here
                tracing::warn!(error = %e, "Could not re-read job before running it");
                true
            }
        }
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        job: &Job,
        token: &CancellationToken,
    ) -> Attempt {
        let ctx = JobContext::new(job.clone(), token.clone());
        let mut handle = tokio::spawn(async move { handler.run(ctx).await });
        let deadline = Duration::from_secs(job.timeout_secs);

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(JobOutcome::Success) => Attempt::Succeeded,
                Ok(JobOutcome::Retryable(mut error)) => {
                    error.kind = FailureKind::Retryable;
                    Attempt::Failed(error)
                }
                Ok(JobOutcome::Fatal(mut error)) => {
                    error.kind = FailureKind::Fatal;
                    Attempt::Failed(error)
                }
                Ok(JobOutcome::Cancelled) => Attempt::Cancelled,
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    tracing::error!(panic = %message, "Job handler panicked");
                    Attempt::Failed(
                        JobError::fatal(format!("handler panicked: {}", message)).with_code("PANIC"),
                    )
                }
                Err(e) => Attempt::Failed(JobError::fatal(format!("handler task aborted: {}", e))),
            },
            _ = tokio::time::sleep(deadline) => {
                token.cancel();
                tracing::warn!(timeout_secs = job.timeout_secs, "Job exceeded its deadline");
                Attempt::TimedOut(JobError::timeout(job.timeout_secs))
            }
            _ = token.cancelled() => {
                tracing::info!("Job cancelled while running");
                Attempt::Cancelled
            }
        }
    }

    /// Commit the attempt: status transitions, the execution record, retry decision.
    async fn finalize(&self, job: Job, attempt: Attempt, elapsed: Duration) {
        let now = self.clock.now();
        let outcome = attempt.execution_outcome();
        JobMetrics::record_outcome(&job.job_type, outcome.as_str(), elapsed.as_secs_f64());

        let (target, error) = match attempt {
            Attempt::Succeeded => (JobStatus::Succeeded, None),
            Attempt::Failed(error) => (JobStatus::Failed, Some(error)),
            Attempt::TimedOut(error) => (JobStatus::TimedOut, Some(error)),
            Attempt::Cancelled => (JobStatus::Cancelled, None),
        };

        let mut finished = job.clone();
        finished.status = target;
        finished.finished_at = Some(now);
        if error.is_some() {
            finished.last_error = error.clone();
        }

        let won = self.commit(&finished, JobStatus::Running, now).await;

        // A lost race means someone else (explicit cancellation) already moved the job
        // out of Running; the attempt still gets its record.
        let record_outcome = if won { outcome } else { ExecutionOutcome::Cancelled };
        self.record_execution(&job, record_outcome, now, elapsed, error.clone())
            .await;

        if !won {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Job left Running before the attempt finished");
            return;
        }

        match target {
            JobStatus::Succeeded => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(duration_ms = elapsed.as_millis() as u64, "Job succeeded");
                self.fire_hook(&finished).await;
            }
            JobStatus::Cancelled => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                self.fire_hook(&finished).await;
            }
            JobStatus::Failed | JobStatus::TimedOut => {
                if target == JobStatus::TimedOut {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                let kind = error.as_ref().map_or(FailureKind::Fatal, |e| e.kind);
                self.apply_retry(finished, kind, now).await;
            }
            _ => {}
        }
    }

    async fn apply_retry(&self, failed: Job, kind: FailureKind, now: DateTime<Utc>) {
        let from = failed.status;
        match self.retry.decide(failed.attempt, failed.max_retries, kind, now) {
            RetryDecision::Retry { delay, scheduled_at } => {
                let mut retrying = failed;
                retrying.status = JobStatus::Retrying;
                if !self.commit(&retrying, from, now).await {
                    return;
                }

                let mut pending = retrying;
                pending.status = JobStatus::Pending;
                pending.scheduled_at = scheduled_at;
                pending.finished_at = None;
                if self.commit(&pending, JobStatus::Retrying, now).await {
                    tracing::warn!(
                        delay_secs = delay.as_secs(),
                        retry_at = %scheduled_at,
                        max_retries = pending.max_retries,
                        "Job failed, retry scheduled"
                    );
                }
            }
            RetryDecision::Dead => {
                let mut dead = failed;
                dead.status = JobStatus::Dead;
                if self.commit(&dead, from, now).await {
                    tracing::error!(
                        failure = ?kind,
                        error = ?dead.last_error.as_ref().map(|e| e.message.as_str()),
                        "Job is dead"
                    );
                    self.fire_hook(&dead).await;
                }
            }
        }
    }

    /// Compare-and-swap `job` over a record in `expected`; emits the event on success.
    async fn commit(&self, job: &Job, expected: JobStatus, at: DateTime<Utc>) -> bool {
        match self.store.update_if(job, expected).await {
            Ok(true) => {
                tracing::debug!(from = %expected, to = %job.status, "Job status changed");
                let _ = self.events.send(JobEvent {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    from: Some(expected),
                    to: job.status,
                    at,
                });
                true
            }
            Ok(false) => false,
            Err(e) => {
                e.log();
                false
            }
        }
    }

    async fn record_execution(
        &self,
        job: &Job,
        outcome: ExecutionOutcome,
        finished_at: DateTime<Utc>,
        elapsed: Duration,
        error: Option<JobError>,
    ) {
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempt,
            outcome,
            started_at: job.started_at.unwrap_or(finished_at),
            finished_at,
            duration_ms: elapsed.as_millis() as u64,
            error,
        };
        if let Err(e) = self.store.append_execution(record).await {
            e.log();
        }
    }

    async fn fire_hook(&self, job: &Job) {
        if let Some(hook) = &self.hook {
            hook.on_terminal(job).await;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
