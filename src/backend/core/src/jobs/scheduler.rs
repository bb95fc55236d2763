//! The scheduler loop.
//!
//! Every poll interval the loop selects due pending jobs, orders them by priority and
//! age, claims as many as there are free worker slots and hands them to the pool. It
//! never runs handler code itself, and a failed tick is logged and retried on the next
//! interval.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::job::{Job, JobEvent, JobStatus};
use super::registry::JobRegistry;
use super::store::{ExclusiveClaim, JobFilter, JobStore};
use super::worker::{TerminalHook, WorkerPool};
use crate::clock::Clock;
use crate::error::Result;
use crate::telemetry::JobMetrics;

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Pending jobs whose scheduled time had arrived
    pub due: usize,
    /// Jobs picked for a claim attempt
    pub selected: usize,
    /// Claims that succeeded and were submitted to the pool
    pub claimed: usize,
    /// Claims lost to a concurrent status change
    pub lost_races: usize,
    /// Due instances of exclusive types cancelled because another instance was running
    pub skipped_exclusive: usize,
}

/// Dispatch order: higher priority first, then earlier `scheduled_at`.
pub fn dispatch_order(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.scheduled_at.cmp(&b.scheduled_at))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

/// Polls the store and feeds the worker pool.
pub struct SchedulerLoop {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    events: broadcast::Sender<JobEvent>,
    hook: Option<Arc<dyn TerminalHook>>,
    wake: Notify,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            pool,
            registry,
            clock,
            poll_interval,
            events,
            hook: None,
            wake: Notify::new(),
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<JobEvent>) -> Self {
        self.events = events;
        self
    }

    /// Notified when an exclusive instance is skipped, so recurrence continues.
    pub fn with_terminal_hook(mut self, hook: Arc<dyn TerminalHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run a tick now instead of waiting for the next interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Run one tick against the clock.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(self.clock.now()).await
    }

    /// Run one tick treating `now` as the current time.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut due = self.store.query(&JobFilter::due(now)).await?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        dispatch_order(&mut due);
        let available = self.pool.available();

        for job in due {
            if report.selected >= available {
                break;
            }

            let claimed = if self.registry.is_exclusive(&job.job_type) {
                match self.store.claim_exclusive(job.id, now).await? {
                    ExclusiveClaim::Claimed(claimed) => Some(claimed),
                    ExclusiveClaim::Lost => None,
                    ExclusiveClaim::Busy => {
                        self.skip_exclusive(&job, now, &mut report).await?;
                        continue;
                    }
                }
            } else {
                self.store
                    .claim(job.id, JobStatus::Pending, JobStatus::Running, now)
                    .await?
            };

            report.selected += 1;
            match claimed {
                Some(claimed) => {
                    report.claimed += 1;
                    JobMetrics::record_claimed(&claimed.job_type);
                    tracing::debug!(
                        job_id = %claimed.id,
                        job_type = %claimed.job_type,
                        priority = %claimed.priority,
                        attempt = claimed.attempt,
                        "Job claimed"
                    );
                    self.emit(&claimed, JobStatus::Pending, now);
                    self.pool.submit(claimed).await?;
                }
                None => {
                    report.lost_races += 1;
                    tracing::debug!(job_id = %job.id, "Job claimed elsewhere, skipping");
                }
            }
        }

        Ok(report)
    }

    /// Cancel a due instance of an exclusive type whose previous run is still going.
    async fn skip_exclusive(&self, job: &Job, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        if let Some(skipped) = self
            .store
            .claim(job.id, JobStatus::Pending, JobStatus::Cancelled, now)
            .await?
        {
            report.skipped_exclusive += 1;
            tracing::info!(
                job_id = %skipped.id,
                job_type = %skipped.job_type,
                "Exclusive job already running, skipping due instance"
            );
            self.emit(&skipped, JobStatus::Pending, now);
            if let Some(hook) = &self.hook {
                hook.on_terminal(&skipped).await;
            }
        }
        Ok(())
    }

    fn emit(&self, job: &Job, from: JobStatus, at: DateTime<Utc>) {
        let _ = self.events.send(JobEvent {
            job_id: job.id,
            job_type: job.job_type.clone(),
            from: Some(from),
            to: job.status,
            at,
        });
    }

    /// Spawn the polling loop.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                poll_interval_ms = scheduler.poll_interval.as_millis() as u64,
                capacity = scheduler.pool.capacity(),
                "Scheduler loop started"
            );

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("Scheduler loop shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => scheduler.run_tick().await,
                    _ = scheduler.wake.notified() => scheduler.run_tick().await,
                }
            }

            tracing::info!("Scheduler loop stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run_tick(&self) {
        match self.tick().await {
            Ok(report) if report.claimed > 0 || report.skipped_exclusive > 0 => {
                JobMetrics::record_tick("ok");
                tracing::debug!(
                    due = report.due,
                    claimed = report.claimed,
                    lost_races = report.lost_races,
                    skipped_exclusive = report.skipped_exclusive,
                    "Scheduler tick"
                );
            }
            Ok(_) => JobMetrics::record_tick("idle"),
            Err(e) => {
                JobMetrics::record_tick("error");
                e.log();
                tracing::warn!(error = %e, "Scheduler tick failed, retrying next interval");
            }
        }
    }
}

/// Handle for controlling a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop after its current tick.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Scheduler loop task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
