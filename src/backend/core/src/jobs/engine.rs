//! Engine facade.
//!
//! [`JobEngine`] wires the store, registry, worker pool, scheduler loop and system
//! job manager together and is the only type most callers need.
//!
//! ```rust,ignore
//! let engine = JobEngine::builder(config)
//!     .register("reports.generate", handler_fn(|ctx| async move { generate(ctx).await }))
//!     .build()?;
//!
//! engine.start().await?;
//! let id = engine.enqueue(NewJob::new("reports.generate").with_payload(json!({"id": 7}))).await?;
//! // ...
//! engine.shutdown().await;
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::builtin::{register_system_jobs, SystemHandlers};
use super::history::HistorySweeper;
use super::job::{ExecutionRecord, Job, JobEvent, JobId, JobStatus, NewJob};
use super::registry::{JobHandler, JobRegistry, JobRegistryBuilder};
use super::scheduler::{SchedulerHandle, SchedulerLoop, TickReport};
use super::store::{InMemoryJobStore, JobFilter, JobStore};
use super::submit::{JobDefaults, JobSubmitter};
use super::system::SystemJobManager;
use super::worker::{TerminalHook, WorkerPool, WorkerPoolStats};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{MaintenanceBackend, NoopMaintenance};
use crate::error::{CadenceError, Result};
use crate::health::{CompositeProbe, HealthProbe, HealthReport, StoreProbe};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const CANCEL_ATTEMPTS: usize = 50;

// ═══════════════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of [`JobEngine::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelResult {
    /// The job was pending (or orphaned in `Running`) and is now cancelled
    Cancelled,
    /// The job was executing; it is cancelled and its handler has been signalled
    Signalled,
    /// The job had already finished
    AlreadyTerminal,
    NotFound,
}

/// Snapshot returned by [`JobEngine::health`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub jobs_by_status: HashMap<JobStatus, u64>,
    pub pool: WorkerPoolStats,
    /// Whether the scheduler loop is running
    pub running: bool,
    pub components: HealthReport,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Assembles a [`JobEngine`].
pub struct JobEngineBuilder {
    config: Config,
    store: Option<Arc<dyn JobStore>>,
    registry: JobRegistryBuilder,
    clock: Arc<dyn Clock>,
    maintenance: Option<Arc<dyn MaintenanceBackend>>,
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl JobEngineBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            registry: JobRegistryBuilder::new(),
            clock: Arc::new(SystemClock),
            maintenance: None,
            probes: Vec::new(),
        }
    }

    /// Use `store` instead of the default in-memory store.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_maintenance(mut self, backend: Arc<dyn MaintenanceBackend>) -> Self {
        self.maintenance = Some(backend);
        self
    }

    /// Add a probe to the health check (the store probe is always present).
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn register(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.registry = self.registry.register(job_type, handler);
        self
    }

    pub fn register_exclusive(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.registry = self.registry.register_exclusive(job_type, handler);
        self
    }

    /// Validate the configuration and wire the components.
    pub fn build(self) -> Result<JobEngine> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()) as Arc<dyn JobStore>);

        let mut probes = CompositeProbe::new().add_probe(Arc::new(StoreProbe::new(Arc::clone(&store))));
        for probe in self.probes {
            probes = probes.add_probe(probe);
        }

        let sweeper = Arc::new(HistorySweeper::from_config(
            Arc::clone(&store),
            Arc::clone(&clock),
            &config.history,
        ));
        let registry = Arc::new(
            register_system_jobs(
                self.registry,
                SystemHandlers {
                    probes: probes.clone(),
                    maintenance: self
                        .maintenance
                        .unwrap_or_else(|| Arc::new(NoopMaintenance) as Arc<dyn MaintenanceBackend>),
                    maintenance_config: config.system_jobs.maintenance.clone(),
                    sweeper,
                },
            )
            .build(),
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let submitter = Arc::new(JobSubmitter::new(
            Arc::clone(&store),
            JobDefaults::from_config(&config),
            Arc::clone(&clock),
            events.clone(),
        ));
        let manager = Arc::new(SystemJobManager::new(
            Arc::clone(&submitter),
            Arc::clone(&store),
            &config,
        ));
        let hook: Arc<dyn TerminalHook> = manager.clone();

        let pool = Arc::new(
            WorkerPool::new(
                config.scheduler.max_concurrent_jobs,
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::clone(&clock),
            )
            .with_retry_policy(config.retry.policy())
            .with_events(events.clone())
            .with_terminal_hook(Arc::clone(&hook)),
        );
        let scheduler = Arc::new(
            SchedulerLoop::new(
                Arc::clone(&store),
                Arc::clone(&pool),
                Arc::clone(&registry),
                Arc::clone(&clock),
                config.scheduler.poll_interval(),
            )
            .with_events(events.clone())
            .with_terminal_hook(Arc::clone(&hook)),
        );

        info!(
            capacity = pool.capacity(),
            job_types = ?registry.job_types(),
            "Job engine built"
        );

        Ok(JobEngine {
            config,
            store,
            registry,
            clock,
            submitter,
            manager,
            hook,
            pool,
            scheduler,
            probes,
            events,
            handle: Mutex::new(None),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// The assembled scheduling and execution engine.
pub struct JobEngine {
    config: Config,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    submitter: Arc<JobSubmitter>,
    manager: Arc<SystemJobManager>,
    hook: Arc<dyn TerminalHook>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<SchedulerLoop>,
    probes: CompositeProbe,
    events: broadcast::Sender<JobEvent>,
    handle: Mutex<Option<SchedulerHandle>>,
}

impl JobEngine {
    pub fn builder(config: Config) -> JobEngineBuilder {
        JobEngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn system_jobs(&self) -> &SystemJobManager {
        &self.manager
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Whether the scheduler loop is running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Seed system jobs and start the scheduler loop.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            warn!("Job engine already started");
            return Ok(());
        }

        let seeded = self.manager.initialize().await?;
        let handle = Arc::clone(&self.scheduler).start();
        *self.handle.lock() = Some(handle);

        info!(
            system_jobs_seeded = seeded.len(),
            poll_interval_ms = self.config.scheduler.poll_interval_ms,
            "Job engine started"
        );
        Ok(())
    }

    /// Stop with the configured `scheduler.shutdown_grace`.
    pub async fn shutdown(&self) {
        self.shutdown_with(self.config.scheduler.shutdown_grace).await
    }

    /// Stop the loop, wait up to `grace` for running jobs, then cancel the rest.
    pub async fn shutdown_with(&self, grace: Duration) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        let running = self.pool.running();
        if running > 0 {
            info!(running, grace_secs = grace.as_secs(), "Waiting for running jobs");
        }
        if tokio::time::timeout(grace, self.pool.join_all()).await.is_err() {
            warn!(
                running = self.pool.running(),
                "Shutdown grace period elapsed, cancelling running jobs"
            );
            self.pool.cancel_all();
            self.pool.join_all().await;
        }

        info!("Job engine stopped");
    }

    /// Run a single scheduler tick now.
    pub async fn tick(&self) -> Result<TickReport> {
        self.scheduler.tick().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission & Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a new job and wake the scheduler.
    pub async fn enqueue(&self, new: NewJob) -> Result<JobId> {
        let id = self.submitter.submit(new).await?;
        self.scheduler.wake();
        Ok(id)
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CadenceError::job_not_found(id))
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.query(filter).await
    }

    /// Execution history of a job, oldest attempt first.
    pub async fn executions(&self, id: JobId) -> Result<Vec<ExecutionRecord>> {
        self.store.executions(id).await
    }

    pub async fn health(&self) -> Result<EngineHealth> {
        let jobs_by_status = self.store.count_by_status().await?;
        Ok(EngineHealth {
            jobs_by_status,
            pool: self.pool.stats(),
            running: self.is_running(),
            components: self.probes.check_all().await,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────────────────

    /// Cancel a job.
    ///
    /// A pending job is cancelled directly. A running job is moved to `Cancelled` in
    /// the store first, then its handler is signalled and its slot freed. A job caught
    /// between a failure and its retry decision is retried until it settles.
    pub async fn cancel(&self, id: JobId) -> Result<CancelResult> {
        for _ in 0..CANCEL_ATTEMPTS {
            let Some(job) = self.store.get(id).await? else {
                return Ok(CancelResult::NotFound);
            };
            if job.status.is_terminal() {
                return Ok(CancelResult::AlreadyTerminal);
            }

            let now = self.clock.now();
            match job.status {
                JobStatus::Pending | JobStatus::Running => {
                    let Some(cancelled) = self
                        .store
                        .claim(id, job.status, JobStatus::Cancelled, now)
                        .await?
                    else {
                        continue;
                    };

                    let signalled = job.status == JobStatus::Running && self.pool.cancel(id);
                    self.emit(&cancelled, job.status, now);
                    info!(job_id = %id, job_type = %cancelled.job_type, from = %job.status, "Job cancelled");
                    self.hook.on_terminal(&cancelled).await;

                    return Ok(if signalled {
                        CancelResult::Signalled
                    } else {
                        CancelResult::Cancelled
                    });
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }

        let job = self.get(id).await?;
        Err(CadenceError::invalid_state_transition(id, job.status, JobStatus::Cancelled))
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
}
