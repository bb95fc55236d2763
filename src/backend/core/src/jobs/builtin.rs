//! Built-in system jobs.

use async_trait::async_trait;
use std::sync::Arc;

use super::history::HistorySweeper;
use super::job::{JobContext, JobError, JobOutcome};
use super::registry::{JobHandler, JobRegistryBuilder};
use crate::config::MaintenanceJobConfig;
use crate::db::MaintenanceBackend;
use crate::health::CompositeProbe;

pub const HEALTH_CHECK_JOB: &str = "system.health_check";
pub const DB_MAINTENANCE_JOB: &str = "system.db_maintenance";
pub const HISTORY_RETENTION_JOB: &str = "system.history_retention";

/// Every system job type, in initialization order.
pub const SYSTEM_JOB_TYPES: [&str; 3] = [HEALTH_CHECK_JOB, DB_MAINTENANCE_JOB, HISTORY_RETENTION_JOB];

pub fn is_system_job(job_type: &str) -> bool {
    SYSTEM_JOB_TYPES.contains(&job_type)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

/// Job: probe the engine's dependencies.
pub struct HealthCheckJob {
    probes: CompositeProbe,
}

impl HealthCheckJob {
    pub fn new(probes: CompositeProbe) -> Self {
        Self { probes }
    }
}

#[async_trait]
impl JobHandler for HealthCheckJob {
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        let Some(report) = ctx.cancellable(self.probes.check_all()).await else {
            return JobOutcome::Cancelled;
        };

        if !report.is_operational() {
            let failing = report.failing().join(", ");
            ctx.log_warn(&format!("Unhealthy components: {}", failing));
            return JobOutcome::Retryable(
                JobError::retryable(format!("unhealthy components: {}", failing))
                    .with_code("HEALTH_CHECK_FAILED"),
            );
        }

        if !report.is_healthy() {
            ctx.log_warn(&format!("Degraded components: {}", report.failing().join(", ")));
        } else {
            ctx.log_info(&format!("{} components healthy", report.summary.total));
        }
        JobOutcome::Success
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Database Maintenance
// ═══════════════════════════════════════════════════════════════════════════════

/// Job: vacuum and optionally reindex the database.
pub struct DatabaseMaintenanceJob {
    backend: Arc<dyn MaintenanceBackend>,
    vacuum_full: bool,
    reindex: bool,
}

impl DatabaseMaintenanceJob {
    pub fn new(backend: Arc<dyn MaintenanceBackend>, vacuum_full: bool, reindex: bool) -> Self {
        Self {
            backend,
            vacuum_full,
            reindex,
        }
    }

    pub fn from_config(backend: Arc<dyn MaintenanceBackend>, config: &MaintenanceJobConfig) -> Self {
        Self::new(backend, config.vacuum_full, config.reindex)
    }
}

#[async_trait]
impl JobHandler for DatabaseMaintenanceJob {
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        ctx.log_info(&format!(
            "Starting maintenance (vacuum_full={}, reindex={})",
            self.vacuum_full, self.reindex
        ));

        match ctx.cancellable(self.backend.vacuum(self.vacuum_full)).await {
            None => return JobOutcome::Cancelled,
            Some(Err(e)) => return JobOutcome::Retryable(JobError::from(e)),
            Some(Ok(())) => {}
        }

        if self.reindex {
            if ctx.is_cancelled() {
                return JobOutcome::Cancelled;
            }
            match ctx.cancellable(self.backend.reindex()).await {
                None => return JobOutcome::Cancelled,
                Some(Err(e)) => return JobOutcome::Retryable(JobError::from(e)),
                Some(Ok(())) => {}
            }
        }

        JobOutcome::Success
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// History Retention
// ═══════════════════════════════════════════════════════════════════════════════

/// Job: purge execution history past the retention window.
pub struct HistoryRetentionJob {
    sweeper: Arc<HistorySweeper>,
}

impl HistoryRetentionJob {
    pub fn new(sweeper: Arc<HistorySweeper>) -> Self {
        Self { sweeper }
    }
}

#[async_trait]
impl JobHandler for HistoryRetentionJob {
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        match ctx.cancellable(self.sweeper.sweep()).await {
            None => JobOutcome::Cancelled,
            Some(Ok(report)) => {
                ctx.log_info(&format!(
                    "Deleted {} execution records and {} jobs older than {} days",
                    report.executions_deleted,
                    report.jobs_deleted,
                    self.sweeper.retention_days()
                ));
                JobOutcome::Success
            }
            Some(Err(e)) if e.is_retryable() => JobOutcome::Retryable(JobError::from(e)),
            Some(Err(e)) => JobOutcome::Fatal(JobError::from(e)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registration
// ═══════════════════════════════════════════════════════════════════════════════

/// Collaborators the system job handlers need.
pub struct SystemHandlers {
    pub probes: CompositeProbe,
    pub maintenance: Arc<dyn MaintenanceBackend>,
    pub maintenance_config: MaintenanceJobConfig,
    pub sweeper: Arc<HistorySweeper>,
}

/// Register the system job handlers. Types the caller already registered keep
/// the caller's handler; maintenance and retention are exclusive either way.
pub fn register_system_jobs(mut builder: JobRegistryBuilder, handlers: SystemHandlers) -> JobRegistryBuilder {
    if !builder.contains(HEALTH_CHECK_JOB) {
        builder = builder.register(HEALTH_CHECK_JOB, Arc::new(HealthCheckJob::new(handlers.probes)));
    }
    if !builder.contains(DB_MAINTENANCE_JOB) {
        builder = builder.register_exclusive(
            DB_MAINTENANCE_JOB,
            Arc::new(DatabaseMaintenanceJob::from_config(
                handlers.maintenance,
                &handlers.maintenance_config,
            )),
        );
    }
    if !builder.contains(HISTORY_RETENTION_JOB) {
        builder = builder.register_exclusive(
            HISTORY_RETENTION_JOB,
            Arc::new(HistoryRetentionJob::new(handlers.sweeper)),
        );
    }
    // a caller's replacement handler still must not overlap with itself
    builder
        .mark_exclusive(DB_MAINTENANCE_JOB)
        .mark_exclusive(HISTORY_RETENTION_JOB)
}
