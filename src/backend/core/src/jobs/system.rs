//! System job management.
//!
//! The manager seeds the configured system jobs at startup and, installed as the
//! pool's [`TerminalHook`], keeps every recurring job chain alive by enqueueing the
//! next instance when the current one reaches a terminal status.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::builtin::SYSTEM_JOB_TYPES;
use super::job::{Job, JobId, NewJob};
use super::store::{JobFilter, JobStore};
use super::submit::JobSubmitter;
use super::worker::TerminalHook;
use crate::config::Config;
use crate::error::Result;

/// Seeds system jobs and re-enqueues recurring jobs.
pub struct SystemJobManager {
    submitter: Arc<JobSubmitter>,
    store: Arc<dyn JobStore>,
    auto_init: bool,
    /// Enabled system job type -> schedule expression
    schedules: Vec<(String, String)>,
}

impl SystemJobManager {
    pub fn new(submitter: Arc<JobSubmitter>, store: Arc<dyn JobStore>, config: &Config) -> Self {
        let schedules = SYSTEM_JOB_TYPES
            .iter()
            .filter(|t| config.system_jobs.is_enabled(t))
            .filter_map(|t| {
                config
                    .system_job_schedule(t)
                    .map(|schedule| (t.to_string(), schedule.to_string()))
            })
            .collect();

        Self {
            submitter,
            store,
            auto_init: config.system_jobs.auto_init,
            schedules,
        }
    }

    /// Enabled system job types with their schedules.
    pub fn schedules(&self) -> &[(String, String)] {
        &self.schedules
    }

    /// Enqueue every enabled system job that has no active instance.
    ///
    /// Returns the ids of newly enqueued jobs by type. Does nothing when
    /// `system_jobs.auto_init` is off.
    pub async fn initialize(&self) -> Result<HashMap<String, JobId>> {
        let mut enqueued = HashMap::new();
        if !self.auto_init {
            info!("System job auto-initialization disabled");
            return Ok(enqueued);
        }

        for (job_type, schedule) in &self.schedules {
            if self.has_active_instance(job_type, None).await? {
                debug!(job_type = %job_type, "System job already scheduled");
                continue;
            }

            let id = self
                .submitter
                .submit(NewJob::new(job_type.clone()).with_schedule(schedule.clone()))
                .await?;
            info!(job_id = %id, job_type = %job_type, schedule = %schedule, "System job initialized");
            enqueued.insert(job_type.clone(), id);
        }

        Ok(enqueued)
    }

    /// Enqueue the next instance of a finished recurring job.
    ///
    /// Skipped when another active instance of the same chain exists, which is the
    /// case for an exclusive instance cancelled because its predecessor was still
    /// running: the predecessor schedules the next fire when it finishes.
    pub async fn reschedule(&self, finished: &Job) -> Result<Option<JobId>> {
        let Some(expression) = finished.cron_expression.as_deref() else {
            return Ok(None);
        };

        if self
            .has_active_instance(&finished.job_type, Some(expression))
            .await?
        {
            debug!(
                job_id = %finished.id,
                job_type = %finished.job_type,
                "Active instance already present, not rescheduling"
            );
            return Ok(None);
        }

        let next = self.submitter.submit_recurrence(finished).await?;
        if let Some(id) = next {
            debug!(
                previous = %finished.id,
                job_id = %id,
                job_type = %finished.job_type,
                "Recurring job rescheduled"
            );
        }
        Ok(next)
    }

    async fn has_active_instance(&self, job_type: &str, expression: Option<&str>) -> Result<bool> {
        let active = self
            .store
            .query(&JobFilter::active().with_type(job_type))
            .await?;
        Ok(active.iter().any(|job| match expression {
            Some(expr) => job.cron_expression.as_deref() == Some(expr),
            None => true,
        }))
    }
}

#[async_trait]
impl TerminalHook for SystemJobManager {
    async fn on_terminal(&self, job: &Job) {
        if !job.is_recurring() {
            return;
        }
        if let Err(e) = self.reschedule(job).await {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                "Failed to reschedule recurring job"
            );
            e.log();
        }
    }
}
