//! Job submission and defaults resolution.
//!
//! Each setting of a new job is taken from the first source that provides it:
//!
//! 1. the value on the [`NewJob`] itself
//! 2. the `job_types.<type>` override
//! 3. the feature section for built-in types (`system_jobs.maintenance.timeout_secs`, ...)
//! 4. the global default (`scheduler.default_timeout_secs`, `retry.default_max_retries`, `medium`)

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::builtin::{DB_MAINTENANCE_JOB, HEALTH_CHECK_JOB};
use super::job::{Job, JobEvent, JobId, JobPriority, JobStatus, NewJob};
use super::schedule::ScheduleExpr;
use super::store::JobStore;
use crate::clock::Clock;
use crate::config::{Config, JobTypeConfig};
use crate::error::{CadenceError, Result};
use crate::telemetry::JobMetrics;

/// Settings resolved for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub priority: JobPriority,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Layered per-type defaults.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    default_priority: JobPriority,
    default_timeout_secs: u64,
    default_max_retries: u32,
    job_types: HashMap<String, JobTypeConfig>,
    features: HashMap<String, JobTypeConfig>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl JobDefaults {
    pub fn from_config(config: &Config) -> Self {
        let mut features = HashMap::new();
        features.insert(
            HEALTH_CHECK_JOB.to_string(),
            JobTypeConfig {
                timeout_secs: Some(config.system_jobs.health_check.timeout_secs),
                ..Default::default()
            },
        );
        features.insert(
            DB_MAINTENANCE_JOB.to_string(),
            JobTypeConfig {
                timeout_secs: Some(config.system_jobs.maintenance.timeout_secs),
                ..Default::default()
            },
        );

        for (job_type, feature) in &features {
            if let Some(explicit) = config.job_types.get(job_type) {
                if explicit.timeout_secs.is_some() && feature.timeout_secs.is_some() {
                    tracing::warn!(
                        job_type = %job_type,
                        "Timeout set in both job_types and the system_jobs section; job_types wins"
                    );
                }
            }
        }

        Self {
            default_priority: JobPriority::default(),
            default_timeout_secs: config.scheduler.default_timeout_secs,
            default_max_retries: config.retry.default_max_retries,
            job_types: config.job_types.clone(),
            features,
        }
    }

    /// Resolve priority, timeout and retry budget for a submission.
    pub fn resolve(&self, new: &NewJob) -> ResolvedSettings {
        let layers = [
            self.job_types.get(&new.job_type),
            self.features.get(&new.job_type),
        ];

        let priority = new
            .priority
            .or_else(|| layers.iter().flatten().find_map(|l| l.priority))
            .unwrap_or(self.default_priority);
        let timeout_secs = new
            .timeout_secs
            .or_else(|| layers.iter().flatten().find_map(|l| l.timeout_secs))
            .unwrap_or(self.default_timeout_secs);
        let max_retries = new
            .max_retries
            .or_else(|| layers.iter().flatten().find_map(|l| l.max_retries))
            .unwrap_or(self.default_max_retries);

        ResolvedSettings {
            priority,
            timeout_secs,
            max_retries,
        }
    }
}

/// Turns [`NewJob`] requests into pending job records.
pub struct JobSubmitter {
    store: Arc<dyn JobStore>,
    defaults: JobDefaults,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<JobEvent>,
}

impl JobSubmitter {
    pub fn new(
        store: Arc<dyn JobStore>,
        defaults: JobDefaults,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            store,
            defaults,
            clock,
            events,
        }
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    /// Validate, resolve defaults and persist a new pending job.
    ///
    /// A recurring job without an explicit `scheduled_at` is first due at the next
    /// fire time of its schedule.
    pub async fn submit(&self, new: NewJob) -> Result<JobId> {
        if new.job_type.trim().is_empty() {
            return Err(CadenceError::validation("job_type must not be empty"));
        }

        let now = self.clock.now();
        let schedule = new
            .cron_expression
            .as_deref()
            .map(ScheduleExpr::parse)
            .transpose()?;

        let scheduled_at = match (new.scheduled_at, &schedule) {
            (Some(at), _) => at,
            (None, Some(expr)) => expr.next_after(now).ok_or_else(|| {
                CadenceError::invalid_schedule(expr.as_str(), "no upcoming fire time")
            })?,
            (None, None) => now,
        };

        let settings = self.defaults.resolve(&new);
        if settings.timeout_secs == 0 {
            return Err(CadenceError::validation("timeout_secs must be positive"));
        }

        let job = Job {
            id: self.store.next_id(),
            job_type: new.job_type,
            payload: new.payload,
            priority: settings.priority,
            status: JobStatus::Pending,
            scheduled_at,
            created_at: now,
            started_at: None,
            finished_at: None,
            attempt: 0,
            max_retries: settings.max_retries,
            timeout_secs: settings.timeout_secs,
            cron_expression: schedule.map(|s| s.as_str().to_string()),
            last_error: None,
        };

        let id = job.id;
        let job_type = job.job_type.clone();
        self.store.insert(job).await?;

        JobMetrics::record_enqueued(&job_type);
        tracing::info!(
            job_id = %id,
            job_type = %job_type,
            priority = %settings.priority,
            scheduled_at = %scheduled_at,
            "Job enqueued"
        );
        let _ = self.events.send(JobEvent {
            job_id: id,
            job_type,
            from: None,
            to: JobStatus::Pending,
            at: now,
        });

        Ok(id)
    }

    /// Enqueue the next instance of a finished recurring job.
    ///
    /// Returns `None` for one-off jobs.
    pub async fn submit_recurrence(&self, finished: &Job) -> Result<Option<JobId>> {
        let Some(expression) = finished.cron_expression.as_deref() else {
            return Ok(None);
        };

        let schedule = ScheduleExpr::parse(expression)?;
        let anchor = finished.finished_at.unwrap_or_else(|| self.clock.now());
        let Some(next) = schedule.next_after(anchor) else {
            tracing::warn!(
                job_id = %finished.id,
                job_type = %finished.job_type,
                schedule = %expression,
                "Recurring job has no further fire times"
            );
            return Ok(None);
        };

        let new = NewJob::new(finished.job_type.clone())
            .with_payload(finished.payload.clone())
            .with_priority(finished.priority)
            .with_max_retries(finished.max_retries)
            .with_timeout(finished.timeout_secs)
            .with_schedule(expression)
            .scheduled_for(next);

        self.submit(new).await.map(Some)
    }
}
