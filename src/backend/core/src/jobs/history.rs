//! Execution history retention.
//!
//! Execution records and terminal jobs whose `finished_at` is older than the
//! retention window are deleted in bounded batches, so a large backlog never turns
//! into one long-running statement.

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::job::JobStatus;
use super::store::{JobFilter, JobStore};
use crate::clock::Clock;
use crate::config::HistoryConfig;
use crate::error::Result;
use crate::telemetry::JobMetrics;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub executions_deleted: u64,
    pub jobs_deleted: u64,
    /// Delete statements issued
    pub batches: u32,
}

/// Deletes history past the retention window.
pub struct HistorySweeper {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
    batch_size: usize,
}

impl HistorySweeper {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, retention_days: u32, batch_size: usize) -> Self {
        Self {
            store,
            clock,
            retention_days,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: &HistoryConfig) -> Self {
        Self::new(store, clock, config.retention_days, config.batch_size)
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Delete everything that finished before `now - retention_days`.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let cutoff = self.clock.now() - Duration::days(i64::from(self.retention_days));
        let mut report = SweepReport::default();

        loop {
            let deleted = self
                .store
                .delete_executions_before(cutoff, self.batch_size)
                .await?;
            report.batches += 1;
            report.executions_deleted += deleted;
            debug!(deleted, "Execution record batch deleted");
            if (deleted as usize) < self.batch_size {
                break;
            }
        }

        let terminal = JobFilter::new()
            .with_statuses([JobStatus::Succeeded, JobStatus::Dead, JobStatus::Cancelled])
            .finished_before(cutoff)
            .with_limit(self.batch_size);
        loop {
            let ids: Vec<_> = self.store.query(&terminal).await?.into_iter().map(|j| j.id).collect();
            if ids.is_empty() {
                break;
            }
            let deleted = self.store.delete(&ids).await?;
            report.batches += 1;
            report.jobs_deleted += deleted;
            debug!(deleted, "Terminal job batch deleted");
            if ids.len() < self.batch_size {
                break;
            }
        }

        JobMetrics::record_history_deleted("executions", report.executions_deleted);
        JobMetrics::record_history_deleted("jobs", report.jobs_deleted);
        info!(
            cutoff = %cutoff,
            executions_deleted = report.executions_deleted,
            jobs_deleted = report.jobs_deleted,
            batches = report.batches,
            "History retention sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::job::{ExecutionOutcome, ExecutionRecord, Job, JobPriority};
    use crate::jobs::store::InMemoryJobStore;
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    fn finished_job(store: &InMemoryJobStore, status: JobStatus, finished_at: DateTime<Utc>) -> Job {
        Job {
            id: store.next_id(),
            job_type: "reports.generate".into(),
            payload: serde_json::Value::Null,
            priority: JobPriority::Medium,
            status,
            scheduled_at: finished_at,
            created_at: finished_at,
            started_at: Some(finished_at),
            finished_at: Some(finished_at),
            attempt: 1,
            max_retries: 3,
            timeout_secs: 60,
            cron_expression: None,
            last_error: None,
        }
    }

    fn record(job: &Job) -> ExecutionRecord {
        let at = job.finished_at.unwrap();
        ExecutionRecord {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: 1,
            outcome: ExecutionOutcome::Succeeded,
            started_at: at,
            finished_at: at,
            duration_ms: 5,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_batches_until_short() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let old = now - Duration::days(45);
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..5 {
            let job = finished_job(&store, JobStatus::Succeeded, old);
            store.append_execution(record(&job)).await.unwrap();
            store.insert(job).await.unwrap();
        }

        let sweeper = HistorySweeper::new(store.clone(), Arc::new(ManualClock::new(now)), 30, 2);
        let report = sweeper.sweep().await.unwrap();

        assert_eq!(report.executions_deleted, 5);
        assert_eq!(report.jobs_deleted, 5);
        // 2 + 2 + 1 for each kind
        assert_eq!(report.batches, 6);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_keeps_active_and_recent_jobs() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let store = Arc::new(InMemoryJobStore::new());

        let recent = finished_job(&store, JobStatus::Dead, now - Duration::days(3));
        let mut stuck = finished_job(&store, JobStatus::Pending, now - Duration::days(90));
        stuck.finished_at = None;
        let recent_id = recent.id;
        let stuck_id = stuck.id;
        store.insert(recent).await.unwrap();
        store.insert(stuck).await.unwrap();

        let sweeper = HistorySweeper::new(store.clone(), Arc::new(ManualClock::new(now)), 30, 100);
        let report = sweeper.sweep().await.unwrap();

        assert_eq!(report.jobs_deleted, 0);
        assert!(store.get(recent_id).await.unwrap().is_some());
        assert!(store.get(stuck_id).await.unwrap().is_some());
    }
}
