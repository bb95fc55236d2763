//! Prometheus metrics for the scheduler, worker pool and retention sweeper.
//!
//! Metric calls go through the `metrics` facade and are no-ops until a recorder is
//! installed, so library code records unconditionally.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub const JOBS_ENQUEUED: &str = "cadence_jobs_enqueued_total";
pub const JOBS_CLAIMED: &str = "cadence_jobs_claimed_total";
pub const JOB_OUTCOMES: &str = "cadence_job_outcomes_total";
pub const JOB_DURATION: &str = "cadence_job_duration_seconds";
pub const WORKER_SLOTS_BUSY: &str = "cadence_worker_slots_busy";
pub const SCHEDULER_TICKS: &str = "cadence_scheduler_ticks_total";
pub const HISTORY_DELETED: &str = "cadence_history_deleted_total";
pub const ERRORS: &str = "cadence_errors_total";

const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0,
];

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(listen: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(JOB_DURATION.to_string()),
            DURATION_BUCKETS,
        )?
        .install()?;

    register_metric_descriptions();

    tracing::info!(listen = %listen, "Prometheus exporter listening");
    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!(JOBS_ENQUEUED, "Jobs inserted as pending, by type");
    describe_counter!(JOBS_CLAIMED, "Pending jobs claimed by the scheduler, by type");
    describe_counter!(JOB_OUTCOMES, "Finished attempts by type and outcome");
    describe_histogram!(JOB_DURATION, "Attempt wall time in seconds");
    describe_gauge!(WORKER_SLOTS_BUSY, "Worker slots currently executing a job");
    describe_counter!(SCHEDULER_TICKS, "Scheduler ticks by result");
    describe_counter!(HISTORY_DELETED, "Rows purged by the retention sweeper");
    describe_counter!(ERRORS, "Errors constructed, by code and category");
}

/// Recording helpers for job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_enqueued(job_type: &str) {
        counter!(JOBS_ENQUEUED, "job_type" => job_type.to_string()).increment(1);
    }

    pub fn record_claimed(job_type: &str) {
        counter!(JOBS_CLAIMED, "job_type" => job_type.to_string()).increment(1);
    }

    /// Record a finished attempt.
    pub fn record_outcome(job_type: &str, outcome: &'static str, duration_seconds: f64) {
        counter!(
            JOB_OUTCOMES,
            "job_type" => job_type.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
        histogram!(JOB_DURATION, "job_type" => job_type.to_string()).record(duration_seconds);
    }

    pub fn set_slots_busy(busy: usize) {
        gauge!(WORKER_SLOTS_BUSY).set(busy as f64);
    }

    /// `result` is one of `ok`, `idle` or `error`.
    pub fn record_tick(result: &'static str) {
        counter!(SCHEDULER_TICKS, "result" => result).increment(1);
    }

    /// `kind` is `executions` or `jobs`.
    pub fn record_history_deleted(kind: &'static str, count: u64) {
        counter!(HISTORY_DELETED, "kind" => kind).increment(count);
    }
}
