//! Job records and the types that flow through execution.
//!
//! - **Job**: the persisted unit of schedulable work and its state machine
//! - **NewJob**: a submission request, resolved against configured defaults on enqueue
//! - **ExecutionRecord**: append-only log entry written once per attempt
//! - **JobContext / JobOutcome**: what a handler receives and what it must return

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CadenceError;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` and a free slot
    Pending,
    /// Claimed and executing on a worker
    Running,
    /// Handler finished without error
    Succeeded,
    /// Handler reported a failure; awaiting the retry decision
    Failed,
    /// Deadline elapsed before the handler finished; awaiting the retry decision
    TimedOut,
    /// Retry granted; about to return to pending
    Retrying,
    /// Stopped by request
    Cancelled,
    /// Failed permanently; needs a human
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        Self::Pending,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::TimedOut,
        Self::Retrying,
        Self::Cancelled,
        Self::Dead,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
                | (Failed, Retrying)
                | (TimedOut, Retrying)
                | (Failed, Dead)
                | (TimedOut, Dead)
                | (Retrying, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CadenceError::validation(format!("Unknown job status '{}'", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Numeric rank, higher runs first.
    pub fn rank(&self) -> i16 {
        *self as i16
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No handler for the job type; never retried
    Configuration,
    /// Transient failure
    Retryable,
    /// Permanent failure
    Fatal,
    /// Deadline exceeded
    Timeout,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable | Self::Timeout)
    }
}

/// A classified job failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
    /// Optional machine-readable code supplied by the handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Retryable, message)
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("execution exceeded {}s deadline", timeout_secs),
        )
    }

    pub fn unknown_type(job_type: &str) -> Self {
        Self::new(
            FailureKind::Configuration,
            format!("no handler registered for job type '{}'", job_type),
        )
        .with_code("UNKNOWN_JOB_TYPE")
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<CadenceError> for JobError {
    fn from(error: CadenceError) -> Self {
        let kind = if error.is_retryable() {
            FailureKind::Retryable
        } else {
            FailureKind::Fatal
        };
        Self {
            kind,
            message: error.user_message().to_string(),
            code: Some(error.code().to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Executions started so far; the claim increments it
    pub attempt: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Present only on recurring jobs
    pub cron_expression: Option<String>,
    pub last_error: Option<JobError>,
}

impl Job {
    /// Whether the job is pending and its scheduled time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    pub fn is_recurring(&self) -> bool {
        self.cron_expression.is_some()
    }

    /// Get the duration if the job has both start and finish times.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submission
// ═══════════════════════════════════════════════════════════════════════════════

/// A request to enqueue a job.
///
/// Unset fields are filled from per-type overrides and global defaults when the job
/// is submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: Option<JobPriority>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub cron_expression: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: serde_json::Value::Null,
            priority: None,
            scheduled_at: None,
            max_retries: None,
            timeout_secs: None,
            cron_expression: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the earliest time the job may run.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Make the job recurring.
    pub fn with_schedule(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Records
// ═══════════════════════════════════════════════════════════════════════════════

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ExecutionOutcome {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CadenceError::validation(format!(
                "Unknown execution outcome '{}'",
                other
            ))),
        }
    }
}

/// One attempt of one job. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job_id: JobId,
    pub job_type: String,
    pub attempt: u32,
    pub outcome: ExecutionOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<JobError>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Events
// ═══════════════════════════════════════════════════════════════════════════════

/// A status transition that has been committed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_type: String,
    /// `None` when the job was just created
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one attempt.
pub struct JobContext {
    job: Job,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, cancellation: CancellationToken) -> Self {
        Self { job, cancellation }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    /// The current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Decode the payload; a payload that does not decode is a fatal failure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.job.payload.clone())
            .map_err(|e| JobError::fatal(format!("invalid payload: {}", e)).with_code("BAD_PAYLOAD"))
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the pool cancels this attempt.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Run a future, giving up with `None` if cancellation is requested first.
    pub async fn cancellable<F, T>(&self, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            result = future => Some(result),
            _ = self.cancellation.cancelled() => None,
        }
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job.id,
            job_type = %self.job.job_type,
            attempt = self.job.attempt,
            message
        );
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job.id,
            job_type = %self.job.job_type,
            attempt = self.job.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// What every handler invocation returns.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success,
    Retryable(JobError),
    Fatal(JobError),
    /// The handler observed cancellation and stopped
    Cancelled,
}

impl JobOutcome {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(JobError::retryable(message))
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(JobError::fatal(message))
    }
}

impl From<Result<(), JobError>> for JobOutcome {
    fn from(result: Result<(), JobError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(error) if error.is_retryable() => Self::Retryable(error),
            Err(error) => Self::Fatal(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
