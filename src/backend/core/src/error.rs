//! Error handling for Cadence.
//!
//! This module provides:
//! - A single crate error type carrying a stable, machine-readable code
//! - User-facing messages separated from internal detail (for logs only)
//! - Retry classification used by the scheduler when a store call fails
//! - Severity-aware logging with tracing and an error counter metric
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence_core::error::{CadenceError, ErrorCode, ErrorContext, Result};
//!
//! fn load(path: &str) -> Result<String> {
//!     std::fs::read_to_string(path)
//!         .context("Failed to read job manifest")
//!         .with_error_code(ErrorCode::ConfigurationError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::jobs::{JobId, JobStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Cadence operations.
pub type Result<T> = std::result::Result<T, CadenceError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be matched on by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    DuplicateJob,
    InvalidStateTransition,
    UnknownJobType,
    InvalidSchedule,

    // Execution Errors (1100-1199)
    WorkerPoolClosed,
    Timeout,
    MaintenanceFailed,
    HealthCheckFailed,

    // Store Errors (2000-2099)
    StoreUnavailable,
    StoreQueryFailed,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Validation Errors (4100-4199)
    ValidationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::DuplicateJob => 1001,
            Self::InvalidStateTransition => 1002,
            Self::UnknownJobType => 1003,
            Self::InvalidSchedule => 1004,

            Self::WorkerPoolClosed => 1100,
            Self::Timeout => 1101,
            Self::MaintenanceFailed => 1102,
            Self::HealthCheckFailed => 1103,

            Self::StoreUnavailable => 2000,
            Self::StoreQueryFailed => 2001,

            Self::SerializationError => 2200,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Whether an operation failing with this code may succeed if attempted again.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable
                | Self::Timeout
                | Self::MaintenanceFailed
                | Self::HealthCheckFailed
        )
    }

    /// Get the category name for metrics labels.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "execution",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity levels used to pick the log level for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected, caller-side mistakes
    Low,
    /// Recoverable operational problems
    Medium,
    /// Failures that need attention
    High,
    /// The engine cannot make progress
    Critical,
}

impl ErrorSeverity {
    /// Map an error code to its severity.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::DuplicateJob
            | ErrorCode::InvalidStateTransition
            | ErrorCode::ValidationError
            | ErrorCode::InvalidSchedule => Self::Low,

            ErrorCode::Timeout
            | ErrorCode::HealthCheckFailed
            | ErrorCode::UnknownJobType
            | ErrorCode::SerializationError => Self::Medium,

            ErrorCode::StoreQueryFailed
            | ErrorCode::MaintenanceFailed
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StoreUnavailable
            | ErrorCode::WorkerPoolClosed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, execution, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Cadence.
#[derive(Error, Debug)]
pub struct CadenceError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CadenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CadenceError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "cadence_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for attaching context to foreign errors.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Re-code the error.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let msg = message.into();
            CadenceError::with_internal(ErrorCode::InternalError, msg, e.to_string()).with_source(e)
        })
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| CadenceError::with_internal(code, code.to_string(), e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CadenceError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| CadenceError::new(code, code.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for CadenceError {
    fn from(error: sqlx::Error) -> Self {
        let (code, message) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::JobNotFound, "Record not found"),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                (ErrorCode::DuplicateJob, "Record already exists")
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => (ErrorCode::StoreUnavailable, "Job store is unavailable"),
            _ => (ErrorCode::StoreQueryFailed, "Job store query failed"),
        };

        Self::with_internal(code, message, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for CadenceError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::StoreQueryFailed,
            "Database migration failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for CadenceError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to serialize or deserialize data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<cron::error::Error> for CadenceError {
    fn from(error: cron::error::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidSchedule,
            "Invalid schedule expression",
            error.to_string(),
        )
    }
}

impl From<tokio::sync::AcquireError> for CadenceError {
    fn from(error: tokio::sync::AcquireError) -> Self {
        Self::with_internal(
            ErrorCode::WorkerPoolClosed,
            "Worker pool is closed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for CadenceError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for CadenceError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for CadenceError {
    fn from(error: config::ConfigError) -> Self {
        let (code, message) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::ConfigurationError, "Configuration source not found")
            }
            config::ConfigError::FileParse { .. } | config::ConfigError::PathParse(_) => {
                (ErrorCode::InvalidConfiguration, "Configuration could not be parsed")
            }
            _ => (ErrorCode::InvalidConfiguration, "Invalid configuration"),
        };
        Self::with_internal(code, message, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for CadenceError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<CadenceError>() {
            Ok(cadence_error) => cadence_error,
            Err(error) => Self::internal(format!("{:#}", error)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl CadenceError {
    /// A job id that does not exist in the store.
    pub fn job_not_found(job_id: JobId) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    /// Inserting a job whose id already exists.
    pub fn duplicate_job(job_id: JobId) -> Self {
        Self::new(ErrorCode::DuplicateJob, format!("Job already exists: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    /// A status change the job state machine does not allow.
    pub fn invalid_state_transition(job_id: JobId, from: JobStatus, to: JobStatus) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid state transition for job {}: {} -> {}", job_id, from, to),
        )
        .with_context("from", from)
        .with_context("to", to)
    }

    /// A job type name that is not known to the engine.
    pub fn unknown_job_type(job_type: impl Into<String>) -> Self {
        let job_type = job_type.into();
        Self::new(
            ErrorCode::UnknownJobType,
            format!("Unknown job type '{}'", job_type),
        )
        .with_details(ErrorDetails::new().with_entity("job_type", &job_type))
    }

    /// A schedule expression that cannot be parsed or never fires.
    pub fn invalid_schedule(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        let expression = expression.into();
        Self::with_internal(
            ErrorCode::InvalidSchedule,
            format!("Invalid schedule expression '{}'", expression),
            reason,
        )
        .with_context("expression", &expression)
    }

    /// The job store could not be reached.
    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StoreUnavailable, "Job store is unavailable", reason)
    }

    /// A database maintenance step failed.
    pub fn maintenance_failed(step: &'static str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::MaintenanceFailed,
            format!("Database maintenance step '{}' failed", step),
            reason,
        )
        .with_context("step", step)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
