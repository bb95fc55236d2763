#![allow(clippy::result_large_err)]
//! # Cadence Core
//!
//! Background job scheduling and execution engine.
//!
//! ## Architecture
//!
//! - **Scheduler Loop**: Polls for due jobs and claims them with a compare-and-swap on status
//! - **Worker Pool**: Bounded concurrent execution with per-job deadlines and cancellation
//! - **Retry Policy**: Exponential backoff with a per-job retry budget, then dead
//! - **Job Registry**: Explicit job type to handler map built at startup
//! - **System Jobs**: Recurring health checks, database maintenance and history retention
//! - **Job Store**: In-memory arena or PostgreSQL
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod jobs;
pub mod telemetry;

pub use error::{CadenceError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::error::{CadenceError, ErrorCode, ErrorContext, Result};
    pub use crate::jobs::{
        handler_fn, CancelResult, Job, JobContext, JobEngine, JobError, JobFilter, JobHandler,
        JobId, JobOutcome, JobPriority, JobStatus, JobStore, NewJob,
    };
}
