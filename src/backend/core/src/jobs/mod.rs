//! Background job scheduling and execution.
//!
//! - **Job records**: persisted units of work with a status state machine
//! - **Scheduler loop**: polls for due jobs and claims them atomically
//! - **Worker pool**: bounded concurrent execution with deadlines and cancellation
//! - **Retry policy**: exponential backoff, then dead
//! - **System jobs**: health checks, database maintenance and history retention
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                 JobEngine                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │ JobSubmitter│───▶│  JobStore   │◀──▶│  Scheduler  │───▶│ WorkerPool  │  │
//! │  │ (defaults)  │    │ (CAS claim) │    │    Loop     │    │ (semaphore) │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘  │
//! │         ▲                  ▲                                     │         │
//! │         │                  │            ┌─────────────┐          ▼         │
//! │         │                  └────────────│ RetryPolicy │◀── JobRegistry     │
//! │         │                               └─────────────┘     handlers       │
//! │  ┌──────┴──────────────────────────────────────────────────────────────┐  │
//! │  │  SystemJobManager: seeds system jobs, re-enqueues recurring jobs     │  │
//! │  └──────────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence_core::jobs::{handler_fn, JobEngine, JobOutcome, NewJob};
//!
//! let engine = JobEngine::builder(config)
//!     .register("emails.send", handler_fn(|ctx| async move {
//!         let request: SendEmail = match ctx.payload_as() {
//!             Ok(r) => r,
//!             Err(e) => return JobOutcome::Fatal(e),
//!         };
//!         send(request).await.into()
//!     }))
//!     .build()?;
//!
//! engine.start().await?;
//! engine.enqueue(NewJob::new("emails.send").with_payload(json!({"to": "ops@example.com"}))).await?;
//! ```

pub mod builtin;
pub mod engine;
pub mod history;
pub mod job;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod submit;
pub mod system;
pub mod worker;

pub use engine::{CancelResult, EngineHealth, JobEngine, JobEngineBuilder};
pub use history::{HistorySweeper, SweepReport};
pub use job::{
    ExecutionOutcome, ExecutionRecord, FailureKind, Job, JobContext, JobError, JobEvent, JobId,
    JobOutcome, JobPriority, JobStatus, NewJob,
};
pub use registry::{handler_fn, JobHandler, JobRegistry, JobRegistryBuilder};
pub use retry::{RetryDecision, RetryPolicy};
pub use schedule::ScheduleExpr;
pub use scheduler::{SchedulerHandle, SchedulerLoop, TickReport};
pub use store::{
    ExclusiveClaim, IdGenerator, InMemoryJobStore, JobFilter, JobStore, SequentialIdGenerator,
    UuidGenerator,
};
pub use submit::{JobDefaults, JobSubmitter};
pub use system::SystemJobManager;
pub use worker::{TerminalHook, WorkerPool, WorkerPoolStats};
