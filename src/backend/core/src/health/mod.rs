//! Health probing
//!
//! Dependency probes used by the `system.health_check` job and by
//! [`JobEngine::health`](crate::jobs::JobEngine::health).

mod check;
mod checker;

pub use check::*;
pub use checker::*;
