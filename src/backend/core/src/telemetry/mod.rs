//! Telemetry: structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use cadence_core::config::Config;
//! use cadence_core::telemetry::init_telemetry;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! init_telemetry(&config.telemetry)?;
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, LogFormat, LoggingConfig};
pub use self::metrics::{init_metrics, JobMetrics};

use crate::config::TelemetryConfig;

/// Initialize logging and, when enabled, the metrics exporter.
///
/// Call once at startup, inside the tokio runtime.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_logging(&config.logging())?;

    if config.metrics_enabled {
        init_metrics(config.metrics_listen)?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_format = ?config.log_format,
        metrics_enabled = config.metrics_enabled,
        "Telemetry initialized"
    );
    Ok(())
}
