//! Configuration management.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults (every field has one)
//! 2. an optional TOML file
//! 3. environment variables prefixed `CADENCE__`, nested with `__`
//!    (e.g. `CADENCE__SCHEDULER__MAX_CONCURRENT_JOBS=20`)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{CadenceError, Result};
use crate::jobs::builtin::{
    DB_MAINTENANCE_JOB, HEALTH_CHECK_JOB, HISTORY_RETENTION_JOB, SYSTEM_JOB_TYPES,
};
use crate::jobs::retry::RetryPolicy;
use crate::jobs::schedule::ScheduleExpr;
use crate::jobs::JobPriority;
use crate::telemetry::logging::{LogFormat, LoggingConfig};

const ENV_PREFIX: &str = "CADENCE";
const ENV_SEPARATOR: &str = "__";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Polling and capacity
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Backoff and retry budget
    #[serde(default)]
    pub retry: RetryConfig,

    /// Execution history retention
    #[serde(default)]
    pub history: HistoryConfig,

    /// Built-in recurring jobs
    #[serde(default)]
    pub system_jobs: SystemJobsConfig,

    /// Per-type overrides, keyed by job type
    #[serde(default)]
    pub job_types: HashMap<String, JobTypeConfig>,

    /// PostgreSQL store; absent means the in-memory store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between scheduler ticks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Worker slots
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Deadline for jobs with no explicit or per-type timeout
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// How long shutdown waits for in-flight jobs
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            default_timeout_secs: default_timeout_secs(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries granted to jobs that do not set their own budget
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.base_delay_secs, self.max_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Terminal jobs and execution records older than this are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Rows deleted per statement
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// When the retention sweep runs
    #[serde(default = "default_history_schedule")]
    pub schedule: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
            schedule: default_history_schedule(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemJobsConfig {
    /// Enqueue missing system jobs at startup
    #[serde(default = "default_auto_init")]
    pub auto_init: bool,

    /// System job types to manage
    #[serde(default = "default_enabled_system_jobs")]
    pub enabled: Vec<String>,

    #[serde(default)]
    pub health_check: HealthCheckJobConfig,

    #[serde(default)]
    pub maintenance: MaintenanceJobConfig,
}

impl Default for SystemJobsConfig {
    fn default() -> Self {
        Self {
            auto_init: default_auto_init(),
            enabled: default_enabled_system_jobs(),
            health_check: HealthCheckJobConfig::default(),
            maintenance: MaintenanceJobConfig::default(),
        }
    }
}

impl SystemJobsConfig {
    pub fn is_enabled(&self, job_type: &str) -> bool {
        self.enabled.iter().any(|t| t == job_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckJobConfig {
    #[serde(default = "default_health_check_schedule")]
    pub schedule: String,

    #[serde(default = "default_health_check_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HealthCheckJobConfig {
    fn default() -> Self {
        Self {
            schedule: default_health_check_schedule(),
            timeout_secs: default_health_check_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceJobConfig {
    #[serde(default = "default_maintenance_schedule")]
    pub schedule: String,

    /// Use `VACUUM FULL` (takes exclusive locks)
    #[serde(default)]
    pub vacuum_full: bool,

    /// Rebuild indexes after vacuuming
    #[serde(default)]
    pub reindex: bool,

    #[serde(default = "default_maintenance_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MaintenanceJobConfig {
    fn default() -> Self {
        Self {
            schedule: default_maintenance_schedule(),
            vacuum_full: false,
            reindex: false,
            timeout_secs: default_maintenance_timeout_secs(),
        }
    }
}

/// Per-type defaults. Unset fields fall through to the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTypeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<JobPriority>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Apply embedded migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive (trace, debug, info, warn, error, or an `EnvFilter` string)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Install the Prometheus exporter
    #[serde(default)]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: SocketAddr,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            module_levels: HashMap::new(),
            metrics_enabled: false,
            metrics_listen: default_metrics_listen(),
        }
    }
}

impl TelemetryConfig {
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            format: self.log_format.clone(),
            module_levels: self.module_levels.clone(),
            ..LoggingConfig::default()
        }
    }
}

// Default value functions
fn default_poll_interval_ms() -> u64 { 5000 }
fn default_max_concurrent_jobs() -> usize { 10 }
fn default_timeout_secs() -> u64 { 3600 }
fn default_shutdown_grace() -> Duration { Duration::from_secs(30) }
fn default_max_retries() -> u32 { 3 }
fn default_base_delay_secs() -> u64 { 5 }
fn default_max_delay_secs() -> u64 { 3600 }
fn default_retention_days() -> u32 { 30 }
fn default_batch_size() -> usize { 500 }
fn default_history_schedule() -> String { "0 30 2 * * *".to_string() }
fn default_auto_init() -> bool { true }
fn default_enabled_system_jobs() -> Vec<String> {
    SYSTEM_JOB_TYPES.iter().map(|t| t.to_string()).collect()
}
fn default_health_check_schedule() -> String { "0 */5 * * * *".to_string() }
fn default_health_check_timeout_secs() -> u64 { 60 }
fn default_maintenance_schedule() -> String { "0 0 3 * * *".to_string() }
fn default_maintenance_timeout_secs() -> u64 { 1800 }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_run_migrations() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_listen() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 9000)) }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from a specific file path, overlaid with the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_from(Some(path.as_ref()))
    }

    fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("system_jobs.enabled"),
            )
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(CadenceError::configuration(
                "scheduler.max_concurrent_jobs must be at least 1",
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(CadenceError::configuration(
                "scheduler.poll_interval_ms must be positive",
            ));
        }
        if self.scheduler.default_timeout_secs == 0 {
            return Err(CadenceError::configuration(
                "scheduler.default_timeout_secs must be positive",
            ));
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(CadenceError::configuration(
                "retry.base_delay_secs must not exceed retry.max_delay_secs",
            ));
        }
        if self.history.batch_size == 0 {
            return Err(CadenceError::configuration("history.batch_size must be at least 1"));
        }
        if self.system_jobs.health_check.timeout_secs == 0
            || self.system_jobs.maintenance.timeout_secs == 0
        {
            return Err(CadenceError::configuration(
                "system job timeouts must be positive",
            ));
        }

        for name in &self.system_jobs.enabled {
            if !SYSTEM_JOB_TYPES.contains(&name.as_str()) {
                return Err(CadenceError::unknown_job_type(name.clone())
                    .with_context("setting", "system_jobs.enabled"));
            }
        }

        for expression in [
            &self.history.schedule,
            &self.system_jobs.health_check.schedule,
            &self.system_jobs.maintenance.schedule,
        ] {
            ScheduleExpr::parse(expression)?;
        }

        for (job_type, overrides) in &self.job_types {
            if overrides.timeout_secs == Some(0) {
                return Err(CadenceError::configuration(format!(
                    "job_types.\"{}\".timeout_secs must be positive",
                    job_type
                )));
            }
        }

        if let Some(db) = &self.database {
            if db.url.trim().is_empty() {
                return Err(CadenceError::configuration("database.url must not be empty"));
            }
            if db.min_connections > db.max_connections {
                return Err(CadenceError::configuration(
                    "database.min_connections must not exceed database.max_connections",
                ));
            }
        }

        Ok(())
    }

    /// The schedule expression configured for a system job type.
    pub fn system_job_schedule(&self, job_type: &str) -> Option<&str> {
        match job_type {
            HEALTH_CHECK_JOB => Some(&self.system_jobs.health_check.schedule),
            DB_MAINTENANCE_JOB => Some(&self.system_jobs.maintenance.schedule),
            HISTORY_RETENTION_JOB => Some(&self.history.schedule),
            _ => None,
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            CadenceError::with_internal(
                crate::error::ErrorCode::SerializationError,
                "Failed to render configuration",
                e.to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.poll_interval_ms, 5000);
        assert_eq!(config.scheduler.max_concurrent_jobs, 10);
        assert_eq!(config.scheduler.default_timeout_secs, 3600);
        assert_eq!(config.scheduler.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.retry.default_max_retries, 3);
        assert_eq!(config.history.retention_days, 30);
        assert_eq!(config.history.batch_size, 500);
        assert!(config.system_jobs.auto_init);
        assert_eq!(config.system_jobs.enabled.len(), 3);
        assert!(config.database.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
max_concurrent_jobs = 4
shutdown_grace = "5s"

[system_jobs]
enabled = ["system.health_check"]

[system_jobs.maintenance]
vacuum_full = true

[job_types."reports.generate"]
priority = "high"
timeout_secs = 600
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 4);
        assert_eq!(config.scheduler.poll_interval_ms, 5000);
        assert_eq!(config.scheduler.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.system_jobs.enabled, vec!["system.health_check".to_string()]);
        assert!(config.system_jobs.maintenance.vacuum_full);

        let overrides = &config.job_types["reports.generate"];
        assert_eq!(overrides.priority, Some(JobPriority::High));
        assert_eq!(overrides.timeout_secs, Some(600));
        assert_eq!(overrides.max_retries, None);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.scheduler.max_concurrent_jobs = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_validate_rejects_unknown_system_job() {
        let mut config = Config::default();
        config.system_jobs.enabled.push("system.coffee".into());
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownJobType);
    }

    #[test]
    fn test_validate_rejects_bad_schedule() {
        let mut config = Config::default();
        config.history.schedule = "every tuesday".into();
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSchedule);
    }

    #[test]
    fn test_effective_toml_roundtrip() {
        let mut config = Config::default();
        config.job_types.insert(
            "reports.generate".into(),
            JobTypeConfig {
                priority: Some(JobPriority::Critical),
                ..Default::default()
            },
        );
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("max_concurrent_jobs = 10"));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(
            parsed.job_types["reports.generate"].priority,
            Some(JobPriority::Critical)
        );
        assert_eq!(parsed.scheduler.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_system_job_schedule_lookup() {
        let config = Config::default();
        assert_eq!(config.system_job_schedule(HISTORY_RETENTION_JOB), Some("0 30 2 * * *"));
        assert_eq!(config.system_job_schedule("other"), None);
    }
}
