//! Health probes.
//!
//! A probe checks one dependency. Probes run concurrently, each under its own
//! timeout, and a probe that exceeds its latency threshold reports `Degraded`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use super::check::{ComponentHealth, HealthReport};
use crate::jobs::store::JobStore;

/// Limits applied to every probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Abandon the probe after this long
    pub timeout: Duration,
    /// Report `Degraded` above this latency
    pub latency_threshold_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            latency_threshold_ms: 1000,
        }
    }
}

/// A single dependency check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Component name used in reports.
    fn name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;

    /// Run [`check`](Self::check) under the configured timeout and latency threshold.
    async fn check_with_config(&self, config: &ProbeConfig) -> ComponentHealth {
        let start = Instant::now();

        match tokio::time::timeout(config.timeout, self.check()).await {
            Ok(mut health) => {
                health.latency_ms = Some(start.elapsed().as_millis() as u64);
                health.check_latency_threshold(config.latency_threshold_ms);
                health
            }
            Err(_) => ComponentHealth::unhealthy(self.name())
                .with_error(format!("Health check timed out after {:?}", config.timeout))
                .with_latency(start.elapsed()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Store Probe
// ═══════════════════════════════════════════════════════════════════════════════

/// Pings the job store.
pub struct StoreProbe {
    store: Arc<dyn JobStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthProbe for StoreProbe {
    fn name(&self) -> &str {
        "job_store"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        match self.store.ping().await {
            Ok(()) => ComponentHealth::healthy(self.name()).with_latency(start.elapsed()),
            Err(e) => ComponentHealth::unhealthy(self.name())
                .with_error(e.to_string())
                .with_latency(start.elapsed()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Database Probe
// ═══════════════════════════════════════════════════════════════════════════════

/// Checks the PostgreSQL pool and runs `SELECT 1`.
pub struct DatabaseProbe {
    pool: PgPool,
}

impl DatabaseProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();

        if self.pool.is_closed() {
            return ComponentHealth::unhealthy(self.name())
                .with_error("Connection pool is closed")
                .with_latency(start.elapsed());
        }

        match sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
        {
            Ok(_) => {
                let pool_size = self.pool.size();
                let idle = self.pool.num_idle();
                debug!(pool_size, idle_connections = idle, "Database pool status");

                ComponentHealth::healthy(self.name())
                    .with_message("Connected to PostgreSQL")
                    .with_latency(start.elapsed())
                    .with_metadata("pool_size", pool_size)
                    .with_metadata("idle_connections", idle)
            }
            Err(e) => {
                error!(error = %e, "Database health check failed");
                ComponentHealth::unhealthy(self.name())
                    .with_error(format!("Query failed: {}", e))
                    .with_latency(start.elapsed())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Composite
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs a set of probes concurrently.
#[derive(Default, Clone)]
pub struct CompositeProbe {
    probes: Vec<Arc<dyn HealthProbe>>,
    config: ProbeConfig,
}

impl CompositeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn with_config(mut self, config: ProbeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Run every probe and fold the results.
    pub async fn check_all(&self) -> HealthReport {
        let checks = self.probes.iter().map(|probe| {
            let probe = Arc::clone(probe);
            let config = self.config.clone();
            async move { probe.check_with_config(&config).await }
        });

        HealthReport::new().with_components(futures::future::join_all(checks).await)
    }
}
