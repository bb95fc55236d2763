//! PostgreSQL storage for Cadence.
//!
//! Uses sqlx with a shared connection pool. The schema lives in `migrations/`.

mod job_store;
mod maintenance;

pub use job_store::PgJobStore;
pub use maintenance::{MaintenanceBackend, NoopMaintenance, PgMaintenance};

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::health::DatabaseProbe;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the pool described by `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn job_store(&self) -> PgJobStore {
        PgJobStore::new(self.pool.clone())
    }

    pub fn maintenance(&self) -> PgMaintenance {
        PgMaintenance::new(self.pool.clone())
    }

    pub fn probe(&self) -> DatabaseProbe {
        DatabaseProbe::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
