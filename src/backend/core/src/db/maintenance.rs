//! Database maintenance operations run by `system.db_maintenance`.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Instant;
use tracing::info;

use crate::error::{CadenceError, Result};

/// Storage housekeeping steps.
#[async_trait]
pub trait MaintenanceBackend: Send + Sync {
    /// Reclaim dead tuples and refresh planner statistics.
    async fn vacuum(&self, full: bool) -> Result<()>;

    /// Rebuild indexes.
    async fn reindex(&self) -> Result<()>;
}

/// PostgreSQL `VACUUM` / `REINDEX`.
#[derive(Clone)]
pub struct PgMaintenance {
    pool: PgPool,
}

impl PgMaintenance {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MaintenanceBackend for PgMaintenance {
    async fn vacuum(&self, full: bool) -> Result<()> {
        let statement = if full {
            "VACUUM (FULL, ANALYZE)"
        } else {
            "VACUUM (ANALYZE)"
        };

        let start = Instant::now();
        // VACUUM cannot run inside a transaction block, so execute on the bare pool.
        sqlx::query(statement)
            .execute(&self.pool)
            .await
            .map_err(|e| CadenceError::maintenance_failed("vacuum", e.to_string()))?;

        info!(full, elapsed_ms = start.elapsed().as_millis() as u64, "VACUUM completed");
        Ok(())
    }

    async fn reindex(&self) -> Result<()> {
        let database: String = sqlx::query_scalar("SELECT current_database()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CadenceError::maintenance_failed("reindex", e.to_string()))?;

        let start = Instant::now();
        let statement = format!("REINDEX DATABASE \"{}\"", database.replace('"', "\"\""));
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(|e| CadenceError::maintenance_failed("reindex", e.to_string()))?;

        info!(
            database = %database,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "REINDEX completed"
        );
        Ok(())
    }
}

/// Backend for stores with nothing to maintain (the in-memory arena).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMaintenance;

#[async_trait]
impl MaintenanceBackend for NoopMaintenance {
    async fn vacuum(&self, full: bool) -> Result<()> {
        tracing::debug!(full, "No maintenance backend configured; skipping vacuum");
        Ok(())
    }

    async fn reindex(&self) -> Result<()> {
        tracing::debug!("No maintenance backend configured; skipping reindex");
        Ok(())
    }
}
