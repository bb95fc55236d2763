//! PostgreSQL job store.
//!
//! Claims are a single `UPDATE ... WHERE id = $1 AND status = $2`, so concurrent
//! schedulers can never both move the same row out of a status. Exclusive claims run
//! in a transaction holding an advisory lock keyed on the job type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CadenceError, ErrorCode, Result};
use crate::jobs::job::{ExecutionOutcome, ExecutionRecord, Job, JobError, JobId, JobPriority, JobStatus};
use crate::jobs::store::{
    check_transition, ExclusiveClaim, IdGenerator, JobFilter, JobStore, UuidGenerator,
};

const JOB_COLUMNS: &str = "id, job_type, payload, priority, status, scheduled_at, created_at, \
     started_at, finished_at, attempt, max_retries, timeout_secs, cron_expression, last_error";

/// `JobStore` backed by the `jobs` and `job_executions` tables.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    ids: Arc<dyn IdGenerator>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ids: Arc::new(UuidGenerator),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    fn next_id(&self) -> JobId {
        self.ids.next_id()
    }

    async fn insert(&self, job: Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, payload, priority, status, scheduled_at, created_at,
                              started_at, finished_at, attempt, max_retries, timeout_secs,
                              cron_expression, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                job_type = EXCLUDED.job_type,
                payload = EXCLUDED.payload,
                priority = EXCLUDED.priority,
                status = EXCLUDED.status,
                scheduled_at = EXCLUDED.scheduled_at,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                attempt = EXCLUDED.attempt,
                max_retries = EXCLUDED.max_retries,
                timeout_secs = EXCLUDED.timeout_secs,
                cron_expression = EXCLUDED.cron_expression,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(job.id.0)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority.rank())
        .bind(job.status.as_str())
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.attempt as i32)
        .bind(job.max_retries as i32)
        .bind(job.timeout_secs as i64)
        .bind(&job.cron_expression)
        .bind(job.last_error.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn claim(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        check_transition(id, expected, new)?;

        let stamped = new == JobStatus::Running || new.is_terminal();
        let set = if new == JobStatus::Running {
            "status = $3, attempt = attempt + 1, started_at = $4, finished_at = NULL"
        } else if new.is_terminal() {
            "status = $3, finished_at = $4"
        } else {
            "status = $3"
        };
        let sql = format!(
            "UPDATE jobs SET {} WHERE id = $1 AND status = $2 RETURNING {}",
            set, JOB_COLUMNS
        );

        let mut query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.0)
            .bind(expected.as_str())
            .bind(new.as_str());
        if stamped {
            query = query.bind(at);
        }
        let row = query.fetch_optional(&self.pool).await?;

        row.map(Job::try_from).transpose()
    }

    async fn claim_exclusive(&self, id: JobId, at: DateTime<Utc>) -> Result<ExclusiveClaim> {
        let mut tx = self.pool.begin().await?;

        let job_type: Option<String> =
            sqlx::query_scalar("SELECT job_type FROM jobs WHERE id = $1 AND status = 'pending'")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(job_type) = job_type else {
            return Ok(ExclusiveClaim::Lost);
        };

        // released at commit or rollback; later holders see every committed claim
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&job_type)
            .execute(&mut *tx)
            .await?;

        let busy: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM jobs WHERE job_type = $1 AND status = 'running' AND id <> $2)",
        )
        .bind(&job_type)
        .bind(id.0)
        .fetch_one(&mut *tx)
        .await?;
        if busy {
            return Ok(ExclusiveClaim::Busy);
        }

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE jobs SET status = 'running', attempt = attempt + 1, started_at = $2, \
             finished_at = NULL WHERE id = $1 AND status = 'pending' RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(id.0)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        match row {
            Some(row) => Ok(ExclusiveClaim::Claimed(Job::try_from(row)?)),
            None => Ok(ExclusiveClaim::Lost),
        }
    }

    async fn update_if(&self, job: &Job, expected: JobStatus) -> Result<bool> {
        check_transition(job.id, expected, job.status)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET payload = $3,
                priority = $4,
                status = $5,
                scheduled_at = $6,
                started_at = $7,
                finished_at = $8,
                attempt = $9,
                max_retries = $10,
                timeout_secs = $11,
                cron_expression = $12,
                last_error = $13
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(job.id.0)
        .bind(expected.as_str())
        .bind(&job.payload)
        .bind(job.priority.rank())
        .bind(job.status.as_str())
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.attempt as i32)
        .bind(job.max_retries as i32)
        .bind(job.timeout_secs as i64)
        .bind(&job.cron_expression)
        .bind(job.last_error.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_execution(&self, record: ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_executions (id, job_id, job_type, attempt, outcome,
                                        started_at, finished_at, duration_ms, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.job_id.0)
        .bind(&record.job_type)
        .bind(record.attempt as i32)
        .bind(record.outcome.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_ms as i64)
        .bind(record.error.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn executions(&self, job_id: JobId) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, job_id, job_type, attempt, outcome, started_at, finished_at, duration_ms, error
            FROM job_executions
            WHERE job_id = $1
            ORDER BY attempt, started_at
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExecutionRecord::try_from).collect()
    }

    async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM jobs WHERE TRUE",
            JOB_COLUMNS
        ));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY scheduled_at, id");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn delete(&self, ids: &[JobId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();

        // job_executions rows go with their job through ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_executions_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_executions
            WHERE id IN (
                SELECT id FROM job_executions
                WHERE finished_at < $1
                ORDER BY finished_at
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(status, count)| Ok((status.parse::<JobStatus>()?, count as u64)))
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        builder.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(job_type) = &filter.job_type {
        builder.push(" AND job_type = ").push_bind(job_type.clone());
    }
    if let Some(after) = filter.scheduled_after {
        builder.push(" AND scheduled_at >= ").push_bind(after);
    }
    if let Some(before) = filter.scheduled_before {
        builder.push(" AND scheduled_at <= ").push_bind(before);
    }
    if let Some(cutoff) = filter.finished_before {
        builder.push(" AND finished_at < ").push_bind(cutoff);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    priority: i16,
    status: String,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    attempt: i32,
    max_retries: i32,
    timeout_secs: i64,
    cron_expression: Option<String>,
    last_error: Option<Json<JobError>>,
}

impl TryFrom<JobRow> for Job {
    type Error = CadenceError;

    fn try_from(row: JobRow) -> Result<Self> {
        let priority = JobPriority::from_rank(row.priority).ok_or_else(|| {
            CadenceError::with_internal(
                ErrorCode::StoreQueryFailed,
                "Stored job has an invalid priority",
                format!("job {} has priority rank {}", row.id, row.priority),
            )
        })?;

        Ok(Self {
            id: JobId(row.id),
            job_type: row.job_type,
            payload: row.payload,
            priority,
            status: row.status.parse()?,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            attempt: row.attempt.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            timeout_secs: row.timeout_secs.max(0) as u64,
            cron_expression: row.cron_expression,
            last_error: row.last_error.map(|Json(e)| e),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    job_id: Uuid,
    job_type: String,
    attempt: i32,
    outcome: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: i64,
    error: Option<Json<JobError>>,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = CadenceError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let outcome: ExecutionOutcome = row.outcome.parse()?;
        Ok(Self {
            id: row.id,
            job_id: JobId(row.job_id),
            job_type: row.job_type,
            attempt: row.attempt.max(0) as u32,
            outcome,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_ms: row.duration_ms.max(0) as u64,
            error: row.error.map(|Json(e)| e),
        })
    }
}
