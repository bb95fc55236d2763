//! Job persistence contract and the in-memory arena.
//!
//! Every status change goes through a compare-and-swap on the current status, so
//! concurrent claimers and cancellers cannot both win the same transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::job::{ExecutionRecord, Job, JobId, JobStatus};
use crate::error::{CadenceError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Id Generation
// ═══════════════════════════════════════════════════════════════════════════════

/// Source of fresh job ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> JobId;
}

/// Random v4 UUIDs.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> JobId {
        JobId::new()
    }
}

/// Monotonic ids (`00000000-0000-0000-0000-000000000001`, ...) for reproducible tests.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> JobId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        JobId(Uuid::from_u128(n as u128))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Query Filter
// ═══════════════════════════════════════════════════════════════════════════════

/// Selection criteria for [`JobStore::query`].
///
/// Results are ordered by `scheduled_at` ascending, then by id.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Empty means any status
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<String>,
    /// Inclusive lower bound on `scheduled_at`
    pub scheduled_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `scheduled_at`
    pub scheduled_before: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `finished_at`; jobs without one never match
    pub finished_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending jobs whose scheduled time has arrived.
    pub fn due(now: DateTime<Utc>) -> Self {
        Self::new()
            .with_status(JobStatus::Pending)
            .scheduled_before(now)
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    /// Every non-terminal status.
    pub fn active() -> Self {
        Self::new().with_statuses(JobStatus::ALL.into_iter().filter(|s| !s.is_terminal()))
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn scheduled_after(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_after = Some(at);
        self
    }

    pub fn scheduled_before(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_before = Some(at);
        self
    }

    pub fn finished_before(mut self, at: DateTime<Utc>) -> Self {
        self.finished_before = Some(at);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if let Some(job_type) = &self.job_type {
            if &job.job_type != job_type {
                return false;
            }
        }
        if let Some(after) = self.scheduled_after {
            if job.scheduled_at < after {
                return false;
            }
        }
        if let Some(before) = self.scheduled_before {
            if job.scheduled_at > before {
                return false;
            }
        }
        if let Some(cutoff) = self.finished_before {
            match job.finished_at {
                Some(finished) if finished < cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of [`JobStore::claim_exclusive`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExclusiveClaim {
    /// The job is now `Running`
    Claimed(Job),
    /// Another job of the same type is `Running`; this one is still `Pending`
    Busy,
    /// The job is missing or no longer `Pending`
    Lost,
}

/// Persistence for jobs and their execution history.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Allocate an id for a new job.
    fn next_id(&self) -> JobId;

    /// Insert a job, replacing any record with the same id.
    async fn insert(&self, job: Job) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically move a job from `expected` to `new`.
    ///
    /// Returns the updated record, or `None` if the job is missing or no longer in
    /// `expected`. Moving to `Running` increments `attempt` and stamps `started_at`;
    /// moving to a terminal status stamps `finished_at`.
    async fn claim(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Claim `Pending -> Running` only if no other job of the same type is `Running`.
    ///
    /// The running-instance check and the claim are one atomic step against every
    /// other `claim_exclusive` call on the same store.
    async fn claim_exclusive(&self, id: JobId, at: DateTime<Utc>) -> Result<ExclusiveClaim>;

    /// Replace the stored record with `job` if its current status is `expected`.
    async fn update_if(&self, job: &Job, expected: JobStatus) -> Result<bool>;

    async fn append_execution(&self, record: ExecutionRecord) -> Result<()>;

    /// Execution history of one job, oldest attempt first.
    async fn executions(&self, job_id: JobId) -> Result<Vec<ExecutionRecord>>;

    async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Delete jobs and their execution records. Returns the number of jobs removed.
    async fn delete(&self, ids: &[JobId]) -> Result<u64>;

    /// Delete up to `limit` execution records finished before `cutoff`.
    async fn delete_executions_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<u64>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;
}

/// Check a status change against the state machine before it reaches storage.
pub(crate) fn check_transition(id: JobId, from: JobStatus, to: JobStatus) -> Result<()> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(CadenceError::invalid_state_transition(id, from, to))
    }
}

/// Apply the field updates that accompany a claim.
pub(crate) fn apply_claim(job: &mut Job, new: JobStatus, at: DateTime<Utc>) {
    job.status = new;
    if new == JobStatus::Running {
        job.attempt += 1;
        job.started_at = Some(at);
        job.finished_at = None;
    } else if new.is_terminal() {
        job.finished_at = Some(at);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory job store for tests and single-process deployments.
///
/// Claims run under the per-entry `DashMap` lock. Exclusive claims are additionally
/// serialized by a store-wide mutex.
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    exclusive: Mutex<()>,
    executions: RwLock<Vec<ExecutionRecord>>,
    ids: Arc<dyn IdGenerator>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UuidGenerator))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            jobs: DashMap::new(),
            exclusive: Mutex::new(()),
            executions: RwLock::new(Vec::new()),
            ids,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CadenceError::store_unavailable("in-memory store marked unavailable"))
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn next_id(&self) -> JobId {
        self.ids.next_id()
    }

    async fn insert(&self, job: Job) -> Result<()> {
        self.ensure_available()?;
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.ensure_available()?;
        Ok(self.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn claim(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.ensure_available()?;
        check_transition(id, expected, new)?;

        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if entry.status != expected {
            return Ok(None);
        }
        apply_claim(&mut entry, new, at);
        Ok(Some(entry.clone()))
    }

    async fn claim_exclusive(&self, id: JobId, at: DateTime<Utc>) -> Result<ExclusiveClaim> {
        self.ensure_available()?;
        let _guard = self.exclusive.lock();

        // the entry ref must be released before iterating, DashMap shards are not reentrant
        let job_type = match self.jobs.get(&id) {
            Some(entry) if entry.status == JobStatus::Pending => entry.job_type.clone(),
            _ => return Ok(ExclusiveClaim::Lost),
        };
        let busy = self.jobs.iter().any(|entry| {
            entry.id != id && entry.job_type == job_type && entry.status == JobStatus::Running
        });
        if busy {
            return Ok(ExclusiveClaim::Busy);
        }

        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(ExclusiveClaim::Lost);
        };
        if entry.status != JobStatus::Pending {
            return Ok(ExclusiveClaim::Lost);
        }
        apply_claim(&mut entry, JobStatus::Running, at);
        Ok(ExclusiveClaim::Claimed(entry.clone()))
    }

    async fn update_if(&self, job: &Job, expected: JobStatus) -> Result<bool> {
        self.ensure_available()?;
        check_transition(job.id, expected, job.status)?;

        let Some(mut entry) = self.jobs.get_mut(&job.id) else {
            return Ok(false);
        };
        if entry.status != expected {
            return Ok(false);
        }
        *entry = job.clone();
        Ok(true)
    }

    async fn append_execution(&self, record: ExecutionRecord) -> Result<()> {
        self.ensure_available()?;
        self.executions.write().push(record);
        Ok(())
    }

    async fn executions(&self, job_id: JobId) -> Result<Vec<ExecutionRecord>> {
        self.ensure_available()?;
        let mut records: Vec<_> = self
            .executions
            .read()
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.attempt, r.started_at));
        Ok(records)
    }

    async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.ensure_available()?;
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn delete(&self, ids: &[JobId]) -> Result<u64> {
        self.ensure_available()?;
        let mut deleted = 0;
        for id in ids {
            if self.jobs.remove(id).is_some() {
                deleted += 1;
            }
        }
        self.executions.write().retain(|r| !ids.contains(&r.job_id));
        Ok(deleted)
    }

    async fn delete_executions_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<u64> {
        self.ensure_available()?;
        let mut executions = self.executions.write();
        let mut deleted = 0usize;
        executions.retain(|r| {
            if deleted < limit && r.finished_at < cutoff {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted as u64)
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        self.ensure_available()?;
        let mut counts = HashMap::new();
        for entry in self.jobs.iter() {
            *counts.entry(entry.value().status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
