//! The shared transactional store: single source of truth for jobs, leases,
//! and worker registrations.
//!
//! The store is expressed as the [`JobStore`] capability set so that the
//! scheduler, worker, and control API are all written against the same seam
//! and the test suite can substitute [`MemoryStore`] for Postgres.

pub mod memory;
pub mod postgres;
pub mod state;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use state::JobState;

/// The orchestrated unit of work, as persisted.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub state: JobState,
    /// Opaque to the orchestrator; only the worker-side handler interprets it.
    pub payload: Vec<u8>,
    pub max_attempts: i32,
    pub current_attempt: i32,
    pub timeout_seconds: i32,
    pub last_error: Option<String>,
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// A time-bounded claim on a job held by one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub job_id: Uuid,
    pub scheduler_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// Result of a successful lease acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LeaseGrant {
    pub job_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// A SCHEDULED job handed to a worker for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub timeout_seconds: i32,
}

/// Synthetic last-error written when lease recovery exhausts a job's budget.
pub(crate) fn attempts_exhausted_error(attempt: i32, max_attempts: i32) -> String {
    format!("lease expired; attempts exhausted ({attempt}/{max_attempts})")
}

/// The capability set every store implementation provides.
///
/// Operations that claim work (`acquire_lease`, `acquire_scheduled_job`)
/// return `Ok(None)` when nothing is available; that is not an error.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in PENDING with attempt count zero.
    async fn create_job(
        &self,
        job_id: Uuid,
        payload: Vec<u8>,
        max_attempts: i32,
        timeout_seconds: i32,
    ) -> Result<()>;

    /// Transition a non-terminal job to CANCELLED and stamp `cancelled_at`.
    /// Removes any lease row.
    async fn cancel_job(&self, job_id: Uuid) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List jobs newest-first, optionally filtered by state. Non-positive
    /// limits fall back to the default of 100.
    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>>;

    /// Atomically claim the oldest PENDING job for a scheduler: transition it
    /// to SCHEDULED and create its lease row. Concurrent callers each obtain
    /// a distinct job or `None`.
    async fn acquire_lease(
        &self,
        scheduler_id: Uuid,
        lease_duration: Duration,
    ) -> Result<Option<LeaseGrant>>;

    /// Reclaim jobs whose lease expired before `now`. SCHEDULED jobs rewind
    /// to PENDING with their attempt count untouched; RUNNING jobs consume an
    /// attempt and either rewind or fail terminally. The lease row is deleted
    /// in every case. Returns the recovered job ids.
    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Atomically claim the oldest SCHEDULED job that still holds a lease and
    /// transition it to RUNNING on behalf of a worker.
    async fn acquire_scheduled_job(&self, worker_id: Uuid) -> Result<Option<ClaimedJob>>;

    /// Transition SCHEDULED -> RUNNING, rejecting jobs whose lease already
    /// lapsed.
    async fn mark_job_running(&self, job_id: Uuid) -> Result<()>;

    /// Transition RUNNING -> COMPLETED and drop the lease.
    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()>;

    /// Transition RUNNING -> FAILED, record the error, then apply the retry
    /// policy inside the same transaction. Returns the state the job was left
    /// in: PENDING when re-admitted, FAILED when the budget is spent.
    async fn mark_job_failed(&self, job_id: Uuid, error: &str, retryable: bool)
        -> Result<JobState>;

    /// Re-admit a FAILED job at rest if its recorded failure was retryable
    /// and attempts remain. Returns whether the job went back to PENDING.
    async fn retry_job_if_allowed(&self, job_id: Uuid) -> Result<bool>;

    /// Upsert the worker's registration row with its advisory capacity.
    async fn heartbeat_worker(&self, worker_id: Uuid, capacity: i32) -> Result<()>;

    /// Read used by in-flight executions to observe user cancellation.
    async fn is_job_cancelled(&self, job_id: Uuid) -> Result<bool>;

    /// Per-state job counts for the metrics endpoint.
    async fn count_jobs_by_state(&self) -> Result<Vec<(JobState, i64)>>;

    async fn ping(&self) -> Result<()>;
}
