//! Postgres-backed [`JobStore`].
//!
//! Every multi-row operation runs through [`PgStore::run_in_transaction`],
//! and every work-claiming read uses `FOR UPDATE SKIP LOCKED` so peers
//! contend without queueing behind each other. Lease expiries are written
//! with the storage server clock; mixing in local wall-clock for writes
//! would break fencing under drift.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{ConductorError, Result};
use crate::store::state::{is_transition_allowed, JobState};
use crate::store::{attempts_exhausted_error, ClaimedJob, Job, JobStore, LeaseGrant};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| ConductorError::Internal(format!("migration failed: {error}")))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// The underlying pool, for embedders that colocate their own tables.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute `f` under a fresh transaction: commit on `Ok`, roll back on
    /// `Err`. A panic or cancellation drops the transaction, which also
    /// rolls back.
    pub(crate) async fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction<'static, Postgres>) -> BoxFuture<'t, Result<T>>
            + Send,
    {
        let mut tx = self.pool.begin().await?;

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::warn!(error = %rollback_error, "transaction rollback failed");
                }
                Err(error)
            }
        }
    }

    async fn recover_one(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.run_in_transaction(move |tx| {
            Box::pin(async move {
                // Re-check expiry under the job-row lock; a renewed lease or a
                // peer already holding the row means nothing to do here.
                let row = sqlx::query(
                    "SELECT j.state, j.current_attempt, j.max_attempts
                     FROM jobs j
                     JOIN job_leases l ON l.job_id = j.id
                     WHERE j.id = $1 AND l.lease_expires_at < $2
                     FOR UPDATE OF j SKIP LOCKED",
                )
                .bind(job_id)
                .bind(now)
                .fetch_optional(&mut **tx)
                .await?;

                let Some(row) = row else {
                    return Ok(false);
                };

                let state: JobState = row.try_get::<String, _>("state")?.parse()?;
                let current_attempt: i32 = row.try_get("current_attempt")?;
                let max_attempts: i32 = row.try_get("max_attempts")?;

                match state {
                    JobState::Scheduled => {
                        // The worker never picked it up; the attempt was not
                        // consumed.
                        transition_job_state(tx, job_id, JobState::Scheduled, JobState::Pending)
                            .await?;
                    }
                    JobState::Running => {
                        let next_attempt = current_attempt + 1;

                        if next_attempt < max_attempts {
                            transition_job_state(tx, job_id, JobState::Running, JobState::Pending)
                                .await?;
                            sqlx::query("UPDATE jobs SET current_attempt = $2 WHERE id = $1")
                                .bind(job_id)
                                .bind(next_attempt)
                                .execute(&mut **tx)
                                .await?;
                        } else {
                            transition_job_state(tx, job_id, JobState::Running, JobState::Failed)
                                .await?;
                            sqlx::query(
                                "UPDATE jobs SET current_attempt = $2, last_error = $3 WHERE id = $1",
                            )
                            .bind(job_id)
                            .bind(next_attempt)
                            .bind(attempts_exhausted_error(next_attempt, max_attempts))
                            .execute(&mut **tx)
                            .await?;
                        }
                    }
                    _ => {}
                }

                sqlx::query("DELETE FROM job_leases WHERE job_id = $1")
                    .bind(job_id)
                    .execute(&mut **tx)
                    .await?;

                Ok(true)
            })
        })
        .await
    }
}

/// The transition gate. Updates state and `updated_at` iff the stored state
/// still equals `from` and the pair is allowed; a lost race and a disallowed
/// pair surface as the same error.
async fn transition_job_state(
    tx: &mut Transaction<'static, Postgres>,
    job_id: Uuid,
    from: JobState,
    to: JobState,
) -> Result<()> {
    if !is_transition_allowed(from, to) {
        return Err(ConductorError::InvalidTransition { from, to });
    }

    let result = sqlx::query(
        "UPDATE jobs
         SET state = $2, updated_at = now()
         WHERE id = $1 AND state = $3",
    )
    .bind(job_id)
    .bind(to.as_str())
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() != 1 {
        return Err(ConductorError::InvalidTransition { from, to });
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    state: String,
    payload: Vec<u8>,
    max_attempts: i32,
    current_attempt: i32,
    timeout_seconds: i32,
    last_error: Option<String>,
    retryable: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = ConductorError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            state: row.state.parse()?,
            payload: row.payload,
            max_attempts: row.max_attempts,
            current_attempt: row.current_attempt,
            timeout_seconds: row.timeout_seconds,
            last_error: row.last_error,
            retryable: row.retryable,
            created_at: row.created_at,
            updated_at: row.updated_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, state, payload, max_attempts, current_attempt, \
                           timeout_seconds, last_error, retryable, created_at, \
                           updated_at, cancelled_at";

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(
        &self,
        job_id: Uuid,
        payload: Vec<u8>,
        max_attempts: i32,
        timeout_seconds: i32,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, state, payload, max_attempts, current_attempt, timeout_seconds)
             VALUES ($1, 'PENDING', $2, $3, 0, $4)",
        )
        .bind(job_id)
        .bind(payload)
        .bind(max_attempts)
        .bind(timeout_seconds)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        self.run_in_transaction(move |tx| {
            Box::pin(async move {
                let state: Option<String> =
                    sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1 FOR UPDATE")
                        .bind(job_id)
                        .fetch_optional(&mut **tx)
                        .await?;

                let Some(state) = state else {
                    return Err(ConductorError::JobNotFound(job_id));
                };

                let current: JobState = state.parse()?;
                transition_job_state(tx, job_id, current, JobState::Cancelled).await?;

                sqlx::query("UPDATE jobs SET cancelled_at = now() WHERE id = $1")
                    .bind(job_id)
                    .execute(&mut **tx)
                    .await?;

                sqlx::query("DELETE FROM job_leases WHERE job_id = $1")
                    .bind(job_id)
                    .execute(&mut **tx)
                    .await?;

                Ok(())
            })
        })
        .await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let limit = if limit <= 0 { 100 } else { limit };

        let rows: Vec<JobRow> = match state {
            Some(state) => {
                sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = $1 ORDER BY created_at DESC LIMIT $2"
                ))
                .bind(state.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn acquire_lease(
        &self,
        scheduler_id: Uuid,
        lease_duration: Duration,
    ) -> Result<Option<LeaseGrant>> {
        let lease_seconds = lease_duration.as_secs_f64();
        if lease_seconds <= 0.0 {
            return Err(ConductorError::validation("lease duration must be positive"));
        }

        self.run_in_transaction(move |tx| {
            Box::pin(async move {
                let job_id: Option<Uuid> = sqlx::query_scalar(
                    "SELECT id FROM jobs
                     WHERE state = 'PENDING'
                     ORDER BY created_at
                     FOR UPDATE SKIP LOCKED
                     LIMIT 1",
                )
                .fetch_optional(&mut **tx)
                .await?;

                let Some(job_id) = job_id else {
                    return Ok(None);
                };

                transition_job_state(tx, job_id, JobState::Pending, JobState::Scheduled).await?;

                let lease_expires_at: DateTime<Utc> = sqlx::query_scalar(
                    "INSERT INTO job_leases (job_id, scheduler_id, lease_expires_at)
                     VALUES ($1, $2, now() + make_interval(secs => $3))
                     RETURNING lease_expires_at",
                )
                .bind(job_id)
                .bind(scheduler_id)
                .bind(lease_seconds)
                .fetch_one(&mut **tx)
                .await?;

                Ok(Some(LeaseGrant {
                    job_id,
                    lease_expires_at,
                }))
            })
        })
        .await
    }

    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let candidates: Vec<Uuid> = sqlx::query_scalar(
            "SELECT job_id FROM job_leases WHERE lease_expires_at < $1 ORDER BY job_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        // One transaction per job keeps the lock footprint to a single row,
        // so concurrent sweeps partition the work instead of deadlocking.
        let mut recovered = Vec::new();
        for job_id in candidates {
            if self.recover_one(job_id, now).await? {
                recovered.push(job_id);
            }
        }

        Ok(recovered)
    }

    async fn acquire_scheduled_job(&self, worker_id: Uuid) -> Result<Option<ClaimedJob>> {
        self.run_in_transaction(move |tx| {
            Box::pin(async move {
                // The lease join guarantees a worker never claims a job whose
                // lease was just reaped by recovery.
                let row = sqlx::query(
                    "SELECT j.id, j.payload, j.timeout_seconds
                     FROM jobs j
                     JOIN job_leases l ON l.job_id = j.id
                     WHERE j.state = 'SCHEDULED'
                     ORDER BY j.created_at
                     FOR UPDATE OF j SKIP LOCKED
                     LIMIT 1",
                )
                .fetch_optional(&mut **tx)
                .await?;

                let Some(row) = row else {
                    return Ok(None);
                };

                let job_id: Uuid = row.try_get("id")?;
                let payload: Vec<u8> = row.try_get("payload")?;
                let timeout_seconds: i32 = row.try_get("timeout_seconds")?;

                transition_job_state(tx, job_id, JobState::Scheduled, JobState::Running).await?;

                tracing::debug!(worker_id = %worker_id, job_id = %job_id, "job claimed");

                Ok(Some(ClaimedJob {
                    id: job_id,
                    payload,
                    timeout_seconds,
                }))
            })
        })
        .await
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<()> {
        self.run_in_transaction(move |tx| {
            Box::pin(async move {
                let expired: Option<bool> = sqlx::query_scalar(
                    "SELECT lease_expires_at < now() FROM job_leases WHERE job_id = $1 FOR UPDATE",
                )
                .bind(job_id)
                .fetch_optional(&mut **tx)
                .await?;

                // No lease, or a lapsed one: the job is not startable.
                if expired.unwrap_or(true) {
                    return Err(ConductorError::InvalidTransition {
                        from: JobState::Scheduled,
                        to: JobState::Running,
                    });
                }

                transition_job_state(tx, job_id, JobState::Scheduled, JobState::Running).await
            })
        })
        .await
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        self.run_in_transaction(move |tx| {
            Box::pin(async move {
                transition_job_state(tx, job_id, JobState::Running, JobState::Completed).await?;

                sqlx::query("DELETE FROM job_leases WHERE job_id = $1")
                    .bind(job_id)
                    .execute(&mut **tx)
                    .await?;

                Ok(())
            })
        })
        .await
    }

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<JobState> {
        let error = error.to_string();

        self.run_in_transaction(move |tx| {
            Box::pin(async move {
                let row = sqlx::query(
                    "SELECT current_attempt, max_attempts FROM jobs WHERE id = $1 FOR UPDATE",
                )
                .bind(job_id)
                .fetch_optional(&mut **tx)
                .await?;

                let Some(row) = row else {
                    return Err(ConductorError::JobNotFound(job_id));
                };

                let current_attempt: i32 = row.try_get("current_attempt")?;
                let max_attempts: i32 = row.try_get("max_attempts")?;

                transition_job_state(tx, job_id, JobState::Running, JobState::Failed).await?;

                sqlx::query("UPDATE jobs SET last_error = $2, retryable = $3 WHERE id = $1")
                    .bind(job_id)
                    .bind(&error)
                    .bind(retryable)
                    .execute(&mut **tx)
                    .await?;

                let mut final_state = JobState::Failed;

                if retryable && current_attempt + 1 < max_attempts {
                    transition_job_state(tx, job_id, JobState::Failed, JobState::Pending).await?;
                    sqlx::query("UPDATE jobs SET current_attempt = $2 WHERE id = $1")
                        .bind(job_id)
                        .bind(current_attempt + 1)
                        .execute(&mut **tx)
                        .await?;
                    final_state = JobState::Pending;
                }

                sqlx::query("DELETE FROM job_leases WHERE job_id = $1")
                    .bind(job_id)
                    .execute(&mut **tx)
                    .await?;

                Ok(final_state)
            })
        })
        .await
    }

    async fn retry_job_if_allowed(&self, job_id: Uuid) -> Result<bool> {
        self.run_in_transaction(move |tx| {
            Box::pin(async move {
                let row = sqlx::query(
                    "SELECT state, current_attempt, max_attempts, retryable
                     FROM jobs WHERE id = $1 FOR UPDATE",
                )
                .bind(job_id)
                .fetch_optional(&mut **tx)
                .await?;

                let Some(row) = row else {
                    return Err(ConductorError::JobNotFound(job_id));
                };

                let state: JobState = row.try_get::<String, _>("state")?.parse()?;
                let current_attempt: i32 = row.try_get("current_attempt")?;
                let max_attempts: i32 = row.try_get("max_attempts")?;
                let retryable: bool = row.try_get("retryable")?;

                if state != JobState::Failed || !retryable || current_attempt + 1 >= max_attempts {
                    return Ok(false);
                }

                transition_job_state(tx, job_id, JobState::Failed, JobState::Pending).await?;
                sqlx::query("UPDATE jobs SET current_attempt = $2 WHERE id = $1")
                    .bind(job_id)
                    .bind(current_attempt + 1)
                    .execute(&mut **tx)
                    .await?;

                Ok(true)
            })
        })
        .await
    }

    async fn heartbeat_worker(&self, worker_id: Uuid, capacity: i32) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, last_heartbeat, capacity)
             VALUES ($1, now(), $2)
             ON CONFLICT (id)
             DO UPDATE SET last_heartbeat = now(), capacity = EXCLUDED.capacity",
        )
        .bind(worker_id)
        .bind(capacity)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_job_cancelled(&self, job_id: Uuid) -> Result<bool> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(state) = state else {
            return Err(ConductorError::JobNotFound(job_id));
        };

        Ok(state.parse::<JobState>()? == JobState::Cancelled)
    }

    async fn count_jobs_by_state(&self) -> Result<Vec<(JobState, i64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let state: JobState = row.try_get::<String, _>("state")?.parse()?;
            counts.push((state, row.try_get::<i64, _>("count")?));
        }

        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
