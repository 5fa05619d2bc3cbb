//! In-process [`JobStore`] used by the test suite and for embedding without
//! transactional storage.
//!
//! A single mutex serializes every operation, which makes each one trivially
//! atomic; the gate semantics are shared with the Postgres implementation
//! through the same allowed-transition table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::store::state::{is_transition_allowed, JobState};
use crate::store::{attempts_exhausted_error, ClaimedJob, Job, JobStore, Lease, LeaseGrant};

#[derive(Debug, Clone)]
struct WorkerRegistration {
    capacity: i32,
    last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// Insertion sequence, used to break creation-timestamp ties so FIFO
    /// claiming stays deterministic.
    sequence: HashMap<Uuid, u64>,
    leases: HashMap<Uuid, Lease>,
    workers: HashMap<Uuid, WorkerRegistration>,
    next_sequence: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test introspection: the active lease for a job, if any.
    pub fn lease_for(&self, job_id: Uuid) -> Option<Lease> {
        self.lock().leases.get(&job_id).copied()
    }

    /// Test introspection: total number of lease rows.
    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    /// Test introspection: a worker's registered advisory capacity.
    pub fn worker_capacity(&self, worker_id: Uuid) -> Option<i32> {
        self.lock()
            .workers
            .get(&worker_id)
            .map(|registration| registration.capacity)
    }

    /// Test introspection: a worker's last recorded heartbeat.
    pub fn worker_heartbeat_at(&self, worker_id: Uuid) -> Option<DateTime<Utc>> {
        self.lock()
            .workers
            .get(&worker_id)
            .map(|registration| registration.last_heartbeat)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The transition gate, applied to an in-memory job row.
fn transition_job_state(job: &mut Job, from: JobState, to: JobState) -> Result<()> {
    if !is_transition_allowed(from, to) || job.state != from {
        return Err(ConductorError::InvalidTransition { from, to });
    }

    job.state = to;
    job.updated_at = Utc::now();
    Ok(())
}

fn lease_duration_to_chrono(lease_duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(lease_duration)
        .map_err(|_| ConductorError::validation("lease duration out of range"))
}

impl Inner {
    /// Oldest job in `state` by (created_at, insertion sequence).
    fn oldest_in_state(&self, state: JobState, requires_lease: bool) -> Option<Uuid> {
        self.jobs
            .values()
            .filter(|job| job.state == state)
            .filter(|job| !requires_lease || self.leases.contains_key(&job.id))
            .min_by_key(|job| (job.created_at, self.sequence.get(&job.id).copied()))
            .map(|job| job.id)
    }

    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(ConductorError::JobNotFound(job_id))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(
        &self,
        job_id: Uuid,
        payload: Vec<u8>,
        max_attempts: i32,
        timeout_seconds: i32,
    ) -> Result<()> {
        if max_attempts < 1 {
            return Err(ConductorError::validation("max_attempts must be at least 1"));
        }
        if timeout_seconds <= 0 {
            return Err(ConductorError::validation("timeout_seconds must be positive"));
        }

        let now = Utc::now();
        let mut inner = self.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.sequence.insert(job_id, sequence);
        inner.jobs.insert(
            job_id,
            Job {
                id: job_id,
                state: JobState::Pending,
                payload,
                max_attempts,
                current_attempt: 0,
                timeout_seconds,
                last_error: None,
                retryable: false,
                created_at: now,
                updated_at: now,
                cancelled_at: None,
            },
        );

        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.job_mut(job_id)?;
        let current = job.state;

        transition_job_state(job, current, JobState::Cancelled)?;
        job.cancelled_at = Some(Utc::now());
        inner.leases.remove(&job_id);

        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let limit = if limit <= 0 { 100 } else { limit } as usize;

        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| state.map_or(true, |wanted| job.state == wanted))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| {
            (
                std::cmp::Reverse(job.created_at),
                std::cmp::Reverse(inner.sequence.get(&job.id).copied()),
            )
        });
        jobs.truncate(limit);

        Ok(jobs)
    }

    async fn acquire_lease(
        &self,
        scheduler_id: Uuid,
        lease_duration: Duration,
    ) -> Result<Option<LeaseGrant>> {
        if lease_duration.is_zero() {
            return Err(ConductorError::validation("lease duration must be positive"));
        }
        let lease_duration = lease_duration_to_chrono(lease_duration)?;

        let mut inner = self.lock();
        let Some(job_id) = inner.oldest_in_state(JobState::Pending, false) else {
            return Ok(None);
        };

        let job = inner.job_mut(job_id)?;
        transition_job_state(job, JobState::Pending, JobState::Scheduled)?;

        let lease_expires_at = Utc::now() + lease_duration;
        inner.leases.insert(
            job_id,
            Lease {
                job_id,
                scheduler_id,
                lease_expires_at,
            },
        );

        Ok(Some(LeaseGrant {
            job_id,
            lease_expires_at,
        }))
    }

    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut inner = self.lock();

        let mut expired: Vec<Uuid> = inner
            .leases
            .values()
            .filter(|lease| lease.lease_expires_at < now)
            .map(|lease| lease.job_id)
            .collect();
        expired.sort();

        let mut recovered = Vec::new();
        for job_id in expired {
            let job = inner.job_mut(job_id)?;

            match job.state {
                JobState::Scheduled => {
                    transition_job_state(job, JobState::Scheduled, JobState::Pending)?;
                }
                JobState::Running => {
                    let next_attempt = job.current_attempt + 1;

                    if next_attempt < job.max_attempts {
                        transition_job_state(job, JobState::Running, JobState::Pending)?;
                        job.current_attempt = next_attempt;
                    } else {
                        transition_job_state(job, JobState::Running, JobState::Failed)?;
                        job.current_attempt = next_attempt;
                        job.last_error =
                            Some(attempts_exhausted_error(next_attempt, job.max_attempts));
                    }
                }
                _ => {}
            }

            inner.leases.remove(&job_id);
            recovered.push(job_id);
        }

        Ok(recovered)
    }

    async fn acquire_scheduled_job(&self, _worker_id: Uuid) -> Result<Option<ClaimedJob>> {
        let mut inner = self.lock();
        let Some(job_id) = inner.oldest_in_state(JobState::Scheduled, true) else {
            return Ok(None);
        };

        let job = inner.job_mut(job_id)?;
        transition_job_state(job, JobState::Scheduled, JobState::Running)?;

        Ok(Some(ClaimedJob {
            id: job.id,
            payload: job.payload.clone(),
            timeout_seconds: job.timeout_seconds,
        }))
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.lock();

        let startable = inner
            .leases
            .get(&job_id)
            .map_or(false, |lease| lease.lease_expires_at > Utc::now());
        if !startable {
            return Err(ConductorError::InvalidTransition {
                from: JobState::Scheduled,
                to: JobState::Running,
            });
        }

        let job = inner.job_mut(job_id)?;
        transition_job_state(job, JobState::Scheduled, JobState::Running)
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.job_mut(job_id)?;

        transition_job_state(job, JobState::Running, JobState::Completed)?;
        inner.leases.remove(&job_id);

        Ok(())
    }

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<JobState> {
        let mut inner = self.lock();
        let job = inner.job_mut(job_id)?;

        transition_job_state(job, JobState::Running, JobState::Failed)?;
        job.last_error = Some(error.to_string());
        job.retryable = retryable;

        let mut final_state = JobState::Failed;

        if retryable && job.current_attempt + 1 < job.max_attempts {
            transition_job_state(job, JobState::Failed, JobState::Pending)?;
            job.current_attempt += 1;
            final_state = JobState::Pending;
        }

        inner.leases.remove(&job_id);

        Ok(final_state)
    }

    async fn retry_job_if_allowed(&self, job_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        let job = inner.job_mut(job_id)?;

        if job.state != JobState::Failed
            || !job.retryable
            || job.current_attempt + 1 >= job.max_attempts
        {
            return Ok(false);
        }

        transition_job_state(job, JobState::Failed, JobState::Pending)?;
        job.current_attempt += 1;

        Ok(true)
    }

    async fn heartbeat_worker(&self, worker_id: Uuid, capacity: i32) -> Result<()> {
        self.lock().workers.insert(
            worker_id,
            WorkerRegistration {
                capacity,
                last_heartbeat: Utc::now(),
            },
        );

        Ok(())
    }

    async fn is_job_cancelled(&self, job_id: Uuid) -> Result<bool> {
        let inner = self.lock();
        let job = inner
            .jobs
            .get(&job_id)
            .ok_or(ConductorError::JobNotFound(job_id))?;

        Ok(job.state == JobState::Cancelled)
    }

    async fn count_jobs_by_state(&self) -> Result<Vec<(JobState, i64)>> {
        let inner = self.lock();
        let mut counts: BTreeMap<JobState, i64> = BTreeMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.state).or_default() += 1;
        }

        Ok(counts.into_iter().collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
