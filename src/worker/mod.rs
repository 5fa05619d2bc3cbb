//! Worker: the pool-bounded executor that pulls SCHEDULED jobs, runs their
//! payloads, and reports terminal outcomes.
//!
//! A worker owns no authoritative state. It claims work through the store's
//! skip-locked pull, executes under the job's per-attempt timeout, and
//! records the outcome through the transition gate; anything it abandons is
//! handed back by lease expiry.

pub mod handler;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{ConductorError, Result};
use crate::store::{ClaimedJob, JobState, JobStore};
pub use handler::{HandlerError, JobHandler, ShellHandler};

pub struct Worker {
    id: Uuid,
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
}

impl Worker {
    pub fn new(
        id: Uuid,
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            id,
            config,
            store,
            handler,
        }
    }

    /// Register, then drive the heartbeat and dispatch loops until the token
    /// is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.store
            .heartbeat_worker(self.id, self.config.capacity as i32)
            .await?;
        tracing::info!(
            worker_id = %self.id,
            capacity = self.config.capacity,
            "worker registered"
        );

        tokio::join!(
            self.heartbeat_loop(&shutdown),
            self.dispatch_loop(&shutdown),
        );

        tracing::info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    async fn heartbeat_loop(&self, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self
                        .store
                        .heartbeat_worker(self.id, self.config.capacity as i32)
                        .await
                    {
                        tracing::warn!(worker_id = %self.id, error = %error, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn dispatch_loop(&self, shutdown: &CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.config.capacity));

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.store.acquire_scheduled_job(self.id).await {
                Ok(Some(job)) => {
                    tracing::info!(worker_id = %self.id, job_id = %job.id, "job pulled");

                    let store = Arc::clone(&self.store);
                    let handler = Arc::clone(&self.handler);
                    let poll_interval = self.config.cancellation_poll_interval;
                    let job_shutdown = shutdown.clone();

                    tokio::spawn(async move {
                        // Holds the slot for the lifetime of the attempt; the
                        // permit drops on every exit path, including panics.
                        let _permit = permit;
                        execute_job(store, handler, job, poll_interval, job_shutdown).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle_wait(shutdown).await;
                }
                Err(error) => {
                    tracing::warn!(worker_id = %self.id, error = %error, "job pull failed");
                    drop(permit);
                    self.idle_wait(shutdown).await;
                }
            }
        }
    }

    async fn idle_wait(&self, shutdown: &CancellationToken) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.idle_backoff + jitter) => {}
        }
    }
}

/// Run one claimed job to an outcome and record it.
async fn execute_job(
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    job: ClaimedJob,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let timeout = Duration::from_secs(job.timeout_seconds.max(1) as u64);

    let execution = handler.execute(job.id, &job.payload);
    tokio::pin!(execution);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut cancellation_poll =
        tokio::time::interval_at(tokio::time::Instant::now() + poll_interval, poll_interval);

    let outcome = loop {
        tokio::select! {
            result = &mut execution => break Some(result),
            _ = &mut deadline => {
                break Some(Err(HandlerError::retryable("timeout")));
            }
            _ = cancellation_poll.tick() => {
                match store.is_job_cancelled(job.id).await {
                    Ok(true) => {
                        tracing::info!(job_id = %job.id, "cancellation observed, stopping execution");
                        break None;
                    }
                    Ok(false) => {}
                    Err(error) => {
                        tracing::warn!(job_id = %job.id, error = %error, "cancellation check failed");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                // Leave the job RUNNING; lease expiry hands it back.
                tracing::info!(job_id = %job.id, "shutdown during execution, abandoning attempt");
                break None;
            }
        }
    };

    let recorded = match outcome {
        None => return,
        Some(Ok(())) => store
            .mark_job_completed(job.id)
            .await
            .map(|_| JobState::Completed),
        Some(Err(error)) => {
            store
                .mark_job_failed(job.id, &error.message, error.retryable)
                .await
        }
    };

    match recorded {
        Ok(state) => {
            tracing::info!(job_id = %job.id, state = %state, "job outcome recorded");
        }
        // Lost a race with cancellation or recovery; the authoritative
        // transition already happened elsewhere.
        Err(ConductorError::InvalidTransition { .. }) => {
            tracing::debug!(job_id = %job.id, "outcome discarded, job already transitioned");
        }
        Err(error) => {
            tracing::warn!(job_id = %job.id, error = %error, "failed to record outcome");
        }
    }
}
