//! Scheduler: the background loop that makes PENDING jobs schedulable and
//! reclaims expired leases.
//!
//! Schedulers are stateless; any number of instances may run against the
//! same store. Skip-locked claiming guarantees concurrent instances each
//! lease a distinct job, and concurrent recovery sweeps partition the
//! expired leases between them.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::store::JobStore;

pub struct Scheduler {
    id: Uuid,
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
}

impl Scheduler {
    pub fn new(id: Uuid, config: SchedulerConfig, store: Arc<dyn JobStore>) -> Self {
        Self { id, config, store }
    }

    /// Drive the lease and recovery ticks until the token is cancelled.
    ///
    /// Each tick runs to completion; no lock is held across the waits
    /// between ticks.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut schedule = tokio::time::interval(self.config.schedule_interval);
        let mut recovery = tokio::time::interval(self.config.recovery_interval);

        tracing::info!(scheduler_id = %self.id, "scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(scheduler_id = %self.id, "scheduler stopping");
                    break;
                }
                _ = schedule.tick() => self.lease_once().await,
                _ = recovery.tick() => self.recover_once().await,
            }
        }
    }

    async fn lease_once(&self) {
        match self
            .store
            .acquire_lease(self.id, self.config.lease_duration)
            .await
        {
            Ok(Some(grant)) => {
                tracing::info!(
                    scheduler_id = %self.id,
                    job_id = %grant.job_id,
                    lease_expires_at = %grant.lease_expires_at,
                    "job leased"
                );
            }
            // No pending jobs is the common case, not an error.
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(scheduler_id = %self.id, error = %error, "lease attempt failed");
            }
        }
    }

    async fn recover_once(&self) {
        match self.store.recover_expired_leases(Utc::now()).await {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::info!(
                    scheduler_id = %self.id,
                    count = recovered.len(),
                    "recovered expired leases"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(scheduler_id = %self.id, error = %error, "lease recovery failed");
            }
        }
    }
}
