use std::net::SocketAddr;
use std::time::Duration;

/// Connection settings for the shared transactional store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Control-plane HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Cadence and lease settings for a scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lease_duration: Duration,
    pub schedule_interval: Duration,
    pub recovery_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            schedule_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(2),
        }
    }
}

/// Execution pool and pacing settings for a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on concurrently executing jobs.
    pub capacity: usize,
    pub heartbeat_interval: Duration,
    /// Pause between pull attempts when the store reports no work.
    pub idle_backoff: Duration,
    /// How often an in-flight job re-checks for user cancellation.
    pub cancellation_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            heartbeat_interval: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(300),
            cancellation_poll_interval: Duration::from_secs(1),
        }
    }
}
