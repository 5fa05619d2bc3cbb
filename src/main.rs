use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use conductor::api::{self, AppState};
use conductor::config::{ApiConfig, SchedulerConfig, StoreConfig, WorkerConfig};
use conductor::scheduler::Scheduler;
use conductor::shutdown;
use conductor::store::{JobStore, PgStore};
use conductor::worker::{ShellHandler, Worker};

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "A correctness-first distributed job orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control-plane HTTP API
    ControlPlane {
        /// Connection string for the shared store
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,

        /// Address the HTTP listener binds to
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
    },
    /// Run a scheduler instance; any number may run concurrently
    Scheduler {
        /// Connection string for the shared store
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,

        /// How long each acquired lease lasts, in seconds
        #[arg(long, default_value_t = 30)]
        lease_duration_seconds: u64,
    },
    /// Run a worker instance
    Worker {
        /// Connection string for the shared store
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,

        /// Maximum concurrently executing jobs
        #[arg(long, default_value_t = 4)]
        capacity: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let shutdown = shutdown::install_shutdown_handler();

    match cli.command {
        Command::ControlPlane { database_url, bind } => {
            let store = connect(&database_url).await?;
            let config = ApiConfig { bind_addr: bind };

            let app = api::router(AppState { store });
            let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
            tracing::info!(addr = %config.bind_addr, "control plane listening");

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await?;
        }
        Command::Scheduler {
            database_url,
            lease_duration_seconds,
        } => {
            let store = connect(&database_url).await?;
            let config = SchedulerConfig {
                lease_duration: Duration::from_secs(lease_duration_seconds),
                ..Default::default()
            };

            Scheduler::new(Uuid::new_v4(), config, store)
                .run(shutdown)
                .await;
        }
        Command::Worker {
            database_url,
            capacity,
        } => {
            let store = connect(&database_url).await?;
            let config = WorkerConfig {
                capacity,
                ..Default::default()
            };

            Worker::new(Uuid::new_v4(), config, store, Arc::new(ShellHandler::new()))
                .run(shutdown)
                .await?;
        }
    }

    Ok(())
}

async fn connect(database_url: &str) -> Result<Arc<dyn JobStore>, conductor::error::ConductorError> {
    let store = PgStore::connect(&StoreConfig::new(database_url)).await?;
    store.run_migrations().await?;
    Ok(Arc::new(store))
}
