use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobmesh::config::{RuntimeConfig, SchedulerConfig};
use jobmesh::runtime::Runtime;
use jobmesh::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobmesh")]
#[command(version)]
#[command(about = "A pull-based distributed job scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler server
    Server(ServerArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the HTTP API
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Address to bind the HTTP API on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Maximum number of queued jobs before submissions are rejected
    #[arg(long, env = "MAX_QUEUE_SIZE", default_value = "1000")]
    max_queue_size: usize,

    /// Seconds without a heartbeat before a node is marked offline
    #[arg(long, env = "HEARTBEAT_TIMEOUT_SECONDS", default_value = "180")]
    heartbeat_timeout: u64,

    /// Seconds between supervisor ticks
    #[arg(long, env = "TICK_INTERVAL_SECONDS", default_value = "30")]
    tick_interval: u64,

    /// Days to keep finished jobs
    #[arg(long, env = "JOB_RETENTION_DAYS", default_value = "30")]
    job_retention_days: u64,

    /// Accepted job types (comma-separated); empty accepts any type
    #[arg(long, env = "JOB_TYPES", value_delimiter = ',', default_value = "ocr,pdf_parse")]
    job_types: Vec<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

const SECONDS_PER_DAY: u64 = 24 * 3600;

impl ServerArgs {
    async fn into_config(self) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
        let listen_addr = resolve_listen_addr(&self.host, self.port).await?;
        let job_types: Vec<String> = self
            .job_types
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let scheduler = SchedulerConfig::default()
            .with_max_queue_size(self.max_queue_size)
            .with_heartbeat_timeout(Duration::from_secs(self.heartbeat_timeout))
            .with_job_types(job_types);

        let mut config = RuntimeConfig::new(listen_addr)
            .with_scheduler(scheduler)
            .with_tick_interval(Duration::from_secs(self.tick_interval.max(1)));
        config.job_retention = retention(self.job_retention_days);
        Ok(config)
    }
}

/// Resolve `host` (an IP literal or a hostname such as `localhost`) to the
/// first address it maps to.
async fn resolve_listen_addr(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address found for host '{host}'"),
            )
        })
}

fn retention(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY))
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = args.into_config().await?;
    tracing::info!(
        addr = %config.listen_addr,
        max_queue_size = config.scheduler.max_queue_size,
        heartbeat_timeout_secs = config.scheduler.heartbeat_timeout.as_secs(),
        tick_interval_secs = config.tick_interval.as_secs(),
        job_types = ?config.scheduler.job_types,
        "Starting jobmesh scheduler"
    );

    let runtime = Runtime::new(config)?;
    let token = install_shutdown_handler();
    runtime.run(token).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
    }

    Ok(())
}
