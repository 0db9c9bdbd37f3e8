//! cdx-server - web archive CDX index server
//!
//! Serves the ingest, lookup, replication and access-control API over
//! one or more sled-backed collections. Run with `--primary-url` to
//! replicate an upstream server instead of accepting local writes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cdx_api::{run_server, ApiConfig, AppState};
use cdx_index::{Config, DataStore};

mod poller;

#[derive(Parser)]
#[command(name = "cdx-server")]
#[command(about = "Web archive CDX index server")]
#[command(version)]
struct Cli {
    /// Host to bind to
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Directory holding one database per collection
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Mount the access-control endpoints and evaluate rules at query time
    #[arg(long)]
    access_control: bool,

    /// Deny access checks that no rule matched
    #[arg(long)]
    default_deny: bool,

    /// Run as a secondary replicating from this upstream primary URL
    #[arg(long)]
    primary_url: Option<String>,

    /// Accept local writes even while replicating
    #[arg(long)]
    accepts_writes: bool,

    /// Seconds between replication polls
    #[arg(long, default_value = "10")]
    replication_interval: u64,

    /// Log filter when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config {
        data_dir: cli.data_dir,
        experimental_access_control: cli.access_control,
        is_secondary: cli.primary_url.is_some(),
        accepts_writes: cli.accepts_writes,
        default_deny: cli.default_deny,
    };

    let store = match DataStore::open(config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to open data store");
            return ExitCode::FAILURE;
        }
    };

    if let Some(primary_url) = cli.primary_url {
        let interval = Duration::from_secs(cli.replication_interval.max(1));
        tokio::spawn(poller::run(Arc::clone(&store), primary_url, interval));
    }

    let api_config = ApiConfig {
        host: cli.bind,
        port: cli.port,
    };
    if let Err(e) = run_server(api_config, AppState::new(store)).await {
        tracing::error!(error = %e, "fatal server error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
