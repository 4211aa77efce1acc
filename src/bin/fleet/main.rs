//! Kuba Fleet process launcher
//!
//! One binary, one component per process:
//!
//! - `range-assigner` - keyspace partitioning (`/ra/*`)
//! - `leaf` - in-memory series store (`/leaf/*`)
//! - `zone-index` - field-hints index (`/zis/*`)
//! - `ingest-router` - write routing (`/ingest/write`)
//! - `zone-mixer` - zone query fan-out (`/zm/*`)
//! - `root-mixer` - cross-zone fan-out (`/rm/query`)
//! - `scheduler` - standing queries (`/sqs/standing/*`)
//! - `check-config` - validate configuration and exit
//!
//! Every component also serves `GET /health` and `GET /metrics`.
//!
//! # Configuration
//!
//! 1. `--config` path
//! 2. `FLEET_CONFIG` environment variable (path to TOML file)
//! 3. `./fleet.toml` in current directory
//! 4. Default configuration
//!
//! Environment variables then override file values, and finally the
//! remote configuration service (`CONFIG_URL`) overrides both.
//!
//! # Exit codes
//!
//! `0` clean shutdown, `1` configuration or bind error, `2` internal error.

mod components;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kuba_fleet::config::{ApplicationConfig, ConfigSource};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use components::Component;

// =============================================================================
// CLI Definition
// =============================================================================

/// Kuba Fleet - range-sharded in-memory time-series monitoring
#[derive(Parser)]
#[command(name = "fleet")]
#[command(version)]
#[command(about = "Runs one component of a range-sharded time-series fleet", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides FLEET_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override listen address (e.g., 0.0.0.0:8080)
    #[arg(short, long, global = true)]
    listen: Option<String>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Start the range assigner
    RangeAssigner,
    /// Start a leaf store
    Leaf,
    /// Start the zone index server
    ZoneIndex,
    /// Start an ingestion router
    IngestRouter,
    /// Start a zone mixer
    ZoneMixer,
    /// Start the root mixer
    RootMixer,
    /// Start the standing-query scheduler
    Scheduler,
    /// Validate configuration file without starting anything
    CheckConfig,
}

impl Commands {
    fn component(self) -> &'static str {
        match self {
            Commands::RangeAssigner => "range-assigner",
            Commands::Leaf => "leaf",
            Commands::ZoneIndex => "zone-index",
            Commands::IngestRouter => "ingest-router",
            Commands::ZoneMixer => "zone-mixer",
            Commands::RootMixer => "root-mixer",
            Commands::Scheduler => "scheduler",
            Commands::CheckConfig => "check-config",
        }
    }
}

/// Why the process is exiting abnormally
enum Failure {
    Configuration(String),
    Internal(String),
}

impl Failure {
    fn exit_code(&self) -> ExitCode {
        match self {
            Failure::Configuration(_) => ExitCode::from(1),
            Failure::Internal(_) => ExitCode::from(2),
        }
    }

    fn message(&self) -> &str {
        match self {
            Failure::Configuration(m) | Failure::Internal(m) => m,
        }
    }
}

impl From<kuba_fleet::Error> for Failure {
    fn from(err: kuba_fleet::Error) -> Self {
        match err {
            kuba_fleet::Error::Configuration(m) => Failure::Configuration(m),
            other => Failure::Internal(other.to_string()),
        }
    }
}

// =============================================================================
// Start-up helpers
// =============================================================================

fn load_config(cli: &Cli) -> Result<(ApplicationConfig, ConfigSource), Failure> {
    let (mut config, source) = ApplicationConfig::resolve(cli.config.as_deref())?;
    if let Some(listen) = &cli.listen {
        config.server.bind_addr = listen.clone();
    }
    Ok((config, source))
}

fn init_tracing(config: &ApplicationConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Validate configuration and print summary
fn cmd_check_config(config: &ApplicationConfig, source: &ConfigSource) {
    println!("Configuration is valid!");
    println!();
    match source {
        ConfigSource::File(path) => println!("Source: {}", path.display()),
        ConfigSource::Defaults => println!("Source: built-in defaults"),
    }
    println!();
    println!("Server Settings:");
    println!("  Listen address: {}", config.server.bind_addr);
    println!("  Default deadline: {} ms", config.server.default_deadline_ms);
    println!();
    println!("Cluster:");
    println!("  Zone: {}", config.cluster.zone_id);
    println!("  Range assigner: {}", config.cluster.range_assigner_url);
    println!("  Zone index: {}", config.cluster.zone_index_url);
    println!(
        "  Recovery log broker: {}",
        config
            .cluster
            .recovery_log_broker
            .as_deref()
            .unwrap_or("in-memory")
    );
    println!("  Zone mixers: {}", config.cluster.zone_mixers.len());
    println!();
    println!("Limits:");
    println!("  Fan-out limit: {}", config.mixer.fan_out_limit);
    println!("  Write retries: {}", config.router.max_write_retries);
    println!("  Durable writes: {}", config.leaf.durable_writes);
    println!(
        "  Standing query concurrency: {}",
        config.scheduler.max_concurrent
    );
    println!("  Log level: {}", config.logging.level);
}

/// Graceful shutdown signal handler
///
/// Signal registration failures are logged and the server then waits
/// forever; it can still be killed.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {},
            Err(e) => {
                warn!(
                    error = %e,
                    "Ctrl+C handler installation failed - graceful shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(
                    error = %e,
                    "SIGTERM handler installation failed - SIGTERM shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn build(command: Commands, config: &mut ApplicationConfig) -> Result<Component, Failure> {
    let remote = components::apply_remote_config(config).await;
    config.validate().map_err(Failure::Configuration)?;

    let component = match command {
        Commands::RangeAssigner => components::range_assigner(config)?,
        Commands::Leaf => components::leaf(config, remote).await?,
        Commands::ZoneIndex => components::zone_index(config)?,
        Commands::IngestRouter => components::ingest_router(config)?,
        Commands::ZoneMixer => components::zone_mixer(config)?,
        Commands::RootMixer => components::root_mixer(config)?,
        Commands::Scheduler => components::scheduler(config)?,
        Commands::CheckConfig => {
            return Err(Failure::Internal("check-config does not start a server".into()))
        },
    };
    Ok(component)
}

async fn run(command: Commands, mut config: ApplicationConfig) -> Result<(), Failure> {
    info!(
        component = command.component(),
        zone = %config.cluster.zone_id,
        "Starting Kuba Fleet v{}",
        env!("CARGO_PKG_VERSION")
    );

    let addr: SocketAddr = config.server.bind_addr.parse().map_err(|e| {
        Failure::Configuration(format!("invalid listen address {}: {e}", config.server.bind_addr))
    })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Failure::Configuration(format!("failed to bind {addr}: {e}")))?;

    let component = build(command, &mut config).await?;
    component.services.start_all();
    debug!(services = ?component.services.statuses().iter().map(|(n, _)| *n).collect::<Vec<_>>(), "Background services started");

    info!("Server listening on http://{}", addr);
    let served = axum::serve(listener, component.router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(agent) = &component.agent {
        if let Err(e) = agent.deregister().await {
            warn!(error = %e, "Failed to deregister leaf on shutdown");
        }
    }
    if let Err(e) = component.services.shutdown().await {
        warn!(error = %e, "Some background services did not stop cleanly");
    }

    served.map_err(|e| Failure::Internal(format!("server error: {e}")))?;
    info!("Server shutdown complete");
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, source) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(failure) => {
            eprintln!("Configuration error: {}", failure.message());
            return failure.exit_code();
        },
    };

    if cli.command == Commands::CheckConfig {
        cmd_check_config(&config, &source);
        return ExitCode::SUCCESS;
    }

    init_tracing(&config);
    if let ConfigSource::File(path) = &source {
        debug!(path = %path.display(), "Configuration loaded");
    }

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!(error = failure.message(), "Fleet process failed");
            failure.exit_code()
        },
    }
}
