//! Directory replicator daemon.
//!
//! Usage:
//!   # Run every stream in the config until Ctrl-C
//!   directory-replicator run --config /etc/replicator.yaml
//!
//!   # Check a config file without connecting anywhere
//!   directory-replicator validate --config /etc/replicator.yaml
//!
//! Exit codes: 0 on clean shutdown, 2 on configuration errors at startup,
//! 1 on anything else.

use clap::{Parser, Subcommand, ValueEnum};
use directory_replicator::config::ReplicatorConfig;
use directory_replicator::supervisor::ReplicationSupervisor;
use directory_replicator::trigger::TriggerRegistry;
use directory_replicator::ReplicationError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "directory-replicator", version, about = "Replicate a directory change feed into a key-value store")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "REPLICATOR_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start all configured streams and run until interrupted.
    Run {
        #[arg(short, long, env = "REPLICATOR_CONFIG")]
        config: PathBuf,
    },
    /// Parse and validate a configuration file, then exit.
    Validate {
        #[arg(short, long, env = "REPLICATOR_CONFIG")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

/// Configuration problems discovered before any stream starts.
fn is_config_error(e: &ReplicationError) -> bool {
    matches!(
        e,
        ReplicationError::Config(_) | ReplicationError::Yaml(_) | ReplicationError::Io(_)
    )
}

fn load(path: &Path) -> Result<ReplicatorConfig, ReplicationError> {
    let config = ReplicatorConfig::from_file(path)?;
    config.validate()?;
    Ok(config)
}

/// Build every trigger chain once so unknown kinds and bad options surface
/// before the daemon starts.
fn check_triggers(config: &ReplicatorConfig) -> Result<usize, ReplicationError> {
    let registry = TriggerRegistry::with_builtins();
    for stream in &config.streams {
        let pipeline = registry.build(&stream.consumer_id, &stream.trigger_chain)?;
        info!(consumer_id = %stream.consumer_id, stages = pipeline.len(), "Trigger chain ok");
    }
    Ok(config.streams.len())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = match &cli.command {
        Command::Validate { config } => load(config).and_then(|c| check_triggers(&c)).map(|n| {
            info!(path = %config.display(), streams = n, "Configuration is valid");
        }),
        Command::Run { config } => match load(config) {
            Ok(c) => run(c).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_config_error(&e) => {
            error!(error = %e, "Configuration error");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            error!(error = %e, "Replicator failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(config: ReplicatorConfig) -> Result<(), ReplicationError> {
    let settings = config.settings.supervisor_settings();
    let feed = config.source.build(&settings.consumer.retry)?;
    let store = config.destination.open(&settings.consumer.retry).await?;

    info!(
        feed = feed.name(),
        store = store.name(),
        streams = config.streams.len(),
        "Starting directory replicator"
    );

    let supervisor = ReplicationSupervisor::new(feed, Arc::clone(&store), TriggerRegistry::with_builtins(), settings);

    for stream in config.streams {
        if let Err(e) = supervisor.add_stream(stream).await {
            supervisor.shutdown().await;
            if let Err(close_err) = store.close().await {
                warn!(error = %close_err, "Failed to close destination store");
            }
            return Err(e);
        }
    }

    let mut ticker = tokio::time::interval(config.settings.health_log_interval_duration());
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
                }
                info!("Shutdown signal received");
                break;
            }

            _ = ticker.tick() => {
                let health = supervisor.health_check().await;
                for s in health.streams.iter().filter(|s| s.health.needs_attention()) {
                    warn!(consumer_id = %s.consumer_id, health = %s.health, "Stream needs attention");
                }
                info!(
                    total = health.streams_total,
                    streaming = health.streams_streaming,
                    backoff = health.streams_backoff,
                    attention = health.streams_attention,
                    "Health"
                );
            }
        }
    }

    supervisor.shutdown().await;
    if let Err(e) = store.close().await {
        warn!(store = store.name(), error = %e, "Failed to close destination store");
    }
    info!("Directory replicator stopped");
    Ok(())
}
