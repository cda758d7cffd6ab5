//! Queue Coordinator
//!
//! Coordination server for multi-kiosk queue deployments.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use coordinator::config::{default_config_path, Config};
use coordinator::orchestrator::{OrchestratorEvent, ServerOrchestrator};
use coordinator::reset::DailyResetEngine;
use coordinator::store::{NewService, Store, StoreOptions};
use coordinator::SystemClock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Queue Coordinator - discovery, realtime hub, print broker and daily reset.
#[derive(Parser, Debug)]
#[command(name = "queue-coordinator")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the coordination server
    Serve,

    /// Inspect or trigger the daily reset
    #[command(subcommand)]
    Reset(ResetCommands),

    /// Manage services
    #[command(subcommand)]
    Services(ServicesCommands),

    /// Show database statistics
    Stats,

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for the daily reset.
#[derive(Subcommand, Debug, Clone)]
pub enum ResetCommands {
    /// Show whether today's reset has run
    Status,

    /// Clear the ticket queue now
    Force,

    /// List past resets, most recent first
    History {
        /// Maximum number of entries
        #[arg(long, short)]
        limit: Option<u32>,
    },
}

/// Subcommands for service management.
#[derive(Subcommand, Debug, Clone)]
pub enum ServicesCommands {
    /// List all services
    List,

    /// Create an active service
    Add {
        /// Service name
        name: String,

        /// Optional description
        #[arg(long, short)]
        description: Option<String>,
    },
}

/// Subcommands for the configuration file.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Missing files load as defaults
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_tracing(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve => {
            let mut orchestrator = ServerOrchestrator::new(config)?;
            tracing::info!(
                "Starting queue coordinator (device ID: {})",
                orchestrator.device_id()
            );
            run_headless(&mut orchestrator).await?;
        }
        Commands::Reset(cmd) => {
            let store = open_store(&config)?;
            let engine = DailyResetEngine::new(
                store,
                Arc::new(SystemClock),
                config.reset.timezone,
            )
            .with_history_limit(config.reset.history_limit);

            match cmd {
                ResetCommands::Status => {
                    let status = engine.status()?;
                    println!("Today:        {}", status.today);
                    println!(
                        "Needs reset:  {}",
                        if status.needs_reset { "yes" } else { "no" }
                    );
                    match status.last_reset {
                        Some(last) => println!(
                            "Last reset:   {} ({} tickets)",
                            last.last_reset_timestamp, last.tickets_reset
                        ),
                        None => println!("Last reset:   never"),
                    }
                }
                ResetCommands::Force => {
                    let report = engine.perform_manual_reset()?;
                    println!("{}", report.message);
                }
                ResetCommands::History { limit } => {
                    let history = engine.history(limit)?;
                    if history.is_empty() {
                        println!("No resets recorded.");
                    } else {
                        println!("{:<12} {:<26} {:>8}", "DATE", "TIMESTAMP", "TICKETS");
                        for record in history {
                            println!(
                                "{:<12} {:<26} {:>8}",
                                record.last_reset_date,
                                record.last_reset_timestamp,
                                record.tickets_reset
                            );
                        }
                    }
                }
            }
        }
        Commands::Services(cmd) => {
            let store = open_store(&config)?;
            match cmd {
                ServicesCommands::List => {
                    let services = store.list_services()?;
                    if services.is_empty() {
                        println!("No services configured.");
                    } else {
                        println!("{:<6} {:<24} {:<10} DESCRIPTION", "ID", "NAME", "STATUS");
                        for service in services {
                            println!(
                                "{:<6} {:<24} {:<10} {}",
                                service.id,
                                truncate_str(&service.name, 24),
                                service.status.as_str(),
                                service.description.as_deref().unwrap_or("-")
                            );
                        }
                    }
                }
                ServicesCommands::Add { name, description } => {
                    let service = store.create_service(&NewService {
                        description,
                        ..NewService::active(name)
                    })?;
                    println!("Created service {} ({})", service.id, service.name);
                }
            }
        }
        Commands::Stats => {
            let store = open_store(&config)?;
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            init_config(&config_path, force)?;
        }
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// Returns the file writer guard when file logging is enabled; it must live
/// until the process exits so buffered lines get flushed.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if !config.server.log_to_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    }

    let log_dir = config.server.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(&log_dir, "coordinator.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

fn open_store(config: &Config) -> anyhow::Result<Arc<Store>> {
    let path = config.database_path();
    let store = Store::open(
        &path,
        StoreOptions {
            read_connections: config.database.read_connections,
            busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
        },
        Arc::new(SystemClock),
    )
    .with_context(|| format!("Failed to open database: {}", path.display()))?;
    Ok(Arc::new(store))
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Run the server until SIGTERM or SIGINT.
async fn run_headless(orchestrator: &mut ServerOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    if let Some(addr) = orchestrator.local_addr() {
        tracing::info!("Realtime endpoint: ws://{}", addr);
    }

    // Subscribe to orchestrator events for logging
    let mut events = orchestrator.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ResetPerformed {
                    date,
                    tickets_reset,
                } => {
                    tracing::info!("Daily reset for {} cleared {} tickets", date, tickets_reset);
                }
                OrchestratorEvent::JobsExpired { request_ids } => {
                    tracing::warn!("Expired {} print requests", request_ids.len());
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
