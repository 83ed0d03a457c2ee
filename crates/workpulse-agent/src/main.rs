//! `workpulse-updater`: keeps the WorkPulse agent up to date

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use workpulse_config::{AgentConfig, ConfigManager};
use workpulse_updates::{
    BackupManager, NoopServiceControl, StatusStore, SystemServiceControl, UpdateOrchestrator,
    VersionIdentifier,
};

#[derive(Parser)]
#[command(name = "workpulse-updater")]
#[command(about = "Self-update service for the WorkPulse monitoring agent")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background update loop until interrupted
    Run,
    /// Run one update cycle now and print the resulting status
    Check,
    /// Print the persisted update status
    Status,
    /// Inspect or prune installation backups
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Show or validate the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// List backups, newest first
    List,
    /// Delete backups past the retention period
    Prune,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Check the configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    };
    let config = manager
        .load_config()
        .with_context(|| format!("loading {}", manager.config_path().display()))?;
    logging::init(&config.logging)?;

    match cli.command {
        Commands::Run => run_loop(&manager, config).await,
        Commands::Check => run_check(&manager, config).await,
        Commands::Status => print_status(&config),
        Commands::Backups { action } => match action {
            BackupAction::List => list_backups(&config),
            BackupAction::Prune => prune_backups(&config),
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", ConfigManager::render(&config)?);
                Ok(())
            }
            ConfigAction::Validate => {
                manager.validate_config(&config)?;
                println!("{}: ok", manager.config_path().display());
                Ok(())
            }
        },
    }
}

/// Installed version: the newer of the configured pin and the status
/// record, then our own package version.
///
/// A pin only seeds the version; once an update has installed something
/// newer the status record wins.
fn resolve_current_version(config: &AgentConfig) -> anyhow::Result<VersionIdentifier> {
    let pinned = match &config.agent.installed_version {
        Some(version) => Some(
            VersionIdentifier::parse(version)
                .with_context(|| format!("agent.installed_version '{version}'"))?,
        ),
        None => None,
    };
    let status_file = config.update_paths().status_file();
    let recorded = StatusStore::read_snapshot(&status_file)
        .ok()
        .map(|record| record.current_version);

    match (pinned, recorded) {
        (Some(pinned), Some(recorded)) if recorded > pinned => {
            debug!(%pinned, %recorded, "Status record is newer than the configured version");
            Ok(recorded)
        }
        (Some(pinned), _) => Ok(pinned),
        (None, Some(recorded)) => Ok(recorded),
        (None, None) => Ok(VersionIdentifier::parse(env!("CARGO_PKG_VERSION"))?),
    }
}

fn build_orchestrator(
    manager: &ConfigManager,
    config: &AgentConfig,
) -> anyhow::Result<Arc<UpdateOrchestrator>> {
    manager.validate_config(config)?;
    let current = resolve_current_version(config)?;
    let service = Arc::new(SystemServiceControl::new(&config.agent.service_name));
    let orchestrator = UpdateOrchestrator::from_settings(
        &config.updates,
        &config.update_paths(),
        current,
        &config.http,
        service,
    )
    .context("initialising update engine")?;
    Ok(Arc::new(orchestrator))
}

async fn run_loop(manager: &ConfigManager, config: AgentConfig) -> anyhow::Result<()> {
    if !config.updates.enabled {
        info!("Updates are disabled in configuration");
        return Ok(());
    }
    let orchestrator = build_orchestrator(manager, &config)?;

    let signal_target = orchestrator.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping at the next safe point");
                signal_target.shutdown();
            }
            Err(e) => warn!(error = %e, "Cannot listen for interrupts"),
        }
    });

    orchestrator.run(config.updates.check_interval()).await;
    Ok(())
}

async fn run_check(manager: &ConfigManager, config: AgentConfig) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(manager, &config)?;

    let signal_target = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_target.cancel_current();
        }
    });

    orchestrator.recover().await.context("recovering interrupted update")?;
    let state = orchestrator.check_and_update().await?;
    info!(state = %state, "Update check finished");
    println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);
    Ok(())
}

fn print_status(config: &AgentConfig) -> anyhow::Result<()> {
    let path = config.update_paths().status_file();
    let record = StatusStore::read_snapshot(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn backup_manager(config: &AgentConfig) -> BackupManager {
    let paths = config.update_paths();
    BackupManager::new(
        paths.backup_dir(),
        paths.install_dir(),
        Arc::new(NoopServiceControl),
    )
    .with_retention_days(config.updates.backup_retention_days)
    .with_max_backups(config.updates.max_backups)
}

fn list_backups(config: &AgentConfig) -> anyhow::Result<()> {
    let backups = backup_manager(config);
    let records = backups.list_backups();
    if records.is_empty() {
        println!("No backups in {}", backups.backup_dir().display());
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<12} {:>10} bytes {:>6} files  {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.version.to_string(),
            record.size_bytes,
            record.file_count,
            backups.archive_path(&record).display(),
        );
    }
    Ok(())
}

fn prune_backups(config: &AgentConfig) -> anyhow::Result<()> {
    let removed = backup_manager(config).sweep_retention()?;
    for record in &removed {
        println!("removed {}", record.file_name);
    }
    println!("{} backup(s) removed", removed.len());
    Ok(())
}
