//! Command-line interface for the upkeep self-update engine

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use upkeep_engine::{
    messages, EngineConfig, TriggerLocation, UpdateEngine, UpdateSession, UpdateStatus,
};

/// Exit code for a verified success or an up-to-date installation
const EXIT_OK: i32 = 0;
/// Exit code for a recoverable failure (rolled back, or nothing touched)
const EXIT_RECOVERABLE: i32 = 1;
/// Exit code for an unrecoverable failure requiring manual recovery
const EXIT_MANUAL_RECOVERY: i32 = 2;

#[derive(Parser)]
#[command(name = "upkeep")]
#[command(about = "Safely update an installed unit from its release registry", version)]
struct Cli {
    /// Path to the engine configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the registry for a newer version
    Check {
        /// Bypass the cached registry answer
        #[arg(long)]
        force: bool,
    },
    /// Download, validate, and install the latest release
    Update {
        /// Exact version to install (defaults to the registry's latest)
        #[arg(long)]
        version: Option<semver::Version>,
        /// Where this request originates from
        #[arg(long, value_enum, default_value_t = TriggerArg::CommandLine)]
        trigger: TriggerArg,
        /// Identity recorded in the update history
        #[arg(long)]
        actor: Option<String>,
        /// Proceed even when the installed version is already current
        #[arg(long)]
        reinstall: bool,
    },
    /// Show the recent update history
    History {
        /// Maximum entries to show
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Remove leftover downloaded packages
    Cleanup {
        /// Only remove packages older than this many hours
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum TriggerArg {
    InteractiveUi,
    CommandLine,
    Scheduled,
    BulkOperation,
}

impl From<TriggerArg> for TriggerLocation {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::InteractiveUi => TriggerLocation::InteractiveUi,
            TriggerArg::CommandLine => TriggerLocation::CommandLine,
            TriggerArg::Scheduled => TriggerLocation::Scheduled,
            TriggerArg::BulkOperation => TriggerLocation::BulkOperation,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(EXIT_RECOVERABLE);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(cli.config.as_deref())?;
    let registry_url = config.registry_url.clone();
    let engine = UpdateEngine::new(config).context("failed to initialize update engine")?;

    match cli.command {
        Commands::Check { force } => {
            let check = engine.check_for_update(force).await?;
            println!("installed: {}", check.current_version);
            println!("latest:    {}", check.latest_version);
            if check.update_available {
                println!("update available");
                if !check.release.notes.is_empty() {
                    println!("\n{}", check.release.notes);
                }
            } else {
                println!("already up to date");
            }
            Ok(EXIT_OK)
        }
        Commands::Update {
            version,
            trigger,
            actor,
            reinstall,
        } => {
            let actor = actor
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "operator".to_string());

            if version.is_none() && !reinstall {
                let check = engine.check_for_update(false).await?;
                if !check.update_available {
                    println!("already up to date ({})", check.current_version);
                    return Ok(EXIT_OK);
                }
            }

            let session = match engine.run_update(version, trigger.into(), &actor).await {
                Ok(session) => session,
                Err(e) => {
                    eprintln!("{}", messages::operator_message(&e, &registry_url));
                    return Ok(EXIT_RECOVERABLE);
                }
            };
            Ok(report_session(&session, &registry_url))
        }
        Commands::History { limit } => {
            let entries = engine.get_history(limit);
            if entries.is_empty() {
                println!("no update history");
            }
            for entry in entries {
                println!(
                    "{}  {:<8}  {:<11}  {}  by {} ({}){}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.severity,
                    entry.status,
                    entry.target_version,
                    entry.actor,
                    entry.trigger_location,
                    entry
                        .error_message
                        .map(|m| format!("\n    {m}"))
                        .unwrap_or_default(),
                );
            }
            Ok(EXIT_OK)
        }
        Commands::Cleanup { max_age_hours } => {
            let removed =
                engine.cleanup_orphans(Duration::from_secs(max_age_hours * 60 * 60))?;
            println!("removed {removed} orphaned package(s)");
            Ok(EXIT_OK)
        }
    }
}

fn report_session(session: &UpdateSession, registry_url: &str) -> i32 {
    match session.status {
        UpdateStatus::Complete => {
            println!(
                "updated {} -> {}",
                session.current_version, session.target_version
            );
            EXIT_OK
        }
        UpdateStatus::RolledBack => {
            let detail = session
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            eprintln!("update failed and was rolled back: {detail}");
            eprintln!(
                "the previous installation ({}) was restored",
                session.current_version
            );
            EXIT_RECOVERABLE
        }
        _ => {
            let detail = session
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown failure".to_string());
            eprintln!("update failed: {detail}");
            if session.requires_manual_recovery() {
                eprintln!(
                    "automatic rollback failed; reinstall manually from {registry_url}"
                );
                EXIT_MANUAL_RECOVERY
            } else {
                EXIT_RECOVERABLE
            }
        }
    }
}

fn load_config(explicit: Option<&std::path::Path>) -> anyhow::Result<EngineConfig> {
    if let Some(path) = explicit {
        return EngineConfig::from_toml_file(path)
            .with_context(|| format!("failed to load {}", path.display()));
    }

    let local = PathBuf::from("upkeep.toml");
    if local.is_file() {
        return EngineConfig::from_toml_file(&local).context("failed to load upkeep.toml");
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("upkeep").join("upkeep.toml");
        if global.is_file() {
            return EngineConfig::from_toml_file(&global)
                .with_context(|| format!("failed to load {}", global.display()));
        }
    }

    anyhow::bail!(
        "no configuration found; pass --config or create upkeep.toml in the working directory"
    )
}
