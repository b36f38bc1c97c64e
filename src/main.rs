//! # Outreach: campaign send scheduler
//!
//! Usage:
//!   outreach run                  # Daemon: one send pass every tick
//!   outreach once                 # Single pass, then exit
//!   outreach unlock               # Force-release a stuck run lock
//!   outreach runs --limit 20      # Recent scheduler runs (JSON)
//!   outreach logs --limit 50      # Recent message log rows (JSON)
//!   outreach pause <id>           # Stop sending to a recipient
//!   outreach resume <id>          # Resume a recipient

use anyhow::Result;
use clap::{Parser, Subcommand};
use outreach_core::OutreachConfig;
use outreach_scheduler::{CampaignDb, PassOutcome, RunLock, SchedulerEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "outreach",
    version,
    about = "📬 Outreach: campaign send scheduler"
)]
struct Cli {
    /// Config file (default: ~/.outreach/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run send passes on the configured interval until Ctrl-C
    Run,
    /// Run a single send pass
    Once,
    /// Force-release the run lock
    Unlock,
    /// Show recent scheduler runs
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show recent message log rows
    Logs {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Pause a recipient
    Pause { id: i64 },
    /// Resume a paused recipient
    Resume { id: i64 },
}

fn load_config(path: Option<&str>) -> Result<OutreachConfig> {
    let config = match path {
        Some(p) => {
            let mut config = OutreachConfig::load_from(&PathBuf::from(shellexpand::tilde(p).as_ref()))?;
            config.apply_env_overrides();
            config
        }
        None => OutreachConfig::load()?,
    };
    Ok(config)
}

fn open_db(config: &OutreachConfig) -> Result<Arc<CampaignDb>> {
    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::debug!("🗄️ Database: {}", db_path.display());
    Ok(Arc::new(CampaignDb::open(&db_path)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "outreach=debug,outreach_scheduler=debug,outreach_channels=debug,outreach_core=debug"
    } else {
        "outreach=info,outreach_scheduler=info,outreach_channels=info,outreach_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let db = open_db(&config)?;

    match cli.command {
        Command::Run => {
            let transport = outreach_channels::from_config(&config.transport)?;
            let interval = config.scheduler.tick_interval_secs;
            let engine = Arc::new(SchedulerEngine::new(db, transport, config.scheduler));

            println!("📬 Outreach v{}", env!("CARGO_PKG_VERSION"));
            println!("   ⏰ Tick:      every {interval}s");
            println!("   📮 Provider:  {}", config.transport.provider);
            println!("   🗄️  Database:  {}", config.database.resolved_path().display());
            println!();

            tokio::select! {
                _ = outreach_scheduler::spawn_scheduler(engine, interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("👋 Shutting down; the run lock will lapse on its own");
                }
            }
        }
        Command::Once => {
            let transport = outreach_channels::from_config(&config.transport)?;
            let engine = SchedulerEngine::new(db, transport, config.scheduler);
            match engine.run_once().await? {
                PassOutcome::LockUnavailable => {
                    println!("🔒 Another scheduler holds the lock; nothing done.");
                }
                PassOutcome::Completed(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
        Command::Unlock => {
            let lock = RunLock::new(&config.scheduler.lock_name, config.scheduler.lock_lease());
            if let Some(state) = lock.inspect(&db)? {
                if state.is_held(chrono::Utc::now()) {
                    println!("⚠️  Lock '{}' was live (owner {:?})", lock.name(), state.owner_token);
                }
            }
            if lock.force_release(&db)? {
                println!("🔓 Released lock '{}'", lock.name());
            } else {
                println!("Lock '{}' does not exist.", lock.name());
            }
        }
        Command::Runs { limit } => {
            println!("{}", serde_json::to_string_pretty(&db.recent_runs(limit)?)?);
        }
        Command::Logs { limit } => {
            println!("{}", serde_json::to_string_pretty(&db.recent_logs(limit)?)?);
        }
        Command::Pause { id } => {
            if db.set_paused(id, true, chrono::Utc::now())? {
                println!("⏸️  Recipient {id} paused");
            } else {
                anyhow::bail!("Recipient {id} not found");
            }
        }
        Command::Resume { id } => {
            if db.set_paused(id, false, chrono::Utc::now())? {
                println!("▶️  Recipient {id} resumed");
            } else {
                anyhow::bail!("Recipient {id} not found");
            }
        }
    }

    Ok(())
}
