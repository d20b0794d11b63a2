//! Innkeep store operations tool
//!
//! Usage:
//!   innkeep --config /etc/innkeep/store.toml health
//!   innkeep outbox --failed
//!   innkeep reset --yes
//!
//! Reads the same configuration as the application (file plus `INNKEEP_*`
//! environment variables), so it must run on the device that owns the store.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use innkeep_store::{DataService, HealthStatus, OutboxEntry, StoreConfig, SyncOutbox};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "innkeep")]
#[command(about = "Inspect and maintain the local Innkeep offline store")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "INNKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the store file location
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run health checks; exits non-zero when unhealthy
    Health,
    /// Print row counts, outbox and conflict totals
    Stats,
    /// List outbox entries
    Outbox {
        /// Show failed entries instead of pending ones
        #[arg(long)]
        failed: bool,

        /// Maximum number of entries to print
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Move failed outbox entries back to pending
    RetryFailed,
    /// Delete completed outbox entries
    PurgeCompleted,
    /// Delete all local data and re-seed defaults
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn outbox_entries(
    outbox: &SyncOutbox,
    failed: bool,
    limit: usize,
) -> anyhow::Result<Vec<OutboxEntry>> {
    if failed {
        let mut entries = outbox.list_failed().await?;
        entries.truncate(limit);
        Ok(entries)
    } else {
        Ok(outbox.list_pending(limit).await?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config =
        StoreConfig::load(args.config.as_deref()).context("failed to load store configuration")?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if matches!(args.command, Command::Reset { .. }) {
        // a reset seeds explicitly; avoid seeding twice on open
        config.seed_defaults = false;
    }

    info!(db_path = %config.db_path.display(), "Opening store");
    let service = DataService::new(config);
    service
        .initialize()
        .await
        .context("failed to open the offline store")?;

    match args.command {
        Command::Health => {
            let report = service.check_health().await;
            print_json(&report)?;
            if report.status == HealthStatus::Unhealthy {
                bail!("store is unhealthy");
            }
        }
        Command::Stats => {
            print_json(&service.statistics().await?)?;
        }
        Command::Outbox { failed, limit } => {
            let outbox = service.outbox().await?;
            print_json(&outbox_entries(&outbox, failed, limit).await?)?;
        }
        Command::RetryFailed => {
            let retried = service.outbox().await?.retry_failed().await?;
            info!(entries = retried, "Re-queued failed entries");
            print_json(&json!({ "retried": retried }))?;
        }
        Command::PurgeCompleted => {
            let purged = service.outbox().await?.purge_completed().await?;
            info!(entries = purged, "Purged completed entries");
            print_json(&json!({ "purged": purged }))?;
        }
        Command::Reset { yes } => {
            if !yes {
                bail!("reset deletes every local record; pass --yes to confirm");
            }
            let pending = service.outbox().await?.status_counts().await?.pending;
            if pending > 0 {
                warn!(pending = pending, "Discarding unsynced outbox entries");
            }
            let report = service.reset().await?;
            print_json(&json!({ "seeded_rows": report.rows, "seeded_settings": report.settings }))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use innkeep_store::MemoryKvBackend;
    use std::sync::Arc;

    async fn service() -> DataService {
        let config = StoreConfig {
            device_id: Some("ops-test".to_string()),
            kdf_iterations: 1_000,
            seed_defaults: false,
            ..StoreConfig::default()
        };
        let service = DataService::new(config).with_backend(Arc::new(MemoryKvBackend::new()));
        service.initialize().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_outbox_limit_applies_to_failed_entries() {
        let service = service().await;
        let guests = service.get_repository("guests").await.unwrap();
        for name in ["Ana", "Ben", "Chloe"] {
            let guest = json!({ "name": name }).as_object().unwrap().clone();
            guests.create(guest).await.unwrap();
        }

        let outbox = service.outbox().await.unwrap();
        assert_eq!(outbox_entries(&outbox, false, 2).await.unwrap().len(), 2);

        for entry in outbox.list_pending(10).await.unwrap() {
            outbox.mark_syncing(entry.id).await.unwrap();
            outbox.mark_failed(entry.id, "gateway timeout").await.unwrap();
        }
        assert_eq!(outbox_entries(&outbox, true, 2).await.unwrap().len(), 2);
        assert_eq!(outbox_entries(&outbox, true, 50).await.unwrap().len(), 3);
        assert!(outbox_entries(&outbox, false, 50).await.unwrap().is_empty());
    }
}
