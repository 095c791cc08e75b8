//! Command-line front end over a file-backed store and the HTTP transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::coordinator::{start_sync_scheduler, SchedulerConfig};
use crate::persistence::{JsonFileStore, LocalStore};
use crate::session::{SessionConfig, SessionEvent, SyncSession};
use crate::tracker::ChangeTracker;
use crate::transport::HttpTransport;

#[derive(Debug, Parser)]
#[command(name = "enterprise-sync", version, about = "Synchronize a local object store with a remote endpoint")]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Store file, overriding `store_path` from the config
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single sync pass
    Sync,
    /// Sync on the configured interval until interrupted
    Watch,
    /// Show the sync cursor and pending changes
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

type HttpSession = SyncSession<JsonFileStore, HttpTransport>;

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store_path = Some(store);
    }

    match cli.command {
        Command::Sync => sync_once(&config).await,
        Command::Watch => watch(&config).await,
        Command::Status { json } => status(&config, json),
    }
}

async fn connect(config: &SyncConfig) -> Result<HttpSession> {
    config.validate()?;
    let credentials = config
        .credentials()
        .context("No username configured; set `username` or ENTERPRISE_SYNC_USERNAME")?;

    let store = JsonFileStore::open(config.store_path())?;
    let transport = HttpTransport::new(Duration::from_secs(config.timeout_secs))?;
    let session = SyncSession::new(
        Arc::new(RwLock::new(store)),
        transport,
        SessionConfig::from(config),
    );
    session.authenticate(credentials).await?;
    Ok(session)
}

async fn sync_once(config: &SyncConfig) -> Result<()> {
    let session = connect(config).await?;
    let result = session.sync().await;
    session.logout().await?;
    let report = result?;

    println!(
        "Synced: {} sent, {} received, {} created, {} updated, {} purged",
        report.sent,
        report.received,
        report.created,
        report.updated,
        report.purged.len()
    );
    if !report.conflicts.is_empty() {
        println!("Kept {} newer local versions", report.conflicts.len());
    }
    if !report.unacknowledged.is_empty() {
        println!(
            "{} changes were not acknowledged and will be resent",
            report.unacknowledged.len()
        );
    }
    Ok(())
}

async fn watch(config: &SyncConfig) -> Result<()> {
    let session = connect(config).await?;

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::SyncFailed { kind, message } = event {
                error!(?kind, "Sync session failed: {}", message);
            }
        }
    });

    let (stop, handle) = start_sync_scheduler(session.clone(), SchedulerConfig::from(config));
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, stopping");

    let _ = stop.send(true);
    handle.await.context("Scheduler task failed")?;
    session.logout().await?;
    Ok(())
}

fn status(config: &SyncConfig, json: bool) -> Result<()> {
    let path = config.store_path();
    let store = JsonFileStore::open(&path)?;
    let last_sync = store.last_sync();
    let pending = ChangeTracker::new().collect_dirty(&store, last_sync);
    let deleted = pending
        .iter()
        .filter(|id| store.entity_by_id(id).is_some_and(|e| e.is_deleted()))
        .count();

    if json {
        let value = serde_json::json!({
            "store": path,
            "entities": store.len(),
            "lastSync": last_sync,
            "pendingChanges": pending.len(),
            "pendingDeletions": deleted,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Store:             {}", path.display());
        println!("Entities:          {}", store.len());
        println!("Last sync:         {}", last_sync.to_rfc3339());
        println!("Pending changes:   {}", pending.len());
        println!("Pending deletions: {}", deleted);
    }
    Ok(())
}
