//! Watch a referral tree from a ledger snapshot
//!
//! Usage:
//!   cargo run --features cli --bin genealogy_watch -- \
//!       --ledger fixtures/ledger_snapshot.json --root 0xa11ce
//!   cargo run --features cli --bin genealogy_watch -- \
//!       --ledger snapshot.json --root 0xa11ce --config sync.yaml --max-depth 3
//!
//! Prints one JSON document with the projected tree's stats, the team report
//! and the node layout, then exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use genealogy_sync::graph::{layout, LayoutBounds, Orientation, Spacing};
use genealogy_sync::{
    team_report, InMemoryLedger, LedgerSnapshot, NetworkSyncEngine, SubscribeConfig, SyncConfig,
};

#[derive(Parser)]
#[command(name = "genealogy_watch")]
#[command(about = "Fetch and summarize the referral tree under a root")]
struct Args {
    /// Ledger snapshot (JSON)
    #[arg(short = 'l', long)]
    ledger: PathBuf,

    /// Root member address
    #[arg(short = 'r', long)]
    root: String,

    /// Sync configuration (YAML); environment overrides apply on top
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[arg(long)]
    max_depth: Option<u32>,

    #[arg(long)]
    max_fanout: Option<usize>,

    /// Hide members that are not active
    #[arg(long)]
    active_only: bool,

    /// Layout orientation (vertical, horizontal)
    #[arg(short = 'o', long, default_value = "vertical")]
    orientation: String,

    /// Give up waiting for the first fetch after this many seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SyncConfig::load(path)?.with_env_overrides(|var| std::env::var(var).ok())?,
        None => SyncConfig::from_env()?,
    };

    let raw = std::fs::read_to_string(&args.ledger)
        .with_context(|| format!("reading ledger snapshot {}", args.ledger.display()))?;
    let snapshot: LedgerSnapshot = serde_json::from_str(&raw).context("parsing ledger snapshot")?;
    tracing::info!(members = snapshot.members.len(), "Ledger snapshot loaded");

    let engine = NetworkSyncEngine::new(Arc::new(InMemoryLedger::from_snapshot(snapshot)), config);
    engine.start();

    let mut options = SubscribeConfig::default().live_fallback(false).include_inactive(!args.active_only);
    if let Some(depth) = args.max_depth {
        options = options.with_max_depth(depth);
    }
    if let Some(fanout) = args.max_fanout {
        options = options.with_max_fanout(fanout);
    }
    let mut subscription = engine.subscribe(args.root.as_str(), options)?;

    let wait = async {
        loop {
            let view = subscription.snapshot();
            if !view.loading && (view.data.is_some() || view.error.is_some()) {
                return Ok::<_, genealogy_sync::SyncError>(view);
            }
            subscription.changed().await?;
        }
    };
    let view = tokio::time::timeout(Duration::from_secs(args.timeout_secs), wait)
        .await
        .context("timed out waiting for the first fetch")??;

    let Some(tree) = view.data else {
        match view.error {
            Some(e) => bail!(e),
            None => bail!("no tree for {}", args.root),
        }
    };
    if let Some(e) = &view.error {
        tracing::warn!(error = %e, "Showing stale tree");
    }

    let nodes = layout(&tree, Orientation::parse(&args.orientation), Spacing::default());
    let output = serde_json::json!({
        "root": tree.id,
        "partial": view.partial,
        "stale": view.stale,
        "last_fetch": view.last_fetch,
        "stats": view.stats,
        "team": team_report(&tree, Utc::now()),
        "bounds": LayoutBounds::of(&nodes),
        "layout": nodes,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    subscription.unsubscribe();
    engine.stop();
    Ok(())
}
