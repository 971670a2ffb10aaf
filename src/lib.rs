//! Genealogy Sync - referral network synchronization engine
//!
//! Keeps an up-to-date picture of the referral tree under a chosen root:
//! bounded concurrent fetch from a slow ledger, a TTL cache with
//! single-flight refresh, adaptive polling driven by user activity, and an
//! optional live event channel that invalidates affected roots.
//!
//! ## Architecture
//!
//! ```text
//!   consumer ──subscribe──► NetworkSyncEngine ──► NetworkSubscription (view + stats)
//!                               │
//!        ┌──────────────────────┼─────────────────────────┐
//!        ▼                      ▼                         ▼
//!   RootScheduler          TreeCache               StreamListener
//!   (polling state)    (TTL, single flight,      (reconnect backoff,
//!        │              event invalidation)        degrade to polling)
//!        └──────► TreeFetcher ──► LedgerQuery (bounded, retried, timed out)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use genealogy_sync::{InMemoryLedger, NetworkSyncEngine, SubscribeConfig, SyncConfig};
//!
//! # async fn demo() -> Result<(), genealogy_sync::SyncError> {
//! let ledger = Arc::new(InMemoryLedger::new());
//! let engine = NetworkSyncEngine::new(ledger, SyncConfig::default());
//! engine.start();
//!
//! let mut subscription = engine.subscribe("0xroot", SubscribeConfig::default())?;
//! subscription.changed().await?;
//! let view = subscription.snapshot();
//! println!("{:?}", view.stats);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod ledger;
pub mod scheduler;
pub mod stats;

pub use cache::{CachedTree, InvalidationScope, SubscriptionId, TreeCache};
pub use config::{CacheConfig, FetchConfig, PollingConfig, StreamConfig, SubscribeConfig, SyncConfig};
pub use engine::{NetworkSubscription, NetworkSyncEngine, NetworkView};
pub use error::{ConfigError, FetchError, LedgerError, StreamError, SyncError, SyncResult};
pub use events::{ChannelEventSource, EventSource, LedgerEvent, LedgerEventKind};
pub use fetcher::{FetchedTree, TreeFetcher, UplineMember};
pub use ledger::{InMemoryLedger, LedgerQuery, LedgerSnapshot, MemberRecord};
pub use scheduler::SchedulerState;
pub use stats::{aggregate, team_report, MemberSummary, TeamReport, TreeStats};

pub use genealogy_graph as graph;
pub use genealogy_types as types;
pub use genealogy_types::{NetworkNode, NodeAttributes, NodeId};
