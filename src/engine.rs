//! NetworkSyncEngine - explicit owner of cache, polling table and
//! subscriptions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ NetworkSyncEngine                                            │
//! │  fetcher: TreeFetcher          cache: TreeCache              │
//! │  trackers: RwLock<HashMap<NodeId, RootTracker>>              │
//! └──────────────────────────────────────────────────────────────┘
//!        │ one tracker per observed root (refcounted)
//!        ▼
//!  RootTracker ── RootScheduler task ──► poll ─► cache ─► fetcher ─► ledger
//!       │      └─ StreamListener task ──► cache.handle_event ─► refresh
//!       │
//!       └─ watch::Sender<RootView> ──► NetworkSubscription (projection + stats)
//! ```
//!
//! Every subscription of a root shares one tracker and one cached tree; the
//! tree is fetched with the largest depth/fan-out any subscriber asked for
//! and each subscription projects it down to its own options on read.
//!
//! Locks (`trackers`, polling state, cache map) are only held around map
//! access, never across a ledger call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genealogy_types::{NetworkNode, NodeId, Projection};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::{InvalidationScope, SubscriptionId, TreeCache};
use crate::config::{PollingConfig, SubscribeConfig, SyncConfig};
use crate::error::{FetchError, SyncError, SyncResult};
use crate::events::{EventSink, EventSource, LedgerEvent, StreamListener};
use crate::fetcher::{FetchedTree, TreeFetcher, UplineMember};
use crate::ledger::LedgerQuery;
use crate::scheduler::{
    PollReason, PollTarget, PollingState, RefreshRequest, RootScheduler, SchedulerState, SharedPollingState,
};
use crate::stats::{aggregate, TreeStats};

/// Queued out-of-band refreshes per root; further event refreshes are coalesced
const REFRESH_QUEUE: usize = 8;

// ============================================================================
// VIEWS
// ============================================================================

/// What the tracker publishes after every poll
#[derive(Debug, Clone, Default)]
struct RootView {
    tree: Option<Arc<FetchedTree>>,
    loading: bool,
    error: Option<FetchError>,
    stale: bool,
    last_fetch: Option<DateTime<Utc>>,
}

/// Snapshot handed to a consumer
#[derive(Debug, Clone)]
pub struct NetworkView {
    /// Tree projected through the subscription's options; may be stale
    pub data: Option<NetworkNode>,
    pub loading: bool,
    /// Last fetch failure; `data` still holds the last known tree
    pub error: Option<FetchError>,
    pub stats: Option<TreeStats>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub stale: bool,
    /// Some branch of `data` failed or was truncated
    pub partial: bool,
    pub stream_degraded: bool,
    pub polling_state: SchedulerState,
}

/// Depth and fan-out a tracker fetches with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FetchShape {
    max_depth: u32,
    max_fanout: usize,
}

// ============================================================================
// TRACKER
// ============================================================================

struct RootTracker {
    /// Distinguishes a re-created tracker from a torn-down one
    generation: u64,
    state: SharedPollingState,
    view_tx: watch::Sender<RootView>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    shutdown_tx: watch::Sender<bool>,
    subscribers: HashMap<u64, SubscribeConfig>,
    shape: FetchShape,
    scheduler: JoinHandle<()>,
    listener: Option<JoinHandle<()>>,
}

impl RootTracker {
    fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.state.lock().stop();
        self.view_tx.send_modify(|view| view.loading = false);
        if let Some(listener) = &self.listener {
            listener.abort();
        }
    }
}

struct EngineInner {
    config: SyncConfig,
    fetcher: TreeFetcher,
    cache: TreeCache,
    event_source: RwLock<Option<Arc<dyn EventSource>>>,
    trackers: RwLock<HashMap<NodeId, RootTracker>>,
    running: AtomicBool,
    visible: AtomicBool,
    next_id: AtomicU64,
    cache_subscription: RwLock<Option<SubscriptionId>>,
}

impl EngineInner {
    fn trackers(&self) -> RwLockReadGuard<'_, HashMap<NodeId, RootTracker>> {
        self.trackers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn trackers_mut(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, RootTracker>> {
        self.trackers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// One poll of `root`: fetch through the cache and publish the outcome.
    async fn poll_root(&self, root: &NodeId, reason: PollReason) {
        let Some((generation, shape, view_tx)) = self
            .trackers()
            .get(root)
            .map(|t| (t.generation, t.shape, t.view_tx.clone()))
        else {
            return;
        };

        view_tx.send_if_modified(|view| !std::mem::replace(&mut view.loading, true));

        let fetcher = self.fetcher.clone();
        let key = root.clone();
        let fetch = move || async move { fetcher.fetch_tree(&key, shape.max_depth, shape.max_fanout).await };

        let cached = self
            .cache
            .get(root)
            .filter(|tree| !reason.is_forced() && tree.covers(shape.max_depth, shape.max_fanout));
        let result = match cached {
            Some(tree) => Ok(tree),
            None => self.cache.refresh_with(root, fetch).await,
        };

        let still_tracked = self
            .trackers()
            .get(root)
            .is_some_and(|t| t.generation == generation);
        if !still_tracked {
            tracing::debug!(root = %root, "Discarding poll result for untracked root");
            return;
        }

        match result {
            Ok(tree) => {
                view_tx.send_if_modified(|view| {
                    let same = view.tree.as_ref().is_some_and(|t| Arc::ptr_eq(t, &tree));
                    let changed = !same || view.loading || view.error.is_some() || view.stale;
                    view.last_fetch = Some(tree.fetched_at_utc);
                    view.tree = Some(tree);
                    view.loading = false;
                    view.error = None;
                    view.stale = false;
                    changed
                });
            }
            Err(e) => {
                tracing::warn!(root = %root, error = %e, ?reason, "Poll failed, keeping last known tree");
                let fallback = self.cache.get_stale(root).map(|cached| cached.tree);
                view_tx.send_modify(|view| {
                    if view.tree.is_none() {
                        view.tree = fallback;
                    }
                    view.loading = false;
                    view.stale = view.tree.is_some();
                    view.error = Some(e);
                });
            }
        }
    }

    /// Queue an out-of-band refresh for every tracked root in `scope`
    fn refresh_scope(&self, scope: &InvalidationScope) {
        for (root, tracker) in self.trackers().iter() {
            if scope.includes(root) {
                let request = RefreshRequest {
                    reason: PollReason::Event,
                    done: None,
                };
                if tracker.refresh_tx.try_send(request).is_err() {
                    tracing::trace!(root = %root, "Event refresh coalesced");
                }
            }
        }
    }

    /// Drop one subscriber; tears the tracker down with the last one
    fn release(&self, root: &NodeId, subscriber: u64, generation: u64) {
        let mut trackers = self.trackers_mut();
        let Some(tracker) = trackers.get_mut(root) else { return };
        if tracker.generation != generation {
            return;
        }
        tracker.subscribers.remove(&subscriber);
        if !tracker.subscribers.is_empty() {
            return;
        }
        if let Some(tracker) = trackers.remove(root) {
            tracker.shutdown();
            tracing::info!(root = %root, "Root untracked");
        }
    }
}

/// Scheduler target that polls through a weak engine handle
struct EnginePoller(Weak<EngineInner>);

#[async_trait]
impl PollTarget for EnginePoller {
    async fn poll(&self, root: &NodeId, reason: PollReason) {
        if let Some(inner) = self.0.upgrade() {
            inner.poll_root(root, reason).await;
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Entry point for consumers. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct NetworkSyncEngine {
    inner: Arc<EngineInner>,
}

impl NetworkSyncEngine {
    pub fn new(ledger: Arc<dyn LedgerQuery>, config: SyncConfig) -> Self {
        let fetcher = TreeFetcher::new(ledger, config.fetch.clone());
        let cache = TreeCache::new(config.cache.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                fetcher,
                cache,
                event_source: RwLock::new(None),
                trackers: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                visible: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                cache_subscription: RwLock::new(None),
            }),
        }
    }

    /// Use `source` as the live event channel for roots that ask for it
    pub fn with_event_source(self, source: Arc<dyn EventSource>) -> Self {
        *self
            .inner
            .event_source
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(source);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &TreeCache {
        &self.inner.cache
    }

    pub fn fetcher(&self) -> &TreeFetcher {
        &self.inner.fetcher
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start accepting subscriptions. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.cache.subscribe(
            |event| event.affects_tree(),
            move |_, scope| {
                if let Some(inner) = weak.upgrade() {
                    inner.refresh_scope(scope);
                }
            },
        );
        *self
            .inner
            .cache_subscription
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
        tracing::info!("Network sync engine started");
    }

    /// Stop every tracker; pending fetch results are discarded.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let subscription = self
            .inner
            .cache_subscription
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = subscription {
            self.inner.cache.unsubscribe(id);
        }
        let trackers: Vec<(NodeId, RootTracker)> = self.inner.trackers_mut().drain().collect();
        for (root, tracker) in &trackers {
            tracker.shutdown();
            tracing::debug!(root = %root, "Root tracking stopped");
        }
        tracing::info!(roots = trackers.len(), "Network sync engine stopped");
    }

    /// Observe `root`. The first subscriber of a root starts its scheduler
    /// (and live channel, if requested); later ones share it.
    pub fn subscribe(&self, root: impl Into<NodeId>, options: SubscribeConfig) -> SyncResult<NetworkSubscription> {
        if !self.is_running() {
            return Err(SyncError::NotRunning);
        }
        let root = root.into();
        let subscriber = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let fetch_defaults = &self.inner.config.fetch;
        let wanted = FetchShape {
            max_depth: options.max_depth.unwrap_or(fetch_defaults.max_depth),
            max_fanout: options.max_fanout.unwrap_or(fetch_defaults.max_fanout),
        };

        let mut trackers = self.inner.trackers_mut();
        let (generation, view_rx, state, refresh_tx) = match trackers.get_mut(&root) {
            Some(tracker) => {
                tracker.subscribers.insert(subscriber, options.clone());
                tracker.shape = FetchShape {
                    max_depth: tracker.shape.max_depth.max(wanted.max_depth),
                    max_fanout: tracker.shape.max_fanout.max(wanted.max_fanout),
                };
                tracker.state.lock().set_intervals(self.intervals_for(&tracker.subscribers));
                if options.use_live_fallback && tracker.listener.is_none() {
                    tracker.listener =
                        self.spawn_listener(&root, tracker.state.clone(), tracker.shutdown_tx.subscribe());
                }
                let _ = tracker.refresh_tx.try_send(RefreshRequest {
                    reason: PollReason::Subscribe,
                    done: None,
                });
                (
                    tracker.generation,
                    tracker.view_tx.subscribe(),
                    tracker.state.clone(),
                    tracker.refresh_tx.clone(),
                )
            }
            None => {
                let tracker = self.create_tracker(&root, subscriber, options.clone(), wanted);
                let handles = (
                    tracker.generation,
                    tracker.view_tx.subscribe(),
                    tracker.state.clone(),
                    tracker.refresh_tx.clone(),
                );
                trackers.insert(root.clone(), tracker);
                tracing::info!(root = %root, "Root tracked");
                handles
            }
        };
        drop(trackers);

        Ok(NetworkSubscription {
            root,
            id: subscriber,
            generation,
            projection: Projection {
                max_depth: wanted.max_depth,
                max_fanout: wanted.max_fanout,
                include_inactive: options.include_inactive,
            },
            view_rx,
            state,
            refresh_tx,
            engine: Arc::downgrade(&self.inner),
            released: false,
        })
    }

    fn create_tracker(
        &self,
        root: &NodeId,
        subscriber: u64,
        options: SubscribeConfig,
        shape: FetchShape,
    ) -> RootTracker {
        let mut subscribers = HashMap::new();
        subscribers.insert(subscriber, options);

        let mut polling = PollingState::new(self.intervals_for(&subscribers), Instant::now());
        if !self.inner.visible.load(Ordering::SeqCst) {
            polling.on_visibility(false, Instant::now());
        }
        let state = SharedPollingState::new(polling);

        let (view_tx, _) = watch::channel(RootView::default());
        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let target: Arc<dyn PollTarget> = Arc::new(EnginePoller(Arc::downgrade(&self.inner)));
        let scheduler = RootScheduler::new(root.clone(), state.clone(), target, refresh_rx);
        let scheduler = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

        let wants_stream = subscribers.values().any(|o| o.use_live_fallback);
        let listener = if wants_stream {
            self.spawn_listener(root, state.clone(), shutdown_rx)
        } else {
            None
        };

        RootTracker {
            generation: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            state,
            view_tx,
            refresh_tx,
            shutdown_tx,
            subscribers,
            shape,
            scheduler,
            listener,
        }
    }

    fn spawn_listener(
        &self,
        root: &NodeId,
        state: SharedPollingState,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if !self.inner.config.stream.enabled {
            return None;
        }
        let source = self
            .inner
            .event_source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let cache = self.inner.cache.clone();
        let sink: EventSink = Arc::new(move |event: LedgerEvent| {
            cache.handle_event(&event);
        });
        let listener = StreamListener::new(root.clone(), source, self.inner.config.stream.clone(), state, sink);
        Some(tokio::spawn(listener.run(shutdown_rx)))
    }

    /// Polling intervals for a root: the configured ones, rescaled to the
    /// fastest `base_interval` any subscriber asked for
    fn intervals_for(&self, subscribers: &HashMap<u64, SubscribeConfig>) -> PollingConfig {
        let polling = &self.inner.config.polling;
        match subscribers.values().filter_map(|o| o.base_interval).min() {
            Some(base) => polling.scaled_to(base),
            None => polling.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Activity signals
    // ------------------------------------------------------------------------

    /// User input anywhere in the hosting view
    pub fn record_activity(&self) {
        let now = Instant::now();
        for (root, tracker) in self.inner.trackers().iter() {
            if let Some((from, to)) = tracker.state.lock().on_activity(now) {
                tracing::info!(root = %root, from = from.as_str(), to = to.as_str(), "Polling state changed");
            }
        }
    }

    /// Hosting view shown or hidden
    pub fn set_visibility(&self, visible: bool) {
        self.inner.visible.store(visible, Ordering::SeqCst);
        let now = Instant::now();
        for (root, tracker) in self.inner.trackers().iter() {
            if let Some((from, to)) = tracker.state.lock().on_visibility(visible, now) {
                tracing::info!(root = %root, from = from.as_str(), to = to.as_str(), "Polling state changed");
            }
        }
    }

    /// Current scheduler state of a tracked root
    pub fn polling_state(&self, root: &NodeId) -> Option<SchedulerState> {
        self.inner.trackers().get(root).map(|t| {
            let mut state = t.state.lock();
            state.evaluate(Instant::now());
            state.state()
        })
    }

    pub fn tracked_roots(&self) -> Vec<NodeId> {
        let mut roots: Vec<NodeId> = self.inner.trackers().keys().cloned().collect();
        roots.sort();
        roots
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Register a consumer callback for ledger events matching `predicate`
    pub fn on_event<P, C>(&self, predicate: P, callback: C) -> SubscriptionId
    where
        P: Fn(&LedgerEvent) -> bool + Send + Sync + 'static,
        C: Fn(&LedgerEvent, &InvalidationScope) + Send + Sync + 'static,
    {
        self.inner.cache.subscribe(predicate, callback)
    }

    /// Push an event from the host (same path as the live channel)
    pub fn ingest_event(&self, event: LedgerEvent) -> Option<InvalidationScope> {
        self.inner.cache.handle_event(&event)
    }

    /// Sponsors above `id`, nearest first
    pub async fn upline(&self, id: &NodeId, max_levels: u32) -> Vec<UplineMember> {
        self.inner.fetcher.fetch_upline(id, max_levels).await
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let trackers = self.trackers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, tracker) in trackers.drain() {
            tracker.shutdown();
            tracker.scheduler.abort();
        }
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Consumer handle for one root. Dropping it unsubscribes.
pub struct NetworkSubscription {
    root: NodeId,
    id: u64,
    generation: u64,
    projection: Projection,
    view_rx: watch::Receiver<RootView>,
    state: SharedPollingState,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    engine: Weak<EngineInner>,
    released: bool,
}

impl std::fmt::Debug for NetworkSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSubscription")
            .field("root", &self.root)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl NetworkSubscription {
    pub fn root(&self) -> &NodeId {
        &self.root
    }

    /// Current view, projected through this subscription's options
    pub fn snapshot(&self) -> NetworkView {
        let view = self.view_rx.borrow().clone();
        let (polling_state, stream_degraded) = {
            let state = self.state.lock();
            (state.state(), state.stream_degraded)
        };
        let data = view.tree.as_ref().map(|t| t.root.project(&self.projection));
        NetworkView {
            stats: data.as_ref().map(aggregate),
            partial: data.as_ref().is_some_and(|d| d.is_partial()),
            data,
            loading: view.loading,
            error: view.error,
            last_fetch: view.last_fetch,
            stale: view.stale,
            stream_degraded,
            polling_state,
        }
    }

    /// Wait for the next published change
    pub async fn changed(&mut self) -> SyncResult<()> {
        self.view_rx
            .changed()
            .await
            .map_err(|_| SyncError::Stopped(self.root.clone()))
    }

    /// Poll now, bypassing the cache, and wait until the view is updated
    pub async fn refresh(&self) -> SyncResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.refresh_tx
            .send(RefreshRequest {
                reason: PollReason::Manual,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| SyncError::Stopped(self.root.clone()))?;
        done_rx.await.map_err(|_| SyncError::Stopped(self.root.clone()))
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.release(&self.root, self.id, self.generation);
        }
    }
}

impl Drop for NetworkSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use std::time::Duration;

    fn engine() -> (Arc<InMemoryLedger>, NetworkSyncEngine) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.add_registered("a", Some(&NodeId::new("root")), 2);
        let engine = NetworkSyncEngine::new(ledger.clone(), SyncConfig::default());
        (ledger, engine)
    }

    #[tokio::test]
    async fn test_subscribe_requires_start() {
        let (_ledger, engine) = engine();
        assert!(matches!(
            engine.subscribe("root", SubscribeConfig::default()),
            Err(SyncError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refcounted_tracking() {
        let (_ledger, engine) = engine();
        engine.start();
        let first = engine.subscribe("root", SubscribeConfig::default()).unwrap();
        let second = engine.subscribe("root", SubscribeConfig::default()).unwrap();
        assert_eq!(engine.tracked_roots(), vec![NodeId::new("root")]);

        first.unsubscribe();
        assert_eq!(engine.tracked_roots().len(), 1);
        drop(second);
        assert!(engine.tracked_roots().is_empty());
        assert_eq!(engine.polling_state(&NodeId::new("root")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_view_arrives() {
        let (_ledger, engine) = engine();
        engine.start();
        let mut sub = engine.subscribe("root", SubscribeConfig::default()).unwrap();
        while sub.snapshot().data.is_none() {
            tokio::time::timeout(Duration::from_secs(5), sub.changed())
                .await
                .unwrap()
                .unwrap();
        }
        let view = sub.snapshot();
        assert_eq!(view.stats.unwrap().total_nodes, 2);
        assert!(!view.stale);
        assert!(view.error.is_none());
        assert_eq!(view.polling_state, SchedulerState::Active);
        engine.stop();
    }
}
