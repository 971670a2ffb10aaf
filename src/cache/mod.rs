//! Cache & Invalidation Layer
//!
//! Trees are cached per root with a TTL and handed out as `Arc`s, so a
//! stored tree is never mutated. Three rules keep the cache coherent:
//!
//! 1. **Expiry**: `get` only returns entries younger than their TTL.
//!    `get_stale` returns expired entries too, flagged `stale`.
//! 2. **Last writer wins by fetch start**: a put whose fetch started before
//!    the cached entry's fetch is rejected, whatever the completion order.
//!    A put whose fetch started before the last invalidation of that root is
//!    rejected as well.
//! 3. **Single flight**: concurrent refreshes of one root share one fetch.
//!
//! The entry map is behind a plain mutex that is never held across an
//! await; the fetch itself runs outside of it.

mod single_flight;

pub use single_flight::SingleFlight;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use genealogy_types::NodeId;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::events::LedgerEvent;
use crate::fetcher::FetchedTree;

/// How many event ids are remembered for de-duplication
const SEEN_EVENTS: usize = 512;

/// Per-root invalidation marks kept before they fold into one global mark
const INVALIDATION_MARKS: usize = 1024;

pub type EventPredicate = Arc<dyn Fn(&LedgerEvent) -> bool + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&LedgerEvent, &InvalidationScope) + Send + Sync>;

/// Handle of an event subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Roots an event invalidated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    Roots(Vec<NodeId>),
    /// The event could not be narrowed down; every root was invalidated
    All,
}

impl InvalidationScope {
    pub fn includes(&self, root: &NodeId) -> bool {
        match self {
            InvalidationScope::All => true,
            InvalidationScope::Roots(roots) => roots.contains(root),
        }
    }
}

/// One cached tree
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub root: NodeId,
    pub tree: Arc<FetchedTree>,
    /// Start of the fetch that produced `tree`
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

/// Result of `get_stale`
#[derive(Debug, Clone)]
pub struct CachedTree {
    pub tree: Arc<FetchedTree>,
    pub stale: bool,
    pub age: Duration,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<NodeId, CacheEntry>,
    /// Last explicit invalidation per root, dropped once a newer tree lands
    invalidated_at: HashMap<NodeId, Instant>,
    /// Last `invalidate_all`
    all_invalidated_at: Option<Instant>,
    seen_events: HashSet<Uuid>,
    seen_order: std::collections::VecDeque<Uuid>,
}

impl CacheState {
    fn invalidated_since(&self, root: &NodeId, fetched_at: Instant) -> bool {
        let root_mark = self.invalidated_at.get(root).is_some_and(|at| fetched_at < *at);
        let all_mark = self.all_invalidated_at.is_some_and(|at| fetched_at < at);
        root_mark || all_mark
    }

    /// Trees of `root` fetched before `at` must not be stored.
    ///
    /// Past `INVALIDATION_MARKS` roots the marks fold into the global mark,
    /// which only ever rejects more.
    fn mark_invalidated(&mut self, root: &NodeId, at: Instant) {
        self.invalidated_at.insert(root.clone(), at);
        if self.invalidated_at.len() > INVALIDATION_MARKS {
            let newest = self.invalidated_at.drain().map(|(_, at)| at).max();
            self.all_invalidated_at = self.all_invalidated_at.max(newest);
            tracing::debug!("Invalidation marks folded into a global mark");
        }
    }

    /// Remember an event id; false if it was already seen
    fn mark_seen(&mut self, id: Uuid) -> bool {
        if !self.seen_events.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        while self.seen_order.len() > SEEN_EVENTS {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_events.remove(&old);
            }
        }
        true
    }
}

struct Subscriber {
    id: SubscriptionId,
    predicate: EventPredicate,
    on_event: EventCallback,
}

struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    flights: SingleFlight<NodeId, Result<Arc<FetchedTree>, FetchError>>,
}

/// Tree cache; clones share the same storage
#[derive(Clone)]
pub struct TreeCache {
    inner: Arc<CacheInner>,
}

impl TreeCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState::default()),
                subscribers: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                flights: SingleFlight::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Tree for `root` if cached and not expired. A miss is not an error.
    pub fn get(&self, root: &NodeId) -> Option<Arc<FetchedTree>> {
        let now = Instant::now();
        self.state()
            .entries
            .get(root)
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| entry.tree.clone())
    }

    /// Tree for `root` even when expired, flagged stale
    pub fn get_stale(&self, root: &NodeId) -> Option<CachedTree> {
        let now = Instant::now();
        self.state().entries.get(root).map(|entry| CachedTree {
            tree: entry.tree.clone(),
            stale: !entry.is_valid_at(now),
            age: now.saturating_duration_since(entry.fetched_at),
        })
    }

    /// Store with the configured TTL; see `put_with_ttl`
    pub fn put(&self, root: &NodeId, tree: Arc<FetchedTree>) -> bool {
        self.put_with_ttl(root, tree, self.inner.config.ttl())
    }

    /// Store `tree` unless it is older than what is cached or than the last
    /// invalidation of `root`. Returns whether the tree was stored.
    pub fn put_with_ttl(&self, root: &NodeId, tree: Arc<FetchedTree>, ttl: Duration) -> bool {
        let fetched_at = tree.started_at;
        let mut state = self.state();

        if state.invalidated_since(root, fetched_at) {
            tracing::debug!(root = %root, "Discarding tree fetched before invalidation");
            return false;
        }
        if let Some(existing) = state.entries.get(root) {
            if existing.fetched_at > fetched_at {
                tracing::debug!(root = %root, "Discarding tree older than cached entry");
                return false;
            }
        }

        state.entries.insert(
            root.clone(),
            CacheEntry {
                root: root.clone(),
                tree,
                fetched_at,
                ttl,
            },
        );
        // the entry now rejects anything older on its own
        state.invalidated_at.remove(root);

        let max = self.inner.config.max_entries.max(1);
        while state.entries.len() > max {
            let Some((oldest, fetched_at)) = state
                .entries
                .values()
                .min_by_key(|entry| entry.fetched_at)
                .map(|entry| (entry.root.clone(), entry.fetched_at))
            else {
                break;
            };
            state.entries.remove(&oldest);
            state.mark_invalidated(&oldest, fetched_at);
            tracing::debug!(root = %oldest, "Evicted oldest cache entry");
        }
        true
    }

    pub fn invalidate(&self, root: &NodeId) {
        let mut state = self.state();
        state.entries.remove(root);
        state.mark_invalidated(root, Instant::now());
        tracing::debug!(root = %root, "Cache entry invalidated");
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.invalidated_at.clear();
        state.all_invalidated_at = Some(Instant::now());
        tracing::debug!("All cache entries invalidated");
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots: Vec<NodeId> = self.state().entries.keys().cloned().collect();
        roots.sort();
        roots
    }

    // ========================================================================
    // Fetch coordination
    // ========================================================================

    /// Cached tree if fresh, otherwise a (shared) fetch
    pub async fn get_or_fetch<F, Fut>(&self, root: &NodeId, fetch: F) -> Result<Arc<FetchedTree>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedTree, FetchError>> + Send + 'static,
    {
        if let Some(tree) = self.get(root) {
            return Ok(tree);
        }
        self.refresh_with(root, fetch).await
    }

    /// Fetch now, joining a fetch of the same root that is already running.
    /// The result is stored before any waiter sees it.
    pub async fn refresh_with<F, Fut>(&self, root: &NodeId, fetch: F) -> Result<Arc<FetchedTree>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedTree, FetchError>> + Send + 'static,
    {
        let cache = self.clone();
        let key = root.clone();
        self.inner
            .flights
            .run(root.clone(), move || {
                let work = fetch();
                async move {
                    let tree = Arc::new(work.await?);
                    cache.put(&key, tree.clone());
                    Ok(tree)
                }
            })
            .await
    }

    /// True while a fetch of `root` is running
    pub fn is_fetching(&self, root: &NodeId) -> bool {
        self.inner.flights.is_in_flight(root)
    }

    // ========================================================================
    // Event subscriptions
    // ========================================================================

    /// Call `on_event` for every event matching `predicate`, after the roots
    /// it may affect were invalidated.
    pub fn subscribe<P, C>(&self, predicate: P, on_event: C) -> SubscriptionId
    where
        P: Fn(&LedgerEvent) -> bool + Send + Sync + 'static,
        C: Fn(&LedgerEvent, &InvalidationScope) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                predicate: Arc::new(predicate),
                on_event: Arc::new(on_event),
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Apply a ledger event.
    ///
    /// Returns `None` when no subscriber matched or the event was already
    /// handled (same id delivered over another connection). Otherwise the
    /// affected roots are invalidated and the matching callbacks run.
    ///
    /// Affected roots are chosen conservatively: the cached trees containing
    /// the hinted member, or every root when there is no hint or no cached
    /// tree contains it (a new registrant is not in any tree yet).
    pub fn handle_event(&self, event: &LedgerEvent) -> Option<InvalidationScope> {
        let matching: Vec<EventCallback> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| (s.predicate)(event))
            .map(|s| s.on_event.clone())
            .collect();
        if matching.is_empty() {
            return None;
        }

        let scope = {
            let mut state = self.state();
            if !state.mark_seen(event.id) {
                return None;
            }
            let roots: Vec<NodeId> = match &event.affected_root_hint {
                Some(hint) => {
                    let mut roots: Vec<NodeId> = state
                        .entries
                        .values()
                        .filter(|entry| entry.tree.root.contains(hint))
                        .map(|entry| entry.root.clone())
                        .collect();
                    roots.sort();
                    roots
                }
                None => Vec::new(),
            };
            if roots.is_empty() {
                InvalidationScope::All
            } else {
                InvalidationScope::Roots(roots)
            }
        };

        match &scope {
            InvalidationScope::All => self.invalidate_all(),
            InvalidationScope::Roots(roots) => roots.iter().for_each(|root| self.invalidate(root)),
        }
        tracing::debug!(kind = event.kind.as_str(), ?scope, "Ledger event applied");

        for on_event in matching {
            on_event(event, &scope);
        }
        Some(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LedgerEventKind;
    use chrono::Utc;
    use genealogy_types::{NetworkNode, NodeAttributes};
    use std::sync::atomic::AtomicUsize;

    fn tree(root: &str, members: &[&str]) -> Arc<FetchedTree> {
        let mut node = NetworkNode::new(root, 0, NodeAttributes::default());
        for m in members {
            node = node.with_child(NetworkNode::new(*m, 0, NodeAttributes::default()));
        }
        Arc::new(FetchedTree {
            node_count: node.node_count(),
            root: node,
            partial: false,
            started_at: Instant::now(),
            fetched_at_utc: Utc::now(),
            max_depth: 5,
            max_fanout: 10,
        })
    }

    fn cache(ttl_secs: u64) -> TreeCache {
        TreeCache::new(CacheConfig::default().with_ttl(Duration::from_secs(ttl_secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_respects_ttl() {
        let cache = cache(5);
        let root = NodeId::new("root");
        assert!(cache.put(&root, tree("root", &[])));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get(&root).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&root).is_none());
        let stale = cache.get_stale(&root).unwrap();
        assert!(stale.stale);
        assert_eq!(stale.age, Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_fetch_does_not_overwrite() {
        let cache = cache(10);
        let root = NodeId::new("root");
        let older = tree("root", &["old"]);
        tokio::time::advance(Duration::from_secs(1)).await;
        let newer = tree("root", &["new"]);

        assert!(cache.put(&root, newer));
        assert!(!cache.put(&root, older));
        assert!(cache.get(&root).unwrap().root.contains(&NodeId::new("new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_started_before_invalidation_is_discarded() {
        let cache = cache(10);
        let root = NodeId::new("root");
        let in_flight = tree("root", &[]);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.invalidate(&root);
        assert!(!cache.put(&root, in_flight));
        assert!(cache.put(&root, tree("root", &[])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_marks_stay_bounded() {
        let cache = cache(10);
        let root = NodeId::new("root");
        cache.invalidate(&root);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.put(&root, tree("root", &[])));
        assert!(cache.state().invalidated_at.is_empty());

        let before_burst = tree("r0", &[]);
        tokio::time::advance(Duration::from_millis(1)).await;
        for i in 0..INVALIDATION_MARKS + 10 {
            cache.invalidate(&NodeId::new(format!("r{i}")));
        }
        assert!(cache.state().invalidated_at.len() <= INVALIDATION_MARKS);
        // a fetch that started before the burst is still rejected
        assert!(!cache.put(&NodeId::new("r0"), before_burst));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.put(&NodeId::new("r0"), tree("r0", &[])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_keeps_size_bounded() {
        let cache = TreeCache::new(CacheConfig::default().with_max_entries(2));
        for name in ["a", "b", "c"] {
            cache.put(&NodeId::new(name), tree(name, &[]));
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(cache.roots(), vec![NodeId::new("b"), NodeId::new("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_scope_narrowed_by_hint() {
        let cache = cache(10);
        cache.put(&NodeId::new("r1"), tree("r1", &["x"]));
        cache.put(&NodeId::new("r2"), tree("r2", &["y"]));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        cache.subscribe(
            |e| e.affects_tree(),
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        let event = LedgerEvent::new(LedgerEventKind::BonusDistributed, Some(NodeId::new("x")));
        assert_eq!(
            cache.handle_event(&event),
            Some(InvalidationScope::Roots(vec![NodeId::new("r1")]))
        );
        assert!(cache.get(&NodeId::new("r1")).is_none());
        assert!(cache.get(&NodeId::new("r2")).is_some());

        // same event over a second connection
        assert_eq!(cache.handle_event(&event), None);

        // unknown member: everything goes
        let stranger = LedgerEvent::new(LedgerEventKind::UserRegistered, Some(NodeId::new("new")));
        assert_eq!(cache.handle_event(&stranger), Some(InvalidationScope::All));
        assert!(cache.is_empty());

        // price ticks match nobody
        assert_eq!(cache.handle_event(&LedgerEvent::new(LedgerEventKind::PriceUpdate, None)), None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_stores_before_returning() {
        let cache = cache(10);
        let root = NodeId::new("root");
        let fetched = cache
            .refresh_with(&root, || async { Ok(FetchedTree::clone(&tree("root", &["a"]))) })
            .await
            .unwrap();
        assert_eq!(fetched.node_count, 2);
        assert!(cache.get(&root).is_some());
        assert!(!cache.is_fetching(&root));
    }
}
