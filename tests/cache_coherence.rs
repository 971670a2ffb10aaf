//! Integration tests for the tree cache in front of a real fetcher
//!
//! These tests verify that:
//! 1. Entries expire after their TTL
//! 2. Concurrent requests for one root share a single fetch
//! 3. A fetch that started before an invalidation never lands in the cache

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use genealogy_sync::{
    CacheConfig, FetchConfig, FetchError, FetchedTree, InMemoryLedger, NodeId, TreeCache, TreeFetcher,
};

fn setup(latency: Duration) -> (Arc<InMemoryLedger>, TreeFetcher, TreeCache) {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_registered("root", None, 1);
    ledger.add_registered("a", Some(&NodeId::new("root")), 2);
    ledger.set_default_latency(latency);
    let fetcher = TreeFetcher::new(ledger.clone(), FetchConfig::default());
    let cache = TreeCache::new(CacheConfig::default().with_ttl(Duration::from_secs(5)));
    (ledger, fetcher, cache)
}

fn fetch_root(
    fetcher: &TreeFetcher,
) -> impl FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<FetchedTree, FetchError>> + Send>> {
    let fetcher = fetcher.clone();
    move || Box::pin(async move { fetcher.fetch_tree(&NodeId::new("root"), 5, 10).await })
}

#[tokio::test(start_paused = true)]
async fn test_ttl_hit_then_miss() {
    let (_ledger, fetcher, cache) = setup(Duration::ZERO);
    let root = NodeId::new("root");

    let tree = Arc::new(fetcher.fetch_tree(&root, 5, 10).await.unwrap());
    assert!(cache.put(&root, tree));

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(cache.get(&root).is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.get(&root).is_none());
    assert!(cache.get_stale(&root).unwrap().stale);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_fetch() {
    let (ledger, fetcher, cache) = setup(Duration::from_millis(200));
    let root = NodeId::new("root");

    let (first, second) = tokio::join!(
        cache.get_or_fetch(&root, fetch_root(&fetcher)),
        cache.get_or_fetch(&root, fetch_root(&fetcher)),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(ledger.info_calls(&root), 1);
    assert_eq!(first.node_count, 2);

    // a fresh entry is served without touching the ledger
    cache.get_or_fetch(&root, fetch_root(&fetcher)).await.unwrap();
    assert_eq!(ledger.info_calls(&root), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_racing_invalidation_is_not_stored() {
    let (_ledger, fetcher, cache) = setup(Duration::from_millis(200));
    let root = NodeId::new("root");

    let racing = {
        let cache = cache.clone();
        let fetch = fetch_root(&fetcher);
        let root = root.clone();
        tokio::spawn(async move { cache.refresh_with(&root, fetch).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.invalidate(&root);

    let fetched = racing.await.unwrap().unwrap();
    assert_eq!(fetched.node_count, 2);
    assert!(cache.get(&root).is_none());

    // the next fetch starts after the invalidation and is kept
    cache.refresh_with(&root, fetch_root(&fetcher)).await.unwrap();
    assert!(cache.get(&root).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_keeps_previous_entry() {
    let (ledger, fetcher, cache) = setup(Duration::ZERO);
    let root = NodeId::new("root");
    cache.refresh_with(&root, fetch_root(&fetcher)).await.unwrap();

    ledger.fail_node_info(&root, None);
    let err = cache.refresh_with(&root, fetch_root(&fetcher)).await.unwrap_err();
    assert_eq!(err.root(), &root);
    assert_eq!(cache.get(&root).unwrap().node_count, 2);
}
