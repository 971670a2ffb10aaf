//! Integration tests for bounded tree fetching
//!
//! These tests verify that:
//! 1. Depth and fan-out limits prune the tree without raising errors
//! 2. No member repeats on a root-to-leaf path, whatever the ledger links
//! 3. Concurrent ledger reads never exceed the configured pool size

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use genealogy_sync::{FetchConfig, InMemoryLedger, NetworkNode, NodeId, TreeFetcher};

fn id(name: &str) -> NodeId {
    NodeId::new(name)
}

fn child_ids(node: &NetworkNode) -> Vec<&str> {
    node.children.iter().map(|c| c.id.as_str()).collect()
}

/// Walk the tree with an explicit stack and check every bound on the way
fn assert_within_bounds(tree: &NetworkNode, max_depth: u32, max_fanout: usize) -> Result<(), TestCaseError> {
    let mut stack: Vec<(&NetworkNode, Vec<&NodeId>)> = vec![(tree, Vec::new())];
    while let Some((node, mut path)) = stack.pop() {
        prop_assert!(node.depth <= max_depth, "{} at depth {}", node.id, node.depth);
        prop_assert_eq!(node.depth as usize, path.len());
        prop_assert!(node.children.len() <= max_fanout, "{} has {} children", node.id, node.children.len());
        prop_assert!(!path.contains(&&node.id), "{} repeats on its own path", node.id);
        path.push(&node.id);
        for child in &node.children {
            stack.push((child, path.clone()));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_depth_limit_prunes_without_error() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_registered("root", None, 1);
    ledger.add_registered("a", Some(&id("root")), 2);
    ledger.add_registered("b", Some(&id("root")), 3);
    ledger.add_registered("a1", Some(&id("a")), 4);

    let fetcher = TreeFetcher::new(ledger.clone(), FetchConfig::default());
    let fetched = fetcher.fetch_tree(&id("root"), 1, 10).await.unwrap();

    assert_eq!(child_ids(&fetched.root), vec!["a", "b"]);
    assert!(fetched.root.children.iter().all(|c| c.children.is_empty()));
    assert!(!fetched.partial);
    assert_eq!(fetched.node_count, 3);
    // the pruned level is never asked for
    assert_eq!(ledger.info_calls(&id("a1")), 0);
}

#[tokio::test]
async fn test_fanout_limit_keeps_first_slots() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_registered("root", None, 1);
    for i in 0..12 {
        ledger.add_registered(format!("c{i}"), Some(&id("root")), 10 + i);
    }

    let fetcher = TreeFetcher::new(ledger.clone(), FetchConfig::default());
    let fetched = fetcher.fetch_tree(&id("root"), 5, 10).await.unwrap();

    let expected: Vec<String> = (0..10).map(|i| format!("c{i}")).collect();
    assert_eq!(child_ids(&fetched.root), expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(!fetched.partial);
    assert!(fetched.root.errors.is_empty());
    assert_eq!(ledger.child_calls(&id("root")), 10);
}

#[tokio::test(start_paused = true)]
async fn test_reads_stay_within_pool_size() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_registered("root", None, 1);
    for i in 0..20 {
        ledger.add_registered(format!("c{i}"), Some(&id("root")), 10 + i);
    }
    ledger.set_default_latency(Duration::from_millis(50));

    let config = FetchConfig::default().with_concurrency(4);
    let fetcher = TreeFetcher::new(ledger.clone(), config);
    let fetched = fetcher.fetch_tree(&id("root"), 2, 25).await.unwrap();

    assert_eq!(fetched.root.children.len(), 20);
    let peak = ledger.max_concurrent_reads();
    assert!(peak <= 4, "peak concurrency {peak}");
    assert!(peak > 1, "siblings were read one at a time");
}

#[tokio::test]
async fn test_cyclic_ledger_terminates() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_registered("root", None, 1);
    ledger.add_registered("a", Some(&id("root")), 2);
    ledger.add_registered("b", Some(&id("a")), 3);
    ledger.link_child(&id("b"), &id("root"));
    ledger.link_child(&id("b"), &id("b"));

    let fetcher = TreeFetcher::new(ledger, FetchConfig::default());
    let fetched = fetcher.fetch_tree(&id("root"), 10, 10).await.unwrap();

    assert_eq!(fetched.node_count, 3);
    assert!(fetched.partial);
    let b = fetched.root.find(&id("b")).unwrap();
    assert_eq!(b.errors.len(), 2);
}

/// Random ledger: a sponsor tree plus a few arbitrary extra links, which may
/// close cycles, self-loops or shared children.
fn ledger_strategy() -> impl Strategy<Value = (Vec<usize>, Vec<(usize, usize)>)> {
    (
        prop::collection::vec(0usize..1_000, 0..30),
        prop::collection::vec((0usize..1_000, 0usize..1_000), 0..6),
    )
}

fn build_ledger(sponsors: &[usize], links: &[(usize, usize)]) -> InMemoryLedger {
    let ledger = InMemoryLedger::new();
    ledger.add_registered("m0", None, 1);
    for (i, pick) in sponsors.iter().enumerate() {
        let member = i + 1;
        let sponsor = NodeId::new(format!("m{}", pick % member));
        ledger.add_registered(format!("m{member}"), Some(&sponsor), member as i64 + 1);
    }
    let n = sponsors.len() + 1;
    for (from, to) in links {
        ledger.link_child(&NodeId::new(format!("m{}", from % n)), &NodeId::new(format!("m{}", to % n)));
    }
    ledger
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_fetch_respects_bounds(
        (sponsors, links) in ledger_strategy(),
        max_depth in 0u32..5,
        max_fanout in 0usize..5,
    ) {
        let ledger = Arc::new(build_ledger(&sponsors, &links));
        let fetcher = TreeFetcher::new(ledger, FetchConfig::default());
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let fetched = runtime
            .block_on(fetcher.fetch_tree(&NodeId::new("m0"), max_depth, max_fanout))
            .unwrap();

        assert_within_bounds(&fetched.root, max_depth, max_fanout)?;
        prop_assert_eq!(fetched.node_count, fetched.root.node_count());

        let ids: HashSet<&NodeId> = fetched.root.iter().map(|n| &n.id).collect();
        prop_assert!(ids.len() <= sponsors.len() + 1);
    }
}
