//! Bounded Tree Fetcher
//!
//! Materializes a referral tree from the ledger, level by level:
//!
//! ```text
//!   frontier = [root]
//!   loop:
//!     1. probe child slots of every frontier parent   (parents run concurrently,
//!        slots of one parent run in order)
//!     2. read the attributes of every accepted child  (concurrently)
//!     3. attach children whose attributes resolved    → next frontier
//! ```
//!
//! Both concurrent phases go through `buffered(concurrency)`, so at most
//! `concurrency` ledger reads are in flight and results come back in slot
//! order, which keeps the output deterministic.
//!
//! Nodes live in an arena (`Vec<Slot>`) with parent indices. The cycle guard
//! walks the parent chain of the arena, so the visited set is per path:
//! the same member may appear under two different branches (diamond), but
//! never twice on one root-to-node path.
//!
//! The fetcher never touches the cache.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use genealogy_types::{BranchError, BranchErrorKind, LedgerUserInfo, NetworkNode, NodeAttributes, NodeId};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::FetchConfig;
use crate::error::{FetchError, LedgerError};
use crate::ledger::LedgerQuery;

/// Result of one tree fetch
#[derive(Debug, Clone)]
pub struct FetchedTree {
    pub root: NetworkNode,
    /// Some branch failed or was truncated by the cycle guard
    pub partial: bool,
    pub node_count: usize,
    /// When the fetch began; used for last-writer-wins in the cache
    pub started_at: Instant,
    /// Wall-clock completion time reported to consumers
    pub fetched_at_utc: DateTime<Utc>,
    pub max_depth: u32,
    pub max_fanout: usize,
}

impl FetchedTree {
    /// True when this tree was fetched at least as deep and wide as requested
    pub fn covers(&self, max_depth: u32, max_fanout: usize) -> bool {
        self.max_depth >= max_depth && self.max_fanout >= max_fanout
    }
}

/// One sponsor above a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UplineMember {
    /// 1 for the direct sponsor
    pub level: u32,
    pub id: NodeId,
    pub attributes: NodeAttributes,
}

/// Arena slot; children are arena indices
struct Slot {
    id: NodeId,
    depth: u32,
    parent: Option<usize>,
    attributes: NodeAttributes,
    children: Vec<usize>,
    errors: Vec<BranchError>,
}

/// Children accepted for one parent during slot probing
struct Probe {
    parent: usize,
    accepted: Vec<(u32, NodeId)>,
    errors: Vec<BranchError>,
}

#[derive(Clone)]
pub struct TreeFetcher {
    ledger: Arc<dyn LedgerQuery>,
    config: FetchConfig,
}

impl TreeFetcher {
    pub fn new(ledger: Arc<dyn LedgerQuery>, config: FetchConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch the tree under `root`, at most `max_depth` levels deep and
    /// `max_fanout` children per node.
    ///
    /// Only a failure to read the root itself is an error. Branch failures
    /// become `BranchError` annotations on the parent and set `partial`.
    pub async fn fetch_tree(
        &self,
        root: &NodeId,
        max_depth: u32,
        max_fanout: usize,
    ) -> Result<FetchedTree, FetchError> {
        let started_at = Instant::now();
        tracing::debug!(root = %root, max_depth, max_fanout, "Tree fetch started");

        let info = self
            .read(|| self.ledger.get_node_info(root))
            .await
            .map_err(|source| FetchError::RootUnavailable {
                root: root.clone(),
                source,
            })?;

        let mut arena = vec![Slot {
            id: root.clone(),
            depth: 0,
            parent: None,
            attributes: info.ingest(),
            children: Vec::new(),
            errors: Vec::new(),
        }];

        if !arena[0].attributes.registered {
            tracing::info!(root = %root, "Root is not registered, returning empty tree");
        }

        let mut frontier: Vec<usize> = vec![0];
        while !frontier.is_empty() {
            let expandable: Vec<usize> = frontier
                .into_iter()
                .filter(|&i| {
                    let slot = &arena[i];
                    slot.depth < max_depth && slot.attributes.registered && slot.attributes.direct_referrals > 0
                })
                .collect();
            if expandable.is_empty() || max_fanout == 0 {
                break;
            }

            // Phase 1: probe child slots
            let pending: Vec<_> = expandable
                .into_iter()
                .map(|parent| {
                    let slot = &arena[parent];
                    let path = ancestors(&arena, parent);
                    self.probe_children(parent, slot.id.clone(), slot.attributes.direct_referrals, path, max_fanout)
                })
                .collect();
            let probes: Vec<Probe> = stream::iter(pending)
                .buffered(self.config.concurrency)
                .collect()
                .await;

            let mut candidates: Vec<(usize, u32, NodeId)> = Vec::new();
            for probe in probes {
                arena[probe.parent].errors.extend(probe.errors);
                candidates.extend(probe.accepted.into_iter().map(|(index, id)| (probe.parent, index, id)));
            }

            // Phase 2: child attributes
            let pending: Vec<_> = candidates
                .into_iter()
                .map(|(parent, index, id)| self.resolve_child(parent, index, id))
                .collect();
            let resolved: Vec<_> = stream::iter(pending)
                .buffered(self.config.concurrency)
                .collect()
                .await;

            // Phase 3: attach
            let mut next = Vec::new();
            for (parent, index, id, result) in resolved {
                match result {
                    Ok(info) if !info.is_registered => {
                        tracing::trace!(parent = %arena[parent].id, child = %id, "Skipping unregistered child");
                    }
                    Ok(info) => {
                        let child = arena.len();
                        let depth = arena[parent].depth + 1;
                        arena.push(Slot {
                            id,
                            depth,
                            parent: Some(parent),
                            attributes: info.ingest(),
                            children: Vec::new(),
                            errors: Vec::new(),
                        });
                        arena[parent].children.push(child);
                        next.push(child);
                    }
                    Err(e) => {
                        tracing::warn!(
                            parent = %arena[parent].id,
                            child = %id,
                            index,
                            error = %e,
                            "Branch dropped: child attributes unavailable"
                        );
                        arena[parent]
                            .errors
                            .push(BranchError::new(e.branch_kind(), index, Some(id), e.to_string()));
                    }
                }
            }
            frontier = next;
        }

        let node_count = arena.len();
        let partial = arena.iter().any(|s| !s.errors.is_empty());
        let root_node = assemble(arena);

        tracing::info!(
            root = %root,
            node_count,
            partial,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Tree fetch complete"
        );

        Ok(FetchedTree {
            root: root_node,
            partial,
            node_count,
            started_at,
            fetched_at_utc: Utc::now(),
            max_depth,
            max_fanout,
        })
    }

    /// Probe the child slots of one parent until `max_fanout` children are
    /// accepted, the ledger reports an empty slot, or the slot budget is
    /// spent. Rejected slots (unreadable, cyclic, duplicate) use up budget,
    /// so a hostile `direct_referrals` count cannot drive unbounded reads.
    async fn probe_children(
        &self,
        parent: usize,
        parent_id: NodeId,
        slots: u32,
        path: HashSet<NodeId>,
        max_fanout: usize,
    ) -> Probe {
        let mut probe = Probe {
            parent,
            accepted: Vec::new(),
            errors: Vec::new(),
        };
        let budget = self.config.slot_budget(max_fanout, slots);
        let mut ended = false;

        for index in 0..budget {
            if probe.accepted.len() >= max_fanout {
                ended = true;
                break;
            }
            let child = match self.read(|| self.ledger.get_child_id(&parent_id, index)).await {
                Ok(Some(child)) if !child.is_zero_address() => child,
                Ok(_) => {
                    ended = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(parent = %parent_id, index, error = %e, "Child slot unreadable");
                    probe
                        .errors
                        .push(BranchError::new(e.branch_kind(), index, None, e.to_string()));
                    continue;
                }
            };

            if path.contains(&child) {
                tracing::warn!(parent = %parent_id, child = %child, index, "Cycle detected, branch truncated");
                probe.errors.push(BranchError::new(
                    BranchErrorKind::CycleDetected,
                    index,
                    Some(child.clone()),
                    format!("{child} is an ancestor of {parent_id}"),
                ));
                continue;
            }
            if probe.accepted.iter().any(|(_, id)| id == &child) {
                continue;
            }
            probe.accepted.push((index, child));
        }

        if !ended && budget < slots && probe.accepted.len() < max_fanout {
            tracing::warn!(
                parent = %parent_id,
                slots,
                probed = budget,
                accepted = probe.accepted.len(),
                "Slot budget spent on rejected children, remaining slots skipped"
            );
        }
        probe
    }

    async fn resolve_child(
        &self,
        parent: usize,
        index: u32,
        id: NodeId,
    ) -> (usize, u32, NodeId, Result<LedgerUserInfo, LedgerError>) {
        let result = self.read(|| self.ledger.get_node_info(&id)).await;
        (parent, index, id, result)
    }

    /// Walk sponsors upward from `id`, at most `max_levels` steps.
    ///
    /// Stops at the top of the hierarchy, on a repeated id, at an
    /// unregistered sponsor or on the first read failure; whatever was
    /// collected so far is returned.
    pub async fn fetch_upline(&self, id: &NodeId, max_levels: u32) -> Vec<UplineMember> {
        let mut chain = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::from([id.clone()]);
        let mut current = id.clone();

        for level in 1..=max_levels {
            let sponsor = match self.read(|| self.ledger.get_upline_id(&current)).await {
                Ok(Some(sponsor)) if !sponsor.is_zero_address() => sponsor,
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(member = %current, error = %e, "Upline walk stopped");
                    break;
                }
            };
            if !seen.insert(sponsor.clone()) {
                tracing::warn!(member = %current, sponsor = %sponsor, "Upline loops back, stopping");
                break;
            }
            let attributes = match self.read(|| self.ledger.get_node_info(&sponsor)).await {
                Ok(info) if info.is_registered => info.ingest(),
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(sponsor = %sponsor, error = %e, "Upline walk stopped");
                    break;
                }
            };
            chain.push(UplineMember {
                level,
                id: sponsor.clone(),
                attributes,
            });
            current = sponsor;
        }
        chain
    }

    /// One ledger read under the timeout and retry policy.
    ///
    /// Transient failures are retried with exponential backoff; a timeout
    /// fails the read immediately.
    async fn read<T, F, Fut>(&self, op: F) -> Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let timeout = self.config.read_timeout();
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => LedgerError::Timeout(timeout),
            };
            attempt += 1;
            if !err.is_retryable() || attempt >= attempts {
                return Err(err);
            }
            let delay: Duration = self.config.retry_delay(attempt - 1);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying ledger read");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Ids on the path from the root down to `index`, inclusive
fn ancestors(arena: &[Slot], mut index: usize) -> HashSet<NodeId> {
    let mut path = HashSet::new();
    loop {
        path.insert(arena[index].id.clone());
        match arena[index].parent {
            Some(parent) => index = parent,
            None => return path,
        }
    }
}

/// Turn the arena into an owned tree without recursion.
///
/// Children always sit at higher indices than their parent, so building
/// from the back means every child is complete before its parent.
fn assemble(arena: Vec<Slot>) -> NetworkNode {
    let mut built: Vec<Option<NetworkNode>> = Vec::with_capacity(arena.len());
    built.resize_with(arena.len(), || None);

    let mut slots: Vec<Option<Slot>> = arena.into_iter().map(Some).collect();
    for i in (0..slots.len()).rev() {
        let Some(slot) = slots[i].take() else { continue };
        let children = slot.children.iter().filter_map(|&c| built[c].take()).collect();
        built[i] = Some(NetworkNode {
            id: slot.id,
            depth: slot.depth,
            attributes: slot.attributes,
            children,
            errors: slot.errors,
        });
    }
    built
        .into_iter()
        .next()
        .flatten()
        .unwrap_or_else(|| NetworkNode::new("", 0, NodeAttributes::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;

    fn fetcher(ledger: Arc<InMemoryLedger>) -> TreeFetcher {
        let config = FetchConfig::default().with_retries(3, Duration::from_millis(10));
        TreeFetcher::new(ledger, config)
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[tokio::test]
    async fn test_children_attached_in_slot_order() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        for (i, name) in ["c0", "c1", "c2"].iter().enumerate() {
            ledger.add_registered(*name, Some(&id("root")), 10 + i as i64);
        }
        let tree = fetcher(ledger).fetch_tree(&id("root"), 3, 10).await.unwrap();
        let names: Vec<_> = tree.root.children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(names, vec!["c0", "c1", "c2"]);
        assert_eq!(tree.node_count, 4);
        assert!(!tree.partial);
    }

    #[tokio::test]
    async fn test_unregistered_root_is_empty_tree() {
        let ledger = Arc::new(InMemoryLedger::new());
        let tree = fetcher(ledger).fetch_tree(&id("nobody"), 3, 10).await.unwrap();
        assert_eq!(tree.node_count, 1);
        assert!(!tree.root.attributes.registered);
    }

    #[tokio::test]
    async fn test_unregistered_child_skipped() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.add_registered("ok", Some(&id("root")), 2);
        ledger.add_member("pending", Some(&id("root")), Default::default());
        let tree = fetcher(ledger).fetch_tree(&id("root"), 3, 10).await.unwrap();
        assert_eq!(tree.node_count, 2);
        assert!(!tree.partial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.add_registered("a", Some(&id("root")), 2);
        ledger.fail_node_info(&id("a"), Some(2));

        let tree = fetcher(ledger.clone()).fetch_tree(&id("root"), 3, 10).await.unwrap();
        assert!(!tree.partial);
        assert_eq!(tree.node_count, 2);
        assert_eq!(ledger.info_calls(&id("a")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_annotate_parent() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.add_registered("a", Some(&id("root")), 2);
        ledger.add_registered("b", Some(&id("root")), 3);
        ledger.fail_node_info(&id("a"), None);

        let tree = fetcher(ledger).fetch_tree(&id("root"), 3, 10).await.unwrap();
        assert!(tree.partial);
        assert_eq!(tree.root.children.len(), 1);
        let err = &tree.root.errors[0];
        assert_eq!(err.kind, BranchErrorKind::LedgerUnavailable);
        assert_eq!(err.index, 0);
        assert_eq!(err.child_id, Some(id("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_branch_times_out_without_blocking_siblings() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.add_registered("slow", Some(&id("root")), 2);
        ledger.add_registered("fast", Some(&id("root")), 3);
        ledger.set_latency(&id("slow"), Duration::from_secs(60));

        let config = FetchConfig::default().with_read_timeout(Duration::from_secs(1));
        let tree = TreeFetcher::new(ledger, config)
            .fetch_tree(&id("root"), 3, 10)
            .await
            .unwrap();
        assert_eq!(tree.root.children.len(), 1);
        assert_eq!(tree.root.children[0].id, id("fast"));
        assert_eq!(tree.root.errors[0].kind, BranchErrorKind::BranchTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_failure_is_fatal() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.fail_node_info(&id("root"), None);
        let err = fetcher(ledger).fetch_tree(&id("root"), 3, 10).await.unwrap_err();
        assert_eq!(err.root(), &id("root"));
    }

    #[tokio::test]
    async fn test_diamond_allowed_cycle_rejected() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.add_registered("a", Some(&id("root")), 2);
        ledger.add_registered("b", Some(&id("root")), 3);
        ledger.add_registered("shared", Some(&id("a")), 4);
        ledger.link_child(&id("b"), &id("shared"));
        ledger.link_child(&id("shared"), &id("root"));

        let tree = fetcher(ledger).fetch_tree(&id("root"), 10, 10).await.unwrap();
        let shared: Vec<_> = tree.root.iter().filter(|n| n.id == id("shared")).collect();
        assert_eq!(shared.len(), 2);
        assert!(shared
            .iter()
            .all(|n| n.errors.iter().any(|e| e.kind == BranchErrorKind::CycleDetected)));
        assert!(tree.partial);
    }

    #[tokio::test]
    async fn test_duplicate_siblings_dropped() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.add_registered("a", Some(&id("root")), 2);
        ledger.link_child(&id("root"), &id("a"));
        let tree = fetcher(ledger).fetch_tree(&id("root"), 2, 10).await.unwrap();
        assert_eq!(tree.root.children.len(), 1);
        assert!(!tree.partial);
    }

    #[tokio::test]
    async fn test_duplicate_slots_do_not_drive_unbounded_reads() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        ledger.add_registered("a", Some(&id("root")), 2);
        for _ in 0..500 {
            ledger.link_child(&id("root"), &id("a"));
        }
        let tree = fetcher(ledger.clone()).fetch_tree(&id("root"), 2, 10).await.unwrap();
        assert_eq!(tree.root.children.len(), 1);
        // 10 for the fan-out plus 10 spent on rejected slots
        assert_eq!(ledger.child_calls(&id("root")), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_slot_annotated_and_probing_continues() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("root", None, 1);
        for name in ["a", "b", "c"] {
            ledger.add_registered(name, Some(&id("root")), 2);
        }
        // every attempt on slot 0 fails, later slots read fine
        ledger.fail_child_lookup(&id("root"), Some(3));

        let tree = fetcher(ledger.clone()).fetch_tree(&id("root"), 2, 2).await.unwrap();
        assert!(tree.partial);
        let names: Vec<_> = tree.root.children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);

        assert_eq!(tree.root.errors.len(), 1);
        let err = &tree.root.errors[0];
        assert_eq!(err.kind, BranchErrorKind::LedgerUnavailable);
        assert_eq!(err.index, 0);
        assert_eq!(err.child_id, None);
        assert_eq!(ledger.child_calls(&id("root")), 5);
    }

    #[tokio::test]
    async fn test_upline_walk() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_registered("top", None, 1);
        ledger.add_registered("mid", Some(&id("top")), 2);
        ledger.add_registered("leaf", Some(&id("mid")), 3);

        let f = fetcher(ledger);
        let chain = f.fetch_upline(&id("leaf"), 10).await;
        let ids: Vec<_> = chain.iter().map(|m| (m.level, m.id.as_str())).collect();
        assert_eq!(ids, vec![(1, "mid"), (2, "top")]);

        assert_eq!(f.fetch_upline(&id("leaf"), 1).await.len(), 1);
    }
}
