//! In-memory ledger adapter
//!
//! Backs the CLI (loaded from a JSON snapshot) and the test suite. Every
//! read can be slowed down or made to fail per member, and the adapter
//! counts calls plus the highest number of reads in flight at once, which is
//! how single-flight and worker-pool bounds are checked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use genealogy_types::{LedgerUserInfo, NodeId};
use serde::{Deserialize, Serialize};

use super::LedgerQuery;
use crate::error::LedgerError;

/// One member as stored in a ledger snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: NodeId,
    #[serde(default)]
    pub sponsor: Option<NodeId>,
    /// Child slots in ledger order
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub info: LedgerUserInfo,
}

/// Serializable ledger contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub members: Vec<MemberRecord>,
}

#[derive(Default)]
struct LedgerState {
    members: HashMap<NodeId, MemberRecord>,
    /// Insertion order, for stable snapshots
    order: Vec<NodeId>,
    /// Remaining injected failures; `None` fails forever
    info_failures: HashMap<NodeId, Option<u32>>,
    child_failures: HashMap<NodeId, Option<u32>>,
    latency: HashMap<NodeId, Duration>,
    default_latency: Duration,
    info_calls: HashMap<NodeId, usize>,
    child_calls: HashMap<NodeId, usize>,
}

impl LedgerState {
    fn latency_for(&self, id: &NodeId) -> Duration {
        self.latency.get(id).copied().unwrap_or(self.default_latency)
    }

    fn member_mut(&mut self, id: &NodeId) -> &mut MemberRecord {
        if !self.members.contains_key(id) {
            self.order.push(id.clone());
        }
        self.members.entry(id.clone()).or_insert_with(|| MemberRecord {
            id: id.clone(),
            sponsor: None,
            children: Vec::new(),
            info: LedgerUserInfo::default(),
        })
    }
}

/// Consume one injected failure for `id`, if any is armed
fn take_failure(failures: &mut HashMap<NodeId, Option<u32>>, id: &NodeId) -> bool {
    match failures.get_mut(id) {
        None => false,
        Some(None) => true,
        Some(Some(remaining)) => {
            *remaining -= 1;
            if *remaining == 0 {
                failures.remove(id);
            }
            true
        }
    }
}

/// Ledger held entirely in memory
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a read finishes or is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let ledger = Self::new();
        {
            let mut state = ledger.state();
            for record in snapshot.members {
                state.order.push(record.id.clone());
                state.members.insert(record.id.clone(), record);
            }
        }
        ledger
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state();
        LedgerSnapshot {
            members: state
                .order
                .iter()
                .filter_map(|id| state.members.get(id).cloned())
                .collect(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    // ------------------------------------------------------------------------
    // Population
    // ------------------------------------------------------------------------

    /// Insert or replace a member. With a sponsor, the member is appended to
    /// the sponsor's child slots and the sponsor's direct referral count
    /// follows.
    pub fn add_member(&self, id: impl Into<NodeId>, sponsor: Option<&NodeId>, info: LedgerUserInfo) {
        let id = id.into();
        let mut state = self.state();
        let record = state.member_mut(&id);
        record.info = info;
        record.sponsor = sponsor.cloned();
        if let Some(sponsor) = sponsor {
            let parent = state.member_mut(sponsor);
            if !parent.children.contains(&id) {
                parent.children.push(id);
            }
            parent.info.direct_referrals = parent.children.len() as u32;
        }
    }

    /// Registered member on the entry package, joined at `registration_time`
    pub fn add_registered(&self, id: impl Into<NodeId>, sponsor: Option<&NodeId>, registration_time: i64) {
        self.add_member(
            id,
            sponsor,
            LedgerUserInfo {
                is_registered: true,
                package_level: 1,
                registration_time,
                ..Default::default()
            },
        );
    }

    /// Append `child` to `parent`'s slots without touching its sponsor.
    /// This is how malformed ledgers (cycles, shared children) are modelled.
    pub fn link_child(&self, parent: &NodeId, child: &NodeId) {
        let mut state = self.state();
        let record = state.member_mut(parent);
        record.children.push(child.clone());
        record.info.direct_referrals = record.children.len() as u32;
    }

    pub fn update_info(&self, id: &NodeId, update: impl FnOnce(&mut LedgerUserInfo)) {
        let mut state = self.state();
        update(&mut state.member_mut(id).info);
    }

    pub fn len(&self) -> usize {
        self.state().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Fail the next `times` info reads of `id` (`None`: every read)
    pub fn fail_node_info(&self, id: &NodeId, times: Option<u32>) {
        if times != Some(0) {
            self.state().info_failures.insert(id.clone(), times);
        }
    }

    /// Fail the next `times` child-slot reads on `id` (`None`: every read)
    pub fn fail_child_lookup(&self, id: &NodeId, times: Option<u32>) {
        if times != Some(0) {
            self.state().child_failures.insert(id.clone(), times);
        }
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.info_failures.clear();
        state.child_failures.clear();
    }

    /// Delay every read about `id`
    pub fn set_latency(&self, id: &NodeId, latency: Duration) {
        self.state().latency.insert(id.clone(), latency);
    }

    /// Delay every read without a per-member latency
    pub fn set_default_latency(&self, latency: Duration) {
        self.state().default_latency = latency;
    }

    // ------------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------------

    pub fn info_calls(&self, id: &NodeId) -> usize {
        self.state().info_calls.get(id).copied().unwrap_or(0)
    }

    pub fn total_info_calls(&self) -> usize {
        self.state().info_calls.values().sum()
    }

    pub fn child_calls(&self, id: &NodeId) -> usize {
        self.state().child_calls.get(id).copied().unwrap_or(0)
    }

    /// Highest number of reads observed in flight at the same time
    pub fn max_concurrent_reads(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        let mut state = self.state();
        state.info_calls.clear();
        state.child_calls.clear();
        self.max_in_flight.store(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerQuery for InMemoryLedger {
    async fn get_node_info(&self, id: &NodeId) -> Result<LedgerUserInfo, LedgerError> {
        let _in_flight = self.enter();
        let (latency, fail) = {
            let mut state = self.state();
            *state.info_calls.entry(id.clone()).or_default() += 1;
            let fail = take_failure(&mut state.info_failures, id);
            (state.latency_for(id), fail)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(LedgerError::Unavailable(format!("injected failure reading {id}")));
        }
        Ok(self
            .state()
            .members
            .get(id)
            .map(|m| m.info.clone())
            .unwrap_or_default())
    }

    async fn get_child_id(&self, id: &NodeId, index: u32) -> Result<Option<NodeId>, LedgerError> {
        let _in_flight = self.enter();
        let (latency, fail) = {
            let mut state = self.state();
            *state.child_calls.entry(id.clone()).or_default() += 1;
            let fail = take_failure(&mut state.child_failures, id);
            (state.latency_for(id), fail)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(LedgerError::Unavailable(format!(
                "injected failure reading child {index} of {id}"
            )));
        }
        Ok(self
            .state()
            .members
            .get(id)
            .and_then(|m| m.children.get(index as usize).cloned()))
    }

    async fn get_upline_id(&self, id: &NodeId) -> Result<Option<NodeId>, LedgerError> {
        Ok(self.state().members.get(id).and_then(|m| m.sponsor.clone()))
    }
}
