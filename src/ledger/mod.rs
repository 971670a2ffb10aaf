//! Ledger Query Adapter
//!
//! The narrow read interface the engine needs from the external ledger.
//! Implementations are assumed to be slow, rate limited and occasionally
//! failing; callers wrap every read in a timeout and retry policy.

mod memory;

pub use memory::{InMemoryLedger, LedgerSnapshot, MemberRecord};

use async_trait::async_trait;
use genealogy_types::{LedgerUserInfo, NodeId};

use crate::error::LedgerError;

#[async_trait]
pub trait LedgerQuery: Send + Sync {
    /// Raw member record. Unknown ids return an unregistered record.
    async fn get_node_info(&self, id: &NodeId) -> Result<LedgerUserInfo, LedgerError>;

    /// Identifier of the child in slot `index`, `None` past the last child.
    async fn get_child_id(&self, id: &NodeId, index: u32) -> Result<Option<NodeId>, LedgerError>;

    /// Sponsor of `id`, `None` at the top of the hierarchy.
    async fn get_upline_id(&self, _id: &NodeId) -> Result<Option<NodeId>, LedgerError> {
        Ok(None)
    }
}
