//! Domain events pushed by the ledger.

use chrono::{DateTime, Utc};
use genealogy_types::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type as emitted by the ledger's push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    /// New member registered under a sponsor
    UserRegistered,
    /// Referral or pool bonus paid out
    BonusDistributed,
    Withdrawal,
    BalanceUpdate,
    /// Token price tick; carries no member data
    PriceUpdate,
}

impl LedgerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventKind::UserRegistered => "user_registered",
            LedgerEventKind::BonusDistributed => "bonus_distributed",
            LedgerEventKind::Withdrawal => "withdrawal",
            LedgerEventKind::BalanceUpdate => "balance_update",
            LedgerEventKind::PriceUpdate => "price_update",
        }
    }
}

/// Typed domain event `{type, affectedRootHint}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Same event delivered over several connections keeps its id
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: LedgerEventKind,
    /// Member the event is about, when the ledger says so
    #[serde(default)]
    pub affected_root_hint: Option<NodeId>,
    #[serde(default = "Utc::now")]
    pub emitted_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn new(kind: LedgerEventKind, affected_root_hint: Option<NodeId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            affected_root_hint,
            emitted_at: Utc::now(),
        }
    }

    /// Whether this event can change member data in a cached tree
    pub fn affects_tree(&self) -> bool {
        !matches!(self.kind, LedgerEventKind::PriceUpdate)
    }
}
