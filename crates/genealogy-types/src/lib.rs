//! Shared types for the referral network synchronization workspace
//!
//! Every crate that touches a network tree (sync engine, layout, CLI) uses
//! the types defined here, so the shape of a node is decided once.
//!
//! ## Ingestion
//!
//! ```text
//! LedgerUserInfo (raw, base units, integer codes)
//!        │  ingest()  - defaults resolved exactly once
//!        ▼
//! NodeAttributes (typed tiers, Decimal amounts, derived status)
//!        │
//!        ▼
//! NetworkNode { id, depth, attributes, children, errors }
//! ```

pub mod attributes;
pub mod node;

pub use attributes::{LedgerUserInfo, MemberStatus, NodeAttributes, PackageTier, Rank};
pub use node::{BranchError, BranchErrorKind, NetworkNode, NodeId, Projection};
