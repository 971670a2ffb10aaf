//! Network tree nodes
//!
//! A `NetworkNode` owns its children directly. Trees handed out by the sync
//! engine are wrapped in `Arc` and never mutated after they are stored, so
//! every consumer reads the same immutable snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::NodeAttributes;

// ============================================================================
// NODE ID
// ============================================================================

/// Stable external identifier of a member (address-like string)
///
/// `0x` addresses are case-insensitive on the ledger, so they are lowercased
/// on construction; any other identifier is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
            NodeId(trimmed.to_ascii_lowercase())
        } else {
            NodeId(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ledger reports an empty child slot as the zero address
    pub fn is_zero_address(&self) -> bool {
        self.0.len() > 2 && self.0.starts_with("0x") && self.0[2..].bytes().all(|b| b == b'0')
    }

    /// Short display form: `0x1234...abcd`
    pub fn short(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() > 12 {
            let head: String = chars[..6].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}...{tail}")
        } else {
            self.0.clone()
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId::new(s)
    }
}

// ============================================================================
// BRANCH ERRORS
// ============================================================================

/// Why a branch of the tree is missing or truncated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchErrorKind {
    /// Ledger read kept failing after retries
    LedgerUnavailable,
    /// Ledger read exceeded its timeout
    BranchTimeout,
    /// Child points back at an ancestor on the same path
    CycleDetected,
}

impl fmt::Display for BranchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BranchErrorKind::LedgerUnavailable => "ledger unavailable",
            BranchErrorKind::BranchTimeout => "branch timeout",
            BranchErrorKind::CycleDetected => "cycle detected",
        };
        f.write_str(s)
    }
}

/// Annotation attached to the parent of a failed or truncated branch
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} at child slot {index}: {message}")]
pub struct BranchError {
    pub kind: BranchErrorKind,
    /// Child slot on the parent
    pub index: u32,
    /// Child identifier, when it was resolved before the failure
    pub child_id: Option<NodeId>,
    pub message: String,
}

impl BranchError {
    pub fn new(kind: BranchErrorKind, index: u32, child_id: Option<NodeId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            index,
            child_id,
            message: message.into(),
        }
    }
}

// ============================================================================
// PROJECTION
// ============================================================================

/// Per-consumer view over a shared tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub max_depth: u32,
    pub max_fanout: usize,
    pub include_inactive: bool,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            max_depth: u32::MAX,
            max_fanout: usize::MAX,
            include_inactive: true,
        }
    }
}

// ============================================================================
// NETWORK NODE
// ============================================================================

/// One participant in the referral hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub id: NodeId,
    /// 0 for the queried root, parent depth + 1 otherwise
    pub depth: u32,
    pub attributes: NodeAttributes,
    /// Discovery order (child slot index)
    #[serde(default)]
    pub children: Vec<NetworkNode>,
    /// Branches of this node that failed or were truncated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<BranchError>,
}

impl NetworkNode {
    pub fn new(id: impl Into<NodeId>, depth: u32, attributes: NodeAttributes) -> Self {
        Self {
            id: id.into(),
            depth,
            attributes,
            children: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Append a child, fixing its depth (and its subtree's) to follow this node
    pub fn with_child(mut self, mut child: NetworkNode) -> Self {
        child.set_depth(self.depth + 1);
        self.children.push(child);
        self
    }

    fn set_depth(&mut self, depth: u32) {
        let mut stack: Vec<(&mut NetworkNode, u32)> = vec![(self, depth)];
        while let Some((node, d)) = stack.pop() {
            node.depth = d;
            for child in node.children.iter_mut() {
                stack.push((child, d + 1));
            }
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Pre-order iterator (node before its children, children in order)
    pub fn iter(&self) -> PreOrder<'_> {
        PreOrder { stack: vec![self] }
    }

    pub fn node_count(&self) -> usize {
        self.iter().count()
    }

    pub fn find(&self, id: &NodeId) -> Option<&NetworkNode> {
        self.iter().find(|n| &n.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.find(id).is_some()
    }

    /// True when any branch anywhere in the tree carries an error annotation
    pub fn is_partial(&self) -> bool {
        self.iter().any(|n| !n.errors.is_empty())
    }

    /// Copy of the tree with every child list sorted newest registration first
    pub fn sorted_by_recency(&self) -> NetworkNode {
        let mut copy = self.clone();
        let mut stack: Vec<&mut NetworkNode> = vec![&mut copy];
        while let Some(node) = stack.pop() {
            node.children
                .sort_by(|a, b| b.attributes.joined_at.cmp(&a.attributes.joined_at));
            stack.extend(node.children.iter_mut());
        }
        copy
    }

    /// Copy of the tree restricted to a consumer's projection.
    ///
    /// The root is always kept. Inactive members are dropped together with
    /// their subtree when `include_inactive` is false.
    pub fn project(&self, projection: &Projection) -> NetworkNode {
        let mut out = NetworkNode {
            id: self.id.clone(),
            depth: self.depth,
            attributes: self.attributes.clone(),
            children: Vec::new(),
            errors: self.errors.clone(),
        };
        if self.depth >= projection.max_depth {
            return out;
        }
        out.children = self
            .children
            .iter()
            .filter(|c| projection.include_inactive || c.attributes.active)
            .take(projection.max_fanout)
            .map(|c| c.project(projection))
            .collect();
        out
    }
}

/// Pre-order traversal over a `NetworkNode` tree using an explicit stack
pub struct PreOrder<'a> {
    stack: Vec<&'a NetworkNode>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = &'a NetworkNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}
