//! Tidy-tree layout engine for referral network trees
//!
//! Computes absolute positions for every node of a tree. The growth axis
//! carries depth (depth × level spacing); the cross axis carries siblings.
//! Leaves sit at fixed sibling-spacing increments in left-to-right order and
//! every parent is centered over the span of its children.
//!
//! ```text
//! Vertical                      Horizontal
//!
//!         root                  root ─┬─ a ─┬─ a1
//!        /    \                       │     └─ a2
//!       a      b                      └─ b
//!      / \
//!    a1   a2
//! ```
//!
//! The traversal uses an explicit stack, so deep trees never recurse on the
//! native call stack. The input tree is only borrowed.

use genealogy_types::{NetworkNode, NodeAttributes, NodeId};
use serde::{Deserialize, Serialize};

/// Layout orientation determines flow direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Depth flows top-to-bottom, siblings spread left/right
    #[default]
    Vertical,
    /// Depth flows left-to-right, siblings spread top/bottom
    Horizontal,
}

impl Orientation {
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "HORIZONTAL" | "LTR" | "LEFT_TO_RIGHT" => Orientation::Horizontal,
            "VERTICAL" | "TTB" | "TOP_TO_BOTTOM" => Orientation::Vertical,
            _ => Orientation::Vertical, // Default to vertical (more natural for trees)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Horizontal => "HORIZONTAL",
            Orientation::Vertical => "VERTICAL",
        }
    }
}

/// Order in which a node's children are laid out along the cross axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildOrder {
    /// Child slot order as discovered on the ledger
    #[default]
    Discovery,
    /// Newest registration first
    NewestFirst,
}

/// Spacing model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spacing {
    /// Distance between adjacent leaves on the cross axis
    pub sibling: f32,
    /// Distance between depth levels on the growth axis
    pub level: f32,
    pub node_width: f32,
    pub node_height: f32,
}

impl Default for Spacing {
    fn default() -> Self {
        Self {
            sibling: 180.0,
            level: 120.0,
            node_width: 160.0,
            node_height: 60.0,
        }
    }
}

/// Layout configuration
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub orientation: Orientation,
    pub spacing: Spacing,
    pub child_order: ChildOrder,
}

impl LayoutConfig {
    pub fn new(orientation: Orientation, spacing: Spacing) -> Self {
        Self {
            orientation,
            spacing,
            child_order: ChildOrder::default(),
        }
    }

    pub fn with_child_order(mut self, child_order: ChildOrder) -> Self {
        self.child_order = child_order;
        self
    }
}

/// A positioned node. `(x, y)` is the center of a `width` × `height` box.
///
/// Owns a copy of the node's identity and attributes; it never points back
/// into the tree it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutNode {
    pub id: NodeId,
    pub depth: u32,
    /// Index of the parent in the layout array
    pub parent: Option<usize>,
    /// Indices of the children in the layout array
    pub children: Vec<usize>,
    pub attributes: NodeAttributes,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl LayoutNode {
    pub fn min(&self) -> [f32; 2] {
        [self.x - self.width / 2.0, self.y - self.height / 2.0]
    }

    pub fn max(&self) -> [f32; 2] {
        [self.x + self.width / 2.0, self.y + self.height / 2.0]
    }

    /// Inclusive box containment in layout space
    pub fn contains(&self, px: f32, py: f32) -> bool {
        let [min_x, min_y] = self.min();
        let [max_x, max_y] = self.max();
        px >= min_x && px <= max_x && py >= min_y && py <= max_y
    }
}

/// Axis-aligned extents of a whole layout
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutBounds {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl LayoutBounds {
    pub fn of(nodes: &[LayoutNode]) -> Option<Self> {
        let first = nodes.first()?;
        let [min_x, min_y] = first.min();
        let [max_x, max_y] = first.max();
        let init = LayoutBounds {
            min_x,
            min_y,
            max_x,
            max_y,
        };
        Some(nodes.iter().skip(1).fold(init, |b, n| {
            let [nx0, ny0] = n.min();
            let [nx1, ny1] = n.max();
            LayoutBounds {
                min_x: b.min_x.min(nx0),
                min_y: b.min_y.min(ny0),
                max_x: b.max_x.max(nx1),
                max_y: b.max_y.max(ny1),
            }
        }))
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> [f32; 2] {
        [(self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0]
    }
}

/// Lay out `tree` with the given orientation and spacing (discovery order).
pub fn layout(tree: &NetworkNode, orientation: Orientation, spacing: Spacing) -> Vec<LayoutNode> {
    LayoutEngine::new(LayoutConfig::new(orientation, spacing)).layout(tree)
}

/// Layout engine holding a configuration
#[derive(Debug, Clone, Default)]
pub struct LayoutEngine {
    config: LayoutConfig,
}

impl LayoutEngine {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Compute positions for every node, returned in pre-order (layout order).
    ///
    /// The root is placed at the origin of the cross axis and at growth 0.
    pub fn layout(&self, tree: &NetworkNode) -> Vec<LayoutNode> {
        let flat = self.flatten(tree);
        let spacing = self.config.spacing;

        // Leaves take consecutive slots in pre-order, which is left-to-right.
        let mut cross = vec![0.0f32; flat.len()];
        let mut next_leaf = 0u32;
        for (idx, entry) in flat.iter().enumerate() {
            if entry.children.is_empty() {
                cross[idx] = next_leaf as f32 * spacing.sibling;
                next_leaf += 1;
            }
        }

        // Reverse pre-order visits every child before its parent.
        for idx in (0..flat.len()).rev() {
            let children = &flat[idx].children;
            if let (Some(&first), Some(&last)) = (children.first(), children.last()) {
                cross[idx] = (cross[first] + cross[last]) / 2.0;
            }
        }

        let root_cross = cross.first().copied().unwrap_or(0.0);
        let root_depth = tree.depth;

        flat.into_iter()
            .enumerate()
            .map(|(idx, entry)| {
                let c = cross[idx] - root_cross;
                let g = (entry.node.depth.saturating_sub(root_depth)) as f32 * spacing.level;
                let (x, y) = match self.config.orientation {
                    Orientation::Vertical => (c, g),
                    Orientation::Horizontal => (g, c),
                };
                LayoutNode {
                    id: entry.node.id.clone(),
                    depth: entry.node.depth,
                    parent: entry.parent,
                    children: entry.children,
                    attributes: entry.node.attributes.clone(),
                    x,
                    y,
                    width: spacing.node_width,
                    height: spacing.node_height,
                }
            })
            .collect()
    }

    /// Pre-order flattening with parent/child indices
    fn flatten<'a>(&self, tree: &'a NetworkNode) -> Vec<FlatEntry<'a>> {
        let mut flat: Vec<FlatEntry<'a>> = Vec::with_capacity(tree.node_count());
        let mut stack: Vec<(&'a NetworkNode, Option<usize>)> = vec![(tree, None)];

        while let Some((node, parent)) = stack.pop() {
            let idx = flat.len();
            flat.push(FlatEntry {
                node,
                parent,
                children: Vec::new(),
            });
            if let Some(p) = parent {
                flat[p].children.push(idx);
            }
            let ordered = self.ordered_children(node);
            stack.extend(ordered.into_iter().rev().map(|c| (c, Some(idx))));
        }

        flat
    }

    fn ordered_children<'a>(&self, node: &'a NetworkNode) -> Vec<&'a NetworkNode> {
        let mut children: Vec<&NetworkNode> = node.children.iter().collect();
        if self.config.child_order == ChildOrder::NewestFirst {
            // stable sort keeps discovery order among equal timestamps
            children.sort_by(|a, b| b.attributes.joined_at.cmp(&a.attributes.joined_at));
        }
        children
    }
}

struct FlatEntry<'a> {
    node: &'a NetworkNode,
    parent: Option<usize>,
    children: Vec<usize>,
}
