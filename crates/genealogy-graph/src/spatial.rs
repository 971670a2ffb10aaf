//! Spatial index for fast pointer hit testing
//!
//! Uses an R-tree (via `rstar`) over the layout boxes for O(log n) lookups
//! instead of scanning every node, which matters once a network tree has
//! several hundred visible members.
//!
//! Overlapping boxes resolve to the shallowest node; equal depths resolve to
//! the node that comes first in layout order.

use genealogy_types::NodeId;
use rstar::{RTree, RTreeObject, AABB};

use crate::layout::LayoutNode;
use crate::viewport::ViewTransform;

/// Index entry for a laid out node
#[derive(Debug, Clone)]
struct HitEntry {
    /// Position in the layout array
    order: usize,
    depth: u32,
    id: NodeId,
    bounds: AABB<[f32; 2]>,
}

impl RTreeObject for HitEntry {
    type Envelope = AABB<[f32; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds
    }
}

/// R-tree over the boxes of one layout
#[derive(Clone)]
pub struct HitIndex {
    tree: RTree<HitEntry>,
    count: usize,
}

impl std::fmt::Debug for HitIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitIndex")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl Default for HitIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HitIndex {
    pub fn new() -> Self {
        Self {
            tree: RTree::new(),
            count: 0,
        }
    }

    /// Build the index from a layout
    pub fn from_layout(nodes: &[LayoutNode]) -> Self {
        let entries: Vec<HitEntry> = nodes
            .iter()
            .enumerate()
            .map(|(order, n)| HitEntry {
                order,
                depth: n.depth,
                id: n.id.clone(),
                bounds: AABB::from_corners(n.min(), n.max()),
            })
            .collect();
        let count = entries.len();
        tracing::trace!(count, "hit index rebuilt");
        Self {
            tree: RTree::bulk_load(entries),
            count,
        }
    }

    /// Node under a point given in layout coordinates
    pub fn hit_layout_point(&self, x: f32, y: f32) -> Option<&NodeId> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let probe = AABB::from_point([x, y]);
        self.tree
            .locate_in_envelope_intersecting(&probe)
            .min_by_key(|e| (e.depth, e.order))
            .map(|e| &e.id)
    }

    /// Node under a screen-space pointer viewed through `transform`
    pub fn resolve(&self, pointer_x: f32, pointer_y: f32, transform: &ViewTransform) -> Option<&NodeId> {
        let [x, y] = transform.to_layout(pointer_x, pointer_y)?;
        self.hit_layout_point(x, y)
    }

    /// All nodes whose boxes intersect a layout-space rectangle (drag selection)
    pub fn query_rect(&self, min: [f32; 2], max: [f32; 2]) -> Vec<&NodeId> {
        let bounds = AABB::from_corners(min, max);
        let mut hits: Vec<&HitEntry> = self.tree.locate_in_envelope_intersecting(&bounds).collect();
        hits.sort_by_key(|e| e.order);
        hits.into_iter().map(|e| &e.id).collect()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{layout, Orientation, Spacing};
    use genealogy_types::{NetworkNode, NodeAttributes};

    fn boxed(id: &str, depth: u32, x: f32, y: f32, w: f32, h: f32) -> LayoutNode {
        LayoutNode {
            id: NodeId::new(id),
            depth,
            parent: None,
            children: Vec::new(),
            attributes: NodeAttributes::default(),
            x,
            y,
            width: w,
            height: h,
        }
    }

    #[test]
    fn test_empty_index() {
        let index = HitIndex::new();
        assert!(index.is_empty());
        assert!(index.hit_layout_point(0.0, 0.0).is_none());
    }

    #[test]
    fn test_hit_and_miss() {
        let nodes = vec![boxed("a", 0, 0.0, 0.0, 10.0, 10.0), boxed("b", 1, 50.0, 0.0, 10.0, 10.0)];
        let index = HitIndex::from_layout(&nodes);
        assert_eq!(index.len(), 2);
        assert_eq!(index.hit_layout_point(52.0, 4.0).map(|id| id.as_str()), Some("b"));
        // box edge is inclusive
        assert_eq!(index.hit_layout_point(5.0, 5.0).map(|id| id.as_str()), Some("a"));
        assert!(index.hit_layout_point(500.0, 500.0).is_none());
    }

    #[test]
    fn test_overlap_prefers_shallow_then_first() {
        let nodes = vec![
            boxed("deep", 2, 0.0, 0.0, 20.0, 20.0),
            boxed("shallow", 1, 5.0, 5.0, 20.0, 20.0),
            boxed("shallow_later", 1, 5.0, 5.0, 20.0, 20.0),
        ];
        let index = HitIndex::from_layout(&nodes);
        assert_eq!(index.hit_layout_point(4.0, 4.0).map(|id| id.as_str()), Some("shallow"));
    }

    #[test]
    fn test_resolve_through_transform() {
        let nodes = vec![boxed("a", 0, 100.0, 100.0, 10.0, 10.0)];
        let index = HitIndex::from_layout(&nodes);
        let t = ViewTransform::new(-100.0, -100.0, 2.0);
        // layout (100,100) -> screen (100,100)
        assert_eq!(index.resolve(100.0, 100.0, &t).map(|id| id.as_str()), Some("a"));
        assert!(index.resolve(100.0, 100.0, &ViewTransform::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_query_rect_in_layout_order() {
        let tree = NetworkNode::new("r", 0, NodeAttributes::default())
            .with_child(NetworkNode::new("a", 0, NodeAttributes::default()))
            .with_child(NetworkNode::new("b", 0, NodeAttributes::default()));
        let nodes = layout(&tree, Orientation::Vertical, Spacing::default());
        let index = HitIndex::from_layout(&nodes);
        let ids: Vec<_> = index
            .query_rect([-1000.0, -1000.0], [1000.0, 1000.0])
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["r", "a", "b"]);
    }
}
