//! Pointer interaction resolution
//!
//! `resolve` is the plain contract: pointer + transform + layout → node id.
//! `InteractionResolver` keeps hover/selection state on top of a `HitIndex`
//! and reports changes as `InteractionEvent`s for the presentation layer.

use genealogy_types::NodeId;
use serde::{Deserialize, Serialize};

use crate::layout::LayoutNode;
use crate::spatial::HitIndex;
use crate::viewport::ViewTransform;

/// Resolve a screen-space pointer to the node under it.
///
/// The pointer is mapped into layout space through the inverse of
/// `transform`. Overlapping boxes resolve to the smallest depth, then to the
/// earliest node in layout order. Returns `None` when nothing is hit or the
/// transform cannot be inverted.
pub fn resolve(
    pointer_x: f32,
    pointer_y: f32,
    transform: &ViewTransform,
    nodes: &[LayoutNode],
) -> Option<NodeId> {
    let [x, y] = transform.to_layout(pointer_x, pointer_y)?;
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.contains(x, y))
        .min_by_key(|(order, n)| (n.depth, *order))
        .map(|(_, n)| n.id.clone())
}

/// Change reported to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionEvent {
    Hovered { id: NodeId },
    HoverCleared,
    Selected { id: NodeId },
    SelectionCleared,
}

/// Hover and click state over one layout
#[derive(Debug, Default)]
pub struct InteractionResolver {
    index: HitIndex,
    transform: ViewTransform,
    hovered: Option<NodeId>,
    selected: Option<NodeId>,
}

impl InteractionResolver {
    pub fn new(nodes: &[LayoutNode], transform: ViewTransform) -> Self {
        Self {
            index: HitIndex::from_layout(nodes),
            transform,
            hovered: None,
            selected: None,
        }
    }

    /// Swap in a new layout. Hover/selection survive only if the node still exists.
    pub fn set_layout(&mut self, nodes: &[LayoutNode]) {
        self.index = HitIndex::from_layout(nodes);
        let still_there = |id: &NodeId| nodes.iter().any(|n| &n.id == id);
        if self.hovered.as_ref().is_some_and(|id| !still_there(id)) {
            self.hovered = None;
        }
        if self.selected.as_ref().is_some_and(|id| !still_there(id)) {
            self.selected = None;
        }
    }

    pub fn set_transform(&mut self, transform: ViewTransform) {
        self.transform = transform;
    }

    pub fn transform(&self) -> &ViewTransform {
        &self.transform
    }

    pub fn hovered(&self) -> Option<&NodeId> {
        self.hovered.as_ref()
    }

    pub fn selected(&self) -> Option<&NodeId> {
        self.selected.as_ref()
    }

    /// Pointer moved; emits only when the hovered node changes
    pub fn pointer_moved(&mut self, x: f32, y: f32) -> Option<InteractionEvent> {
        let hit = self.index.resolve(x, y, &self.transform).cloned();
        if hit == self.hovered {
            return None;
        }
        self.hovered = hit.clone();
        Some(match hit {
            Some(id) => InteractionEvent::Hovered { id },
            None => InteractionEvent::HoverCleared,
        })
    }

    /// Pointer clicked; clicking empty space clears an existing selection
    pub fn clicked(&mut self, x: f32, y: f32) -> Option<InteractionEvent> {
        match self.index.resolve(x, y, &self.transform).cloned() {
            Some(id) => {
                self.selected = Some(id.clone());
                Some(InteractionEvent::Selected { id })
            }
            None => self.selected.take().map(|_| InteractionEvent::SelectionCleared),
        }
    }
}
