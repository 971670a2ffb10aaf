//! Spatial projection of referral network trees
//!
//! Turns a `NetworkNode` tree into absolutely positioned boxes and maps
//! pointer input back onto them. Rendering itself is left to the caller:
//! any retained or immediate mode surface can draw `LayoutNode`s and feed
//! pointer events into the `InteractionResolver`.
//!
//! ```text
//! NetworkNode ──layout()──► Vec<LayoutNode> ──HitIndex──► resolve(pointer) ──► NodeId
//!                                  ▲                            ▲
//!                            LayoutConfig                 ViewTransform (pan/zoom)
//! ```

pub mod interaction;
pub mod layout;
pub mod spatial;
pub mod viewport;

pub use interaction::{resolve, InteractionEvent, InteractionResolver};
pub use layout::{layout, ChildOrder, LayoutBounds, LayoutConfig, LayoutEngine, LayoutNode, Orientation, Spacing};
pub use spatial::HitIndex;
pub use viewport::ViewTransform;
