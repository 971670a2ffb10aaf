//! Pan/zoom view transform
//!
//! Maps layout coordinates to screen coordinates and back:
//!
//! ```text
//! screen = layout * zoom + pan
//! layout = (screen - pan) / zoom
//! ```

use serde::{Deserialize, Serialize};

use crate::layout::LayoutBounds;

/// Minimum zoom level
pub const MIN_ZOOM: f32 = 0.1;

/// Maximum zoom level
pub const MAX_ZOOM: f32 = 5.0;

/// Pan offset (screen pixels) and zoom scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewTransform {
    pub pan_x: f32,
    pub pan_y: f32,
    /// 1.0 = 100%
    pub zoom: f32,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl ViewTransform {
    pub fn identity() -> Self {
        Self {
            pan_x: 0.0,
            pan_y: 0.0,
            zoom: 1.0,
        }
    }

    pub fn new(pan_x: f32, pan_y: f32, zoom: f32) -> Self {
        Self { pan_x, pan_y, zoom }
    }

    /// A transform is invertible only with a finite, positive zoom
    pub fn is_invertible(&self) -> bool {
        self.zoom.is_finite() && self.zoom > 0.0 && self.pan_x.is_finite() && self.pan_y.is_finite()
    }

    pub fn to_screen(&self, x: f32, y: f32) -> [f32; 2] {
        [x * self.zoom + self.pan_x, y * self.zoom + self.pan_y]
    }

    /// Screen point to layout point, `None` when the transform is degenerate
    pub fn to_layout(&self, sx: f32, sy: f32) -> Option<[f32; 2]> {
        if !self.is_invertible() {
            return None;
        }
        Some([(sx - self.pan_x) / self.zoom, (sy - self.pan_y) / self.zoom])
    }

    /// Pan by a screen-space delta
    pub fn pan_by(&mut self, dx: f32, dy: f32) {
        self.pan_x += dx;
        self.pan_y += dy;
    }

    /// Zoom by `factor` keeping the layout point under `(sx, sy)` fixed
    pub fn zoom_at(&mut self, factor: f32, sx: f32, sy: f32) {
        let Some([lx, ly]) = self.to_layout(sx, sy) else {
            return;
        };
        let new_zoom = (self.zoom * factor).clamp(MIN_ZOOM, MAX_ZOOM);
        if (new_zoom - self.zoom).abs() <= 0.0001 {
            return;
        }
        self.zoom = new_zoom;
        self.pan_x = sx - lx * new_zoom;
        self.pan_y = sy - ly * new_zoom;
    }

    /// Transform that fits `bounds` into a `viewport_w` × `viewport_h` screen,
    /// leaving `padding` pixels on each side, centered.
    pub fn fit(bounds: &LayoutBounds, viewport_w: f32, viewport_h: f32, padding: f32) -> Self {
        let avail_w = (viewport_w - 2.0 * padding).max(1.0);
        let avail_h = (viewport_h - 2.0 * padding).max(1.0);
        let zoom_x = if bounds.width() > 0.0 {
            avail_w / bounds.width()
        } else {
            MAX_ZOOM
        };
        let zoom_y = if bounds.height() > 0.0 {
            avail_h / bounds.height()
        } else {
            MAX_ZOOM
        };
        let zoom = zoom_x.min(zoom_y).clamp(MIN_ZOOM, MAX_ZOOM);
        let [cx, cy] = bounds.center();
        Self {
            pan_x: viewport_w / 2.0 - cx * zoom,
            pan_y: viewport_h / 2.0 - cy * zoom,
            zoom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trip() {
        let t = ViewTransform::identity();
        assert_eq!(t.to_layout(12.0, -3.0), Some([12.0, -3.0]));
        assert_eq!(t.to_screen(12.0, -3.0), [12.0, -3.0]);
    }

    #[test]
    fn test_inverse_of_pan_zoom() {
        let t = ViewTransform::new(100.0, 50.0, 2.0);
        assert_eq!(t.to_screen(10.0, 10.0), [120.0, 70.0]);
        assert_eq!(t.to_layout(120.0, 70.0), Some([10.0, 10.0]));
    }

    #[test]
    fn test_degenerate_zoom_is_not_invertible() {
        assert_eq!(ViewTransform::new(0.0, 0.0, 0.0).to_layout(1.0, 1.0), None);
        assert_eq!(ViewTransform::new(0.0, 0.0, f32::NAN).to_layout(1.0, 1.0), None);
    }

    #[test]
    fn test_zoom_at_keeps_cursor_anchor() {
        let mut t = ViewTransform::new(10.0, 20.0, 1.0);
        let before = t.to_layout(200.0, 100.0).unwrap();
        t.zoom_at(2.0, 200.0, 100.0);
        assert_eq!(t.zoom, 2.0);
        let after = t.to_layout(200.0, 100.0).unwrap();
        assert!((before[0] - after[0]).abs() < 1e-4);
        assert!((before[1] - after[1]).abs() < 1e-4);

        t.zoom_at(100.0, 0.0, 0.0);
        assert_eq!(t.zoom, MAX_ZOOM);
    }

    #[test]
    fn test_fit_centers_bounds() {
        let bounds = LayoutBounds {
            min_x: -100.0,
            min_y: 0.0,
            max_x: 100.0,
            max_y: 100.0,
        };
        let t = ViewTransform::fit(&bounds, 400.0, 400.0, 0.0);
        assert_eq!(t.zoom, 2.0);
        assert_eq!(t.to_screen(0.0, 50.0), [200.0, 200.0]);
    }
}
