//! Pointer, map and screen space.
//!
//! Map space is the coordinate system of persisted token positions. Screen space is
//! relative to the top-left corner of the rendered map box:
//!
//! ```text
//! screen = (map + camera) * coefficient      (per axis)
//! map    = (pointer - origin) / coefficient - camera
//! ```

use crate::model::{Point, Size};

/// Zoom at which one map unit is one screen unit.
pub const REFERENCE_ZOOM: f64 = 6.0;
pub const ZOOM_STEP: f64 = 1.0;
pub const MIN_ZOOM: f64 = 1.0;
pub const MAX_ZOOM: f64 = 20.0;

/// Per-axis scale between map and screen space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub x: f64,
    pub y: f64,
}

impl Scale {
    pub const IDENTITY: Scale = Scale { x: 1.0, y: 1.0 };

    /// Replaces an unusable axis (zero, negative or non-finite) with 1.
    pub fn guarded(self) -> Scale {
        fn axis(v: f64) -> f64 {
            if v.is_finite() && v > f64::EPSILON {
                v
            } else {
                1.0
            }
        }
        Scale {
            x: axis(self.x),
            y: axis(self.y),
        }
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Scale for `zoom` when the map image of size `full` is drawn into a box of size `view`.
///
/// The box keeps fixed on-screen dimensions while the image keeps its own aspect ratio,
/// so the vertical axis is corrected by the ratio of the two aspects.
pub fn zoom_coefficient(zoom: f64, view: Size, full: Size) -> Scale {
    let base = zoom / REFERENCE_ZOOM;
    let correction = if view.is_degenerate() || full.is_degenerate() {
        1.0
    } else {
        (full.height / full.width) / (view.height / view.width)
    };
    Scale {
        x: base,
        y: base * correction,
    }
    .guarded()
}

pub fn to_screen(map: Point, camera: Point, scale: Scale) -> Point {
    let s = scale.guarded();
    Point::new((map.x + camera.x) * s.x, (map.y + camera.y) * s.y)
}

/// Inverse of [`to_screen`] for a pointer given in pointer space.
pub fn to_map_coordinates(pointer: Point, map_origin: Point, camera: Point, scale: Scale) -> Point {
    let s = scale.guarded();
    let local = pointer - map_origin;
    Point::new(local.x / s.x - camera.x, local.y / s.y - camera.y)
}

/// Side length of a token on screen.
pub fn token_size(sprite_size_percent: f64, view: Size) -> f64 {
    if !sprite_size_percent.is_finite() || sprite_size_percent <= 0.0 {
        return 0.0;
    }
    view.width * sprite_size_percent / 100.0
}

/// True when the token box intersects the rendered box.
pub fn is_token_visible(position: Point, camera: Point, scale: Scale, view: Size, token: f64) -> bool {
    let s = to_screen(position, camera, scale);
    s.x + token > 0.0 && s.x < view.width && s.y + token > 0.0 && s.y < view.height
}

pub fn zoom_in(zoom: f64) -> f64 {
    (zoom + ZOOM_STEP).clamp(MIN_ZOOM, MAX_ZOOM)
}

pub fn zoom_out(zoom: f64) -> f64 {
    (zoom - ZOOM_STEP).clamp(MIN_ZOOM, MAX_ZOOM)
}

/// Allowed camera offsets. The camera only ever moves the map up/left, so `max` is the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapBounds {
    pub min: Point,
    pub max: Point,
}

impl MapBounds {
    /// `[-(full - step * slack), 0]` per axis, never above zero.
    pub fn for_map(full: Size, step: f64, slack: f64) -> Self {
        let edge = |len: f64| (-(len - step * slack)).min(0.0);
        Self {
            min: Point::new(edge(full.width), edge(full.height)),
            max: Point::ORIGIN,
        }
    }

    pub fn contains(&self, camera: Point) -> bool {
        (self.min.x..=self.max.x).contains(&camera.x) && (self.min.y..=self.max.y).contains(&camera.y)
    }

    pub fn clamp(&self, camera: Point) -> Point {
        Point::new(
            camera.x.clamp(self.min.x, self.max.x),
            camera.y.clamp(self.min.y, self.max.y),
        )
    }
}

/// Camera offset that puts `position` in the middle of the box, kept inside `bounds`.
pub fn center_on(position: Point, view: Size, bounds: MapBounds) -> Point {
    bounds.clamp(Point::new(
        -position.x + view.width / 2.0,
        -position.y + view.height / 2.0,
    ))
}
