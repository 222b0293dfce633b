//! Camera pan constraints.
//!
//! Every pan must keep the camera inside the map bounds. On top of that a player's
//! committed token may not be pushed more than `leash_distance` past the edge of the
//! visible area it is travelling toward. Distances are signed: negative while the token
//! is still on screen, positive once it has crossed the edge.

use crate::coords::MapBounds;
use crate::mode::Role;
use crate::model::{Character, Point, Session, Size};

/// Map units moved by one arrow-button pan.
pub const PAN_STEP: f64 = 100.0;
/// How many steps of overscroll the bounds allow past the far edge of the map.
pub const EDGE_SLACK: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
}

impl Direction {
    /// Camera offset change that shows more of the map in this direction.
    pub fn camera_delta(self, step: f64) -> Point {
        match self {
            Direction::Right => Point::new(-step, 0.0),
            Direction::Left => Point::new(step, 0.0),
            Direction::Down => Point::new(0.0, -step),
            Direction::Up => Point::new(0.0, step),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PanOutcome {
    Moved(Point),
    OutOfBounds,
    Leashed { character_id: String },
}

impl PanOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, PanOutcome::Moved(_))
    }
}

/// Signed distance past the edge a token at screen coordinate `screen` moves toward when
/// the camera moves by `delta` on that axis.
fn overshoot(screen: f64, extent: f64, delta: f64) -> f64 {
    if delta < 0.0 {
        -screen
    } else {
        screen - extent
    }
}

/// Whether moving the camera from `current` to `proposed` keeps `character`'s committed
/// position within `leash_distance` of the visible area. `visible` is in map units.
///
/// Panning back toward a token that is already out of leash is always allowed: the
/// token then travels away from the edge it crossed.
pub fn is_within_leash(
    character: &Character,
    current: Point,
    proposed: Point,
    visible: Size,
    leash_distance: f64,
) -> bool {
    let after = character.prev_position + proposed;
    let delta = proposed - current;

    let axes = [
        (after.x, visible.width, delta.x),
        (after.y, visible.height, delta.y),
    ];
    axes.into_iter()
        .filter(|&(_, _, d)| d != 0.0)
        .all(|(screen, extent, d)| overshoot(screen, extent, d) <= leash_distance)
}

/// Decides a camera move for `user_id`. Map bounds bind everyone; the leash binds players.
pub fn evaluate_pan(
    session: &Session,
    user_id: &str,
    current: Point,
    proposed: Point,
    visible: Size,
    bounds: MapBounds,
) -> PanOutcome {
    if !proposed.is_finite() || !bounds.contains(proposed) {
        return PanOutcome::OutOfBounds;
    }
    match Role::of(session, user_id) {
        Role::DungeonMaster | Role::Spectator => PanOutcome::Moved(proposed),
        Role::Player => {
            let leashed = session.controlled_by(user_id).filter(|c| !c.is_dead).find(|c| {
                !is_within_leash(c, current, proposed, visible, session.leash_distance)
            });
            match leashed {
                Some(c) => PanOutcome::Leashed {
                    character_id: c.id.clone(),
                },
                None => PanOutcome::Moved(proposed),
            }
        }
    }
}
