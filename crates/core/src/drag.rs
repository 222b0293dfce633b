//! Per-token pointer state machine.
//!
//! `pointer_down` on a token runs the permission guards and captures where on the token
//! it was grabbed. `pointer_move` writes optimistic positions into the store, one axis
//! at a time, and only while the token box stays inside the rendered map on that axis.
//! `pointer_up` is document-level: it releases every dragged token and hands the final
//! position to the [`SyncScheduler`].
//!
//! Only the dungeon master gets the setup bypass. Anyone else in
//! [`Mode::Setup`](crate::mode::Mode::Setup) is held to the play guards and their drops
//! are not committed.

use std::collections::HashMap;

use tracing::debug;

use crate::coords::{self, Scale};
use crate::mode::Viewer;
use crate::model::{Point, Session, Viewport};
use crate::store::{CameraView, SessionStore};
use crate::sync::SyncScheduler;
use crate::turns;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DragState {
    #[default]
    Idle,
    Dragging {
        /// Pointer position relative to the token, in map units.
        grab_offset: Point,
        /// Token position when it was picked up.
        start: Point,
        /// Picked up by the DM in setup mode; the drop commits the placement.
        placing: bool,
    },
}

/// Why a board action was refused. Returned, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnknownToken,
    Dead,
    Paused,
    NotYourTurn,
    NotYourToken,
    NotDungeonMaster,
    /// A turn action with an empty queue.
    NoCharacters,
    /// A token is still being dragged.
    TokenHeld,
}

/// Screen geometry for one pointer event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub viewport: Viewport,
    pub camera: Point,
    pub scale: Scale,
    /// Token side length on screen.
    pub token: f64,
}

impl Frame {
    pub fn new(viewport: Viewport, view: CameraView, sprite_size_percent: f64) -> Self {
        Self {
            viewport,
            camera: view.offset,
            scale: coords::zoom_coefficient(view.zoom, viewport.size, viewport.full),
            token: coords::token_size(sprite_size_percent, viewport.size),
        }
    }

    pub fn for_store(store: &SessionStore, viewport: Viewport) -> Self {
        let pct = store.read(|s| s.map.sprite_size_percent);
        Self::new(viewport, store.view(), pct)
    }

    fn to_map(&self, pointer: Point) -> Point {
        coords::to_map_coordinates(pointer, self.viewport.origin, self.camera, self.scale)
    }

    /// Whether a token at `map` keeps its whole box inside the viewport, per axis.
    fn fits(&self, map: Point) -> (bool, bool) {
        let s = coords::to_screen(map, self.camera, self.scale);
        let view = self.viewport.size;
        (
            s.x >= 0.0 && s.x + self.token <= view.width,
            s.y >= 0.0 && s.y + self.token <= view.height,
        )
    }
}

/// Checks whether `viewer` may pick up `character_id`.
pub fn check_pick_up(session: &Session, viewer: &Viewer, character_id: &str) -> Result<(), Rejection> {
    let Some(character) = session.character(character_id) else {
        return Err(Rejection::UnknownToken);
    };
    if character.is_dead {
        return Err(Rejection::Dead);
    }
    if is_placing(session, viewer) {
        return Ok(());
    }
    if session.is_paused {
        return Err(Rejection::Paused);
    }
    let queue = turns::compute_queue(&session.characters);
    if !turns::is_turn_of(&queue, session.turn_index, &viewer.user_id) {
        return Err(Rejection::NotYourTurn);
    }
    if character.controller_id != viewer.user_id {
        return Err(Rejection::NotYourToken);
    }
    Ok(())
}

fn is_placing(session: &Session, viewer: &Viewer) -> bool {
    viewer.mode.is_setup() && session.is_dungeon_master(&viewer.user_id)
}

#[derive(Debug, Default)]
pub struct DragController {
    tokens: HashMap<String, DragState>,
}

impl DragController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, character_id: &str) -> DragState {
        self.tokens.get(character_id).copied().unwrap_or_default()
    }

    pub fn is_dragging(&self) -> bool {
        self.tokens
            .values()
            .any(|s| matches!(s, DragState::Dragging { .. }))
    }

    pub fn pointer_down(
        &mut self,
        store: &SessionStore,
        viewer: &Viewer,
        character_id: &str,
        pointer: Point,
        frame: &Frame,
    ) -> Result<(), Rejection> {
        let picked = store.read(|s| {
            check_pick_up(s, viewer, character_id)?;
            s.character(character_id)
                .map(|c| (c.position, is_placing(s, viewer)))
                .ok_or(Rejection::UnknownToken)
        });
        let (position, placing) = match picked {
            Ok(p) => p,
            Err(rejection) => {
                debug!(character = character_id, user = %viewer.user_id, ?rejection, "pick up rejected");
                return Err(rejection);
            }
        };
        let grab_offset = frame.to_map(pointer) - position;
        self.tokens.insert(
            character_id.to_string(),
            DragState::Dragging {
                grab_offset,
                start: position,
                placing,
            },
        );
        Ok(())
    }

    /// Moves a dragged token toward the pointer. Returns the position now in the store,
    /// or `None` if the token is not being dragged.
    pub fn pointer_move(
        &mut self,
        store: &SessionStore,
        character_id: &str,
        pointer: Point,
        frame: &Frame,
    ) -> Option<Point> {
        let DragState::Dragging { grab_offset, .. } = self.state(character_id) else {
            return None;
        };
        let current = store.read(|s| s.character(character_id).map(|c| c.position))?;
        let candidate = frame.to_map(pointer) - grab_offset;
        if !candidate.is_finite() {
            return Some(current);
        }
        let (fits_x, fits_y) = frame.fits(candidate);
        let next = Point::new(
            if fits_x { candidate.x } else { current.x },
            if fits_y { candidate.y } else { current.y },
        );
        store.set_moving(character_id, true);
        if next != current {
            store.apply_local_character_move(character_id, next);
        }
        Some(next)
    }

    /// Releases every dragged token and schedules its final position. A DM placement
    /// also commits the drop. Returns the ids that were released.
    pub fn pointer_up(&mut self, store: &SessionStore, sync: &SyncScheduler) -> Vec<String> {
        let mut released = Vec::new();
        for (id, state) in self.tokens.drain() {
            let DragState::Dragging { start, placing, .. } = state else {
                continue;
            };
            store.set_moving(&id, false);
            let Some(position) = store.read(|s| s.character(&id).map(|c| c.position)) else {
                continue;
            };
            if position != start {
                sync.schedule_position(&id, position);
                if placing {
                    if let Some(prev) = store.commit_prev_position(&id) {
                        sync.persist_prev_position(&id, prev);
                    }
                }
            }
            released.push(id);
        }
        released.sort();
        released
    }

    /// Drops drag state without committing, e.g. when the board is torn down mid-drag.
    pub fn cancel(&mut self, store: &SessionStore) {
        for id in self.tokens.drain().map(|(id, _)| id) {
            store.set_moving(&id, false);
        }
    }
}

/// Ids of tokens to render: those whose committed box intersects the viewport, plus any
/// token currently being dragged.
pub fn visible_tokens(store: &SessionStore, frame: &Frame) -> Vec<String> {
    let candidates: Vec<(String, Point)> = store.read(|s| {
        s.characters
            .iter()
            .map(|c| (c.id.clone(), c.prev_position))
            .collect()
    });
    candidates
        .into_iter()
        .filter(|(id, committed)| {
            store.is_moving(id)
                || coords::is_token_visible(
                    *committed,
                    frame.camera,
                    frame.scale,
                    frame.viewport.size,
                    frame.token,
                )
        })
        .map(|(id, _)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::api::{Call, MemoryDataAccess};
    use crate::mode::Mode;
    use crate::model::Size;
    use crate::store::tests::{character_record, session_record, snapshot};
    use crate::sync::SyncConfig;

    fn viewport() -> Viewport {
        Viewport::new(
            Point::new(10.0, 20.0),
            Size::new(500.0, 500.0),
            Size::new(2000.0, 2000.0),
        )
    }

    fn store() -> SessionStore {
        SessionStore::new(
            snapshot(vec![
                character_record("hero", "p1", 18, 50.0, 50.0),
                character_record("rogue", "p2", 10, 300.0, 300.0),
                character_record("goblin", "dm", 4, 200.0, 40.0),
            ])
            .into_session(),
        )
    }

    fn frame(store: &SessionStore) -> Frame {
        Frame::for_store(store, viewport())
    }

    fn pointer_at(map: Point) -> Point {
        // Identity scale, camera at origin.
        map + viewport().origin
    }

    #[tokio::test(start_paused = true)]
    async fn drag_and_release_writes_only_the_final_position() {
        let store = store();
        let api = Arc::new(MemoryDataAccess::new(session_record("s1"), vec![]));
        let sync = SyncScheduler::new(api.clone(), "s1", SyncConfig::default());
        let viewer = Viewer::new("p1", Mode::Play);
        let mut drag = DragController::new();
        let f = frame(&store);

        // Grab the token 5 units in from its corner.
        drag.pointer_down(&store, &viewer, "hero", pointer_at(Point::new(55.0, 55.0)), &f)
            .unwrap();
        for (x, y) in [(60.0, 62.0), (70.0, 75.0), (80.0, 90.0)] {
            drag.pointer_move(&store, "hero", pointer_at(Point::new(x + 5.0, y + 5.0)), &f);
            tokio::time::sleep(Duration::from_millis(16)).await;
        }
        assert!(store.any_movement_in_progress());
        let released = drag.pointer_up(&store, &sync);
        assert_eq!(released, vec!["hero".to_string()]);
        assert!(!store.any_movement_in_progress());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            api.position_calls(),
            vec![Call::Position {
                character_id: "hero".to_string(),
                x: 80.0,
                y: 90.0
            }]
        );
        let hero = store.read(|s| s.character("hero").cloned()).unwrap();
        assert_eq!(hero.position, Point::new(80.0, 90.0));
        assert_eq!(hero.prev_position, Point::new(50.0, 50.0));

        // Releasing again with nothing held writes nothing.
        drag.pointer_up(&store, &sync);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(api.position_calls().len(), 1);
    }

    #[test]
    fn each_axis_is_bounded_independently() {
        let store = store();
        let viewer = Viewer::new("p1", Mode::Play);
        let mut drag = DragController::new();
        let f = frame(&store);
        drag.pointer_down(&store, &viewer, "hero", pointer_at(Point::new(50.0, 50.0)), &f)
            .unwrap();
        // Token is 50 wide; x = 480 would overflow the 500 wide box, y = 100 is fine.
        let p = drag.pointer_move(&store, "hero", pointer_at(Point::new(480.0, 100.0)), &f);
        assert_eq!(p, Some(Point::new(50.0, 100.0)));
        let p = drag.pointer_move(&store, "hero", pointer_at(Point::new(200.0, -5.0)), &f);
        assert_eq!(p, Some(Point::new(200.0, 100.0)));
    }

    #[test]
    fn guards_reject_out_of_turn_paused_and_foreign_tokens() {
        let store = store();
        let f = frame(&store);
        let mut drag = DragController::new();
        let p2 = Viewer::new("p2", Mode::Play);
        let p1 = Viewer::new("p1", Mode::Play);

        // hero (p1) has the highest initiative.
        assert_eq!(
            drag.pointer_down(&store, &p2, "rogue", Point::ORIGIN, &f),
            Err(Rejection::NotYourTurn)
        );
        assert_eq!(
            drag.pointer_down(&store, &p1, "goblin", Point::ORIGIN, &f),
            Err(Rejection::NotYourToken)
        );
        assert_eq!(
            drag.pointer_down(&store, &p1, "ghost", Point::ORIGIN, &f),
            Err(Rejection::UnknownToken)
        );
        store.set_paused(true);
        assert_eq!(
            drag.pointer_down(&store, &p1, "hero", Point::ORIGIN, &f),
            Err(Rejection::Paused)
        );
        store.set_paused(false);
        store.set_dead("hero", true);
        assert_eq!(
            drag.pointer_down(&store, &p1, "hero", Point::ORIGIN, &f),
            Err(Rejection::Dead)
        );
        assert_eq!(drag.state("hero"), DragState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_drop_commits_both_positions() {
        let store = store();
        store.set_paused(true);
        let api = Arc::new(MemoryDataAccess::new(session_record("s1"), vec![]));
        let sync = SyncScheduler::new(api.clone(), "s1", SyncConfig::default());
        let dm = Viewer::new("dm", Mode::Setup);
        let mut drag = DragController::new();
        let f = frame(&store);

        // The DM may place any token while paused and out of turn.
        drag.pointer_down(&store, &dm, "rogue", pointer_at(Point::new(300.0, 300.0)), &f)
            .unwrap();
        drag.pointer_move(&store, "rogue", pointer_at(Point::new(250.0, 260.0)), &f);
        drag.pointer_up(&store, &sync);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let calls = api.calls();
        assert!(calls.contains(&Call::PrevPosition {
            character_id: "rogue".to_string(),
            x: 250.0,
            y: 260.0
        }));
        assert_eq!(api.position_calls().len(), 1);
        let rogue = store.read(|s| s.character("rogue").cloned()).unwrap();
        assert_eq!(rogue.prev_position, rogue.position);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_mode_gives_players_no_bypass() {
        let store = store();
        store.set_paused(true);
        let api = Arc::new(MemoryDataAccess::new(session_record("s1"), vec![]));
        let sync = SyncScheduler::new(api.clone(), "s1", SyncConfig::default());
        let mut drag = DragController::new();
        let f = frame(&store);

        let p2 = Viewer::new("p2", Mode::Setup);
        assert_eq!(
            drag.pointer_down(&store, &p2, "rogue", pointer_at(Point::new(300.0, 300.0)), &f),
            Err(Rejection::Paused)
        );
        store.set_paused(false);
        // hero (p1) is on turn.
        assert_eq!(
            drag.pointer_down(&store, &p2, "rogue", pointer_at(Point::new(300.0, 300.0)), &f),
            Err(Rejection::NotYourTurn)
        );

        // On turn, a player in setup mode drags like in play: nothing is committed.
        let p1 = Viewer::new("p1", Mode::Setup);
        drag.pointer_down(&store, &p1, "hero", pointer_at(Point::new(50.0, 50.0)), &f)
            .unwrap();
        drag.pointer_move(&store, "hero", pointer_at(Point::new(90.0, 80.0)), &f);
        drag.pointer_up(&store, &sync);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(api.calls().len(), 1);
        assert_eq!(api.position_calls().len(), 1);
        let hero = store.read(|s| s.character("hero").cloned()).unwrap();
        assert_eq!(hero.prev_position, Point::new(50.0, 50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn setup_drop_in_place_writes_nothing() {
        let store = store();
        let api = Arc::new(MemoryDataAccess::new(session_record("s1"), vec![]));
        let sync = SyncScheduler::new(api.clone(), "s1", SyncConfig::default());
        let dm = Viewer::new("dm", Mode::Setup);
        let mut drag = DragController::new();
        let f = frame(&store);

        drag.pointer_down(&store, &dm, "rogue", pointer_at(Point::new(300.0, 300.0)), &f)
            .unwrap();
        assert_eq!(drag.pointer_up(&store, &sync), vec!["rogue".to_string()]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(api.calls().is_empty());
    }

    #[test]
    fn tokens_outside_the_view_are_not_rendered() {
        let store = store();
        let f = frame(&store);
        assert_eq!(visible_tokens(&store, &f).len(), 3);

        store.set_view(CameraView {
            offset: Point::new(-250.0, -250.0),
            zoom: 6.0,
        });
        let f = frame(&store);
        assert_eq!(visible_tokens(&store, &f), vec!["rogue".to_string()]);

        store.set_moving("hero", true);
        assert_eq!(visible_tokens(&store, &f).len(), 2);
    }

    #[test]
    fn cancel_clears_movement_flags() {
        let store = store();
        let viewer = Viewer::new("p1", Mode::Play);
        let mut drag = DragController::new();
        let f = frame(&store);
        drag.pointer_down(&store, &viewer, "hero", pointer_at(Point::new(50.0, 50.0)), &f)
            .unwrap();
        drag.pointer_move(&store, "hero", pointer_at(Point::new(60.0, 60.0)), &f);
        assert!(drag.is_dragging());
        drag.cancel(&store);
        assert!(!drag.is_dragging());
        assert!(!store.any_movement_in_progress());
    }
}
