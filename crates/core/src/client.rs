use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tabletop_protocol::MapViewBody;
use tracing::{debug, info, warn};

use crate::api::{fetch_snapshot, DataAccess};
use crate::coords::{self, MapBounds};
use crate::drag::{self, DragController, Frame, Rejection};
use crate::error::Result;
use crate::leash::{self, Direction, PanOutcome, EDGE_SLACK, PAN_STEP};
use crate::mode::{Role, Viewer};
use crate::model::{Character, MapSettings, Point, Size, Viewport};
use crate::store::{CameraView, SessionStore};
use crate::sync::{spawn_poller, PollHandle, SyncConfig, SyncScheduler};
use crate::turns;

/// One viewer's handle on a session: the store plus everything that writes to it.
///
/// Must live inside a tokio runtime. Dropping it releases held tokens, cancels pending
/// writes and stops polling.
pub struct TableClient {
    api: Arc<dyn DataAccess>,
    store: SessionStore,
    viewer: Viewer,
    viewport: Viewport,
    config: SyncConfig,
    drag: DragController,
    sync: SyncScheduler,
    poll: Option<PollHandle>,
}

impl TableClient {
    /// Loads the session and starts from the persisted state.
    pub async fn connect(
        api: Arc<dyn DataAccess>,
        session_id: &str,
        viewer: Viewer,
        config: SyncConfig,
    ) -> Result<Self> {
        let snapshot = fetch_snapshot(api.as_ref(), session_id).await?;
        let store = SessionStore::new(snapshot.into_session());
        let sync = SyncScheduler::new(Arc::clone(&api), session_id, config);
        info!(session = session_id, user = %viewer.user_id, mode = ?viewer.mode, "joined session");
        Ok(Self {
            api,
            store,
            viewer,
            viewport: Viewport::default(),
            config,
            drag: DragController::new(),
            sync,
            poll: None,
        })
    }

    pub fn start_polling(&mut self) {
        if self.poll.is_none() {
            self.poll = Some(spawn_poller(
                Arc::clone(&self.api),
                self.store.clone(),
                self.config,
            ));
        }
    }

    pub fn stop_polling(&mut self) {
        self.poll = None;
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn role(&self) -> Role {
        self.store.read(|s| self.viewer.role(s))
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn frame(&self) -> Frame {
        Frame::for_store(&self.store, self.viewport)
    }

    /// Visible area in map units.
    fn visible(&self, frame: &Frame) -> Size {
        Size::new(
            self.viewport.size.width / frame.scale.x,
            self.viewport.size.height / frame.scale.y,
        )
    }

    fn bounds(&self) -> MapBounds {
        MapBounds::for_map(self.viewport.full, PAN_STEP, EDGE_SLACK)
    }

    fn require_dm(&self, action: &str) -> std::result::Result<(), Rejection> {
        if self.role().is_dm() {
            Ok(())
        } else {
            debug!(user = %self.viewer.user_id, action, "refused: not the dungeon master");
            Err(Rejection::NotDungeonMaster)
        }
    }

    // -- tokens -------------------------------------------------------------

    pub fn pointer_down(&mut self, character_id: &str, pointer: Point) -> std::result::Result<(), Rejection> {
        let frame = self.frame();
        self.drag
            .pointer_down(&self.store, &self.viewer, character_id, pointer, &frame)
    }

    pub fn pointer_move(&mut self, character_id: &str, pointer: Point) -> Option<Point> {
        let frame = self.frame();
        self.drag
            .pointer_move(&self.store, character_id, pointer, &frame)
    }

    pub fn pointer_up(&mut self) -> Vec<String> {
        self.drag.pointer_up(&self.store, &self.sync)
    }

    pub fn visible_tokens(&self) -> Vec<String> {
        drag::visible_tokens(&self.store, &self.frame())
    }

    // -- camera -------------------------------------------------------------

    pub fn pan(&self, direction: Direction) -> PanOutcome {
        let current = self.store.view().offset;
        self.pan_to(current + direction.camera_delta(PAN_STEP))
    }

    pub fn pan_to(&self, proposed: Point) -> PanOutcome {
        let view = self.store.view();
        let frame = self.frame();
        let outcome = self.store.read(|s| {
            leash::evaluate_pan(
                s,
                &self.viewer.user_id,
                view.offset,
                proposed,
                self.visible(&frame),
                self.bounds(),
            )
        });
        match &outcome {
            PanOutcome::Moved(offset) => self.store.set_view(CameraView {
                offset: *offset,
                zoom: view.zoom,
            }),
            other => debug!(user = %self.viewer.user_id, outcome = ?other, "pan refused"),
        }
        outcome
    }

    /// Pans so that `character_id` sits in the middle of the view.
    pub fn center_on(&self, character_id: &str) -> Option<PanOutcome> {
        let position = self
            .store
            .read(|s| s.character(character_id).map(|c| c.position))?;
        let frame = self.frame();
        let target = coords::center_on(position, self.visible(&frame), self.bounds());
        Some(self.pan_to(target))
    }

    pub fn zoom_in(&self) -> f64 {
        self.set_zoom(coords::zoom_in(self.store.view().zoom))
    }

    pub fn zoom_out(&self) -> f64 {
        self.set_zoom(coords::zoom_out(self.store.view().zoom))
    }

    fn set_zoom(&self, zoom: f64) -> f64 {
        let view = self.store.view();
        self.store.set_view(CameraView { zoom, ..view });
        zoom
    }

    /// Locks the local camera in as the session's map view for everyone.
    pub fn commit_view(&self) -> std::result::Result<MapSettings, Rejection> {
        self.require_dm("commit view")?;
        let map = self.store.commit_view();
        self.sync.persist_map_view(map_view_body(&map));
        Ok(map)
    }

    pub fn resize_tokens(&self, sprite_size_percent: f64) -> std::result::Result<(), Rejection> {
        self.require_dm("resize tokens")?;
        self.store.set_sprite_size(sprite_size_percent);
        let map = self.store.read(|s| s.map.clone());
        self.sync.persist_map_view(map_view_body(&map));
        Ok(())
    }

    // -- turns --------------------------------------------------------------

    /// Characters in play order.
    pub fn queue(&self) -> Vec<Character> {
        self.store
            .read(|s| turns::compute_queue(&s.characters).into_iter().cloned().collect())
    }

    pub fn current_turn(&self) -> Option<Character> {
        self.store.read(|s| {
            let queue = turns::compute_queue(&s.characters);
            turns::current_entry(&queue, s.turn_index).cloned()
        })
    }

    pub fn toggle_pause(&self) -> std::result::Result<bool, Rejection> {
        self.require_dm("toggle pause")?;
        let paused = !self.store.read(|s| s.is_paused);
        self.store.set_paused(paused);
        self.sync.persist_pause(paused);
        info!(paused, "pause toggled");
        Ok(paused)
    }

    /// Rolls everyone's initiative, restarts the queue and unpauses.
    pub fn roll_initiative<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> std::result::Result<HashMap<String, i64>, Rejection> {
        self.require_dm("roll initiative")?;
        let rolls = match self.store.read(|s| turns::roll_initiative(&s.characters, rng)) {
            Ok(rolls) => rolls,
            Err(err) => {
                warn!(error = %err, "initiative roll aborted");
                return Err(Rejection::NoCharacters);
            }
        };
        self.store.set_initiatives(&rolls);
        self.sync.persist_initiatives(&rolls);
        let index = self.store.set_turn_index(0);
        self.sync.persist_turn_index(index);
        self.store.set_paused(false);
        self.sync.persist_pause(false);
        info!(characters = rolls.len(), "initiative rolled");
        Ok(rolls)
    }

    /// Commits the acting character's position and hands the turn on. Open to the
    /// current controller and the dungeon master, and only with no token in hand.
    pub fn end_turn(&self) -> std::result::Result<usize, Rejection> {
        if self.drag.is_dragging() {
            debug!(user = %self.viewer.user_id, "refused: end turn mid-drag");
            return Err(Rejection::TokenHeld);
        }
        let (current, is_dm, paused, len, index) = self.store.read(|s| {
            let queue = turns::compute_queue(&s.characters);
            (
                turns::current_entry(&queue, s.turn_index).map(|c| (c.id.clone(), c.controller_id.clone())),
                s.is_dungeon_master(&self.viewer.user_id),
                s.is_paused,
                queue.len(),
                s.turn_index,
            )
        });
        let Some((character_id, controller_id)) = current else {
            return Err(Rejection::NoCharacters);
        };
        if paused && !is_dm {
            return Err(Rejection::Paused);
        }
        if !is_dm && controller_id != self.viewer.user_id {
            return Err(Rejection::NotYourTurn);
        }
        if let Some(prev) = self.store.commit_prev_position(&character_id) {
            self.sync.persist_prev_position(&character_id, prev);
        }
        let next = self.store.set_turn_index(turns::advance_turn(len, index));
        self.sync.persist_turn_index(next);
        debug!(from = index, to = next, "turn ended");
        Ok(next)
    }

    pub fn set_dead(&self, character_id: &str, is_dead: bool) -> std::result::Result<(), Rejection> {
        self.require_dm("set dead")?;
        if !self.store.set_dead(character_id, is_dead) {
            return Err(Rejection::UnknownToken);
        }
        self.sync.persist_death(character_id, is_dead);
        Ok(())
    }
}

impl Drop for TableClient {
    fn drop(&mut self) {
        self.drag.cancel(&self.store);
    }
}

impl std::fmt::Debug for TableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableClient")
            .field("viewer", &self.viewer)
            .field("store", &self.store)
            .field("sync", &self.sync)
            .field("polling", &self.poll.is_some())
            .finish()
    }
}

fn map_view_body(map: &MapSettings) -> MapViewBody {
    MapViewBody {
        camera_x: map.camera.x,
        camera_y: map.camera.y,
        zoom: map.zoom,
        sprite_size_percent: map.sprite_size_percent,
    }
}
