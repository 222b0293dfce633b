//! The per-client mirror of persisted session state.
//!
//! Every other component reads and writes through [`SessionStore`]. Each mutation bumps
//! a revision that subscribers observe through a `watch` channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::model::{MapSettings, Point, ServerSnapshot, Session};
use crate::turns;

/// Local camera. Diverges from `Session.map` while the viewer pans or zooms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraView {
    pub offset: Point,
    pub zoom: f64,
}

impl CameraView {
    fn of(map: &MapSettings) -> Self {
        Self {
            offset: map.camera,
            zoom: map.zoom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied,
    /// A local token is mid-drag; the snapshot was dropped untouched.
    Deferred,
}

#[derive(Debug)]
struct StoreState {
    session: Session,
    view: CameraView,
    view_diverged: bool,
    moving: HashSet<String>,
    revision: u64,
}

#[derive(Clone)]
pub struct SessionStore {
    state: Arc<Mutex<StoreState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl SessionStore {
    pub fn new(session: Session) -> Self {
        let (tx, _rx) = watch::channel(0);
        let view = CameraView::of(&session.map);
        Self {
            state: Arc::new(Mutex::new(StoreState {
                session,
                view,
                view_diverged: false,
                moving: HashSet::new(),
                revision: 0,
            })),
            revision: Arc::new(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the lock and notifies subscribers when it reports a change.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> (R, bool)) -> R {
        let (out, rev) = {
            let mut st = self.lock();
            let (out, changed) = f(&mut st);
            if changed {
                st.revision += 1;
                (out, Some(st.revision))
            } else {
                (out, None)
            }
        };
        if let Some(rev) = rev {
            self.revision.send_replace(rev);
        }
        out
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    pub fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.lock().session)
    }

    pub fn session(&self) -> Session {
        self.read(Session::clone)
    }

    pub fn session_id(&self) -> String {
        self.read(|s| s.id.clone())
    }

    pub fn view(&self) -> CameraView {
        self.lock().view
    }

    // -- inbound ----------------------------------------------------------

    /// Replaces persisted fields with a polled snapshot. Never runs while any token is
    /// being dragged locally.
    pub fn apply_server_snapshot(&self, snapshot: ServerSnapshot) -> SnapshotOutcome {
        self.mutate(|st| {
            if !st.moving.is_empty() {
                debug!(moving = st.moving.len(), "snapshot deferred: drag in progress");
                return (SnapshotOutcome::Deferred, false);
            }
            let mut next = snapshot.into_session();
            for c in next.characters.iter_mut() {
                let prev = st.session.character(&c.id);
                if !c.position.is_finite() {
                    c.position = prev.map(|p| p.position).unwrap_or_default();
                }
                if !c.prev_position.is_finite() {
                    c.prev_position = prev.map(|p| p.prev_position).unwrap_or_default();
                }
            }
            next.turn_index = turns::normalize_turn_index(next.characters.len(), next.turn_index);
            if !st.view_diverged {
                st.view = CameraView::of(&next.map);
            }
            st.session = next;
            (SnapshotOutcome::Applied, true)
        })
    }

    // -- local, optimistic --------------------------------------------------

    pub fn apply_local_character_move(&self, id: &str, position: Point) -> bool {
        if !position.is_finite() {
            return false;
        }
        self.mutate(|st| match st.session.character_mut(id) {
            Some(c) if c.position != position => {
                c.position = position;
                (true, true)
            }
            Some(_) => (true, false),
            None => (false, false),
        })
    }

    /// Copies the current position into the committed position and returns it.
    pub fn commit_prev_position(&self, id: &str) -> Option<Point> {
        self.mutate(|st| match st.session.character_mut(id) {
            Some(c) => {
                let changed = c.prev_position != c.position;
                c.prev_position = c.position;
                (Some(c.position), changed)
            }
            None => (None, false),
        })
    }

    pub fn set_paused(&self, paused: bool) {
        self.mutate(|st| {
            let changed = st.session.is_paused != paused;
            st.session.is_paused = paused;
            ((), changed)
        })
    }

    /// Stores `n` normalized into the current queue range and returns what was stored.
    pub fn set_turn_index(&self, n: usize) -> usize {
        self.mutate(|st| {
            let n = turns::normalize_turn_index(st.session.characters.len(), n);
            let changed = st.session.turn_index != n;
            st.session.turn_index = n;
            (n, changed)
        })
    }

    pub fn set_initiatives(&self, rolls: &HashMap<String, i64>) {
        self.mutate(|st| {
            let mut changed = false;
            for c in st.session.characters.iter_mut() {
                if let Some(&roll) = rolls.get(&c.id) {
                    changed |= c.initiative != roll;
                    c.initiative = roll;
                }
            }
            ((), changed)
        })
    }

    pub fn set_dead(&self, id: &str, is_dead: bool) -> bool {
        self.mutate(|st| match st.session.character_mut(id) {
            Some(c) => {
                let changed = c.is_dead != is_dead;
                c.is_dead = is_dead;
                (true, changed)
            }
            None => (false, false),
        })
    }

    pub fn set_sprite_size(&self, percent: f64) {
        if !percent.is_finite() || percent <= 0.0 {
            return;
        }
        self.mutate(|st| {
            let changed = st.session.map.sprite_size_percent != percent;
            st.session.map.sprite_size_percent = percent;
            ((), changed)
        })
    }

    // -- movement flag ------------------------------------------------------

    pub fn set_moving(&self, id: &str, moving: bool) {
        self.mutate(|st| {
            let changed = if moving {
                st.moving.insert(id.to_string())
            } else {
                st.moving.remove(id)
            };
            ((), changed)
        })
    }

    pub fn is_moving(&self, id: &str) -> bool {
        self.lock().moving.contains(id)
    }

    pub fn any_movement_in_progress(&self) -> bool {
        !self.lock().moving.is_empty()
    }

    // -- camera -------------------------------------------------------------

    pub fn set_view(&self, view: CameraView) {
        self.mutate(|st| {
            let changed = st.view != view;
            st.view = view;
            st.view_diverged = st.view != CameraView::of(&st.session.map);
            ((), changed)
        })
    }

    /// Locks the local view into the session's map settings and returns them.
    pub fn commit_view(&self) -> MapSettings {
        self.mutate(|st| {
            let before = st.session.map.clone();
            st.session.map.camera = st.view.offset;
            st.session.map.zoom = st.view.zoom;
            st.view_diverged = false;
            let changed = before != st.session.map;
            (st.session.map.clone(), changed)
        })
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("SessionStore")
            .field("session", &st.session.id)
            .field("revision", &st.revision)
            .field("moving", &st.moving.len())
            .finish()
    }
}
