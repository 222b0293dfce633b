use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tabletop_protocol::{CharacterRecord, InitiativeUpdate, MapViewBody, SessionRecord};

use crate::error::{Error, Result};
use crate::model::ServerSnapshot;

/// The slice of the data-access layer the core consumes.
#[async_trait]
pub trait DataAccess: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<SessionRecord>;
    async fn get_characters_in_session(&self, session_id: &str) -> Result<Vec<CharacterRecord>>;
    async fn update_character_position(
        &self,
        character_id: &str,
        session_id: &str,
        x: f64,
        y: f64,
    ) -> Result<()>;
    async fn update_character_prev_position(
        &self,
        character_id: &str,
        session_id: &str,
        x: f64,
        y: f64,
    ) -> Result<()>;
    async fn update_initiative_batch(&self, updates: &[InitiativeUpdate]) -> Result<()>;
    async fn update_pause_flag(&self, session_id: &str, is_paused: bool) -> Result<()>;
    async fn update_turn_index(&self, session_id: &str, turn_index: i64) -> Result<()>;
    async fn update_death_flag(&self, character_id: &str, session_id: &str, is_dead: bool)
        -> Result<()>;
    async fn update_map_view(&self, session_id: &str, view: &MapViewBody) -> Result<()>;
}

/// Fetches the session row and its characters together.
pub async fn fetch_snapshot(api: &dyn DataAccess, session_id: &str) -> Result<ServerSnapshot> {
    let (session, characters) = tokio::try_join!(
        api.get_session(session_id),
        api.get_characters_in_session(session_id)
    )?;
    Ok(ServerSnapshot {
        session,
        characters,
    })
}

/// One recorded mutation, as seen by [`MemoryDataAccess`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Position { character_id: String, x: f64, y: f64 },
    PrevPosition { character_id: String, x: f64, y: f64 },
    Initiative(Vec<InitiativeUpdate>),
    Pause(bool),
    TurnIndex(i64),
    Death { character_id: String, is_dead: bool },
    MapView(MapViewBody),
}

#[derive(Debug, Default)]
struct MemoryState {
    session: Option<SessionRecord>,
    characters: Vec<CharacterRecord>,
    calls: Vec<Call>,
    fail_mutations: bool,
    fetches: usize,
}

/// In-memory `DataAccess` that applies mutations to a single session and records
/// every call. Useful for tests and for running a board without a server.
#[derive(Debug, Default)]
pub struct MemoryDataAccess {
    inner: Mutex<MemoryState>,
}

impl MemoryDataAccess {
    pub fn new(session: SessionRecord, characters: Vec<CharacterRecord>) -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                session: Some(session),
                characters,
                ..MemoryState::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut st)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|st| st.calls.clone())
    }

    pub fn position_calls(&self) -> Vec<Call> {
        self.with(|st| {
            st.calls
                .iter()
                .filter(|c| matches!(c, Call::Position { .. }))
                .cloned()
                .collect()
        })
    }

    /// Number of completed `get_session` fetches.
    pub fn fetches(&self) -> usize {
        self.with(|st| st.fetches)
    }

    /// Makes every subsequent mutation fail with a network error.
    pub fn fail_mutations(&self, fail: bool) {
        self.with(|st| st.fail_mutations = fail);
    }

    /// Edits the stored session as another client would.
    pub fn edit_session(&self, f: impl FnOnce(&mut SessionRecord)) {
        self.with(|st| {
            if let Some(s) = st.session.as_mut() {
                f(s);
                s.rev += 1;
            }
        });
    }

    pub fn edit_character(&self, character_id: &str, f: impl FnOnce(&mut CharacterRecord)) {
        self.with(|st| {
            if let Some(c) = st.characters.iter_mut().find(|c| c.character_id == character_id) {
                f(c);
            }
        });
    }

    fn record(
        &self,
        call: Call,
        apply: impl FnOnce(&mut MemoryState) -> Result<()>,
    ) -> Result<()> {
        self.with(|st| {
            st.calls.push(call);
            if st.fail_mutations {
                return Err(Error::Network("connection refused".to_string()));
            }
            apply(st)?;
            if let Some(s) = st.session.as_mut() {
                s.rev += 1;
            }
            Ok(())
        })
    }

    fn character_mut<'a>(
        st: &'a mut MemoryState,
        character_id: &str,
    ) -> Result<&'a mut CharacterRecord> {
        st.characters
            .iter_mut()
            .find(|c| c.character_id == character_id)
            .ok_or_else(|| Error::NotFound(format!("character {character_id}")))
    }
}

#[async_trait]
impl DataAccess for MemoryDataAccess {
    async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.with(|st| {
            st.fetches += 1;
            st.session
                .clone()
                .filter(|s| s.id == session_id)
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
        })
    }

    async fn get_characters_in_session(&self, _session_id: &str) -> Result<Vec<CharacterRecord>> {
        Ok(self.with(|st| st.characters.clone()))
    }

    async fn update_character_position(
        &self,
        character_id: &str,
        _session_id: &str,
        x: f64,
        y: f64,
    ) -> Result<()> {
        let call = Call::Position {
            character_id: character_id.to_string(),
            x,
            y,
        };
        self.record(call, |st| {
            let c = Self::character_mut(st, character_id)?;
            c.position_x = x;
            c.position_y = y;
            Ok(())
        })
    }

    async fn update_character_prev_position(
        &self,
        character_id: &str,
        _session_id: &str,
        x: f64,
        y: f64,
    ) -> Result<()> {
        let call = Call::PrevPosition {
            character_id: character_id.to_string(),
            x,
            y,
        };
        self.record(call, |st| {
            let c = Self::character_mut(st, character_id)?;
            c.prev_position_x = x;
            c.prev_position_y = y;
            Ok(())
        })
    }

    async fn update_initiative_batch(&self, updates: &[InitiativeUpdate]) -> Result<()> {
        self.record(Call::Initiative(updates.to_vec()), |st| {
            let by_id: HashMap<&str, i64> = updates
                .iter()
                .map(|u| (u.character_id.as_str(), u.initiative))
                .collect();
            for c in st.characters.iter_mut() {
                if let Some(&i) = by_id.get(c.character_id.as_str()) {
                    c.initiative = i;
                }
            }
            Ok(())
        })
    }

    async fn update_pause_flag(&self, _session_id: &str, is_paused: bool) -> Result<()> {
        self.record(Call::Pause(is_paused), |st| {
            if let Some(s) = st.session.as_mut() {
                s.is_paused = is_paused;
            }
            Ok(())
        })
    }

    async fn update_turn_index(&self, _session_id: &str, turn_index: i64) -> Result<()> {
        self.record(Call::TurnIndex(turn_index), |st| {
            if let Some(s) = st.session.as_mut() {
                s.turn_index = turn_index;
            }
            Ok(())
        })
    }

    async fn update_death_flag(
        &self,
        character_id: &str,
        _session_id: &str,
        is_dead: bool,
    ) -> Result<()> {
        let call = Call::Death {
            character_id: character_id.to_string(),
            is_dead,
        };
        self.record(call, |st| {
            Self::character_mut(st, character_id)?.is_dead = is_dead;
            Ok(())
        })
    }

    async fn update_map_view(&self, _session_id: &str, view: &MapViewBody) -> Result<()> {
        self.record(Call::MapView(*view), |st| {
            if let Some(s) = st.session.as_mut() {
                s.camera_x = view.camera_x;
                s.camera_y = view.camera_y;
                s.zoom = view.zoom;
                s.sprite_size_percent = view.sprite_size_percent;
            }
            Ok(())
        })
    }
}
