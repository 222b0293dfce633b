//! Outbound write coalescing and the inbound poll loop.
//!
//! [`SyncScheduler`] owns one timer per [`SyncKey`]. Re-arming a key aborts the timer it
//! replaces, so only the last value scheduled inside a window is written. Position
//! writes wait `position_debounce_ms`; discrete actions are dispatched at once.
//!
//! [`spawn_poller`] refetches the session every `poll_interval_ms` and merges it into the
//! [`SessionStore`], skipping any tick where a local token is being dragged.
//!
//! Both must be created inside a tokio runtime. Dropping either aborts its tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabletop_protocol::{InitiativeUpdate, MapViewBody};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::api::{fetch_snapshot, DataAccess};
use crate::error::Result;
use crate::model::Point;
use crate::store::{SessionStore, SnapshotOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub position_debounce_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            position_debounce_ms: 150,
            poll_interval_ms: 2_000,
        }
    }
}

impl SyncConfig {
    pub fn position_debounce(&self) -> Duration {
        Duration::from_millis(self.position_debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// A field group with at most one pending write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncKey {
    Position(String),
    PrevPosition(String),
    Death(String),
    Initiative,
    Pause,
    TurnIndex,
    MapView,
}

#[derive(Debug)]
struct Pending {
    handle: AbortHandle,
    position: Option<Point>,
    generation: u64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    pending: HashMap<SyncKey, Pending>,
    generation: u64,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SyncScheduler {
    api: Arc<dyn DataAccess>,
    session_id: String,
    config: SyncConfig,
    state: Arc<Mutex<SchedulerState>>,
}

impl SyncScheduler {
    pub fn new(api: Arc<dyn DataAccess>, session_id: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            api,
            session_id: session_id.into(),
            config,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    pub fn config(&self) -> SyncConfig {
        self.config
    }

    /// Debounced position write. Scheduling the value that is already pending is a
    /// no-op; anything else restarts the window, even a value written earlier, since
    /// another client may have moved the token in between.
    pub fn schedule_position(&self, character_id: &str, position: Point) {
        let key = SyncKey::Position(character_id.to_string());
        if lock(&self.state)
            .pending
            .get(&key)
            .is_some_and(|p| p.position == Some(position))
        {
            return;
        }
        let id = character_id.to_string();
        self.arm(
            key,
            self.config.position_debounce(),
            Some(position),
            move |api, session| async move {
                api.update_character_position(&id, &session, position.x, position.y)
                    .await
            },
        );
    }

    pub fn persist_prev_position(&self, character_id: &str, position: Point) {
        let id = character_id.to_string();
        self.arm(
            SyncKey::PrevPosition(id.clone()),
            Duration::ZERO,
            None,
            move |api, session| async move {
                api.update_character_prev_position(&id, &session, position.x, position.y)
                    .await
            },
        );
    }

    /// Writes every roll in one batch.
    pub fn persist_initiatives(&self, rolls: &HashMap<String, i64>) {
        let mut updates: Vec<InitiativeUpdate> = rolls
            .iter()
            .map(|(id, &initiative)| InitiativeUpdate {
                character_id: id.clone(),
                session_id: self.session_id.clone(),
                initiative,
            })
            .collect();
        updates.sort_by(|a, b| a.character_id.cmp(&b.character_id));
        self.arm(
            SyncKey::Initiative,
            Duration::ZERO,
            None,
            move |api, _| async move { api.update_initiative_batch(&updates).await },
        );
    }

    pub fn persist_pause(&self, is_paused: bool) {
        self.arm(
            SyncKey::Pause,
            Duration::ZERO,
            None,
            move |api, session| async move { api.update_pause_flag(&session, is_paused).await },
        );
    }

    pub fn persist_turn_index(&self, turn_index: usize) {
        let turn_index = i64::try_from(turn_index).unwrap_or(i64::MAX);
        self.arm(
            SyncKey::TurnIndex,
            Duration::ZERO,
            None,
            move |api, session| async move { api.update_turn_index(&session, turn_index).await },
        );
    }

    pub fn persist_death(&self, character_id: &str, is_dead: bool) {
        let id = character_id.to_string();
        self.arm(
            SyncKey::Death(id.clone()),
            Duration::ZERO,
            None,
            move |api, session| async move { api.update_death_flag(&id, &session, is_dead).await },
        );
    }

    pub fn persist_map_view(&self, view: MapViewBody) {
        self.arm(
            SyncKey::MapView,
            Duration::ZERO,
            None,
            move |api, session| async move { api.update_map_view(&session, &view).await },
        );
    }

    pub fn is_pending(&self, key: &SyncKey) -> bool {
        lock(&self.state).pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Aborts every timer that has not fired yet. Writes already in flight complete.
    pub fn cancel_all(&self) {
        let mut st = lock(&self.state);
        for (key, p) in st.pending.drain() {
            debug!(?key, "cancelling pending write");
            p.handle.abort();
        }
    }

    fn arm<F, Fut>(&self, key: SyncKey, delay: Duration, position: Option<Point>, write: F)
    where
        F: FnOnce(Arc<dyn DataAccess>, String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let session_id = self.session_id.clone();
        let state = Arc::clone(&self.state);

        // Held until the entry is inserted so the task cannot observe a missing entry.
        let mut st = lock(&self.state);
        st.generation += 1;
        let generation = st.generation;
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let mut st = lock(&state);
                if st
                    .pending
                    .get(&task_key)
                    .is_some_and(|p| p.generation == generation)
                {
                    st.pending.remove(&task_key);
                }
            }
            if let Err(err) = write(api, session_id).await {
                warn!(key = ?task_key, error = %err, "write failed; keeping local value until next poll");
            }
        });

        let entry = Pending {
            handle: task.abort_handle(),
            position,
            generation,
        };
        if let Some(prev) = st.pending.insert(key, entry) {
            prev.handle.abort();
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("session_id", &self.session_id)
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}

// -- polling ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Applied,
    /// A drag was in progress when the tick fired; nothing was fetched.
    Skipped,
    /// A drag started while the fetch was in flight; the result was dropped.
    Discarded,
    Failed,
}

/// One poll tick: fetch and merge unless a local drag is in progress.
pub async fn poll_once(api: &dyn DataAccess, store: &SessionStore) -> PollOutcome {
    if store.any_movement_in_progress() {
        debug!("poll skipped: drag in progress");
        return PollOutcome::Skipped;
    }
    let session_id = store.session_id();
    let snapshot = match fetch_snapshot(api, &session_id).await {
        Ok(s) => s,
        Err(err) => {
            warn!(session = %session_id, error = %err, "poll failed");
            return PollOutcome::Failed;
        }
    };
    match store.apply_server_snapshot(snapshot) {
        SnapshotOutcome::Applied => PollOutcome::Applied,
        SnapshotOutcome::Deferred => PollOutcome::Discarded,
    }
}

/// Owns the poll task. Dropping it stops polling.
#[derive(Debug)]
pub struct PollHandle {
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn stop(self) {}

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_poller(api: Arc<dyn DataAccess>, store: SessionStore, config: SyncConfig) -> PollHandle {
    let period = config.poll_interval();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            poll_once(api.as_ref(), &store).await;
        }
    });
    PollHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Call, MemoryDataAccess};
    use crate::store::tests::{character_record, session_record, snapshot};

    fn memory() -> Arc<MemoryDataAccess> {
        Arc::new(MemoryDataAccess::new(
            session_record("s1"),
            vec![character_record("hero", "p1", 12, 50.0, 50.0)],
        ))
    }

    fn scheduler(api: &Arc<MemoryDataAccess>) -> SyncScheduler {
        SyncScheduler::new(api.clone(), "s1", SyncConfig::default())
    }

    fn position(id: &str, x: f64, y: f64) -> Call {
        Call::Position {
            character_id: id.to_string(),
            x,
            y,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_updates_coalesce_into_the_last_value() {
        let api = memory();
        let sync = scheduler(&api);
        for i in 0..10 {
            sync.schedule_position("hero", Point::new(50.0 + i as f64, 60.0));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(api.calls().is_empty());
        settle().await;
        assert_eq!(api.calls(), vec![position("hero", 59.0, 60.0)]);
        assert_eq!(sync.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_the_pending_value_writes_once() {
        let api = memory();
        let sync = scheduler(&api);
        sync.schedule_position("hero", Point::new(80.0, 90.0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Same value: the window is not restarted.
        sync.schedule_position("hero", Point::new(80.0, 90.0));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(api.position_calls(), vec![position("hero", 80.0, 90.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn a_value_already_written_can_be_written_again() {
        let api = memory();
        let sync = scheduler(&api);
        sync.schedule_position("hero", Point::new(80.0, 90.0));
        settle().await;
        // Someone else moves the token; moving it back must reach the server.
        api.update_character_position("hero", "s1", 300.0, 300.0)
            .await
            .unwrap();
        sync.schedule_position("hero", Point::new(80.0, 90.0));
        settle().await;
        assert_eq!(
            api.position_calls(),
            vec![
                position("hero", 80.0, 90.0),
                position("hero", 300.0, 300.0),
                position("hero", 80.0, 90.0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let api = memory();
        let sync = scheduler(&api);
        sync.schedule_position("hero", Point::new(1.0, 1.0));
        sync.schedule_position("goblin", Point::new(2.0, 2.0));
        assert!(sync.is_pending(&SyncKey::Position("hero".to_string())));
        assert_eq!(sync.pending_count(), 2);
        settle().await;
        assert_eq!(api.position_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_scheduler_cancels_pending_writes() {
        let api = memory();
        let sync = scheduler(&api);
        sync.schedule_position("hero", Point::new(80.0, 90.0));
        drop(sync);
        settle().await;
        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn discrete_actions_are_not_delayed() {
        let api = memory();
        let sync = scheduler(&api);
        sync.persist_pause(true);
        sync.persist_turn_index(2);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(api.calls(), vec![Call::Pause(true), Call::TurnIndex(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn initiative_goes_out_as_one_batch() {
        let api = memory();
        let sync = scheduler(&api);
        let rolls = HashMap::from([("hero".to_string(), 17), ("goblin".to_string(), 4)]);
        sync.persist_initiatives(&rolls);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let calls = api.calls();
        assert_eq!(calls.len(), 1);
        let Call::Initiative(batch) = &calls[0] else {
            panic!("expected an initiative batch, got {calls:?}");
        };
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|u| u.session_id == "s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_writes_are_not_retried() {
        let api = memory();
        let sync = scheduler(&api);
        api.fail_mutations(true);
        sync.schedule_position("hero", Point::new(80.0, 90.0));
        settle().await;
        settle().await;
        assert_eq!(api.calls().len(), 1);

        api.fail_mutations(false);
        sync.schedule_position("hero", Point::new(80.0, 90.0));
        settle().await;
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_is_suspended_while_dragging() {
        let api = memory();
        let store = SessionStore::new(
            snapshot(vec![character_record("hero", "p1", 12, 50.0, 50.0)]).into_session(),
        );
        store.set_moving("hero", true);
        let poll = spawn_poller(api.clone(), store.clone(), SyncConfig::default());
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(api.fetches(), 0);

        api.edit_session(|s| s.is_paused = true);
        store.set_moving("hero", false);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(api.fetches() >= 1);
        assert!(store.read(|s| s.is_paused));

        drop(poll);
        let seen = api.fetches();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.fetches(), seen);
    }

    #[tokio::test]
    async fn failed_poll_leaves_the_store_alone() {
        let api = MemoryDataAccess::new(session_record("other"), vec![]);
        let store = SessionStore::new(
            snapshot(vec![character_record("hero", "p1", 12, 50.0, 50.0)]).into_session(),
        );
        assert_eq!(poll_once(&api, &store).await, PollOutcome::Failed);
        assert_eq!(store.read(|s| s.characters.len()), 1);
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: SyncConfig = serde_json::from_str(r#"{"pollIntervalMs": 5}"#).unwrap();
        assert_eq!(cfg, SyncConfig::default());
        let cfg: SyncConfig = serde_json::from_str(r#"{"poll_interval_ms": 500}"#).unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.position_debounce_ms, 150);
    }
}
