use anyhow::Context;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tabletop_protocol::{
    defaults, CharacterRecord, CharacterRow, CreateCharacterInput, CreateSessionInput,
    InitiativeUpdate, MapViewBody, PlayerRecord, SessionRecord,
};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

fn new_id(prefix: &str) -> String {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{c}", now_ms())
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Returned by mutations that address a row which does not exist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not found: {0}")]
pub struct NotFound(pub String);

/// Returned when placing an NPC whose name already exists in the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("conflict: {0}")]
pub struct Conflict(pub String);

#[derive(Debug, Clone)]
pub struct Engine {
    db_path: PathBuf,
}

impl Engine {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(2))?;

        migrate(&conn)?;
        Ok(conn)
    }

    // -- sessions ---------------------------------------------------------

    pub fn create_session(&self, input: &CreateSessionInput) -> anyhow::Result<SessionRecord> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let id = new_id("ses");
        let ts = now_ms();
        let dm = &input.dungeon_master;
        upsert_user_tx(&tx, dm)?;
        tx.execute(
            "INSERT INTO sessions (id, name, map_src, camera_x, camera_y, zoom, sprite_size_percent,
                                   is_paused, dungeon_master_id, turn_index, leash_distance,
                                   created_at, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, 0, ?9, ?10, ?11, ?11)",
            rusqlite::params![
                &id,
                &input.name,
                &input.map_src,
                defaults::CAMERA_X,
                defaults::CAMERA_Y,
                input.zoom.unwrap_or(defaults::ZOOM),
                input
                    .sprite_size_percent
                    .unwrap_or(defaults::SPRITE_SIZE_PERCENT),
                &dm.id,
                input.leash_distance.unwrap_or(defaults::LEASH_DISTANCE),
                now_rfc3339(),
                ts,
            ],
        )?;
        tx.execute(
            "INSERT INTO session_players (session_id, user_id, ordinal) VALUES (?1, ?2, 0)",
            (&id, &dm.id),
        )?;
        append_event_tx(
            &tx,
            "session.created",
            &id,
            serde_json::json!({ "id": id, "name": input.name }),
        )?;
        tx.commit()?;
        self.get_session(&id)?
            .ok_or_else(|| anyhow::Error::new(NotFound(id.clone())))
    }

    /// Appends players after the ones already in the session; users already present are skipped.
    pub fn add_players(&self, session_id: &str, players: &[PlayerRecord]) -> anyhow::Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        ensure_session_tx(&tx, session_id)?;
        let mut next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(ordinal), -1) + 1 FROM session_players WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        for p in players {
            upsert_user_tx(&tx, p)?;
            let n = tx.execute(
                "INSERT OR IGNORE INTO session_players (session_id, user_id, ordinal) VALUES (?1, ?2, ?3)",
                (session_id, &p.id, next),
            )?;
            if n > 0 {
                next += 1;
            }
        }
        append_event_tx(
            &tx,
            "session.players_added",
            session_id,
            serde_json::json!({ "count": players.len() }),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, name, map_src, camera_x, camera_y, zoom, sprite_size_percent, is_paused,
                        dungeon_master_id, turn_index, leash_distance
                 FROM sessions WHERE id = ?1",
                [session_id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        map_src: row.get(2)?,
                        camera_x: row.get(3)?,
                        camera_y: row.get(4)?,
                        zoom: row.get(5)?,
                        sprite_size_percent: row.get(6)?,
                        is_paused: row.get(7)?,
                        dungeon_master_id: row.get(8)?,
                        turn_index: row.get(9)?,
                        leash_distance: row.get(10)?,
                        players: Vec::new(),
                        rev: 0,
                    })
                },
            )
            .optional()?;
        let Some(mut session) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT u.id, u.name FROM session_players sp JOIN users u ON u.id = sp.user_id
             WHERE sp.session_id = ?1 ORDER BY sp.ordinal",
        )?;
        let players = stmt.query_map([session_id], |row| {
            Ok(PlayerRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        session.players = players.collect::<Result<_, _>>()?;
        session.rev = session_rev(&conn, session_id)?;
        Ok(Some(session))
    }

    pub fn delete_session(&self, session_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM character_in_session WHERE session_id = ?1",
            [session_id],
        )?;
        tx.execute(
            "DELETE FROM session_players WHERE session_id = ?1",
            [session_id],
        )?;
        let n = tx.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        if n > 0 {
            append_event_tx(
                &tx,
                "session.deleted",
                session_id,
                serde_json::json!({ "id": session_id }),
            )?;
        }
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn update_pause_flag(&self, session_id: &str, is_paused: bool) -> anyhow::Result<()> {
        self.update_session_row(
            session_id,
            "session.pause",
            "UPDATE sessions SET is_paused = ?2, updated_at_ms = ?3 WHERE id = ?1",
            rusqlite::params![session_id, is_paused, now_ms()],
            serde_json::json!({ "isPaused": is_paused }),
        )
    }

    pub fn update_turn_index(&self, session_id: &str, turn_index: i64) -> anyhow::Result<()> {
        anyhow::ensure!(turn_index >= 0, "turn index must be non-negative");
        self.update_session_row(
            session_id,
            "session.turn",
            "UPDATE sessions SET turn_index = ?2, updated_at_ms = ?3 WHERE id = ?1",
            rusqlite::params![session_id, turn_index, now_ms()],
            serde_json::json!({ "turnIndex": turn_index }),
        )
    }

    pub fn update_map_view(&self, session_id: &str, view: &MapViewBody) -> anyhow::Result<()> {
        anyhow::ensure!(
            view.camera_x.is_finite() && view.camera_y.is_finite() && view.zoom.is_finite(),
            "map view must be finite"
        );
        self.update_session_row(
            session_id,
            "session.map",
            "UPDATE sessions SET camera_x = ?2, camera_y = ?3, zoom = ?4, sprite_size_percent = ?5,
                                 updated_at_ms = ?6
             WHERE id = ?1",
            rusqlite::params![
                session_id,
                view.camera_x,
                view.camera_y,
                view.zoom,
                view.sprite_size_percent,
                now_ms()
            ],
            serde_json::to_value(view)?,
        )
    }

    fn update_session_row(
        &self,
        session_id: &str,
        kind: &str,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let n = tx.execute(sql, params)?;
        if n == 0 {
            return Err(NotFound(format!("session {session_id}")).into());
        }
        append_event_tx(&tx, kind, session_id, payload)?;
        tx.commit()?;
        Ok(())
    }

    // -- characters -------------------------------------------------------

    pub fn create_character(&self, input: &CreateCharacterInput) -> anyhow::Result<CharacterRow> {
        let conn = self.open()?;
        let id = new_id("chr");
        conn.execute(
            "INSERT INTO characters (id, name, img_src, controller_id, dex_modifier, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &id,
                &input.name,
                &input.img_src,
                &input.controller_id,
                input.dex_modifier,
                now_ms(),
            ),
        )?;
        Ok(CharacterRow {
            character_id: id,
            name: input.name.clone(),
            img_src: input.img_src.clone(),
            controller_id: input.controller_id.clone(),
            dex_modifier: input.dex_modifier,
        })
    }

    /// Puts a character on a session's map. Position and prev-position start equal.
    pub fn place_character(
        &self,
        session_id: &str,
        character_id: &str,
        x: f64,
        y: f64,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(x.is_finite() && y.is_finite(), "position must be finite");
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        ensure_session_tx(&tx, session_id)?;
        let name: Option<String> = tx
            .query_row(
                "SELECT name FROM characters WHERE id = ?1",
                [character_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(name) = name else {
            return Err(NotFound(format!("character {character_id}")).into());
        };
        let taken: i64 = tx.query_row(
            "SELECT COUNT(*) FROM character_in_session cis JOIN characters c ON c.id = cis.character_id
             WHERE cis.session_id = ?1 AND c.name = ?2",
            (session_id, &name),
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(Conflict(format!("name {name} already placed in {session_id}")).into());
        }
        tx.execute(
            "INSERT INTO character_in_session (session_id, character_id, position_x, position_y,
                                               prev_position_x, prev_position_y, initiative, is_dead)
             VALUES (?1, ?2, ?3, ?4, ?3, ?4, 0, 0)",
            (session_id, character_id, x, y),
        )?;
        append_event_tx(
            &tx,
            "character.placed",
            session_id,
            serde_json::json!({ "characterId": character_id, "x": x, "y": y }),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_characters_in_session(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Vec<CharacterRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.img_src, c.controller_id, cis.position_x, cis.position_y,
                    cis.prev_position_x, cis.prev_position_y, cis.initiative, c.dex_modifier,
                    cis.is_dead
             FROM character_in_session cis JOIN characters c ON c.id = cis.character_id
             WHERE cis.session_id = ?1
             ORDER BY cis.rowid",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(CharacterRecord {
                character_id: row.get(0)?,
                name: row.get(1)?,
                img_src: row.get(2)?,
                controller_id: row.get(3)?,
                position_x: row.get(4)?,
                position_y: row.get(5)?,
                prev_position_x: row.get(6)?,
                prev_position_y: row.get(7)?,
                initiative: row.get(8)?,
                dex_modifier: row.get(9)?,
                is_dead: row.get(10)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn update_character_position(
        &self,
        character_id: &str,
        session_id: &str,
        x: f64,
        y: f64,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(x.is_finite() && y.is_finite(), "position must be finite");
        self.update_join_row(
            character_id,
            session_id,
            "character.position",
            "UPDATE character_in_session SET position_x = ?3, position_y = ?4
             WHERE character_id = ?1 AND session_id = ?2",
            rusqlite::params![character_id, session_id, x, y],
            serde_json::json!({ "characterId": character_id, "x": x, "y": y }),
        )
    }

    pub fn update_character_prev_position(
        &self,
        character_id: &str,
        session_id: &str,
        x: f64,
        y: f64,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(x.is_finite() && y.is_finite(), "position must be finite");
        self.update_join_row(
            character_id,
            session_id,
            "character.prev_position",
            "UPDATE character_in_session SET prev_position_x = ?3, prev_position_y = ?4
             WHERE character_id = ?1 AND session_id = ?2",
            rusqlite::params![character_id, session_id, x, y],
            serde_json::json!({ "characterId": character_id, "x": x, "y": y }),
        )
    }

    pub fn update_death_flag(
        &self,
        character_id: &str,
        session_id: &str,
        is_dead: bool,
    ) -> anyhow::Result<()> {
        self.update_join_row(
            character_id,
            session_id,
            "character.death",
            "UPDATE character_in_session SET is_dead = ?3 WHERE character_id = ?1 AND session_id = ?2",
            rusqlite::params![character_id, session_id, is_dead],
            serde_json::json!({ "characterId": character_id, "isDead": is_dead }),
        )
    }

    /// All rows are written in one transaction; a missing row aborts the whole batch.
    pub fn update_initiative_batch(&self, updates: &[InitiativeUpdate]) -> anyhow::Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for u in updates {
            let n = tx.execute(
                "UPDATE character_in_session SET initiative = ?3 WHERE character_id = ?1 AND session_id = ?2",
                (&u.character_id, &u.session_id, u.initiative),
            )?;
            if n == 0 {
                return Err(NotFound(format!(
                    "character {} in session {}",
                    u.character_id, u.session_id
                ))
                .into());
            }
        }
        let mut sessions: Vec<&str> = updates.iter().map(|u| u.session_id.as_str()).collect();
        sessions.sort_unstable();
        sessions.dedup();
        for session_id in sessions {
            append_event_tx(
                &tx,
                "character.initiative",
                session_id,
                serde_json::json!({ "count": updates.len() }),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_join_row(
        &self,
        character_id: &str,
        session_id: &str,
        kind: &str,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let n = tx.execute(sql, params)?;
        if n == 0 {
            return Err(NotFound(format!("character {character_id} in session {session_id}")).into());
        }
        append_event_tx(&tx, kind, session_id, payload)?;
        tx.commit()?;
        Ok(())
    }
}

/// True when `err` (or anything it wraps) is a [`NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NotFound>().is_some()
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Conflict>().is_some()
}

fn session_rev(conn: &Connection, session_id: &str) -> anyhow::Result<i64> {
    let rev: Option<i64> = conn.query_row(
        "SELECT MAX(seq) FROM event_log WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    Ok(rev.unwrap_or(0))
}

fn ensure_session_tx(tx: &rusqlite::Transaction<'_>, session_id: &str) -> anyhow::Result<()> {
    let exists: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sessions WHERE id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(NotFound(format!("session {session_id}")).into());
    }
    Ok(())
}

fn upsert_user_tx(tx: &rusqlite::Transaction<'_>, user: &PlayerRecord) -> anyhow::Result<()> {
    tx.execute(
        "INSERT INTO users (id, name) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        (&user.id, &user.name),
    )?;
    Ok(())
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  map_src TEXT NOT NULL,
  camera_x REAL NOT NULL DEFAULT 0,
  camera_y REAL NOT NULL DEFAULT 0,
  zoom REAL NOT NULL DEFAULT 6,
  sprite_size_percent REAL NOT NULL DEFAULT 10,
  is_paused INTEGER NOT NULL DEFAULT 1,
  dungeon_master_id TEXT NOT NULL REFERENCES users(id),
  turn_index INTEGER NOT NULL DEFAULT 0,
  leash_distance REAL NOT NULL DEFAULT 200,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

-- Ordinal 0 is the dungeon master.
CREATE TABLE IF NOT EXISTS session_players (
  session_id TEXT NOT NULL REFERENCES sessions(id),
  user_id TEXT NOT NULL REFERENCES users(id),
  ordinal INTEGER NOT NULL,
  PRIMARY KEY (session_id, user_id)
);

-- Reusable across sessions.
CREATE TABLE IF NOT EXISTS characters (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  img_src TEXT NOT NULL,
  controller_id TEXT NOT NULL,
  dex_modifier INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS character_in_session (
  session_id TEXT NOT NULL REFERENCES sessions(id),
  character_id TEXT NOT NULL REFERENCES characters(id),
  position_x REAL NOT NULL,
  position_y REAL NOT NULL,
  prev_position_x REAL NOT NULL,
  prev_position_y REAL NOT NULL,
  initiative INTEGER NOT NULL DEFAULT 0,
  is_dead INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (session_id, character_id)
);

CREATE TABLE IF NOT EXISTS event_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  session_id TEXT,
  payload_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_event_log_session ON event_log(session_id);
CREATE INDEX IF NOT EXISTS idx_cis_character ON character_in_session(character_id);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}

fn append_event_tx(
    tx: &rusqlite::Transaction<'_>,
    kind: &str,
    session_id: &str,
    payload: serde_json::Value,
) -> anyhow::Result<i64> {
    let ts = now_ms();
    let payload_json = payload.to_string();
    tx.execute(
        "INSERT INTO event_log (ts_ms, kind, session_id, payload_json) VALUES (?1, ?2, ?3, ?4)",
        (ts, kind, session_id, payload_json),
    )?;
    Ok(tx.last_insert_rowid())
}
