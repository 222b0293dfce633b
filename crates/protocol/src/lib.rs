use serde::{Deserialize, Serialize};

/// Session row as returned by `GET /api/sessions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub map_src: String,
    pub camera_x: f64,
    pub camera_y: f64,
    pub zoom: f64,
    pub sprite_size_percent: f64,
    pub is_paused: bool,
    pub dungeon_master_id: String,
    pub turn_index: i64,
    pub leash_distance: f64,
    /// Ordered; the first entry is the dungeon master.
    #[serde(default)]
    pub players: Vec<PlayerRecord>,
    #[serde(default)]
    pub rev: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub id: String,
    pub name: String,
}

/// Character joined with its per-session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRecord {
    pub character_id: String,
    pub name: String,
    pub img_src: String,
    pub controller_id: String,
    pub position_x: f64,
    pub position_y: f64,
    pub prev_position_x: f64,
    pub prev_position_y: f64,
    pub initiative: i64,
    pub dex_modifier: i64,
    pub is_dead: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionBody {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeUpdate {
    pub character_id: String,
    pub session_id: String,
    pub initiative: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseBody {
    pub is_paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnBody {
    pub turn_index: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeathBody {
    pub is_dead: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapViewBody {
    pub camera_x: f64,
    pub camera_y: f64,
    pub zoom: f64,
    pub sprite_size_percent: f64,
}

/// Body of `POST /api/sessions`. Map settings fall back to the new-session defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionInput {
    pub name: String,
    pub map_src: String,
    pub dungeon_master: PlayerRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leash_distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite_size_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCharacterInput {
    pub name: String,
    pub img_src: String,
    pub controller_id: String,
    #[serde(default)]
    pub dex_modifier: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRow {
    pub character_id: String,
    pub name: String,
    pub img_src: String,
    pub controller_id: String,
    pub dex_modifier: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceCharacterInput {
    pub character_id: String,
    pub x: f64,
    pub y: f64,
}

pub mod defaults {
    pub const CAMERA_X: f64 = 0.0;
    pub const CAMERA_Y: f64 = 0.0;
    pub const ZOOM: f64 = 6.0;
    pub const SPRITE_SIZE_PERCENT: f64 = 10.0;
    pub const LEASH_DISTANCE: f64 = 200.0;
}

pub mod routes {
    pub fn session(session_id: &str) -> String {
        format!("/api/sessions/{session_id}")
    }

    pub fn characters(session_id: &str) -> String {
        format!("/api/sessions/{session_id}/characters")
    }

    pub fn character_field(session_id: &str, character_id: &str, field: &str) -> String {
        format!("/api/sessions/{session_id}/characters/{character_id}/{field}")
    }

    pub fn session_field(session_id: &str, field: &str) -> String {
        format!("/api/sessions/{session_id}/{field}")
    }
}
