use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tabletop_protocol::{
    routes, CharacterRecord, DeathBody, InitiativeUpdate, MapViewBody, PauseBody, PositionBody,
    SessionRecord, TurnBody,
};

use crate::api::DataAccess;
use crate::error::{Error, Result};

/// `DataAccess` over the tabletop HTTP API.
#[derive(Debug, Clone)]
pub struct HttpDataAccess {
    base_url: String,
    client: Client,
}

impl HttpDataAccess {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.client.get(self.url(path)).send().await?;
        let resp = check(resp, path).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let resp = self.client.put(self.url(path)).json(body).send().await?;
        check(resp, path).await?;
        Ok(())
    }
}

async fn check(resp: reqwest::Response, path: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound(format!("{path}: {body}")));
    }
    Err(Error::Network(format!("{path}: {status} {body}")))
}

#[async_trait]
impl DataAccess for HttpDataAccess {
    async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.get(&routes::session(session_id)).await
    }

    async fn get_characters_in_session(&self, session_id: &str) -> Result<Vec<CharacterRecord>> {
        self.get(&routes::characters(session_id)).await
    }

    async fn update_character_position(
        &self,
        character_id: &str,
        session_id: &str,
        x: f64,
        y: f64,
    ) -> Result<()> {
        let path = routes::character_field(session_id, character_id, "position");
        self.put(&path, &PositionBody { x, y }).await
    }

    async fn update_character_prev_position(
        &self,
        character_id: &str,
        session_id: &str,
        x: f64,
        y: f64,
    ) -> Result<()> {
        let path = routes::character_field(session_id, character_id, "prev-position");
        self.put(&path, &PositionBody { x, y }).await
    }

    async fn update_initiative_batch(&self, updates: &[InitiativeUpdate]) -> Result<()> {
        let Some(first) = updates.first() else {
            return Ok(());
        };
        let path = routes::session_field(&first.session_id, "initiative");
        self.put(&path, updates).await
    }

    async fn update_pause_flag(&self, session_id: &str, is_paused: bool) -> Result<()> {
        let path = routes::session_field(session_id, "pause");
        self.put(&path, &PauseBody { is_paused }).await
    }

    async fn update_turn_index(&self, session_id: &str, turn_index: i64) -> Result<()> {
        let path = routes::session_field(session_id, "turn");
        self.put(&path, &TurnBody { turn_index }).await
    }

    async fn update_death_flag(
        &self,
        character_id: &str,
        session_id: &str,
        is_dead: bool,
    ) -> Result<()> {
        let path = routes::character_field(session_id, character_id, "death");
        self.put(&path, &DeathBody { is_dead }).await
    }

    async fn update_map_view(&self, session_id: &str, view: &MapViewBody) -> Result<()> {
        let path = routes::session_field(session_id, "map");
        self.put(&path, view).await
    }
}
