use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tabletop_engine::{is_conflict, is_not_found, Engine};
use tabletop_protocol::{
    CharacterRecord, CharacterRow, CreateCharacterInput, CreateSessionInput, DeathBody,
    InitiativeUpdate, MapViewBody, PauseBody, PlaceCharacterInput, PlayerRecord, PositionBody,
    SessionRecord, TurnBody,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

mod config;

pub use config::{default_db_path, Cli, FileConfig, ServerConfig, DEFAULT_PORT};

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: AppState, allowed_origins: Vec<String>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/{id}/players", post(add_players))
        .route(
            "/api/sessions/{id}/characters",
            get(list_characters).post(place_character),
        )
        .route(
            "/api/sessions/{id}/characters/{cid}/position",
            put(put_position),
        )
        .route(
            "/api/sessions/{id}/characters/{cid}/prev-position",
            put(put_prev_position),
        )
        .route(
            "/api/sessions/{id}/characters/{cid}/death",
            put(put_death),
        )
        .route("/api/sessions/{id}/initiative", put(put_initiative))
        .route("/api/sessions/{id}/pause", put(put_pause))
        .route("/api/sessions/{id}/turn", put(put_turn))
        .route("/api/sessions/{id}/map", put(put_map))
        .route("/api/characters", post(create_character))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        // Browsers on other machines must be listed explicitly; never `*`.
        .layer(local_cors(allowed_origins))
}

fn api_error(err: anyhow::Error) -> ApiError {
    if is_not_found(&err) {
        return (StatusCode::NOT_FOUND, err.to_string());
    }
    if is_conflict(&err) {
        return (StatusCode::CONFLICT, err.to_string());
    }
    error!(error = %format!("{err:#}"), "storage failure");
    (StatusCode::INTERNAL_SERVER_ERROR, "storage failure".to_string())
}

fn unprocessable(msg: impl Into<String>) -> ApiError {
    (StatusCode::UNPROCESSABLE_ENTITY, msg.into())
}

async fn health() -> &'static str {
    "ok"
}

// -- sessions ---------------------------------------------------------------

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateSessionInput>,
) -> ApiResult<(StatusCode, Json<SessionRecord>)> {
    let session = state.engine.create_session(&input).map_err(api_error)?;
    info!(session = %session.id, dm = %session.dungeon_master_id, "session created");
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionRecord>> {
    match state.engine.get_session(&id).map_err(api_error)? {
        Some(session) => Ok(Json(session)),
        None => Err((StatusCode::NOT_FOUND, format!("session {id}"))),
    }
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.engine.delete_session(&id).map_err(api_error)? {
        info!(session = %id, "session deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("session {id}")))
    }
}

async fn add_players(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(players): Json<Vec<PlayerRecord>>,
) -> ApiResult<StatusCode> {
    state.engine.add_players(&id, &players).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_initiative(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(updates): Json<Vec<InitiativeUpdate>>,
) -> ApiResult<StatusCode> {
    if let Some(u) = updates.iter().find(|u| u.session_id != id) {
        return Err(unprocessable(format!(
            "update for {} targets session {}",
            u.character_id, u.session_id
        )));
    }
    state
        .engine
        .update_initiative_batch(&updates)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PauseBody>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .update_pause_flag(&id, body.is_paused)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_turn(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<TurnBody>,
) -> ApiResult<StatusCode> {
    if body.turn_index < 0 {
        return Err(unprocessable("turnIndex must not be negative"));
    }
    state
        .engine
        .update_turn_index(&id, body.turn_index)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_map(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MapViewBody>,
) -> ApiResult<StatusCode> {
    if !(body.zoom > 0.0 && body.sprite_size_percent > 0.0) {
        return Err(unprocessable("zoom and spriteSizePercent must be positive"));
    }
    state.engine.update_map_view(&id, &body).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- characters -------------------------------------------------------------

async fn create_character(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateCharacterInput>,
) -> ApiResult<(StatusCode, Json<CharacterRow>)> {
    let row = state.engine.create_character(&input).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn list_characters(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<CharacterRecord>>> {
    if state.engine.get_session(&id).map_err(api_error)?.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("session {id}")));
    }
    let characters = state
        .engine
        .get_characters_in_session(&id)
        .map_err(api_error)?;
    Ok(Json(characters))
}

async fn place_character(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<PlaceCharacterInput>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .place_character(&id, &input.character_id, input.x, input.y)
        .map_err(api_error)?;
    Ok(StatusCode::CREATED)
}

async fn put_position(
    State(state): State<Arc<AppState>>,
    Path((id, cid)): Path<(String, String)>,
    Json(body): Json<PositionBody>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .update_character_position(&cid, &id, body.x, body.y)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_prev_position(
    State(state): State<Arc<AppState>>,
    Path((id, cid)): Path<(String, String)>,
    Json(body): Json<PositionBody>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .update_character_prev_position(&cid, &id, body.x, body.y)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_death(
    State(state): State<Arc<AppState>>,
    Path((id, cid)): Path<(String, String)>,
    Json(body): Json<DeathBody>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .update_death_flag(&cid, &id, body.is_dead)
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- serving ----------------------------------------------------------------

pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    serve_listener(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    config: ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let engine = Engine::new(&config.db_path);
    // Fail fast if the database cannot be opened or migrated.
    engine.open()?;
    let app = build_router(AppState { engine }, config.allowed_origins);
    let addr = listener.local_addr()?;
    info!(%addr, db = %config.db_path.display(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("shut down");
    Ok(addr)
}

fn local_cors(allowed_origins: Vec<String>) -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    let allowed = Arc::new(allowed_origins);
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _req| is_allowed_origin(origin, &allowed),
        ))
}

fn is_allowed_origin(origin: &axum::http::HeaderValue, allowed: &[String]) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    if allowed.iter().any(|a| a.trim_end_matches('/') == s) {
        return true;
    }
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // Origin is just scheme://host[:port]
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}

#[cfg(test)]
mod tests;
