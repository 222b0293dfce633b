use super::*;
use axum::body::Body;
use axum::http::{header, Request};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tabletop_core::sync::{poll_once, PollOutcome};
use tabletop_core::{
    DataAccess, HttpDataAccess, Mode, Point, Size, SyncConfig, TableClient, Viewer, Viewport,
};
use tower::ServiceExt;

static DB_COUNTER: AtomicU64 = AtomicU64::new(1);

fn temp_engine() -> Engine {
    let p = std::env::temp_dir().join(format!(
        "tabletop-server-test-{}-{}.db",
        time::OffsetDateTime::now_utc().unix_timestamp_nanos(),
        DB_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let engine = Engine::new(p);
    let _ = engine.open().expect("open db");
    engine
}

fn state(engine: &Engine) -> State<Arc<AppState>> {
    State(Arc::new(AppState {
        engine: engine.clone(),
    }))
}

fn session_input() -> CreateSessionInput {
    CreateSessionInput {
        name: "Crypt".to_string(),
        map_src: "/img/dungeonmap.jpg".to_string(),
        dungeon_master: PlayerRecord {
            id: "dm".to_string(),
            name: "Dungeon Master".to_string(),
        },
        leash_distance: None,
        zoom: None,
        sprite_size_percent: None,
    }
}

async fn seed_session(engine: &Engine) -> SessionRecord {
    let (status, Json(session)) = create_session(state(engine), Json(session_input()))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::CREATED);
    session
}

async fn seed_character(engine: &Engine, session_id: &str, name: &str, controller: &str) -> String {
    let (_, Json(row)) = create_character(
        state(engine),
        Json(CreateCharacterInput {
            name: name.to_string(),
            img_src: format!("/img/{name}.png"),
            controller_id: controller.to_string(),
            dex_modifier: 1,
        }),
    )
    .await
    .unwrap();
    let status = place_character(
        state(engine),
        Path(session_id.to_string()),
        Json(PlaceCharacterInput {
            character_id: row.character_id.clone(),
            x: 50.0,
            y: 50.0,
        }),
    )
    .await
    .unwrap();
    assert_eq!(status, StatusCode::CREATED);
    row.character_id
}

#[tokio::test]
async fn new_session_starts_paused_with_default_map() {
    let engine = temp_engine();
    let created = seed_session(&engine).await;

    let Json(session) = get_session(state(&engine), Path(created.id.clone()))
        .await
        .unwrap();
    assert!(session.is_paused);
    assert_eq!(session.zoom, 6.0);
    assert_eq!(session.sprite_size_percent, 10.0);
    assert_eq!(session.leash_distance, 200.0);
    assert_eq!(session.turn_index, 0);
    assert_eq!(session.players[0].id, "dm");
}

#[tokio::test]
async fn invited_players_follow_the_dungeon_master() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;
    let players = vec![
        PlayerRecord {
            id: "p1".to_string(),
            name: "Ayla".to_string(),
        },
        PlayerRecord {
            id: "p2".to_string(),
            name: "Bram".to_string(),
        },
    ];
    add_players(state(&engine), Path(session.id.clone()), Json(players))
        .await
        .unwrap();
    let Json(session) = get_session(state(&engine), Path(session.id)).await.unwrap();
    let ids: Vec<&str> = session.players.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["dm", "p1", "p2"]);
}

#[tokio::test]
async fn position_write_leaves_prev_position() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;
    let cid = seed_character(&engine, &session.id, "Hero", "p1").await;

    let status = put_position(
        state(&engine),
        Path((session.id.clone(), cid.clone())),
        Json(PositionBody { x: 80.0, y: 90.0 }),
    )
    .await
    .unwrap();
    assert_eq!(status, StatusCode::NO_CONTENT);

    let Json(chars) = list_characters(state(&engine), Path(session.id.clone()))
        .await
        .unwrap();
    assert_eq!(chars.len(), 1);
    assert_eq!((chars[0].position_x, chars[0].position_y), (80.0, 90.0));
    assert_eq!((chars[0].prev_position_x, chars[0].prev_position_y), (50.0, 50.0));

    put_prev_position(
        state(&engine),
        Path((session.id.clone(), cid)),
        Json(PositionBody { x: 80.0, y: 90.0 }),
    )
    .await
    .unwrap();
    let Json(chars) = list_characters(state(&engine), Path(session.id)).await.unwrap();
    assert_eq!(chars[0].prev_position_x, 80.0);
}

#[tokio::test]
async fn unknown_rows_are_404() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;

    let (status, _) = get_session(state(&engine), Path("missing".to_string()))
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = list_characters(state(&engine), Path("missing".to_string()))
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = put_position(
        state(&engine),
        Path((session.id.clone(), "chr-missing".to_string())),
        Json(PositionBody { x: 1.0, y: 1.0 }),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = put_pause(
        state(&engine),
        Path("missing".to_string()),
        Json(PauseBody { is_paused: false }),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_npc_name_is_a_conflict() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;
    seed_character(&engine, &session.id, "Goblin", "dm").await;

    let (_, Json(second)) = create_character(
        state(&engine),
        Json(CreateCharacterInput {
            name: "Goblin".to_string(),
            img_src: "/img/goblin.png".to_string(),
            controller_id: "dm".to_string(),
            dex_modifier: 0,
        }),
    )
    .await
    .unwrap();
    let (status, _) = place_character(
        state(&engine),
        Path(session.id.clone()),
        Json(PlaceCharacterInput {
            character_id: second.character_id,
            x: 0.0,
            y: 0.0,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn initiative_batch_must_target_the_path_session() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;
    let cid = seed_character(&engine, &session.id, "Hero", "p1").await;

    let (status, _) = put_initiative(
        state(&engine),
        Path(session.id.clone()),
        Json(vec![InitiativeUpdate {
            character_id: cid.clone(),
            session_id: "elsewhere".to_string(),
            initiative: 12,
        }]),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    put_initiative(
        state(&engine),
        Path(session.id.clone()),
        Json(vec![InitiativeUpdate {
            character_id: cid,
            session_id: session.id.clone(),
            initiative: 12,
        }]),
    )
    .await
    .unwrap();
    let Json(chars) = list_characters(state(&engine), Path(session.id)).await.unwrap();
    assert_eq!(chars[0].initiative, 12);
}

#[tokio::test]
async fn turn_pause_and_map_updates_bump_rev() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;
    let before = session.rev;

    put_pause(
        state(&engine),
        Path(session.id.clone()),
        Json(PauseBody { is_paused: false }),
    )
    .await
    .unwrap();
    put_turn(
        state(&engine),
        Path(session.id.clone()),
        Json(TurnBody { turn_index: 2 }),
    )
    .await
    .unwrap();
    put_map(
        state(&engine),
        Path(session.id.clone()),
        Json(MapViewBody {
            camera_x: -100.0,
            camera_y: -50.0,
            zoom: 7.0,
            sprite_size_percent: 12.0,
        }),
    )
    .await
    .unwrap();

    let (status, _) = put_turn(
        state(&engine),
        Path(session.id.clone()),
        Json(TurnBody { turn_index: -1 }),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let Json(after) = get_session(state(&engine), Path(session.id)).await.unwrap();
    assert!(!after.is_paused);
    assert_eq!(after.turn_index, 2);
    assert_eq!((after.camera_x, after.camera_y, after.zoom), (-100.0, -50.0, 7.0));
    assert_eq!(after.sprite_size_percent, 12.0);
    assert!(after.rev > before);
}

#[tokio::test]
async fn death_flag_round_trips() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;
    let cid = seed_character(&engine, &session.id, "Orc", "dm").await;
    put_death(
        state(&engine),
        Path((session.id.clone(), cid)),
        Json(DeathBody { is_dead: true }),
    )
    .await
    .unwrap();
    let Json(chars) = list_characters(state(&engine), Path(session.id)).await.unwrap();
    assert!(chars[0].is_dead);
}

#[tokio::test]
async fn deleted_session_is_gone() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;
    seed_character(&engine, &session.id, "Hero", "p1").await;

    let status = delete_session(state(&engine), Path(session.id.clone()))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = delete_session(state(&engine), Path(session.id.clone()))
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::NOT_FOUND);

    let conn = engine.open().unwrap();
    let left: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM character_in_session WHERE session_id = ?1",
            [&session.id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(left, 0);
}

fn router(engine: &Engine) -> Router {
    build_router(
        AppState {
            engine: engine.clone(),
        },
        vec!["https://table.example.com".to_string()],
    )
}

#[tokio::test]
async fn router_maps_missing_and_malformed_requests() {
    let engine = temp_engine();
    let app = router(&engine);

    let res = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(
            Request::get("/api/sessions/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app
        .oneshot(
            Request::put("/api/sessions/missing/pause")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"paused": "yes"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(res.status().is_client_error());
    assert_ne!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_allows_loopback_and_configured_origins_only() {
    let engine = temp_engine();
    let app = router(&engine);

    for (origin, allowed) in [
        ("http://localhost:5173", true),
        ("http://127.0.0.1:3000", true),
        ("https://table.example.com", true),
        ("https://evil.example.com", false),
        ("http://localhost.evil.example.com", false),
    ] {
        let res = app
            .clone()
            .oneshot(
                Request::get("/health")
                    .header(header::ORIGIN, origin)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let echoed = res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN);
        assert_eq!(echoed.is_some(), allowed, "origin {origin}");
        if let Some(v) = echoed {
            assert_ne!(v, "*");
        }
    }
}

#[test]
fn cli_flags_override_the_config_file() {
    let file: FileConfig = serde_yaml::from_str(
        "addr: 0.0.0.0:8080\ndb_path: /var/lib/tabletop.db\nallowed_origins:\n  - https://table.example.com\n",
    )
    .unwrap();

    let merged = ServerConfig::merge(&Cli::default(), file.clone());
    assert_eq!(merged.addr, "0.0.0.0:8080".parse().unwrap());
    assert_eq!(merged.db_path, std::path::PathBuf::from("/var/lib/tabletop.db"));
    assert_eq!(merged.allowed_origins, vec!["https://table.example.com"]);

    let cli = Cli {
        addr: Some("127.0.0.1:9000".parse().unwrap()),
        db: Some("/tmp/t.db".into()),
        config: None,
    };
    let merged = ServerConfig::merge(&cli, file);
    assert_eq!(merged.addr.port(), 9000);
    assert_eq!(merged.db_path, std::path::PathBuf::from("/tmp/t.db"));

    let defaults = ServerConfig::merge(&Cli::default(), FileConfig::default());
    assert_eq!(defaults.addr.port(), DEFAULT_PORT);
    assert!(defaults.addr.ip().is_loopback());
    assert!(defaults.db_path.ends_with(".tabletop/tabletop.db"));
}

#[test]
fn unknown_config_keys_are_rejected() {
    let err = serde_yaml::from_str::<FileConfig>("port: 80\n");
    assert!(err.is_err());
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn stored_hero(engine: &Engine, session_id: &str) -> CharacterRecord {
    engine
        .get_characters_in_session(session_id)
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
}

#[tokio::test]
async fn table_client_plays_a_turn_over_http() {
    let engine = temp_engine();
    let session = seed_session(&engine).await;
    let hero = seed_character(&engine, &session.id, "Hero", "p1").await;
    engine
        .add_players(
            &session.id,
            &[PlayerRecord {
                id: "p1".to_string(),
                name: "Ayla".to_string(),
            }],
        )
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        addr,
        db_path: engine.db_path().to_path_buf(),
        allowed_origins: vec![],
    };
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve_listener(listener, config, async {
        let _ = stopped.await;
    }));

    let api: Arc<dyn DataAccess> = Arc::new(HttpDataAccess::new(format!("http://{addr}/")));
    assert!(matches!(
        api.get_session("missing").await,
        Err(tabletop_core::Error::NotFound(_))
    ));

    // New sessions start paused; rolling initiative starts play.
    let dm = TableClient::connect(api.clone(), &session.id, Viewer::new("dm", Mode::Play), SyncConfig::default())
        .await
        .unwrap();
    assert!(dm.role().is_dm());
    let rolls = dm.roll_initiative(&mut StdRng::seed_from_u64(7)).unwrap();
    wait_for("initiative", || {
        let paused = engine.get_session(&session.id).unwrap().map(|s| s.is_paused);
        paused == Some(false) && Some(&stored_hero(&engine, &session.id).initiative) == rolls.get(&hero)
    })
    .await;

    let mut player = TableClient::connect(api.clone(), &session.id, Viewer::new("p1", Mode::Play), SyncConfig::default())
        .await
        .unwrap();
    player.set_viewport(Viewport::new(
        Point::ORIGIN,
        Size::new(500.0, 500.0),
        Size::new(2000.0, 2000.0),
    ));
    player.pointer_down(&hero, Point::new(55.0, 55.0)).unwrap();
    player.pointer_move(&hero, Point::new(105.0, 85.0));
    player.pointer_up();
    wait_for("position write", || {
        let c = stored_hero(&engine, &session.id);
        (c.position_x, c.position_y) == (100.0, 80.0)
    })
    .await;
    let c = stored_hero(&engine, &session.id);
    assert_eq!((c.prev_position_x, c.prev_position_y), (50.0, 50.0));

    assert_eq!(player.end_turn(), Ok(0));
    wait_for("committed position", || {
        let c = stored_hero(&engine, &session.id);
        (c.prev_position_x, c.prev_position_y) == (100.0, 80.0)
    })
    .await;

    assert_eq!(poll_once(api.as_ref(), dm.store()).await, PollOutcome::Applied);
    let seen = dm.store().read(|s| s.character(&hero).map(|c| c.position));
    assert_eq!(seen, Some(Point::new(100.0, 80.0)));

    drop(player);
    drop(dm);
    drop(api);
    let _ = stop.send(());
    server.await.unwrap().unwrap();
}
