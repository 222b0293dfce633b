use serde::{Deserialize, Serialize};
use tabletop_protocol::{CharacterRecord, PlayerRecord, SessionRecord};

/// A point in map or screen space, depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl std::ops::Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width.is_finite() && self.height.is_finite())
            || self.width <= 0.0
            || self.height <= 0.0
    }
}

/// On-screen box of the map plus the natural size of the map image.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    /// Top-left corner of the rendered box in pointer space.
    pub origin: Point,
    pub size: Size,
    /// Natural size of the map image.
    pub full: Size,
}

impl Viewport {
    pub fn new(origin: Point, size: Size, full: Size) -> Self {
        Self { origin, size, full }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub img_src: String,
    pub controller_id: String,
    pub position: Point,
    /// Last committed position; moves only when a turn (or a setup placement) is committed.
    pub prev_position: Point,
    pub initiative: i64,
    pub dex_modifier: i64,
    pub is_dead: bool,
}

impl From<CharacterRecord> for Character {
    fn from(r: CharacterRecord) -> Self {
        Self {
            id: r.character_id,
            name: r.name,
            img_src: r.img_src,
            controller_id: r.controller_id,
            position: Point::new(r.position_x, r.position_y),
            prev_position: Point::new(r.prev_position_x, r.prev_position_y),
            initiative: r.initiative,
            dex_modifier: r.dex_modifier,
            is_dead: r.is_dead,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: String,
}

impl From<PlayerRecord> for Player {
    fn from(r: PlayerRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSettings {
    pub img_src: String,
    pub camera: Point,
    pub zoom: f64,
    pub sprite_size_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub map: MapSettings,
    /// The first entry is the dungeon master.
    pub players: Vec<Player>,
    pub dungeon_master_id: String,
    pub is_paused: bool,
    pub turn_index: usize,
    pub leash_distance: f64,
    pub characters: Vec<Character>,
}

impl Session {
    pub fn character(&self, id: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.id == id)
    }

    pub fn character_mut(&mut self, id: &str) -> Option<&mut Character> {
        self.characters.iter_mut().find(|c| c.id == id)
    }

    pub fn is_dungeon_master(&self, user_id: &str) -> bool {
        self.dungeon_master_id == user_id
    }

    pub fn controlled_by<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a Character> {
        self.characters
            .iter()
            .filter(move |c| c.controller_id == user_id)
    }
}

/// A polled pair of `getSession` + `getCharactersInSession`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSnapshot {
    pub session: SessionRecord,
    pub characters: Vec<CharacterRecord>,
}

impl ServerSnapshot {
    pub fn into_session(self) -> Session {
        let s = self.session;
        Session {
            id: s.id,
            name: s.name,
            map: MapSettings {
                img_src: s.map_src,
                camera: Point::new(s.camera_x, s.camera_y),
                zoom: s.zoom,
                sprite_size_percent: s.sprite_size_percent,
            },
            players: s.players.into_iter().map(Player::from).collect(),
            dungeon_master_id: s.dungeon_master_id,
            is_paused: s.is_paused,
            turn_index: usize::try_from(s.turn_index).unwrap_or(0),
            leash_distance: s.leash_distance,
            characters: self.characters.into_iter().map(Character::from).collect(),
        }
    }
}
