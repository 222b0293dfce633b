use crate::model::Session;

/// Board mode. `Setup` is the DM arranging tokens before play: for the DM, pause and
/// turn checks do not apply and a drop commits the placement outright. Other viewers
/// in `Setup` are treated as in `Play`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Setup,
    #[default]
    Play,
}

impl Mode {
    pub fn is_setup(self) -> bool {
        matches!(self, Mode::Setup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    DungeonMaster,
    Player,
    /// In the session but controls nothing.
    Spectator,
}

impl Role {
    pub fn of(session: &Session, user_id: &str) -> Self {
        if session.is_dungeon_master(user_id) {
            Role::DungeonMaster
        } else if session.controlled_by(user_id).next().is_some() {
            Role::Player
        } else {
            Role::Spectator
        }
    }

    pub fn is_dm(self) -> bool {
        matches!(self, Role::DungeonMaster)
    }
}

/// Who is looking at the board and in which mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: String,
    pub mode: Mode,
}

impl Viewer {
    pub fn new(user_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            user_id: user_id.into(),
            mode,
        }
    }

    pub fn role(&self, session: &Session) -> Role {
        Role::of(session, &self.user_id)
    }
}
