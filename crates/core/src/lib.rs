//! Session sync and movement engine for a shared virtual tabletop.
//!
//! Each client keeps an optimistic copy of the session in a [`SessionStore`]. Local
//! drags write to it immediately and reach the server through a debounced
//! [`SyncScheduler`]; a poller merges server state back in whenever no token is being
//! dragged. [`TableClient`] wires these together for one viewer.

pub mod api;
pub mod client;
pub mod coords;
pub mod drag;
pub mod error;
pub mod http;
pub mod leash;
pub mod mode;
pub mod model;
pub mod store;
pub mod sync;
pub mod turns;

pub use api::{DataAccess, MemoryDataAccess};
pub use client::TableClient;
pub use drag::{DragController, DragState, Frame, Rejection};
pub use error::{Error, Result};
pub use http::HttpDataAccess;
pub use leash::{Direction, PanOutcome};
pub use mode::{Mode, Role, Viewer};
pub use model::{Character, MapSettings, Player, Point, ServerSnapshot, Session, Size, Viewport};
pub use store::{CameraView, SessionStore, SnapshotOutcome};
pub use sync::{PollHandle, SyncConfig, SyncKey, SyncScheduler};
