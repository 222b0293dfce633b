//! Umbrella crate for the tabletop workspace.
//!
//! Re-exports the core, engine and protocol crates so downstream code can depend on a
//! single crate name (`tabletop`).

pub use tabletop_core as core;
pub use tabletop_engine as engine;
pub use tabletop_protocol as protocol;
