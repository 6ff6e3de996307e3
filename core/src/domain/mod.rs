//! Domain model of the sync core.

pub mod change;
pub mod document;

pub use change::{Change, ChangeMeta};
pub use document::{DocType, Document, LocalInfo, MoveOrigin, RemoteInfo, SideName, Sides};
