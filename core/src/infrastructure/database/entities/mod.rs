//! SeaORM entities backing the metadata store.

pub mod checkpoint;
pub mod document;
