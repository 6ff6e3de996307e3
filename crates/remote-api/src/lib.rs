//! Typed HTTP client for the Cirrus personal-cloud API.
//!
//! The remote exposes a document-oriented REST surface: stat and list by
//! identifier, raw-stream uploads guarded by `Content-MD5`, rename, trash
//! and restore by identifier, and a long-poll `changes?since=<seq>` feed.
//! This crate owns the wire types and the error mapping; policy (retries,
//! conflict handling, ordering) lives in the sync core.

mod client;
mod error;
mod types;

pub use client::RemoteClient;
pub use error::RemoteError;
pub use types::{
	ChangesPage, ClientCredentials, DiskUsage, RemoteChange, RemoteDoc, RemoteDocType,
	TRASH_DIR_ID,
};
