//! Normalized change stream shared by both watchers.
//!
//! Raw OS events and remote feed entries are reduced to this one
//! vocabulary before they reach the merger, so the reconciliation logic
//! never sees platform or protocol detail.

use chrono::{DateTime, Utc};

use super::document::{DocType, RemoteInfo};

/// Descriptive payload accompanying a change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeMeta {
	/// Base64 MD5, present for file changes.
	pub md5sum: Option<String>,
	pub size: Option<u64>,
	pub mtime: Option<DateTime<Utc>>,
	pub executable: bool,
	/// Local inode / file index, when the local watcher observed it.
	pub ino: Option<u64>,
	/// Remote identity, when the remote watcher observed it.
	pub remote: Option<RemoteInfo>,
	pub mime: Option<String>,
	pub class: Option<String>,
	pub tags: Vec<String>,
}

/// One normalized change, in watcher emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
	AddFile { path: String, meta: ChangeMeta },
	AddDir { path: String, meta: ChangeMeta },
	UpdateFile { path: String, meta: ChangeMeta },
	Move { from: String, to: String, doc_type: DocType, meta: ChangeMeta },
	Trash { path: String, doc_type: DocType },
	/// A trashed document came back (remote restore, or a local re-create
	/// matching a tombstone).
	Restore { path: String, doc_type: DocType, meta: ChangeMeta },
}

impl Change {
	/// The path the change applies to; for moves, the destination.
	pub fn path(&self) -> &str {
		match self {
			Self::AddFile { path, .. }
			| Self::AddDir { path, .. }
			| Self::UpdateFile { path, .. }
			| Self::Trash { path, .. }
			| Self::Restore { path, .. } => path,
			Self::Move { to, .. } => to,
		}
	}

	pub fn doc_type(&self) -> DocType {
		match self {
			Self::AddFile { .. } | Self::UpdateFile { .. } => DocType::File,
			Self::AddDir { .. } => DocType::Folder,
			Self::Move { doc_type, .. }
			| Self::Trash { doc_type, .. }
			| Self::Restore { doc_type, .. } => *doc_type,
		}
	}

	/// Short label for logs.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::AddFile { .. } => "add_file",
			Self::AddDir { .. } => "add_dir",
			Self::UpdateFile { .. } => "update_file",
			Self::Move { .. } => "move",
			Self::Trash { .. } => "trash",
			Self::Restore { .. } => "restore",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn move_reports_destination_path() {
		let change = Change::Move {
			from: "old/name".into(),
			to: "new/name".into(),
			doc_type: DocType::Folder,
			meta: ChangeMeta::default(),
		};
		assert_eq!(change.path(), "new/name");
		assert_eq!(change.doc_type(), DocType::Folder);
		assert_eq!(change.kind(), "move");
	}
}
