//! Document - the catalog entry tracking one file or folder across both sides.
//!
//! A document carries a monotonically increasing revision plus one marker
//! per side recording the last revision that side matched. A side whose
//! marker trails the revision has outstanding work, and the executor will
//! mirror the change onto it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of filesystem entry a document tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
	File,
	Folder,
}

impl std::fmt::Display for DocType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::File => write!(f, "file"),
			Self::Folder => write!(f, "folder"),
		}
	}
}

/// One of the two mirrored stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideName {
	Local,
	Remote,
}

impl SideName {
	pub fn opposite(self) -> Self {
		match self {
			Self::Local => Self::Remote,
			Self::Remote => Self::Local,
		}
	}
}

impl std::fmt::Display for SideName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Local => write!(f, "local"),
			Self::Remote => write!(f, "remote"),
		}
	}
}

/// Last revision at which each side matched the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sides {
	pub local: i64,
	pub remote: i64,
}

impl Sides {
	pub fn get(&self, side: SideName) -> i64 {
		match side {
			SideName::Local => self.local,
			SideName::Remote => self.remote,
		}
	}

	pub fn set(&mut self, side: SideName, rev: i64) {
		match side {
			SideName::Local => self.local = rev,
			SideName::Remote => self.remote = rev,
		}
	}
}

/// Snapshot of the local filesystem's view of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalInfo {
	pub size: u64,
	pub mtime: DateTime<Utc>,
	/// Inode on Unix, file index on Windows.
	pub ino: Option<u64>,
	#[serde(default)]
	pub executable: bool,
}

/// Snapshot of the remote's view of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
	pub id: String,
	pub rev: String,
}

/// Prior state kept while a move is being mirrored to the other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveOrigin {
	pub path: String,
	pub id: String,
	pub ino: Option<u64>,
	pub remote: Option<RemoteInfo>,
}

/// The catalog entry for one (canonical id, kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
	/// Canonical id: the path folded per the local platform's case rules.
	pub id: String,
	/// Canonical forward-slash relative path as last observed.
	pub path: String,
	pub doc_type: DocType,
	/// Local revision; bumped by the merger on every accepted change.
	pub rev: i64,
	pub sides: Sides,
	/// Local inode on Unix, file index on Windows.
	pub ino: Option<u64>,
	pub local: Option<LocalInfo>,
	pub remote: Option<RemoteInfo>,
	/// Base64 MD5 of the content. Always set for files, never for folders.
	pub md5sum: Option<String>,
	pub size: Option<u64>,
	#[serde(default)]
	pub executable: bool,
	pub class: Option<String>,
	pub mime: Option<String>,
	#[serde(default)]
	pub tags: Vec<String>,
	pub updated_at: DateTime<Utc>,
	/// Executor retry counter.
	#[serde(default)]
	pub errors: i32,
	/// Set while a move awaits mirroring on the opposite side.
	pub move_from: Option<MoveOrigin>,
	/// Tombstone; kept until both sides acknowledge the deletion.
	#[serde(default)]
	pub deleted: bool,
	/// Set while a revival awaits an untrash on the opposite side.
	#[serde(default)]
	pub restored: bool,
	/// Store commit sequence, assigned on every put.
	#[serde(default)]
	pub seq: i64,
}

impl Document {
	/// First sighting of a resource by one side.
	pub fn new(id: String, path: String, doc_type: DocType, side: SideName) -> Self {
		let mut sides = Sides::default();
		sides.set(side, 1);
		Self {
			id,
			path,
			doc_type,
			rev: 1,
			sides,
			ino: None,
			local: None,
			remote: None,
			md5sum: None,
			size: None,
			executable: false,
			class: None,
			mime: None,
			tags: Vec::new(),
			updated_at: Utc::now(),
			errors: 0,
			move_from: None,
			deleted: false,
			restored: false,
			seq: 0,
		}
	}

	pub fn is_file(&self) -> bool {
		self.doc_type == DocType::File
	}

	pub fn is_folder(&self) -> bool {
		self.doc_type == DocType::Folder
	}

	pub fn is_up_to_date(&self, side: SideName) -> bool {
		self.sides.get(side) == self.rev
	}

	/// The side with outstanding work, if any.
	///
	/// When both trail the revision the older one wins, which only happens
	/// transiently while a first-sync merge is in flight.
	pub fn dirty_side(&self) -> Option<SideName> {
		let local = self.sides.local;
		let remote = self.sides.remote;
		if local == self.rev && remote == self.rev {
			None
		} else if local <= remote {
			Some(SideName::Local)
		} else {
			Some(SideName::Remote)
		}
	}

	/// Records a change observed by `side`: the revision advances and the
	/// observing side is marked current, leaving the other side dirty.
	///
	/// A fresh revision also clears the retry counter, so a parked
	/// document gets another chance once its upstream state changes.
	pub fn bump(&mut self, side: SideName) {
		self.rev += 1;
		self.sides.set(side, self.rev);
		self.updated_at = Utc::now();
		self.errors = 0;
	}

	/// Marks `side` as having mirrored the document at its current revision.
	pub fn acknowledge(&mut self, side: SideName) {
		self.sides.set(side, self.rev);
	}

	/// Marks both sides current at the present revision (first-sync merge).
	pub fn mark_in_sync(&mut self) {
		self.sides.local = self.rev;
		self.sides.remote = self.rev;
		self.errors = 0;
	}

	/// Both sides have acknowledged the tombstone.
	pub fn fully_deleted(&self) -> bool {
		self.deleted && self.sides.local == self.rev && self.sides.remote == self.rev
	}

	/// Invariant check: no side marker may pass the revision.
	pub fn sides_consistent(&self) -> bool {
		self.sides.local <= self.rev && self.sides.remote <= self.rev
	}
}
