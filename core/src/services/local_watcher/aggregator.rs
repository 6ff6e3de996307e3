//! Event aggregation and move reconstruction.
//!
//! Most platforms report a rename as an unordered `deleted`/`created`
//! pair. Raw events are buffered for a short window and matched here:
//! by inode, then (optionally) by digest and size, then by canonical-id
//! case folding. Whatever stays unmatched falls out as plain trash or
//! add events.

use chrono::{DateTime, Utc};

use crate::domain::{Change, ChangeMeta, DocType};
use crate::shared::path as syncpath;

/// Raw observation, already canonicalized and enriched.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
	pub kind: RawKind,
	pub path: String,
	pub doc_type: DocType,
	pub ino: Option<u64>,
	pub size: Option<u64>,
	pub mtime: Option<DateTime<Utc>>,
	pub md5sum: Option<String>,
	pub executable: bool,
	/// Path the catalog tracks under this event's canonical id, when it
	/// differs from `path` only in case. Set by the enrichment step on
	/// case-insensitive platforms.
	pub prior_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
	Created,
	Modified,
	Deleted,
}

impl RawEvent {
	fn meta(&self) -> ChangeMeta {
		ChangeMeta {
			md5sum: self.md5sum.clone(),
			size: self.size,
			mtime: self.mtime,
			executable: self.executable,
			ino: self.ino,
			remote: None,
			mime: None,
			class: None,
			tags: Vec::new(),
		}
	}
}

/// Buffers raw events for one aggregation window.
#[derive(Debug)]
pub struct Aggregator {
	pending: Vec<RawEvent>,
	/// Match delete/create pairs on digest+size when inodes disagree.
	optimistic_moves: bool,
}

impl Aggregator {
	pub fn new(optimistic_moves: bool) -> Self {
		Self { pending: Vec::new(), optimistic_moves }
	}

	pub fn push(&mut self, event: RawEvent) {
		self.pending.push(event);
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	/// Closes the window: reconstructs moves, suppresses descendant noise,
	/// and returns the normalized changes in a merge-friendly order.
	pub fn flush(&mut self) -> Vec<Change> {
		let events = std::mem::take(&mut self.pending);

		let mut deleted: Vec<RawEvent> = Vec::new();
		let mut created: Vec<RawEvent> = Vec::new();
		let mut modified: Vec<RawEvent> = Vec::new();
		for event in events {
			match event.kind {
				RawKind::Deleted => deleted.push(event),
				RawKind::Created => created.push(event),
				RawKind::Modified => {
					// The last observation of a path wins.
					modified.retain(|m: &RawEvent| m.path != event.path);
					modified.push(event);
				}
			}
		}

		let mut moves: Vec<(RawEvent, RawEvent)> = Vec::new();

		// 1. Inode pairing: the strongest signal a delete+create is a move.
		pair_off(&mut deleted, &mut created, &mut moves, |d, c| {
			d.ino.is_some() && d.ino == c.ino
		});

		// 2. Same content at a new inode: optimistically a move (copy-based
		// editors, some network filesystems).
		if self.optimistic_moves {
			pair_off(&mut deleted, &mut created, &mut moves, |d, c| {
				d.doc_type == DocType::File
					&& d.md5sum.is_some()
					&& d.md5sum == c.md5sum
					&& d.size == c.size
			});
		}

		// 3. Case rename: a creation whose canonical id the catalog already
		// tracks under a different spelling, with no deletion in sight.
		let mut case_renames: Vec<RawEvent> = Vec::new();
		created.retain(|c| {
			if c.prior_path.is_some() && c.prior_path.as_deref() != Some(c.path.as_str()) {
				case_renames.push(c.clone());
				false
			} else {
				true
			}
		});

		// 6. A moved directory drags its subtree along; drop descendant
		// events the parent move already explains.
		let dir_moves: Vec<(String, String)> = moves
			.iter()
			.filter(|(d, _)| d.doc_type == DocType::Folder)
			.map(|(d, c)| (d.path.clone(), c.path.clone()))
			.collect();
		suppress_descendants(&dir_moves, &mut deleted, &mut created, &mut modified, &mut moves);

		let mut changes = Vec::new();

		// Moves first, parents before children.
		moves.sort_by_key(|(d, _)| syncpath::depth(&d.path));
		for (d, c) in moves {
			changes.push(Change::Move {
				from: d.path,
				to: c.path.clone(),
				doc_type: c.doc_type,
				meta: c.meta(),
			});
		}
		for c in case_renames {
			changes.push(Change::Move {
				from: c.prior_path.clone().expect("case rename has a prior path"),
				to: c.path.clone(),
				doc_type: c.doc_type,
				meta: c.meta(),
			});
		}

		// 5. Unmatched creations, parents before children.
		created.sort_by_key(|c| syncpath::depth(&c.path));
		for c in created {
			let change = match c.doc_type {
				DocType::Folder => Change::AddDir { path: c.path.clone(), meta: c.meta() },
				DocType::File => Change::AddFile { path: c.path.clone(), meta: c.meta() },
			};
			changes.push(change);
		}

		for m in modified {
			if m.doc_type == DocType::File {
				changes.push(Change::UpdateFile { path: m.path.clone(), meta: m.meta() });
			}
		}

		// 4. Unmatched deletions become trash, children before parents.
		deleted.sort_by_key(|d| std::cmp::Reverse(syncpath::depth(&d.path)));
		for d in deleted {
			changes.push(Change::Trash { path: d.path.clone(), doc_type: d.doc_type });
		}

		changes
	}
}

fn pair_off(
	deleted: &mut Vec<RawEvent>,
	created: &mut Vec<RawEvent>,
	moves: &mut Vec<(RawEvent, RawEvent)>,
	matches: impl Fn(&RawEvent, &RawEvent) -> bool,
) {
	let mut remaining: Vec<RawEvent> = Vec::new();
	while let Some(d) = deleted.pop() {
		match created.iter().position(|c| matches(&d, c)) {
			Some(idx) => {
				let c = created.remove(idx);
				moves.push((d, c));
			}
			None => remaining.push(d),
		}
	}
	deleted.extend(remaining);
}

fn suppress_descendants(
	dir_moves: &[(String, String)],
	deleted: &mut Vec<RawEvent>,
	created: &mut Vec<RawEvent>,
	modified: &mut Vec<RawEvent>,
	moves: &mut Vec<(RawEvent, RawEvent)>,
) {
	if dir_moves.is_empty() {
		return;
	}
	let inside_from =
		|path: &str| dir_moves.iter().any(|(from, _)| syncpath::is_inside(from, path));
	let consistent_move = |from_path: &str, to_path: &str| {
		dir_moves.iter().any(|(from, to)| {
			syncpath::is_inside(from, from_path)
				&& syncpath::is_inside(to, to_path)
				&& syncpath::rebase(from_path, from, to) == to_path
		})
	};
	// A suppressed pair whose content changed in the same window (move
	// then edit) still owes the merger an update at the new path.
	let mut surviving_updates: Vec<RawEvent> = Vec::new();
	let mut keep_as_update = |d: &RawEvent, c: &RawEvent| {
		if c.doc_type == DocType::File && d.md5sum != c.md5sum {
			let mut update = c.clone();
			update.kind = RawKind::Modified;
			surviving_updates.push(update);
		}
	};

	// Deletions under the old location and creations that are exactly the
	// rebased counterpart are explained by the parent's move.
	let explained: Vec<RawEvent> = deleted
		.iter()
		.filter(|d| inside_from(&d.path))
		.cloned()
		.collect();
	deleted.retain(|d| !inside_from(&d.path));
	created.retain(|c| {
		match explained
			.iter()
			.find(|d| consistent_move(&d.path, &c.path))
		{
			Some(d) => {
				keep_as_update(d, c);
				false
			}
			None => true,
		}
	});
	modified.retain(|m| !inside_from(&m.path));
	// Child moves the pairing pass formed before the parent was
	// recognized. Containment is strict, so a parent move is never
	// consistent with itself.
	moves.retain(|(d, c)| {
		if consistent_move(&d.path, &c.path) {
			keep_as_update(d, c);
			false
		} else {
			true
		}
	});
	drop(keep_as_update);
	modified.extend(surviving_updates);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::shared::digest::digest_bytes;

	fn created_file(path: &str, ino: u64, content: &[u8]) -> RawEvent {
		RawEvent {
			kind: RawKind::Created,
			path: path.to_string(),
			doc_type: DocType::File,
			ino: Some(ino),
			size: Some(content.len() as u64),
			mtime: Some(Utc::now()),
			md5sum: Some(digest_bytes(content)),
			executable: false,
			prior_path: None,
		}
	}

	fn deleted_file(path: &str, ino: u64, content: &[u8]) -> RawEvent {
		RawEvent { kind: RawKind::Deleted, ..created_file(path, ino, content) }
	}

	fn created_dir(path: &str, ino: u64) -> RawEvent {
		RawEvent {
			kind: RawKind::Created,
			path: path.to_string(),
			doc_type: DocType::Folder,
			ino: Some(ino),
			size: None,
			mtime: Some(Utc::now()),
			md5sum: None,
			executable: false,
			prior_path: None,
		}
	}

	fn deleted_dir(path: &str, ino: u64) -> RawEvent {
		RawEvent { kind: RawKind::Deleted, ..created_dir(path, ino) }
	}

	#[test]
	fn inode_pair_becomes_a_move() {
		let mut agg = Aggregator::new(false);
		agg.push(deleted_file("old.txt", 7, b"x"));
		agg.push(created_file("new.txt", 7, b"x"));
		let changes = agg.flush();
		assert_eq!(changes.len(), 1);
		assert!(matches!(
			&changes[0],
			Change::Move { from, to, .. } if from == "old.txt" && to == "new.txt"
		));
	}

	#[test]
	fn inode_pair_with_edit_moves_and_carries_the_new_digest() {
		let mut agg = Aggregator::new(false);
		agg.push(deleted_file("old.txt", 7, b"one"));
		agg.push(created_file("new.txt", 7, b"two"));
		let changes = agg.flush();
		assert_eq!(changes.len(), 1);
		// The inode match wins even though the content changed; the move
		// carries the post-edit digest for the merger to compare.
		assert!(matches!(
			&changes[0],
			Change::Move { from, to, meta, .. } if from == "old.txt" && to == "new.txt"
				&& meta.md5sum.as_deref() == Some(digest_bytes(b"two").as_str())
		));
	}

	#[test]
	fn digest_pair_moves_only_when_optimistic() {
		let events = |agg: &mut Aggregator| {
			agg.push(deleted_file("a.bin", 1, b"same-bytes"));
			agg.push(created_file("b.bin", 2, b"same-bytes"));
		};

		let mut optimistic = Aggregator::new(true);
		events(&mut optimistic);
		let changes = optimistic.flush();
		assert!(matches!(changes[0], Change::Move { .. }), "got {changes:?}");

		let mut strict = Aggregator::new(false);
		events(&mut strict);
		let changes = strict.flush();
		assert_eq!(changes.len(), 2);
		assert!(changes.iter().any(|c| matches!(c, Change::AddFile { .. })));
		assert!(changes.iter().any(|c| matches!(c, Change::Trash { .. })));
	}

	#[test]
	fn case_rename_uses_catalog_prior_path() {
		let mut agg = Aggregator::new(false);
		let mut event = created_file("Notes.txt", 3, b"n");
		event.prior_path = Some("notes.txt".to_string());
		agg.push(event);
		let changes = agg.flush();
		assert!(matches!(
			&changes[0],
			Change::Move { from, to, .. } if from == "notes.txt" && to == "Notes.txt"
		));
	}

	#[test]
	fn lone_delete_becomes_trash() {
		let mut agg = Aggregator::new(true);
		agg.push(deleted_file("gone.txt", 4, b"g"));
		let changes = agg.flush();
		assert_eq!(
			changes,
			vec![Change::Trash { path: "gone.txt".into(), doc_type: DocType::File }]
		);
	}

	#[test]
	fn lone_create_becomes_add() {
		let mut agg = Aggregator::new(true);
		agg.push(created_dir("fresh", 5));
		let changes = agg.flush();
		assert!(matches!(&changes[0], Change::AddDir { path, .. } if path == "fresh"));
	}

	#[test]
	fn directory_move_suppresses_descendant_noise() {
		let mut agg = Aggregator::new(true);
		agg.push(deleted_dir("src", 10));
		agg.push(created_dir("dst", 10));
		agg.push(deleted_file("src/a.txt", 11, b"a"));
		agg.push(created_file("dst/a.txt", 11, b"a"));
		agg.push(deleted_file("src/sub/b.txt", 12, b"b"));
		agg.push(created_file("dst/sub/b.txt", 12, b"b"));

		let changes = agg.flush();
		assert_eq!(changes.len(), 1, "descendants suppressed: {changes:?}");
		assert!(matches!(
			&changes[0],
			Change::Move { from, to, doc_type: DocType::Folder, .. }
				if from == "src" && to == "dst"
		));
	}

	#[test]
	fn move_then_edit_keeps_the_update_at_the_new_path() {
		let mut agg = Aggregator::new(true);
		agg.push(deleted_dir("src", 10));
		agg.push(created_dir("dst", 10));
		// Same inode, different content: moved with the folder, then edited.
		agg.push(deleted_file("src/file", 11, b"foo"));
		agg.push(created_file("dst/file", 11, b"foo blah"));

		let changes = agg.flush();
		assert_eq!(changes.len(), 2, "{changes:?}");
		assert!(matches!(
			&changes[0],
			Change::Move { from, to, .. } if from == "src" && to == "dst"
		));
		assert!(matches!(
			&changes[1],
			Change::UpdateFile { path, meta } if path == "dst/file"
				&& meta.md5sum.as_deref() == Some(digest_bytes(b"foo blah").as_str())
		));
	}

	#[test]
	fn unrelated_events_survive_directory_move() {
		let mut agg = Aggregator::new(true);
		agg.push(deleted_dir("src", 10));
		agg.push(created_dir("dst", 10));
		agg.push(created_file("elsewhere.txt", 20, b"e"));

		let changes = agg.flush();
		assert_eq!(changes.len(), 2);
		assert!(changes.iter().any(
			|c| matches!(c, Change::AddFile { path, .. } if path == "elsewhere.txt")
		));
	}

	#[test]
	fn repeated_modifications_collapse_to_one_update() {
		let mut agg = Aggregator::new(true);
		let mut first = created_file("busy.txt", 6, b"v1");
		first.kind = RawKind::Modified;
		let mut second = created_file("busy.txt", 6, b"v2");
		second.kind = RawKind::Modified;
		agg.push(first);
		agg.push(second);

		let changes = agg.flush();
		assert_eq!(changes.len(), 1);
		assert!(matches!(
			&changes[0],
			Change::UpdateFile { path, meta } if path == "busy.txt"
				&& meta.md5sum.as_deref() == Some(digest_bytes(b"v2").as_str())
		));
	}

	#[test]
	fn moves_emit_parents_before_children() {
		let mut agg = Aggregator::new(false);
		// Two sibling moves at different depths, not parent/child.
		agg.push(deleted_file("deep/nested/file.txt", 31, b"f"));
		agg.push(created_file("deep/nested/renamed.txt", 31, b"f"));
		agg.push(deleted_dir("top", 30));
		agg.push(created_dir("renamed-top", 30));

		let changes = agg.flush();
		assert!(matches!(&changes[0], Change::Move { from, .. } if from == "top"));
	}

	#[test]
	fn flush_clears_the_buffer() {
		let mut agg = Aggregator::new(true);
		agg.push(created_file("once.txt", 9, b"1"));
		assert!(!agg.is_empty());
		agg.flush();
		assert!(agg.is_empty());
		assert!(agg.flush().is_empty());
	}
}
