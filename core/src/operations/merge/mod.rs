//! Prep/merge: the single writer of the metadata catalog.
//!
//! One method per normalized event kind, each taking the side that
//! observed it. The reconciliation rules decide whether an event creates,
//! revives, merges into, moves or tombstones a document, or whether the
//! two sides have diverged and a conflict rename is needed.
//!
//! Conflict policy: the side whose content arrives second is the intruder
//! and its copy moves to a `-conflict-` sibling, while the established
//! document keeps its path and content. Both divergent contents end up on
//! both sides. A local conflict rename echoes back through the local
//! watcher as events about its own handiwork; the move-onto-own-document
//! and trash-of-untracked-copy guards below swallow those echoes.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Change, ChangeMeta, DocType, Document, LocalInfo, RemoteInfo, SideName};
use crate::error::MergeError;
use crate::infrastructure::database::{Store, StoreError};
use crate::infrastructure::progress::{Progress, ProgressTx};
use crate::operations::locks::IdLocks;
use crate::operations::sync::side::{Side as _, SidePair};
use crate::shared::path::{self as syncpath, Platform};

pub mod conflict;

/// Attempts per event when the store reports a stale write.
const STALE_RETRIES: usize = 3;

pub struct Merger {
	store: Arc<Store>,
	sides: SidePair,
	locks: Arc<IdLocks>,
	platform: Platform,
	progress: ProgressTx,
}

impl Merger {
	pub fn new(
		store: Arc<Store>,
		sides: SidePair,
		locks: Arc<IdLocks>,
		platform: Platform,
		progress: ProgressTx,
	) -> Self {
		Self { store, sides, locks, platform, progress }
	}

	/// Applies one normalized change observed by `side`.
	///
	/// Every handler re-reads the document it touches, so a replay after a
	/// stale-write rejection (or a watcher replaying its queue) converges
	/// on the same state.
	#[instrument(skip(self, change), fields(side = %side, kind = change.kind(), path = change.path()))]
	pub async fn apply(&self, side: SideName, change: Change) -> Result<(), MergeError> {
		let mut attempt = 0;
		loop {
			let result = self.dispatch(side, &change).await;
			match result {
				Err(MergeError::Store(StoreError::Conflict { .. })) if attempt < STALE_RETRIES => {
					attempt += 1;
					debug!(attempt, "stale write, replaying merge");
				}
				other => return other,
			}
		}
	}

	async fn dispatch(&self, side: SideName, change: &Change) -> Result<(), MergeError> {
		if side == SideName::Remote {
			self.surface_incompatibilities(change);
		}
		// A path is never merged and executed at the same time. Moves
		// manage their own locking: a folder move inspects the whole
		// subtree's locks instead of waiting on one id.
		match change {
			Change::Move { from, to, doc_type, meta } => {
				self.merge_move(side, from, to, *doc_type, meta).await
			}
			Change::AddFile { path, meta } | Change::UpdateFile { path, meta } => {
				let _guard = self.lock_path(path).await;
				self.merge_file(side, path, meta).await
			}
			Change::AddDir { path, meta } => {
				let _guard = self.lock_path(path).await;
				self.merge_dir(side, path, meta).await
			}
			Change::Trash { path, doc_type } => {
				let _guard = self.lock_path(path).await;
				self.merge_trash(side, path, *doc_type).await
			}
			Change::Restore { path, doc_type, meta } => {
				let _guard = self.lock_path(path).await;
				self.merge_restore(side, path, *doc_type, meta).await
			}
		}
	}

	async fn lock_path(&self, path: &str) -> tokio::sync::OwnedMutexGuard<()> {
		self.locks.lock(&syncpath::id(path, self.platform)).await
	}

	/// add_file and update_file share one decision table.
	async fn merge_file(
		&self,
		side: SideName,
		path: &str,
		meta: &ChangeMeta,
	) -> Result<(), MergeError> {
		let id = syncpath::id(path, self.platform);
		let Some(mut doc) = self.store.get(&id).await? else {
			let mut doc = Document::new(id, path.to_string(), DocType::File, side);
			self.apply_meta(&mut doc, side, meta);
			self.store.put(&mut doc).await?;
			info!(path, %side, "file document created");
			return Ok(());
		};

		if doc.deleted {
			doc.deleted = false;
			doc.restored = true;
			self.apply_meta(&mut doc, side, meta);
			doc.bump(side);
			self.store.put(&mut doc).await?;
			info!(path, %side, "tombstoned file revived");
			return Ok(());
		}

		if doc.is_folder() {
			// The folder was replaced by a file of the same name.
			doc.doc_type = DocType::File;
			self.apply_meta(&mut doc, side, meta);
			doc.bump(side);
			self.store.put(&mut doc).await?;
			info!(path, %side, "folder replaced by file");
			return Ok(());
		}

		if doc.md5sum == meta.md5sum {
			// Same content. Either the echo of an already-merged event, a
			// first-sync merge, or the acknowledgment of our own executor
			// write coming back through the watcher.
			if doc.sides.get(side) < doc.rev {
				self.apply_meta(&mut doc, side, meta);
				doc.sides.set(side, doc.rev);
				self.store.put(&mut doc).await?;
				debug!(path, %side, "sides merged on matching digest");
			}
			return Ok(());
		}

		if doc.dirty_side() == Some(side) {
			// A remote echo no newer than the revision already tracked is
			// the feed replaying old state, not a divergence.
			if side == SideName::Remote && !remote_rev_is_newer(meta, &doc) {
				return Ok(());
			}
			// The other side's content is newer and not yet mirrored here,
			// yet this side reports different content: divergence.
			return self.resolve_conflict(&mut doc, side, meta, path).await;
		}

		// This side owns the latest revision; a changed digest is a plain
		// content update.
		self.apply_meta(&mut doc, side, meta);
		doc.bump(side);
		self.store.put(&mut doc).await?;
		debug!(path, %side, rev = doc.rev, "file content updated");
		Ok(())
	}

	async fn merge_dir(
		&self,
		side: SideName,
		path: &str,
		meta: &ChangeMeta,
	) -> Result<(), MergeError> {
		let id = syncpath::id(path, self.platform);
		let Some(mut doc) = self.store.get(&id).await? else {
			let mut doc = Document::new(id, path.to_string(), DocType::Folder, side);
			self.apply_meta(&mut doc, side, meta);
			self.store.put(&mut doc).await?;
			info!(path, %side, "folder document created");
			return Ok(());
		};

		if doc.deleted {
			doc.deleted = false;
			doc.restored = true;
			self.apply_meta(&mut doc, side, meta);
			doc.bump(side);
			self.store.put(&mut doc).await?;
			return Ok(());
		}

		if doc.is_file() && doc.path == path {
			// The file was replaced by a folder of the same name.
			doc.doc_type = DocType::Folder;
			doc.md5sum = None;
			doc.size = None;
			self.apply_meta(&mut doc, side, meta);
			doc.bump(side);
			self.store.put(&mut doc).await?;
			info!(path, %side, "file replaced by folder");
			return Ok(());
		}

		if doc.path == path {
			if doc.sides.get(side) < doc.rev {
				self.apply_meta(&mut doc, side, meta);
				doc.sides.set(side, doc.rev);
				self.store.put(&mut doc).await?;
			}
			return Ok(());
		}

		// Same canonical id, different spelling: a case-fold collision on
		// a case-insensitive platform. Two directories cannot coexist, so
		// the incoming side's copy moves aside under a conflict name.
		warn!(existing = %doc.path, incoming = path, "case-fold directory collision");
		self.resolve_conflict(&mut doc, side, meta, path).await
	}

	async fn merge_move(
		&self,
		side: SideName,
		from: &str,
		to: &str,
		doc_type: DocType,
		meta: &ChangeMeta,
	) -> Result<(), MergeError> {
		let from_id = syncpath::id(from, self.platform);
		let Some(mut doc) = self.store.get(&from_id).await? else {
			// Nothing tracked at the origin: treat the arrival as an add.
			return match doc_type {
				DocType::File => self.merge_file(side, to, meta).await,
				DocType::Folder => self.merge_dir(side, to, meta).await,
			};
		};

		// Case-only renames keep the id; everything else changes it.
		let mut to = to.to_string();
		let mut to_id = syncpath::id(&to, self.platform);
		if to_id != from_id {
			if let Some(occupant) = self.store.get(&to_id).await? {
				if !occupant.deleted {
					// A destination document already describing this very
					// node is the echo of a rename the merger performed
					// itself (conflict parking); drop it.
					let same_node = (occupant.ino.is_some() && occupant.ino == meta.ino)
						|| (occupant.is_file()
							&& occupant.md5sum.is_some()
							&& occupant.md5sum == meta.md5sum);
					if same_node {
						debug!(from, to = %to, "move echo onto its own document dropped");
						return Ok(());
					}
					// Destination taken: the arriving move is the intruder.
					to = conflict::conflict_path(&to, Utc::now());
					to_id = syncpath::id(&to, self.platform);
					warn!(from, to = %to, "move destination occupied, conflict-renaming");
				}
			}
		}

		if doc.is_folder() {
			return self.merge_folder_move(side, doc, &to, to_id, meta).await;
		}

		let _guard = self.locks.lock(&from_id).await;
		let origin = crate::domain::MoveOrigin {
			path: doc.path.clone(),
			id: doc.id.clone(),
			ino: doc.ino,
			remote: doc.remote.clone(),
		};
		let old_path = doc.path.clone();
		doc.move_from = Some(origin);
		doc.path = to.clone();
		doc.id = to_id;
		// A rename fused with an edit (one inode-matched pair, or a feed
		// entry whose path and digest both changed) adopts the new content;
		// the executor sees the digest mismatch after its rename and
		// transfers the bytes. A pure move touches only the path and the
		// side identity.
		let content_changed = meta.md5sum.is_some() && doc.md5sum != meta.md5sum;
		if content_changed {
			self.apply_meta(&mut doc, side, meta);
		} else {
			self.apply_identity(&mut doc, side, meta);
		}
		doc.bump(side);
		if doc.id == from_id {
			self.store.put(&mut doc).await?;
		} else {
			self.store.put_moved(&from_id, &mut doc).await?;
		}
		info!(from = %old_path, to = %to, %side, content_changed, "file move merged");
		Ok(())
	}

	/// A folder move rewrites every descendant's path in one atomic batch.
	///
	/// Only the folder itself becomes dirty: the one mirrored rename moves
	/// the whole subtree physically, so descendants get a catalog rewrite
	/// with no executor work of their own.
	async fn merge_folder_move(
		&self,
		side: SideName,
		mut doc: Document,
		to: &str,
		to_id: String,
		meta: &ChangeMeta,
	) -> Result<(), MergeError> {
		let from = doc.path.clone();
		let from_id = doc.id.clone();

		if self.locks.is_locked(&doc.id) {
			return Err(MergeError::SubtreeLocked(from));
		}
		let mut descendants = self.store.tree_under(&from).await?;
		for descendant in &descendants {
			if self.locks.is_locked(&descendant.id) {
				return Err(MergeError::SubtreeLocked(from));
			}
		}

		doc.move_from = Some(crate::domain::MoveOrigin {
			path: from.clone(),
			id: from_id.clone(),
			ino: doc.ino,
			remote: doc.remote.clone(),
		});
		doc.path = to.to_string();
		doc.id = to_id;
		// Only the path and side identity move; content changes inside the
		// subtree arrive as their own update events.
		self.apply_identity(&mut doc, side, meta);
		doc.bump(side);

		let mut batch: Vec<(String, &mut Document)> = Vec::with_capacity(1 + descendants.len());
		batch.push((from_id, &mut doc));
		for descendant in &mut descendants {
			let old_id = descendant.id.clone();
			descendant.path = syncpath::rebase(&descendant.path, &from, to);
			descendant.id = syncpath::id(&descendant.path, self.platform);
			batch.push((old_id, descendant));
		}
		self.store.put_moved_batch(batch).await?;
		info!(from = %from, to, %side, descendants = descendants.len(), "folder move merged");
		Ok(())
	}

	async fn merge_trash(
		&self,
		side: SideName,
		path: &str,
		_doc_type: DocType,
	) -> Result<(), MergeError> {
		let id = syncpath::id(path, self.platform);
		let Some(mut doc) = self.store.get(&id).await? else {
			return Ok(());
		};

		// No local copy is tracked at this path (it is pending a download,
		// or a conflict rename just moved it aside); the local absence is
		// already accounted for, not a deletion.
		if side == SideName::Local && doc.local.is_none() && !doc.deleted {
			debug!(path, "local trash for untracked copy ignored");
			return Ok(());
		}

		if doc.deleted {
			// A second side confirming an existing tombstone.
			if doc.sides.get(side) < doc.rev {
				doc.sides.set(side, doc.rev);
				if doc.fully_deleted() {
					self.store.delete(&doc.id).await?;
					debug!(path, "tombstone fully acknowledged, document removed");
				} else {
					self.store.put(&mut doc).await?;
				}
			}
			return Ok(());
		}

		if doc.is_folder() {
			// Descendants get their own tombstones, deepest first.
			let mut descendants = self.store.tree_under(path).await?;
			descendants.sort_by_key(|d| std::cmp::Reverse(syncpath::depth(&d.path)));
			for mut descendant in descendants {
				if descendant.deleted {
					continue;
				}
				descendant.deleted = true;
				descendant.bump(side);
				self.store.put(&mut descendant).await?;
			}
		}

		doc.deleted = true;
		doc.restored = false;
		doc.bump(side);
		self.store.put(&mut doc).await?;
		info!(path, %side, "document tombstoned");
		Ok(())
	}

	async fn merge_restore(
		&self,
		side: SideName,
		path: &str,
		doc_type: DocType,
		meta: &ChangeMeta,
	) -> Result<(), MergeError> {
		let id = syncpath::id(path, self.platform);
		let Some(mut doc) = self.store.get(&id).await? else {
			return match doc_type {
				DocType::File => self.merge_file(side, path, meta).await,
				DocType::Folder => self.merge_dir(side, path, meta).await,
			};
		};
		if !doc.deleted {
			return Ok(());
		}
		doc.deleted = false;
		doc.restored = true;
		self.apply_meta(&mut doc, side, meta);
		doc.bump(side);
		self.store.put(&mut doc).await?;
		info!(path, %side, "document restored");
		Ok(())
	}

	/// Divergence resolution. The side whose content arrived second is the
	/// intruder: its copy moves to a `-conflict-` sibling and the
	/// established document keeps its path and content. Both divergent
	/// contents end up on both sides either way.
	///
	/// `incoming_path` is the spelling the incoming event used; the
	/// intruder's copy lives there and the conflict name derives from it.
	async fn resolve_conflict(
		&self,
		doc: &mut Document,
		incoming: SideName,
		meta: &ChangeMeta,
		incoming_path: &str,
	) -> Result<(), MergeError> {
		match incoming {
			SideName::Local => self.park_local_intruder(doc, meta, incoming_path).await,
			SideName::Remote => self.park_remote_intruder(doc, meta, incoming_path).await,
		}
	}

	/// A later local arrival against an established remote-backed
	/// document: the local bytes move aside on disk, a fresh document
	/// carries them to the remote under the conflict name, and the
	/// canonical path re-materializes from the remote.
	async fn park_local_intruder(
		&self,
		doc: &mut Document,
		meta: &ChangeMeta,
		incoming_path: &str,
	) -> Result<(), MergeError> {
		if doc.remote.is_none() {
			// Nothing established on the remote to protect; the local
			// content simply becomes the next revision.
			self.apply_meta(doc, SideName::Local, meta);
			doc.bump(SideName::Local);
			self.store.put(doc).await?;
			return Ok(());
		}

		let renamed = conflict::conflict_path(incoming_path, Utc::now());
		let mut intruder = Document::new(
			syncpath::id(&renamed, self.platform),
			renamed.clone(),
			doc.doc_type,
			SideName::Local,
		);
		self.apply_meta(&mut intruder, SideName::Local, meta);
		let outcome = self
			.sides
			.local
			.rename(&intruder, incoming_path)
			.await
			.map_err(|source| MergeError::ConflictRename {
				path: incoming_path.to_string(),
				source,
			})?;
		if let Some(local) = outcome.local {
			intruder.ino = local.ino;
			intruder.local = Some(local);
		}
		// New document, dirty toward the remote: the executor uploads the
		// parked content under its conflict name.
		self.store.put(&mut intruder).await?;

		// The canonical path has no local copy anymore; the document stays
		// dirty on the local side until the remote content lands there.
		doc.local = None;
		doc.ino = None;
		self.store.put(doc).await?;
		info!(path = %incoming_path, renamed = %renamed, "local intruder conflict-renamed");
		Ok(())
	}

	/// A later remote arrival against locally-owned content: the remote
	/// copy moves aside by id and re-enters through the feed under its
	/// conflict name, while the local content re-establishes the remote
	/// counterpart at the canonical path.
	async fn park_remote_intruder(
		&self,
		doc: &mut Document,
		meta: &ChangeMeta,
		incoming_path: &str,
	) -> Result<(), MergeError> {
		if let Some(remote) = meta.remote.clone().or_else(|| doc.remote.clone()) {
			let renamed = conflict::conflict_path(incoming_path, Utc::now());
			let mut intruder = Document::new(
				syncpath::id(&renamed, self.platform),
				renamed.clone(),
				doc.doc_type,
				SideName::Remote,
			);
			intruder.remote = Some(remote);
			self.sides
				.remote
				.rename(&intruder, incoming_path)
				.await
				.map_err(|source| MergeError::ConflictRename {
					path: incoming_path.to_string(),
					source,
				})?;
			info!(path = %incoming_path, renamed = %renamed, "remote intruder conflict-renamed");
		}

		// The canonical document no longer owns the renamed remote object;
		// the executor re-creates it from the local content.
		doc.remote = None;
		doc.bump(SideName::Local);
		self.store.put(doc).await?;
		Ok(())
	}

	/// Updates only the observing side's identity snapshot, leaving the
	/// content fields untouched. This is what a pure move applies.
	fn apply_identity(&self, doc: &mut Document, side: SideName, meta: &ChangeMeta) {
		if let Some(mtime) = meta.mtime {
			doc.updated_at = mtime;
		}
		match side {
			SideName::Local => {
				doc.local = Some(LocalInfo {
					size: doc.size.unwrap_or(0),
					mtime: meta.mtime.unwrap_or_else(Utc::now),
					ino: meta.ino.or(doc.ino),
					executable: doc.executable,
				});
				if meta.ino.is_some() {
					doc.ino = meta.ino;
				}
			}
			SideName::Remote => {
				if let Some(remote) = &meta.remote {
					doc.remote = Some(remote.clone());
				}
			}
		}
	}

	fn apply_meta(&self, doc: &mut Document, side: SideName, meta: &ChangeMeta) {
		// Content fields belong to files only.
		if doc.is_file() {
			if meta.md5sum.is_some() {
				doc.md5sum = meta.md5sum.clone();
			}
			if meta.size.is_some() {
				doc.size = meta.size;
			}
		}
		if meta.mime.is_some() {
			doc.mime = meta.mime.clone();
		}
		if meta.class.is_some() {
			doc.class = meta.class.clone();
		}
		if !meta.tags.is_empty() {
			doc.tags = meta.tags.clone();
		}
		doc.executable = meta.executable;
		if let Some(mtime) = meta.mtime {
			doc.updated_at = mtime;
		}
		match side {
			SideName::Local => {
				doc.local = Some(LocalInfo {
					size: meta.size.unwrap_or(0),
					mtime: meta.mtime.unwrap_or_else(Utc::now),
					ino: meta.ino,
					executable: meta.executable,
				});
				if meta.ino.is_some() {
					doc.ino = meta.ino;
				}
			}
			SideName::Remote => {
				if let Some(remote) = &meta.remote {
					doc.remote = Some(RemoteInfo { id: remote.id.clone(), rev: remote.rev.clone() });
				}
			}
		}
	}

	/// Remote documents that cannot exist under the local platform's
	/// naming rules are surfaced, batched per event, without blocking
	/// their compatible siblings.
	fn surface_incompatibilities(&self, change: &Change) {
		let issues: Vec<_> = [change.path()]
			.into_iter()
			.filter_map(|p| syncpath::check(p, change.doc_type(), self.platform))
			.collect();
		if !issues.is_empty() {
			self.progress.emit(Progress::PlatformIncompatibilities { issues });
		}
	}
}

/// Whether the incoming remote revision is a later generation than the
/// one the document tracks. Revisions are `<generation>-<hash>`.
fn remote_rev_is_newer(meta: &ChangeMeta, doc: &Document) -> bool {
	let Some(incoming) = meta.remote.as_ref().and_then(|r| rev_generation(&r.rev)) else {
		return true;
	};
	let Some(tracked) = doc.remote.as_ref().and_then(|r| rev_generation(&r.rev)) else {
		return true;
	};
	incoming > tracked
}

fn rev_generation(rev: &str) -> Option<u64> {
	rev.split('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infrastructure::progress::progress_channel;
	use crate::operations::testing::{meta_local, meta_remote, RecordingSide};
	use crate::shared::digest::digest_bytes;

	struct Fixture {
		store: Arc<Store>,
		merger: Merger,
		local_ops: Arc<RecordingSide>,
		remote_ops: Arc<RecordingSide>,
	}

	async fn fixture() -> Fixture {
		let store = Arc::new(Store::in_memory().await.unwrap());
		let local = Arc::new(RecordingSide::new(SideName::Local));
		let remote = Arc::new(RecordingSide::new(SideName::Remote));
		let (progress, _rx) = progress_channel();
		let merger = Merger::new(
			store.clone(),
			SidePair { local: local.clone(), remote: remote.clone() },
			IdLocks::new(),
			Platform::Linux,
			progress,
		);
		Fixture { store, merger, local_ops: local, remote_ops: remote }
	}

	fn add_file(path: &str, content: &[u8]) -> Change {
		Change::AddFile { path: path.into(), meta: meta_local(content, 100) }
	}

	#[tokio::test]
	async fn local_add_creates_document_dirty_on_remote() {
		let fx = fixture().await;
		fx.merger.apply(SideName::Local, add_file("a.txt", b"hi")).await.unwrap();

		let doc = fx.store.get("a.txt").await.unwrap().unwrap();
		assert_eq!(doc.rev, 1);
		assert_eq!(doc.sides.local, 1);
		assert_eq!(doc.sides.remote, 0);
		assert_eq!(doc.md5sum.as_deref(), Some(digest_bytes(b"hi").as_str()));
		assert_eq!(doc.dirty_side(), Some(SideName::Remote));
	}

	#[tokio::test]
	async fn replaying_the_same_event_is_a_noop() {
		let fx = fixture().await;
		fx.merger.apply(SideName::Local, add_file("a.txt", b"hi")).await.unwrap();
		let before = fx.store.get("a.txt").await.unwrap().unwrap();
		fx.merger.apply(SideName::Local, add_file("a.txt", b"hi")).await.unwrap();
		let after = fx.store.get("a.txt").await.unwrap().unwrap();
		assert_eq!(before, after);
	}

	#[tokio::test]
	async fn matching_digests_merge_sides_on_first_sync() {
		let fx = fixture().await;
		fx.merger
			.apply(SideName::Remote, Change::AddFile {
				path: "same.txt".into(),
				meta: meta_remote(b"content", "r1", "1-a"),
			})
			.await
			.unwrap();
		fx.merger.apply(SideName::Local, add_file("same.txt", b"content")).await.unwrap();

		let doc = fx.store.get("same.txt").await.unwrap().unwrap();
		assert_eq!(doc.dirty_side(), None);
		assert!(doc.local.is_some());
		assert!(doc.remote.is_some());
	}

	#[tokio::test]
	async fn unchanged_digest_update_is_a_noop() {
		let fx = fixture().await;
		fx.merger.apply(SideName::Local, add_file("a.txt", b"hi")).await.unwrap();
		let before = fx.store.get("a.txt").await.unwrap().unwrap();
		fx.merger
			.apply(SideName::Local, Change::UpdateFile {
				path: "a.txt".into(),
				meta: meta_local(b"hi", 100),
			})
			.await
			.unwrap();
		assert_eq!(fx.store.get("a.txt").await.unwrap().unwrap(), before);
	}

	#[tokio::test]
	async fn later_local_arrival_is_parked_as_conflict_sibling() {
		let fx = fixture().await;
		// Remote established the document first; local never mirrored it.
		fx.merger
			.apply(SideName::Remote, Change::AddFile {
				path: "doc.txt".into(),
				meta: meta_remote(b"remote content", "r9", "2-b"),
			})
			.await
			.unwrap();
		fx.local_ops.insert("doc.txt", b"local content");
		// A differing local add is the later arrival: it is the intruder.
		fx.merger.apply(SideName::Local, add_file("doc.txt", b"local content")).await.unwrap();

		// The established document keeps its path, content and remote
		// identity; only its local copy is gone until the download runs.
		let doc = fx.store.get("doc.txt").await.unwrap().unwrap();
		assert_eq!(doc.md5sum.as_deref(), Some(digest_bytes(b"remote content").as_str()));
		assert!(doc.remote.is_some(), "established remote identity survives");
		assert!(doc.local.is_none());
		assert_eq!(doc.dirty_side(), Some(SideName::Local));

		// The local bytes moved aside on the local side only.
		let renames = fx.local_ops.renames();
		assert_eq!(renames.len(), 1);
		assert_eq!(renames[0].0, "doc.txt");
		assert!(renames[0].1.contains("-conflict-"));
		assert!(fx.remote_ops.renames().is_empty());

		// A fresh document carries the parked content toward the remote.
		let parked = fx
			.store
			.all_live()
			.await
			.unwrap()
			.into_iter()
			.find(|d| d.path.contains("-conflict-"))
			.expect("conflict sibling document");
		assert_eq!(parked.md5sum.as_deref(), Some(digest_bytes(b"local content").as_str()));
		assert_eq!(parked.dirty_side(), Some(SideName::Remote));
	}

	#[tokio::test]
	async fn remote_update_against_dirty_local_conflicts() {
		let fx = fixture().await;
		fx.merger.apply(SideName::Local, add_file("doc.txt", b"local")).await.unwrap();
		fx.merger
			.apply(SideName::Remote, Change::UpdateFile {
				path: "doc.txt".into(),
				meta: meta_remote(b"remote", "r4", "5-e"),
			})
			.await
			.unwrap();

		// Local owns the canonical path; the later remote arrival moved
		// aside and the local content re-establishes the remote file.
		let doc = fx.store.get("doc.txt").await.unwrap().unwrap();
		assert_eq!(doc.md5sum.as_deref(), Some(digest_bytes(b"local").as_str()));
		assert!(doc.remote.is_none(), "renamed remote object is released");
		assert_eq!(doc.dirty_side(), Some(SideName::Remote));
		assert_eq!(fx.remote_ops.renames().len(), 1);
		assert!(fx.local_ops.renames().is_empty());
	}

	#[tokio::test]
	async fn file_move_rewrites_id_and_records_origin() {
		let fx = fixture().await;
		fx.merger.apply(SideName::Local, add_file("old/name.txt", b"x")).await.unwrap();
		fx.merger
			.apply(SideName::Local, Change::Move {
				from: "old/name.txt".into(),
				to: "new/name.txt".into(),
				doc_type: DocType::File,
				meta: meta_local(b"x", 100),
			})
			.await
			.unwrap();

		assert!(fx.store.get("old/name.txt").await.unwrap().is_none());
		let doc = fx.store.get("new/name.txt").await.unwrap().unwrap();
		assert_eq!(doc.move_from.as_ref().unwrap().path, "old/name.txt");
		assert_eq!(doc.dirty_side(), Some(SideName::Remote));
		// A pure rename leaves the content fields alone.
		assert_eq!(doc.md5sum.as_deref(), Some(digest_bytes(b"x").as_str()));
	}

	#[tokio::test]
	async fn move_with_changed_content_adopts_digest_and_stays_dirty() {
		let fx = fixture().await;
		fx.merger.apply(SideName::Local, add_file("a.txt", b"one")).await.unwrap();
		let mut doc = fx.store.get("a.txt").await.unwrap().unwrap();
		doc.mark_in_sync();
		fx.store.put(&mut doc).await.unwrap();

		// One inode-matched pair delivered a rename fused with an edit.
		fx.merger
			.apply(SideName::Local, Change::Move {
				from: "a.txt".into(),
				to: "b.txt".into(),
				doc_type: DocType::File,
				meta: meta_local(b"two", 100),
			})
			.await
			.unwrap();

		let doc = fx.store.get("b.txt").await.unwrap().unwrap();
		assert_eq!(doc.md5sum.as_deref(), Some(digest_bytes(b"two").as_str()));
		assert!(doc.move_from.is_some());
		// The opposite side owes both the rename and the new bytes.
		assert_eq!(doc.dirty_side(), Some(SideName::Remote));
	}

	#[tokio::test]
	async fn folder_move_rebases_descendants_without_dirtying_them() {
		let fx = fixture().await;
		fx.merger
			.apply(SideName::Local, Change::AddDir {
				path: "src".into(),
				meta: meta_local(b"", 1),
			})
			.await
			.unwrap();
		fx.merger.apply(SideName::Local, add_file("src/file", b"foo")).await.unwrap();
		// Drain dirtiness so descendant cleanliness is observable.
		for id in ["src", "src/file"] {
			let mut doc = fx.store.get(id).await.unwrap().unwrap();
			doc.mark_in_sync();
			fx.store.put(&mut doc).await.unwrap();
		}

		fx.merger
			.apply(SideName::Local, Change::Move {
				from: "src".into(),
				to: "dst".into(),
				doc_type: DocType::Folder,
				meta: meta_local(b"", 1),
			})
			.await
			.unwrap();

		let folder = fx.store.get("dst").await.unwrap().unwrap();
		assert_eq!(folder.dirty_side(), Some(SideName::Remote));
		assert_eq!(folder.move_from.as_ref().unwrap().path, "src");

		let child = fx.store.get("dst/file").await.unwrap().unwrap();
		assert_eq!(child.path, "dst/file");
		assert_eq!(child.dirty_side(), None, "descendants ride along with the folder rename");
		assert!(fx.store.get("src/file").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn folder_move_backs_off_while_descendant_is_locked() {
		let fx = fixture().await;
		fx.merger
			.apply(SideName::Local, Change::AddDir { path: "src".into(), meta: meta_local(b"", 1) })
			.await
			.unwrap();
		fx.merger.apply(SideName::Local, add_file("src/file", b"foo")).await.unwrap();

		let locks = IdLocks::new();
		let (progress, _rx) = progress_channel();
		let merger = Merger::new(
			fx.store.clone(),
			SidePair {
				local: Arc::new(RecordingSide::new(SideName::Local)),
				remote: Arc::new(RecordingSide::new(SideName::Remote)),
			},
			locks.clone(),
			Platform::Linux,
			progress,
		);
		let _guard = locks.lock("src/file").await;

		let err = merger
			.apply(SideName::Local, Change::Move {
				from: "src".into(),
				to: "dst".into(),
				doc_type: DocType::Folder,
				meta: meta_local(b"", 1),
			})
			.await
			.unwrap_err();
		assert!(matches!(err, MergeError::SubtreeLocked(_)));
	}

	#[tokio::test]
	async fn trash_tombstones_folder_and_descendants() {
		let fx = fixture().await;
		fx.merger
			.apply(SideName::Remote, Change::AddDir {
				path: "parent/dir".into(),
				meta: meta_remote(b"", "d1", "1-a"),
			})
			.await
			.unwrap();
		fx.merger
			.apply(SideName::Remote, Change::AddFile {
				path: "parent/dir/file".into(),
				meta: meta_remote(b"f", "f1", "1-b"),
			})
			.await
			.unwrap();

		fx.merger
			.apply(SideName::Remote, Change::Trash {
				path: "parent/dir".into(),
				doc_type: DocType::Folder,
			})
			.await
			.unwrap();

		let folder = fx.store.get("parent/dir").await.unwrap().unwrap();
		let file = fx.store.get("parent/dir/file").await.unwrap().unwrap();
		assert!(folder.deleted && file.deleted);
		assert_eq!(folder.dirty_side(), Some(SideName::Local));
		assert_eq!(file.dirty_side(), Some(SideName::Local));
	}

	#[tokio::test]
	async fn second_side_trash_removes_the_document() {
		let fx = fixture().await;
		fx.merger.apply(SideName::Local, add_file("gone.txt", b"x")).await.unwrap();
		fx.merger
			.apply(SideName::Local, Change::Trash {
				path: "gone.txt".into(),
				doc_type: DocType::File,
			})
			.await
			.unwrap();
		// The remote side confirms the deletion.
		fx.merger
			.apply(SideName::Remote, Change::Trash {
				path: "gone.txt".into(),
				doc_type: DocType::File,
			})
			.await
			.unwrap();
		assert!(fx.store.get("gone.txt").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn restore_revives_a_tombstone() {
		let fx = fixture().await;
		fx.merger.apply(SideName::Local, add_file("back.txt", b"x")).await.unwrap();
		fx.merger
			.apply(SideName::Local, Change::Trash {
				path: "back.txt".into(),
				doc_type: DocType::File,
			})
			.await
			.unwrap();
		fx.merger
			.apply(SideName::Remote, Change::Restore {
				path: "back.txt".into(),
				doc_type: DocType::File,
				meta: meta_remote(b"x", "r2", "3-c"),
			})
			.await
			.unwrap();

		let doc = fx.store.get("back.txt").await.unwrap().unwrap();
		assert!(!doc.deleted);
	}

	#[tokio::test]
	async fn trash_of_unknown_path_is_ignored() {
		let fx = fixture().await;
		fx.merger
			.apply(SideName::Local, Change::Trash {
				path: "never/seen".into(),
				doc_type: DocType::File,
			})
			.await
			.unwrap();
	}
}
