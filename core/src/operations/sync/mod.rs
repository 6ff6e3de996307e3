//! Sync execution: mirroring dirty documents onto their trailing side.
//!
//! The executor follows the store's dirty index in commit order, takes the
//! per-document lock, and dispatches the mirrored mutation through the
//! target side's capability. Transient failures back off exponentially;
//! incompatible documents park until their upstream state changes;
//! revoked credentials, quota exhaustion and store corruption halt the
//! run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{Document, SideName};
use crate::error::{Classification, Classify, SyncError};
use crate::infrastructure::database::Store;
use crate::infrastructure::progress::{LastFileEntry, LastFiles, Progress, ProgressTx};
use crate::operations::locks::IdLocks;
use crate::shared::path::{self as syncpath, Platform};

pub mod retry;
pub mod side;

use retry::RetryPolicy;
use side::{Side, SidePair, WriteOutcome};

/// Poll fallback when nothing is due; normally the store watch wakes us
/// long before this.
const IDLE_RECHECK: Duration = Duration::from_secs(60);

pub struct SyncExecutor {
	store: Arc<Store>,
	sides: SidePair,
	locks: Arc<IdLocks>,
	progress: ProgressTx,
	last_files: Arc<std::sync::Mutex<LastFiles>>,
	retry: RetryPolicy,
	platform: Platform,
	workers: usize,
	/// Next attempt time for documents in backoff, by id.
	backoff: std::sync::Mutex<HashMap<String, Instant>>,
}

impl SyncExecutor {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		store: Arc<Store>,
		sides: SidePair,
		locks: Arc<IdLocks>,
		progress: ProgressTx,
		last_files: Arc<std::sync::Mutex<LastFiles>>,
		retry: RetryPolicy,
		platform: Platform,
		workers: usize,
	) -> Self {
		Self {
			store,
			sides,
			locks,
			progress,
			last_files,
			retry,
			platform,
			workers: workers.max(1),
			backoff: std::sync::Mutex::new(HashMap::new()),
		}
	}

	/// Drains dirty documents until `shutdown` flips or a halting error
	/// occurs. In-flight operations finish before the call returns.
	#[instrument(skip_all)]
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
		let mut seq_rx = self.store.subscribe();
		let mut was_busy = true;

		loop {
			if *shutdown.borrow() {
				info!("executor stopping");
				return Ok(());
			}

			let batch = self.next_batch().await?;
			match batch {
				Batch::Due(docs) => {
					was_busy = true;
					self.process_batch(docs).await?;
				}
				Batch::Idle => {
					if was_busy {
						self.progress.emit(Progress::UpToDate);
						was_busy = false;
					}
					tokio::select! {
						_ = seq_rx.changed() => {}
						_ = shutdown.changed() => {}
						_ = tokio::time::sleep(IDLE_RECHECK) => {}
					}
				}
				Batch::BackingOff(until) => {
					let wait = until.saturating_duration_since(Instant::now());
					tokio::select! {
						_ = tokio::time::sleep(wait) => {}
						_ = seq_rx.changed() => {}
						_ = shutdown.changed() => {}
					}
				}
			}
		}
	}

	/// Partitions the dirty index into work that is due now, work waiting
	/// out a backoff, and parked documents (which only a merger bump can
	/// revive).
	async fn next_batch(&self) -> Result<Batch, SyncError> {
		let dirty = self.store.dirty().await?;
		let now = Instant::now();
		let mut due = Vec::new();
		let mut earliest: Option<Instant> = None;

		let backoff = self.backoff.lock().expect("backoff table poisoned");
		for doc in dirty {
			if self.retry.exhausted(doc.errors as u32) {
				continue;
			}
			match backoff.get(&doc.id) {
				Some(at) if *at > now => {
					earliest = Some(earliest.map_or(*at, |e| e.min(*at)));
				}
				_ => due.push(doc),
			}
		}
		drop(backoff);

		if !due.is_empty() {
			due.sort_by_key(ordering_key);
			Ok(Batch::Due(due))
		} else if let Some(at) = earliest {
			Ok(Batch::BackingOff(at))
		} else {
			Ok(Batch::Idle)
		}
	}

	async fn process_batch(&self, docs: Vec<Document>) -> Result<(), SyncError> {
		// Documents at the same depth cannot depend on each other, so each
		// depth runs as one concurrent wave through the worker pool; the
		// barrier between waves is what makes a parent's mkdir or rename
		// land before any child touches the new path.
		let mut docs = docs.into_iter().peekable();
		while let Some(first) = docs.next() {
			let key = wave_key(&first);
			let mut wave = vec![first];
			while docs.peek().is_some_and(|doc| wave_key(doc) == key) {
				wave.push(docs.next().expect("peeked"));
			}

			let failures = futures::stream::iter(wave)
				.map(|doc| self.process_one(doc))
				.buffer_unordered(self.workers)
				.filter_map(|result| async move { result.err() })
				.collect::<Vec<_>>()
				.await;
			for err in failures {
				if err.classification().halts_sync() {
					return Err(err);
				}
			}
		}
		Ok(())
	}

	/// Applies one document's outstanding work on its trailing side.
	async fn process_one(&self, stale: Document) -> Result<(), SyncError> {
		let _guard = self.locks.lock(&stale.id).await;

		// Re-read under the lock: the merger may have moved on.
		let Some(mut doc) = self.store.get(&stale.id).await? else {
			return Ok(());
		};
		let Some(target) = doc.dirty_side() else {
			return Ok(());
		};
		if self.retry.exhausted(doc.errors as u32) {
			return Ok(());
		}

		match self.dispatch(&mut doc, target).await {
			Ok(()) => {
				self.backoff.lock().expect("backoff table poisoned").remove(&doc.id);
				Ok(())
			}
			Err(err) => self.handle_failure(doc, target, err).await,
		}
	}

	async fn dispatch(&self, doc: &mut Document, target: SideName) -> Result<(), SyncError> {
		debug!(id = %doc.id, %target, rev = doc.rev, "executing");

		if doc.deleted {
			return self.execute_trash(doc, target).await;
		}

		if target == SideName::Local {
			if let Some(incompat) = syncpath::check(&doc.path, doc.doc_type, self.platform) {
				return Err(SyncError::Incompatible(Box::new(incompat)));
			}
		}

		if let Some(origin) = doc.move_from.clone() {
			return self.execute_move(doc, target, origin.path).await;
		}

		if doc.restored {
			return self.execute_restore(doc, target).await;
		}

		self.execute_materialize(doc, target).await
	}

	/// Creates the folder or transfers the file content onto `target`.
	async fn execute_materialize(
		&self,
		doc: &mut Document,
		target: SideName,
	) -> Result<(), SyncError> {
		if doc.is_folder() {
			let outcome = self.sides.get(target).mkdir(doc).await?;
			self.finish(doc, target, outcome, "add").await?;
			self.progress.emit(Progress::TransferCopy {
				path: doc.path.clone(),
				doc_type: doc.doc_type,
			});
			return Ok(());
		}
		self.execute_file_transfer(doc, target).await
	}

	/// Brings a revived document back from `target`'s trash; when the
	/// trashed copy is unavailable, materializes it from the other side.
	async fn execute_restore(&self, doc: &mut Document, target: SideName) -> Result<(), SyncError> {
		let has_identity = match target {
			SideName::Remote => doc.remote.is_some(),
			SideName::Local => true,
		};
		if has_identity {
			match self.sides.get(target).restore(doc).await {
				Ok(outcome) => {
					doc.restored = false;
					// The content may have changed since the trashing; a
					// digest mismatch means the restored copy is stale and
					// the canonical content still has to flow over.
					let stale = doc.is_file()
						&& outcome.md5sum.is_some()
						&& outcome.md5sum != doc.md5sum;
					if stale {
						if let Some(local) = outcome.local {
							doc.ino = local.ino;
							doc.local = Some(local);
						}
						if let Some(remote) = outcome.remote {
							doc.remote = Some(remote);
						}
						return self.execute_file_transfer(doc, target).await;
					}
					self.finish(doc, target, outcome, "restore").await?;
					self.progress.emit(Progress::TransferCopy {
						path: doc.path.clone(),
						doc_type: doc.doc_type,
					});
					info!(path = %doc.path, %target, "restored from trash");
					return Ok(());
				}
				Err(err) if err.classification() == Classification::Transient => return Err(err),
				Err(err) => {
					debug!(path = %doc.path, error = %err, "restore unavailable, re-materializing");
				}
			}
		}
		doc.restored = false;
		self.execute_materialize(doc, target).await
	}

	async fn execute_file_transfer(
		&self,
		doc: &mut Document,
		target: SideName,
	) -> Result<(), SyncError> {
		self.progress.emit(Progress::TransferStarted {
			path: doc.path.clone(),
			doc_type: doc.doc_type,
		});

		let source = self.sides.get(target.opposite());
		let content = source.read(doc).await?;
		let outcome = self.sides.get(target).write(doc, content).await?;
		self.finish(doc, target, outcome, "update").await?;

		self.progress.emit(Progress::TransferCopy {
			path: doc.path.clone(),
			doc_type: doc.doc_type,
		});
		info!(path = %doc.path, %target, "file mirrored");
		Ok(())
	}

	async fn execute_move(
		&self,
		doc: &mut Document,
		target: SideName,
		from_path: String,
	) -> Result<(), SyncError> {
		// A rename needs the target side to still hold the origin; when it
		// does not (source vanished, identity released by a conflict), the
		// content is materialized fresh instead.
		let can_rename = match target {
			SideName::Remote => doc.remote.is_some(),
			SideName::Local => true,
		};
		let outcome = if can_rename {
			match self.sides.get(target).rename(doc, &from_path).await {
				Ok(outcome) => Some(outcome),
				Err(err) if err.classification() == Classification::Transient => return Err(err),
				Err(err) => {
					warn!(
						from = %from_path, to = %doc.path, %target, error = %err,
						"rename failed, materializing instead"
					);
					None
				}
			}
		} else {
			None
		};
		let Some(outcome) = outcome else {
			doc.move_from = None;
			return self.execute_materialize(doc, target).await;
		};
		doc.move_from = None;
		self.progress.emit(Progress::TransferMove {
			path: doc.path.clone(),
			old_path: from_path.clone(),
		});

		// The rename carried the old bytes along; when the move was fused
		// with an edit the renamed copy's digest trails the document and
		// the content still has to flow over.
		let stale = doc.is_file() && outcome.md5sum.is_some() && outcome.md5sum != doc.md5sum;
		if stale {
			if let Some(local) = outcome.local {
				doc.ino = local.ino;
				doc.local = Some(local);
			}
			if let Some(remote) = outcome.remote {
				doc.remote = Some(remote);
			}
			info!(from = %from_path, to = %doc.path, %target, "move mirrored, content follows");
			return self.execute_file_transfer(doc, target).await;
		}

		self.finish(doc, target, outcome, "move").await?;
		info!(from = %from_path, to = %doc.path, %target, "move mirrored");
		Ok(())
	}

	async fn execute_trash(&self, doc: &mut Document, target: SideName) -> Result<(), SyncError> {
		// When an ancestor folder is tombstoned too, its single physical
		// trash carries this document along; mirroring the descendant
		// would flatten the trashed tree.
		if !self.has_tombstoned_ancestor(&doc.path).await? {
			self.sides.get(target).trash(doc).await?;
		}

		doc.acknowledge(target);
		if doc.fully_deleted() {
			// Both sides agree; the tombstone has served its purpose.
			self.store.delete(&doc.id).await?;
		} else {
			self.store.put(doc).await?;
		}
		self.progress.emit(Progress::DeleteFile { path: doc.path.clone() });
		self.record_transfer(doc, "trash");
		info!(path = %doc.path, %target, "deletion mirrored");
		Ok(())
	}

	async fn has_tombstoned_ancestor(&self, path: &str) -> Result<bool, SyncError> {
		let mut current = path;
		while let Some(parent) = syncpath::parent(current) {
			if let Some(ancestor) = self.store.get_by_path(parent).await? {
				if ancestor.deleted {
					return Ok(true);
				}
			}
			current = parent;
		}
		Ok(false)
	}

	/// Applies the side's refreshed identity, acknowledges the target and
	/// persists, completing one mirrored operation.
	async fn finish(
		&self,
		doc: &mut Document,
		target: SideName,
		outcome: WriteOutcome,
		action: &str,
	) -> Result<(), SyncError> {
		if let Some(local) = outcome.local {
			doc.ino = local.ino;
			doc.local = Some(local);
		}
		if let Some(remote) = outcome.remote {
			doc.remote = Some(remote);
		}
		doc.acknowledge(target);
		doc.errors = 0;
		self.store.put(doc).await?;
		self.record_transfer(doc, action);
		Ok(())
	}

	async fn handle_failure(
		&self,
		mut doc: Document,
		target: SideName,
		err: SyncError,
	) -> Result<(), SyncError> {
		let class = err.classification();
		match class {
			Classification::Transient => {
				doc.errors += 1;
				let delay = self.retry.delay(doc.errors as u32);
				warn!(
					id = %doc.id, %target, errors = doc.errors, ?delay, error = %err,
					"transient failure, backing off"
				);
				self.backoff
					.lock()
					.expect("backoff table poisoned")
					.insert(doc.id.clone(), Instant::now() + delay);
				if let Err(save) = self.store.put(&mut doc).await {
					warn!(id = %doc.id, error = %save, "could not persist retry counter");
				}
				self.progress.emit(Progress::SyncError { message: err.to_string() });
				Ok(())
			}
			Classification::Incompatible | Classification::Permanent => {
				warn!(id = %doc.id, %target, error = %err, "document parked");
				doc.errors = self.retry.max_attempts as i32;
				if let Err(save) = self.store.put(&mut doc).await {
					warn!(id = %doc.id, error = %save, "could not persist parked state");
				}
				if let SyncError::Incompatible(incompat) = &err {
					self.progress.emit(Progress::PlatformIncompatibilities {
						issues: vec![(**incompat).clone()],
					});
				} else {
					self.progress.emit(Progress::SyncError { message: err.to_string() });
				}
				Ok(())
			}
			Classification::Revoked => {
				error!("remote credentials revoked, halting sync");
				self.progress.emit(Progress::Revoked);
				Err(err)
			}
			Classification::Quota => {
				error!("remote out of space, halting sync");
				self.progress.emit(Progress::SyncError { message: "remote is full".into() });
				Err(err)
			}
			Classification::Corrupt => {
				error!(error = %err, "metadata store corrupt, halting sync");
				self.progress.emit(Progress::SyncError { message: err.to_string() });
				Err(err)
			}
			Classification::Conflict => {
				// Conflicts are resolved at merge time; an executor-level
				// conflict means our revision raced a fresher one and the
				// next batch will pick up the winner.
				debug!(id = %doc.id, "racing write, will re-run");
				Ok(())
			}
		}
	}

	fn record_transfer(&self, doc: &Document, action: &str) {
		let entry = LastFileEntry {
			path: doc.path.clone(),
			doc_type: doc.doc_type,
			action: action.to_string(),
			updated: Utc::now(),
		};
		if let Err(err) = self.last_files.lock().expect("journal poisoned").record(entry) {
			warn!(error = %err, "could not journal transfer");
		}
	}
}

enum Batch {
	Due(Vec<Document>),
	BackingOff(Instant),
	Idle,
}

/// Creates and moves run parents-first; deletions run children-first and
/// after everything else. Ties break on commit order.
fn ordering_key(doc: &Document) -> (u8, i64, i64) {
	let (group, depth) = wave_key(doc);
	(group, depth, doc.seq)
}

/// Wave identity: phase and depth. Documents sharing a wave have no
/// parent/child relationship and may run concurrently.
fn wave_key(doc: &Document) -> (u8, i64) {
	let depth = syncpath::depth(&doc.path) as i64;
	if doc.deleted {
		(1, -depth)
	} else {
		(0, depth)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::{Change, DocType};
	use crate::infrastructure::progress::progress_channel;
	use crate::operations::merge::Merger;
	use crate::operations::testing::{meta_local, meta_remote, RecordingSide};
	use crate::shared::digest::digest_bytes;

	struct Fixture {
		store: Arc<Store>,
		merger: Merger,
		executor: Arc<SyncExecutor>,
		local: Arc<RecordingSide>,
		remote: Arc<RecordingSide>,
		progress_rx: tokio::sync::mpsc::UnboundedReceiver<Progress>,
		_tmp: tempfile::TempDir,
	}

	async fn fixture() -> Fixture {
		let store = Arc::new(Store::in_memory().await.unwrap());
		let local = Arc::new(RecordingSide::new(SideName::Local));
		let remote = Arc::new(RecordingSide::new(SideName::Remote));
		let locks = IdLocks::new();
		let (progress, progress_rx) = progress_channel();
		let sides = SidePair { local: local.clone(), remote: remote.clone() };
		let dir = tempfile::tempdir().unwrap();
		let last_files = Arc::new(std::sync::Mutex::new(
			LastFiles::load(dir.path().join("last-files.json")).unwrap(),
		));

		let merger = Merger::new(
			store.clone(),
			sides.clone(),
			locks.clone(),
			Platform::Linux,
			progress.clone(),
		);
		let executor = Arc::new(SyncExecutor::new(
			store.clone(),
			sides,
			locks,
			progress,
			last_files,
			RetryPolicy::default(),
			Platform::Linux,
			3,
		));
		Fixture { store, merger, executor, local, remote, progress_rx, _tmp: dir }
	}

	/// Runs the executor until the dirty index drains.
	async fn drain(fx: &Fixture) {
		loop {
			let batch = fx.executor.next_batch().await.unwrap();
			match batch {
				Batch::Due(docs) => fx.executor.process_batch(docs).await.unwrap(),
				_ => break,
			}
		}
	}

	#[tokio::test]
	async fn local_add_uploads_to_remote() {
		let fx = fixture().await;
		fx.local.insert("a.txt", b"hello");
		fx.merger
			.apply(SideName::Local, Change::AddFile {
				path: "a.txt".into(),
				meta: meta_local(b"hello", 7),
			})
			.await
			.unwrap();

		drain(&fx).await;

		assert_eq!(fx.remote.content("a.txt").unwrap(), b"hello");
		let doc = fx.store.get("a.txt").await.unwrap().unwrap();
		assert_eq!(doc.dirty_side(), None);
		assert!(doc.remote.is_some(), "remote identity captured from the write outcome");
	}

	#[tokio::test]
	async fn remote_add_downloads_parents_first() {
		let fx = fixture().await;
		fx.remote.insert("parent/file", b"content");
		fx.merger
			.apply(SideName::Remote, Change::AddDir {
				path: "parent".into(),
				meta: meta_remote(b"", "d1", "1-a"),
			})
			.await
			.unwrap();
		fx.merger
			.apply(SideName::Remote, Change::AddFile {
				path: "parent/file".into(),
				meta: meta_remote(b"content", "f1", "1-b"),
			})
			.await
			.unwrap();

		drain(&fx).await;

		let ops = fx.local.ops();
		let mkdir_pos = ops.iter().position(|op| op == "mkdir parent").unwrap();
		let write_pos = ops.iter().position(|op| op == "write parent/file").unwrap();
		assert!(mkdir_pos < write_pos, "parent created before child: {ops:?}");
		assert_eq!(fx.local.content("parent/file").unwrap(), b"content");
	}

	#[tokio::test]
	async fn move_is_mirrored_as_exactly_one_rename() {
		let fx = fixture().await;
		fx.local.insert("old.txt", b"x");
		fx.merger
			.apply(SideName::Local, Change::AddFile {
				path: "old.txt".into(),
				meta: meta_local(b"x", 3),
			})
			.await
			.unwrap();
		drain(&fx).await;

		fx.merger
			.apply(SideName::Local, Change::Move {
				from: "old.txt".into(),
				to: "new.txt".into(),
				doc_type: DocType::File,
				meta: meta_local(b"x", 3),
			})
			.await
			.unwrap();
		drain(&fx).await;

		assert_eq!(fx.remote.renames(), vec![("old.txt".to_string(), "new.txt".to_string())]);
		// No delete+create pair: one write from the initial add, none after.
		let writes = fx.remote.ops().iter().filter(|op| op.starts_with("write")).count();
		assert_eq!(writes, 1);
	}

	#[tokio::test]
	async fn move_with_edit_renames_then_re_transfers_content() {
		let fx = fixture().await;
		fx.local.insert("old.txt", b"one");
		fx.merger
			.apply(SideName::Local, Change::AddFile {
				path: "old.txt".into(),
				meta: meta_local(b"one", 3),
			})
			.await
			.unwrap();
		drain(&fx).await;
		assert_eq!(fx.remote.content("old.txt").unwrap(), b"one");

		// The file was renamed and edited inside one aggregation window.
		fx.local.insert("new.txt", b"two");
		fx.merger
			.apply(SideName::Local, Change::Move {
				from: "old.txt".into(),
				to: "new.txt".into(),
				doc_type: DocType::File,
				meta: meta_local(b"two", 3),
			})
			.await
			.unwrap();
		drain(&fx).await;

		assert_eq!(fx.remote.renames(), vec![("old.txt".to_string(), "new.txt".to_string())]);
		// The rename carried the old bytes; the digest mismatch forced a
		// follow-up transfer of the edited content.
		assert_eq!(fx.remote.content("new.txt").unwrap(), b"two");
		let doc = fx.store.get("new.txt").await.unwrap().unwrap();
		assert_eq!(doc.dirty_side(), None);
		assert_eq!(doc.md5sum.as_deref(), Some(digest_bytes(b"two").as_str()));
	}

	#[tokio::test]
	async fn folder_trash_is_one_physical_operation() {
		let fx = fixture().await;
		fx.remote.insert("parent/dir/file", b"f");
		for change in [
			Change::AddDir { path: "parent".into(), meta: meta_remote(b"", "p", "1-a") },
			Change::AddDir { path: "parent/dir".into(), meta: meta_remote(b"", "d", "1-b") },
			Change::AddFile {
				path: "parent/dir/file".into(),
				meta: meta_remote(b"f", "f", "1-c"),
			},
		] {
			fx.merger.apply(SideName::Remote, change).await.unwrap();
		}
		drain(&fx).await;

		fx.merger
			.apply(SideName::Remote, Change::Trash {
				path: "parent/dir".into(),
				doc_type: DocType::Folder,
			})
			.await
			.unwrap();
		drain(&fx).await;

		let trash_ops: Vec<_> =
			fx.local.ops().into_iter().filter(|op| op.starts_with("trash")).collect();
		assert_eq!(trash_ops, vec!["trash parent/dir"], "descendants ride along");
		// The parent folder itself survives.
		let parent = fx.store.get("parent").await.unwrap().unwrap();
		assert!(!parent.deleted);
	}

	#[tokio::test]
	async fn tombstone_is_removed_once_both_sides_acknowledge() {
		let fx = fixture().await;
		fx.local.insert("gone.txt", b"x");
		fx.merger
			.apply(SideName::Local, Change::AddFile {
				path: "gone.txt".into(),
				meta: meta_local(b"x", 9),
			})
			.await
			.unwrap();
		drain(&fx).await;

		fx.merger
			.apply(SideName::Local, Change::Trash {
				path: "gone.txt".into(),
				doc_type: DocType::File,
			})
			.await
			.unwrap();
		drain(&fx).await;

		assert!(fx.store.get("gone.txt").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn remote_restore_untrashes_on_the_local_side() {
		let fx = fixture().await;
		fx.local.insert("back.txt", b"x");
		fx.merger
			.apply(SideName::Local, Change::AddFile {
				path: "back.txt".into(),
				meta: meta_local(b"x", 5),
			})
			.await
			.unwrap();
		drain(&fx).await;

		// The remote trashes, then restores, before the executor mirrors
		// either; the local side sees a single restore.
		fx.merger
			.apply(SideName::Remote, Change::Trash {
				path: "back.txt".into(),
				doc_type: DocType::File,
			})
			.await
			.unwrap();
		fx.merger
			.apply(SideName::Remote, Change::Restore {
				path: "back.txt".into(),
				doc_type: DocType::File,
				meta: meta_remote(b"x", "r1", "4-d"),
			})
			.await
			.unwrap();
		drain(&fx).await;

		assert!(fx.local.ops().contains(&"restore back.txt".to_string()));
		let doc = fx.store.get("back.txt").await.unwrap().unwrap();
		assert!(!doc.restored);
		assert_eq!(doc.dirty_side(), None);
	}

	#[tokio::test]
	async fn up_to_date_progress_after_drain() {
		let mut fx = fixture().await;
		fx.local.insert("p.txt", b"q");
		fx.merger
			.apply(SideName::Local, Change::AddFile {
				path: "p.txt".into(),
				meta: meta_local(b"q", 2),
			})
			.await
			.unwrap();

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let executor = fx.executor.clone();
		let run = tokio::spawn(async move { executor.run(shutdown_rx).await });

		let mut saw_up_to_date = false;
		for _ in 0..64 {
			match tokio::time::timeout(Duration::from_secs(2), fx.progress_rx.recv()).await {
				Ok(Some(Progress::UpToDate)) => {
					saw_up_to_date = true;
					break;
				}
				Ok(Some(_)) => {}
				_ => break,
			}
		}
		assert!(saw_up_to_date);

		shutdown_tx.send(true).unwrap();
		run.await.unwrap().unwrap();
		assert_eq!(fx.remote.content("p.txt").unwrap(), b"q");
	}

	#[tokio::test]
	async fn ordering_prefers_shallow_creates_then_deep_deletes() {
		let mk = |path: &str, deleted: bool, seq: i64| {
			let mut doc = Document::new(
				path.to_string(),
				path.to_string(),
				DocType::File,
				SideName::Local,
			);
			doc.deleted = deleted;
			doc.seq = seq;
			doc
		};
		let mut docs = vec![
			mk("a/b/c", false, 1),
			mk("a", false, 2),
			mk("x", true, 3),
			mk("x/y/z", true, 4),
		];
		docs.sort_by_key(ordering_key);
		let order: Vec<_> = docs.iter().map(|d| d.path.as_str()).collect();
		assert_eq!(order, vec!["a", "a/b/c", "x/y/z", "x"]);
	}
}
