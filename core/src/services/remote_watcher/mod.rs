//! Remote watcher: follows the changes feed from a persisted cursor.
//!
//! Each page is reordered into a causally consistent batch (deletions
//! first, then creations parents-before-children), normalized into the
//! shared change vocabulary, and merged. The cursor only advances once a
//! whole page has merged, so a failed pull replays the same position.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use cirrus_remote_api::{
	ChangesPage, RemoteChange, RemoteClient, RemoteDoc, RemoteDocType, RemoteError, TRASH_DIR_ID,
};

use crate::domain::{Change, ChangeMeta, DocType, RemoteInfo, SideName};
use crate::error::{Classification, Classify, MergeError};
use crate::infrastructure::database::{Store, StoreError, CHECKPOINT_REMOTE_SEQ};
use crate::infrastructure::progress::{Progress, ProgressTx};
use crate::operations::merge::Merger;
use crate::shared::path as syncpath;

/// Delay between pulls after a transient feed failure.
const OFFLINE_RETRY: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RemoteWatcherError {
	#[error(transparent)]
	Remote(#[from] RemoteError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Merge(#[from] MergeError),
}

impl Classify for RemoteWatcherError {
	fn classification(&self) -> Classification {
		match self {
			Self::Remote(err) => err.classification(),
			Self::Store(err) => err.classification(),
			Self::Merge(err) => err.classification(),
		}
	}
}

/// Where pages of remote changes come from. The production source is the
/// API client; tests script their own.
#[async_trait]
pub trait ChangesSource: Send + Sync {
	async fn changes(&self, since: u64) -> Result<ChangesPage, RemoteError>;
}

#[async_trait]
impl ChangesSource for RemoteClient {
	async fn changes(&self, since: u64) -> Result<ChangesPage, RemoteError> {
		RemoteClient::changes(self, since).await
	}
}

pub struct RemoteWatcher {
	source: Arc<dyn ChangesSource>,
	store: Arc<Store>,
	merger: Arc<Merger>,
	progress: ProgressTx,
}

impl RemoteWatcher {
	pub fn new(
		source: Arc<dyn ChangesSource>,
		store: Arc<Store>,
		merger: Arc<Merger>,
		progress: ProgressTx,
	) -> Self {
		Self { source, store, merger, progress }
	}

	/// Polls the feed until `shutdown` flips or a halting error occurs.
	#[instrument(skip_all)]
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RemoteWatcherError> {
		let mut cursor = self.load_cursor().await?;
		let mut online = false;
		info!(cursor, "remote watcher starting");

		loop {
			if *shutdown.borrow() {
				info!("remote watcher stopping");
				return Ok(());
			}

			let pulled = tokio::select! {
				result = self.pull_once(cursor) => result,
				_ = shutdown.changed() => continue,
			};

			match pulled {
				Ok(new_cursor) => {
					if !online {
						self.progress.emit(Progress::Online);
						online = true;
					}
					cursor = new_cursor;
				}
				Err(err) if err.classification() == Classification::Transient => {
					if online {
						self.progress.emit(Progress::Offline);
						online = false;
					}
					warn!(error = %err, "feed pull failed, retrying");
					tokio::select! {
						_ = tokio::time::sleep(OFFLINE_RETRY) => {}
						_ = shutdown.changed() => {}
					}
				}
				Err(err) => {
					if err.classification() == Classification::Revoked {
						self.progress.emit(Progress::Revoked);
					}
					error!(error = %err, "remote watcher halting");
					return Err(err);
				}
			}
		}
	}

	async fn load_cursor(&self) -> Result<u64, RemoteWatcherError> {
		Ok(self
			.store
			.get_checkpoint(CHECKPOINT_REMOTE_SEQ)
			.await?
			.and_then(|v| v.parse().ok())
			.unwrap_or(0))
	}

	/// Pulls and merges one page. Returns the cursor to continue from; on
	/// error the caller keeps the old cursor and the page replays.
	pub async fn pull_once(&self, cursor: u64) -> Result<u64, RemoteWatcherError> {
		let page = self.source.changes(cursor).await?;
		if page.changes.is_empty() {
			return Ok(page.last_seq.max(cursor));
		}
		debug!(count = page.changes.len(), cursor, "merging remote changes");

		let mut batch = page.changes;
		order_batch(&mut batch);

		for remote_change in batch {
			let Some(change) = self.normalize(&remote_change).await? else {
				continue;
			};
			match self.merger.apply(SideName::Remote, change).await {
				Ok(()) => {}
				Err(err) if err.classification() == Classification::Incompatible => {
					// Advancing past an incompatible document keeps the
					// feed from replaying it on every poll; the document
					// stays parked until the user renames it.
					warn!(error = %err, "incompatible change skipped");
				}
				Err(err) => return Err(err.into()),
			}
		}

		let next = page.last_seq.max(cursor);
		self.store
			.set_checkpoint(CHECKPOINT_REMOTE_SEQ, &next.to_string())
			.await?;
		Ok(next)
	}

	/// Maps one feed entry onto the shared change vocabulary.
	async fn normalize(
		&self,
		change: &RemoteChange,
	) -> Result<Option<Change>, RemoteWatcherError> {
		let known = self.store.get_by_remote_id(&change.id).await?;

		// An erased document, or one sitting in the remote trash.
		let is_deletion = change.deleted || change.doc.as_ref().is_some_and(is_trashed);
		if is_deletion {
			let Some(known) = known else {
				// Never tracked: deletion of something we never saw.
				return Ok(None);
			};
			return Ok(Some(Change::Trash { path: known.path, doc_type: known.doc_type }));
		}

		let Some(doc) = &change.doc else {
			return Ok(None);
		};
		let Ok(path) = syncpath::canonicalize(&doc.path) else {
			warn!(path = %doc.path, "unusable remote path skipped");
			return Ok(None);
		};
		let meta = meta_from_remote(doc);
		let doc_type = match doc.doc_type {
			RemoteDocType::File => DocType::File,
			RemoteDocType::Directory => DocType::Folder,
		};

		let change = match known {
			None => match doc_type {
				DocType::File => Change::AddFile { path, meta },
				DocType::Folder => Change::AddDir { path, meta },
			},
			Some(known) if known.deleted => Change::Restore { path, doc_type, meta },
			Some(known) if known.path != path => {
				Change::Move { from: known.path, to: path, doc_type, meta }
			}
			Some(_) => match doc_type {
				DocType::File => Change::UpdateFile { path, meta },
				DocType::Folder => Change::AddDir { path, meta },
			},
		};
		Ok(Some(change))
	}
}

/// Some servers report trashed documents only by their new location
/// under the trash directory.
fn is_trashed(doc: &RemoteDoc) -> bool {
	doc.trashed || doc.path.trim_start_matches('/').starts_with(TRASH_DIR_ID)
}

/// Deletions first (deepest first, so children clear before parents),
/// then everything else parents-before-children. Feed order breaks ties.
fn order_batch(changes: &mut [RemoteChange]) {
	changes.sort_by_key(|change| {
		let is_deletion = change.deleted || change.doc.as_ref().is_some_and(is_trashed);
		let depth = change
			.doc
			.as_ref()
			.map(|d| syncpath::depth(d.path.trim_matches('/')) as i64)
			.unwrap_or(0);
		if is_deletion {
			(0, -depth, change.seq)
		} else {
			(1, depth, change.seq)
		}
	});
}

fn meta_from_remote(doc: &RemoteDoc) -> ChangeMeta {
	ChangeMeta {
		md5sum: doc.md5sum.clone(),
		size: Some(doc.size),
		mtime: Some(doc.updated_at),
		executable: doc.executable,
		ino: None,
		remote: Some(RemoteInfo { id: doc.id.clone(), rev: doc.rev.clone() }),
		mime: doc.mime.clone(),
		class: doc.class.clone(),
		tags: doc.tags.clone(),
	}
}
