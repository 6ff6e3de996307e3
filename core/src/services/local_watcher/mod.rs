//! Local watcher: OS events in, normalized changes out.
//!
//! Raw `notify` events are canonicalized, enriched with stat and digest,
//! buffered for the aggregation window, and handed to the merger as
//! normalized changes. At startup an initial scan reconciles whatever
//! happened while the daemon was stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{DocType, SideName};
use crate::error::{Classification, Classify, MergeError};
use crate::infrastructure::database::{Store, StoreError, CHECKPOINT_LOCAL_SCAN};
use crate::operations::merge::Merger;
use crate::shared::digest::{self, DigestError};
use crate::shared::path::{self as syncpath, Platform};

pub mod aggregator;
pub mod scan;

use aggregator::{Aggregator, RawEvent, RawKind};

/// Bound on waiting for a file to settle before digesting it.
const DIGEST_SETTLE_WAIT: Duration = Duration::from_secs(5);

/// Attempts to merge one change before it is dropped with an error.
const MERGE_RETRIES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
	#[error("filesystem watcher error: {0}")]
	Notify(#[from] notify::Error),
	#[error("I/O error on {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Merge(#[from] MergeError),
	#[error(transparent)]
	Digest(#[from] DigestError),
}

pub struct LocalWatcher {
	root: PathBuf,
	store: Arc<Store>,
	merger: Arc<Merger>,
	platform: Platform,
	window: Duration,
	window_max: Duration,
	optimistic_moves: bool,
}

impl LocalWatcher {
	pub fn new(
		root: PathBuf,
		store: Arc<Store>,
		merger: Arc<Merger>,
		platform: Platform,
		window: Duration,
		window_max: Duration,
		optimistic_moves: bool,
	) -> Self {
		Self { root, store, merger, platform, window, window_max, optimistic_moves }
	}

	/// Scans, then follows live events until `shutdown` flips.
	#[instrument(skip_all, fields(root = %self.root.display()))]
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WatcherError> {
		let mut agg = Aggregator::new(self.optimistic_moves);

		info!("initial scan starting");
		for event in scan::scan_tree(&self.root, &self.store, self.platform).await? {
			agg.push(event);
		}
		self.apply(agg.flush()).await?;
		self.store
			.set_checkpoint(CHECKPOINT_LOCAL_SCAN, &chrono::Utc::now().to_rfc3339())
			.await?;
		info!("initial scan merged");

		// The notify callback runs on its own thread; an unbounded sender
		// is the safe bridge into the async loop.
		let (tx, mut rx) = mpsc::unbounded_channel();
		let mut watcher = notify::recommended_watcher(
			move |result: Result<notify::Event, notify::Error>| {
				let _ = tx.send(result);
			},
		)?;
		watcher.watch(&self.root, RecursiveMode::Recursive)?;
		info!("watching for changes");

		// (soft deadline, hard cap) for the open aggregation window.
		let mut window: Option<(Instant, Instant)> = None;

		loop {
			let flush_at = window.map(|(soft, _)| soft);
			tokio::select! {
				_ = shutdown.changed() => {
					self.apply(agg.flush()).await?;
					info!("local watcher stopping");
					return Ok(());
				}
				received = rx.recv() => {
					match received {
						Some(Ok(event)) => {
							let had_events = !agg.is_empty();
							for raw in self.normalize(event).await {
								agg.push(raw);
							}
							if !agg.is_empty() {
								let now = Instant::now();
								window = Some(match window {
									// New events extend the window, up to
									// the hard cap set by the first one.
									Some((_, cap)) if had_events => {
										((now + self.window).min(cap), cap)
									}
									_ => (now + self.window, now + self.window_max),
								});
							}
						}
						Some(Err(err)) => warn!(error = %err, "watch error"),
						None => {
							warn!("watcher channel closed");
							self.apply(agg.flush()).await?;
							return Ok(());
						}
					}
				}
				_ = sleep_until_opt(flush_at), if flush_at.is_some() => {
					window = None;
					self.apply(agg.flush()).await?;
				}
			}
		}
	}

	/// Feeds flushed changes to the merger, in emission order.
	async fn apply(&self, changes: Vec<crate::domain::Change>) -> Result<(), WatcherError> {
		for change in changes {
			let mut attempt = 0;
			loop {
				match self.merger.apply(SideName::Local, change.clone()).await {
					Ok(()) => break,
					Err(err) => {
						let class = err.classification();
						if class == Classification::Corrupt {
							return Err(err.into());
						}
						attempt += 1;
						if class == Classification::Transient && attempt < MERGE_RETRIES {
							debug!(kind = change.kind(), attempt, "merge retry");
							tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
							continue;
						}
						error!(
							kind = change.kind(), path = change.path(), error = %err,
							"change dropped after merge failures"
						);
						break;
					}
				}
			}
		}
		Ok(())
	}

	/// Canonicalizes and enriches one OS event.
	async fn normalize(&self, event: notify::Event) -> Vec<RawEvent> {
		let mut raw = Vec::new();
		match event.kind {
			EventKind::Create(_) => {
				for path in &event.paths {
					if let Some(e) = self.observed_node(path).await {
						raw.push(e);
					}
				}
			}
			EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
				// Linux pairs both ends in one event: [from, to].
				if let [from, to] = event.paths.as_slice() {
					if let Some(e) = self.vanished_node(from).await {
						raw.push(e);
					}
					if let Some(e) = self.observed_node(to).await {
						raw.push(e);
					}
				}
			}
			EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
				for path in &event.paths {
					if let Some(e) = self.vanished_node(path).await {
						raw.push(e);
					}
				}
			}
			EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
				for path in &event.paths {
					if let Some(e) = self.observed_node(path).await {
						raw.push(e);
					}
				}
			}
			EventKind::Modify(_) => {
				for path in &event.paths {
					match self.observed_node(path).await {
						Some(mut e) => {
							e.kind = RawKind::Modified;
							raw.push(e);
						}
						// A modify for a path that no longer stats is a
						// deletion racing the event queue.
						None => {
							if let Some(e) = self.vanished_node(path).await {
								raw.push(e);
							}
						}
					}
				}
			}
			EventKind::Remove(_) => {
				for path in &event.paths {
					if let Some(e) = self.vanished_node(path).await {
						raw.push(e);
					}
				}
			}
			_ => {}
		}
		raw
	}

	/// Raw event for a path that exists now.
	async fn observed_node(&self, abs: &Path) -> Option<RawEvent> {
		let canonical = self.canonical(abs)?;
		let meta = tokio::fs::symlink_metadata(abs).await.ok()?;
		if meta.is_symlink() {
			return None;
		}

		let prior_path = if self.platform.is_case_insensitive() {
			let id = syncpath::id(&canonical, self.platform);
			match self.store.get(&id).await {
				Ok(Some(doc)) if doc.path != canonical => Some(doc.path),
				_ => None,
			}
		} else {
			None
		};

		if meta.is_dir() {
			return Some(RawEvent {
				kind: RawKind::Created,
				path: canonical,
				doc_type: DocType::Folder,
				ino: scan::ino_of(&meta),
				size: None,
				mtime: meta.modified().ok().map(Into::into),
				md5sum: None,
				executable: false,
				prior_path,
			});
		}

		let md5sum = match digest::stable_digest(abs, DIGEST_SETTLE_WAIT).await {
			Ok(sum) => Some(sum),
			Err(err) => {
				warn!(path = %abs.display(), error = %err, "digest unavailable");
				return None;
			}
		};
		Some(RawEvent {
			kind: RawKind::Created,
			path: canonical,
			doc_type: DocType::File,
			ino: scan::ino_of(&meta),
			size: Some(meta.len()),
			mtime: meta.modified().ok().map(Into::into),
			md5sum,
			executable: scan::is_executable(&meta),
			prior_path,
		})
	}

	/// Raw event for a path that is gone; identity comes from the catalog.
	async fn vanished_node(&self, abs: &Path) -> Option<RawEvent> {
		let canonical = self.canonical(abs)?;
		let id = syncpath::id(&canonical, self.platform);
		let doc = self.store.get(&id).await.ok()??;
		if doc.deleted {
			return None;
		}
		Some(RawEvent {
			kind: RawKind::Deleted,
			path: doc.path.clone(),
			doc_type: doc.doc_type,
			ino: doc.ino,
			size: doc.size,
			mtime: Some(doc.updated_at),
			md5sum: doc.md5sum.clone(),
			executable: doc.executable,
			prior_path: None,
		})
	}

	fn canonical(&self, abs: &Path) -> Option<String> {
		let rel = abs.strip_prefix(&self.root).ok()?;
		let canonical = syncpath::canonicalize(&rel.to_string_lossy()).ok()?;
		if canonical.split('/').any(is_ignored_name) {
			return None;
		}
		Some(canonical)
	}
}

async fn sleep_until_opt(deadline: Option<Instant>) {
	match deadline {
		Some(at) => tokio::time::sleep_until(at).await,
		None => std::future::pending().await,
	}
}

/// Names the watcher never reports: our own bookkeeping directories plus
/// the usual platform and editor droppings.
pub fn is_ignored_name(name: &str) -> bool {
	matches!(name, ".Trash" | ".DS_Store" | "Thumbs.db" | "desktop.ini" | ".cirrus-staging")
		|| name.ends_with(".tmp")
		|| name.ends_with(".swp")
		|| name.ends_with('~')
		|| name.starts_with(".#")
		|| name.starts_with("~$")
}
