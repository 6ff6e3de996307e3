//! Startup scan: reconcile the tree as it is now against the catalog.
//!
//! Changes made while the daemon was stopped surface as synthetic raw
//! events fed through the same aggregation window as live events, so an
//! offline rename still reconstructs into a move by inode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use super::{is_ignored_name, WatcherError};
use crate::domain::{DocType, Document};
use crate::infrastructure::database::Store;
use crate::services::local_watcher::aggregator::{RawEvent, RawKind};
use crate::shared::digest;
use crate::shared::path::{self as syncpath, Platform};

/// Walks `root` and diffs it against the catalog.
#[instrument(skip_all, fields(root = %root.display()))]
pub async fn scan_tree(
	root: &Path,
	store: &Store,
	platform: Platform,
) -> Result<Vec<RawEvent>, WatcherError> {
	let known = store.all_live().await?;
	let mut by_id: HashMap<String, &Document> = known.iter().map(|d| (d.id.clone(), d)).collect();

	let mut events = Vec::new();
	let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

	while let Some(dir) = stack.pop() {
		let mut entries = match tokio::fs::read_dir(&dir).await {
			Ok(entries) => entries,
			Err(err) => {
				warn!(dir = %dir.display(), error = %err, "unreadable directory skipped");
				continue;
			}
		};
		while let Some(entry) = entries.next_entry().await.map_err(|source| WatcherError::Io {
			path: dir.display().to_string(),
			source,
		})? {
			let name = entry.file_name();
			let Some(name) = name.to_str() else {
				warn!(?name, "non-UTF-8 name skipped");
				continue;
			};
			if is_ignored_name(name) {
				continue;
			}

			let abs = entry.path();
			let Some(canonical) = canonical_for(root, &abs) else {
				continue;
			};
			let meta = match entry.metadata().await {
				Ok(meta) => meta,
				Err(err) => {
					warn!(path = %abs.display(), error = %err, "stat failed, skipped");
					continue;
				}
			};
			if meta.is_symlink() {
				debug!(path = %abs.display(), "symlink skipped");
				continue;
			}

			let id = syncpath::id(&canonical, platform);
			let doc = by_id.remove(&id);

			if meta.is_dir() {
				stack.push(abs.clone());
				match doc {
					Some(existing) if existing.path == canonical => {}
					_ => {
						events.push(folder_event(&canonical, &meta, doc));
					}
				}
				continue;
			}

			match doc {
				Some(existing)
					if existing.path == canonical && unchanged(existing, &meta) => {}
				other => {
					if let Some(event) = file_event(&abs, &canonical, &meta, other).await {
						events.push(event);
					}
				}
			}
		}
	}

	// Whatever the catalog still holds was not found on disk.
	for doc in by_id.into_values() {
		// Never materialized locally: absence is pending work, not a delete.
		if doc.sides.local == 0 {
			continue;
		}
		events.push(RawEvent {
			kind: RawKind::Deleted,
			path: doc.path.clone(),
			doc_type: doc.doc_type,
			ino: doc.ino,
			size: doc.size,
			mtime: Some(doc.updated_at),
			md5sum: doc.md5sum.clone(),
			executable: doc.executable,
			prior_path: None,
		});
	}

	debug!(count = events.len(), "scan produced synthetic events");
	Ok(events)
}

fn canonical_for(root: &Path, abs: &Path) -> Option<String> {
	let rel = abs.strip_prefix(root).ok()?;
	syncpath::canonicalize(&rel.to_string_lossy()).ok()
}

/// Size and whole-second mtime agreement means the content was not
/// touched; anything else forces a re-digest.
fn unchanged(doc: &Document, meta: &std::fs::Metadata) -> bool {
	let Some(local) = &doc.local else {
		return false;
	};
	if local.size != meta.len() {
		return false;
	}
	let Ok(modified) = meta.modified() else {
		return false;
	};
	let mtime: chrono::DateTime<chrono::Utc> = modified.into();
	mtime.timestamp() == local.mtime.timestamp()
}

fn folder_event(canonical: &str, meta: &std::fs::Metadata, doc: Option<&Document>) -> RawEvent {
	RawEvent {
		kind: RawKind::Created,
		path: canonical.to_string(),
		doc_type: DocType::Folder,
		ino: ino_of(meta),
		size: None,
		mtime: meta.modified().ok().map(Into::into),
		md5sum: None,
		executable: false,
		prior_path: doc.filter(|d| d.path != canonical).map(|d| d.path.clone()),
	}
}

async fn file_event(
	abs: &Path,
	canonical: &str,
	meta: &std::fs::Metadata,
	doc: Option<&Document>,
) -> Option<RawEvent> {
	let md5sum = match digest::digest(abs).await {
		Ok(sum) => sum,
		Err(err) => {
			warn!(path = %abs.display(), error = %err, "digest failed, skipped");
			return None;
		}
	};

	let kind = match doc {
		Some(existing) if existing.path == canonical => {
			if existing.md5sum.as_deref() == Some(md5sum.as_str()) {
				// Touched but identical; nothing to merge.
				return None;
			}
			RawKind::Modified
		}
		_ => RawKind::Created,
	};

	Some(RawEvent {
		kind,
		path: canonical.to_string(),
		doc_type: DocType::File,
		ino: ino_of(meta),
		size: Some(meta.len()),
		mtime: meta.modified().ok().map(Into::into),
		md5sum: Some(md5sum),
		executable: is_executable(meta),
		prior_path: doc.filter(|d| d.path != canonical).map(|d| d.path.clone()),
	})
}

pub(super) fn ino_of(meta: &std::fs::Metadata) -> Option<u64> {
	#[cfg(unix)]
	{
		use std::os::unix::fs::MetadataExt;
		Some(meta.ino())
	}
	#[cfg(not(unix))]
	{
		None
	}
}

pub(super) fn is_executable(meta: &std::fs::Metadata) -> bool {
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		meta.is_file() && meta.permissions().mode() & 0o111 != 0
	}
	#[cfg(not(unix))]
	{
		false
	}
}
