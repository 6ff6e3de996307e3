//! The capability object for one mirrored store.
//!
//! The executor (and the merger, for conflict renames) depend only on
//! this trait; the local filesystem and the remote API each implement it
//! once. Integration tests substitute an in-memory side.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use md5::{Digest, Md5};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use cirrus_remote_api::RemoteClient;

use crate::domain::{Document, LocalInfo, RemoteInfo, SideName};
use crate::error::SyncError;
use crate::shared::path as syncpath;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, SyncError>> + Send>>;

/// Fresh identity information after a mutation, used to update the
/// document's side snapshot before acknowledging.
#[derive(Debug, Default, Clone)]
pub struct WriteOutcome {
	pub local: Option<LocalInfo>,
	pub remote: Option<RemoteInfo>,
	/// Digest of the content now on the side, when the operation knows
	/// it. Restores report this so stale trash content gets re-mirrored.
	pub md5sum: Option<String>,
}

/// One mirrored store, as the executor sees it.
#[async_trait]
pub trait Side: Send + Sync {
	fn name(&self) -> SideName;

	/// Streams the content of `doc`.
	async fn read(&self, doc: &Document) -> Result<ByteStream, SyncError>;

	/// Writes file content atomically at `doc.path`, verifying the digest.
	async fn write(&self, doc: &Document, content: ByteStream) -> Result<WriteOutcome, SyncError>;

	async fn mkdir(&self, doc: &Document) -> Result<WriteOutcome, SyncError>;

	/// Renames `from_path` to `doc.path`.
	async fn rename(&self, doc: &Document, from_path: &str) -> Result<WriteOutcome, SyncError>;

	/// Moves `doc` to this side's trash. Already-gone sources succeed.
	async fn trash(&self, doc: &Document) -> Result<(), SyncError>;

	/// Brings a trashed document back to `doc.path`.
	async fn restore(&self, doc: &Document) -> Result<WriteOutcome, SyncError>;
}

/// Both capabilities, keyed by side.
#[derive(Clone)]
pub struct SidePair {
	pub local: Arc<dyn Side>,
	pub remote: Arc<dyn Side>,
}

impl SidePair {
	pub fn get(&self, name: SideName) -> &Arc<dyn Side> {
		match name {
			SideName::Local => &self.local,
			SideName::Remote => &self.remote,
		}
	}
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

/// The synchronized directory tree.
pub struct LocalSide {
	root: PathBuf,
	staging: PathBuf,
	trash: PathBuf,
}

impl LocalSide {
	pub fn new(root: PathBuf, staging: PathBuf, trash: PathBuf) -> Self {
		Self { root, staging, trash }
	}

	fn abs(&self, path: &str) -> PathBuf {
		self.root.join(path)
	}

	fn io_err(path: &Path, source: std::io::Error) -> SyncError {
		SyncError::Io { path: path.display().to_string(), source }
	}

	async fn stat_local(&self, path: &Path) -> Result<LocalInfo, SyncError> {
		let meta = tokio::fs::metadata(path).await.map_err(|e| Self::io_err(path, e))?;
		Ok(local_info_from(&meta))
	}
}

fn local_info_from(meta: &std::fs::Metadata) -> LocalInfo {
	#[cfg(unix)]
	let ino = {
		use std::os::unix::fs::MetadataExt;
		Some(meta.ino())
	};
	#[cfg(not(unix))]
	let ino: Option<u64> = None;

	#[cfg(unix)]
	let executable = {
		use std::os::unix::fs::PermissionsExt;
		meta.is_file() && meta.permissions().mode() & 0o111 != 0
	};
	#[cfg(not(unix))]
	let executable = false;

	LocalInfo {
		size: meta.len(),
		mtime: meta.modified().map(Into::into).unwrap_or_else(|_| chrono::Utc::now()),
		ino,
		executable,
	}
}

#[async_trait]
impl Side for LocalSide {
	fn name(&self) -> SideName {
		SideName::Local
	}

	async fn read(&self, doc: &Document) -> Result<ByteStream, SyncError> {
		let path = self.abs(&doc.path);
		let file = tokio::fs::File::open(&path).await.map_err(|e| Self::io_err(&path, e))?;
		let display = path.display().to_string();
		let stream = tokio_util::io::ReaderStream::new(file)
			.map_err(move |e| SyncError::Io { path: display.clone(), source: e });
		Ok(Box::pin(stream))
	}

	async fn write(&self, doc: &Document, mut content: ByteStream) -> Result<WriteOutcome, SyncError> {
		tokio::fs::create_dir_all(&self.staging)
			.await
			.map_err(|e| Self::io_err(&self.staging, e))?;
		let staged = self.staging.join(Uuid::new_v4().to_string());
		let mut file = tokio::fs::File::create(&staged)
			.await
			.map_err(|e| Self::io_err(&staged, e))?;

		let mut hasher = Md5::new();
		while let Some(chunk) = content.next().await {
			let chunk = chunk?;
			hasher.update(&chunk);
			file.write_all(&chunk).await.map_err(|e| Self::io_err(&staged, e))?;
		}
		file.sync_all().await.map_err(|e| Self::io_err(&staged, e))?;
		drop(file);

		// The digest is checked before the rename so a bad transfer never
		// replaces the file in place.
		let written = BASE64.encode(hasher.finalize());
		if let Some(expected) = &doc.md5sum {
			if &written != expected {
				let _ = tokio::fs::remove_file(&staged).await;
				return Err(Self::io_err(
					&staged,
					std::io::Error::new(
						std::io::ErrorKind::InvalidData,
						format!("digest mismatch: expected {expected}, wrote {written}"),
					),
				));
			}
		}

		#[cfg(unix)]
		if doc.executable {
			use std::os::unix::fs::PermissionsExt;
			tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
				.await
				.map_err(|e| Self::io_err(&staged, e))?;
		}

		let target = self.abs(&doc.path);
		if let Some(parent) = target.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(|e| Self::io_err(parent, e))?;
		}
		tokio::fs::rename(&staged, &target).await.map_err(|e| Self::io_err(&target, e))?;
		debug!(path = %doc.path, "local file written");

		Ok(WriteOutcome {
			local: Some(self.stat_local(&target).await?),
			..Default::default()
		})
	}

	async fn mkdir(&self, doc: &Document) -> Result<WriteOutcome, SyncError> {
		let target = self.abs(&doc.path);
		tokio::fs::create_dir_all(&target).await.map_err(|e| Self::io_err(&target, e))?;
		Ok(WriteOutcome {
			local: Some(self.stat_local(&target).await?),
			..Default::default()
		})
	}

	async fn rename(&self, doc: &Document, from_path: &str) -> Result<WriteOutcome, SyncError> {
		let from = self.abs(from_path);
		let to = self.abs(&doc.path);
		if let Some(parent) = to.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(|e| Self::io_err(parent, e))?;
		}
		match tokio::fs::rename(&from, &to).await {
			Ok(()) => {}
			// Cross-device moves cannot rename; fall back to copy+delete
			// for files. The new inode is reported in the outcome.
			Err(_) if doc.is_file() && from.exists() => {
				tokio::fs::copy(&from, &to).await.map_err(|e| Self::io_err(&to, e))?;
				tokio::fs::remove_file(&from).await.map_err(|e| Self::io_err(&from, e))?;
				warn!(from = %from_path, to = %doc.path, "rename fell back to copy+delete");
			}
			Err(e) => return Err(Self::io_err(&from, e)),
		}
		// The digest of what actually landed at the new path, so the
		// executor can tell a pure rename from a rename+edit.
		let md5sum = if doc.is_file() {
			Some(crate::shared::digest::digest(&to).await.map_err(|e| Self::io_err(&to, e))?)
		} else {
			None
		};
		Ok(WriteOutcome {
			local: Some(self.stat_local(&to).await?),
			remote: None,
			md5sum,
		})
	}

	async fn trash(&self, doc: &Document) -> Result<(), SyncError> {
		let source = self.abs(&doc.path);
		if !source.exists() {
			// Already moved along with a trashed ancestor.
			return Ok(());
		}
		tokio::fs::create_dir_all(&self.trash)
			.await
			.map_err(|e| Self::io_err(&self.trash, e))?;
		let mut target = self.trash.join(syncpath::name(&doc.path));
		if target.exists() {
			let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
			target = self
				.trash
				.join(format!("{}-{stamp}", syncpath::name(&doc.path)));
		}
		tokio::fs::rename(&source, &target).await.map_err(|e| Self::io_err(&source, e))?;
		debug!(path = %doc.path, "moved to local trash");
		Ok(())
	}

	async fn restore(&self, doc: &Document) -> Result<WriteOutcome, SyncError> {
		let trashed = self.trash.join(syncpath::name(&doc.path));
		let target = self.abs(&doc.path);
		if let Some(parent) = target.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(|e| Self::io_err(parent, e))?;
		}
		tokio::fs::rename(&trashed, &target)
			.await
			.map_err(|e| Self::io_err(&trashed, e))?;
		let md5sum = if doc.is_file() {
			Some(crate::shared::digest::digest(&target)
				.await
				.map_err(|e| Self::io_err(&target, e))?)
		} else {
			None
		};
		Ok(WriteOutcome {
			local: Some(self.stat_local(&target).await?),
			remote: None,
			md5sum,
		})
	}
}

// ---------------------------------------------------------------------------
// Remote cloud
// ---------------------------------------------------------------------------

/// The remote instance, through its API client.
pub struct RemoteSide {
	client: RemoteClient,
}

impl RemoteSide {
	pub fn new(client: RemoteClient) -> Self {
		Self { client }
	}

	fn remote_info(doc: &Document) -> Result<&RemoteInfo, SyncError> {
		doc.remote.as_ref().ok_or_else(|| SyncError::Io {
			path: doc.path.clone(),
			source: std::io::Error::new(
				std::io::ErrorKind::NotFound,
				"document has no remote identity yet",
			),
		})
	}
}

#[async_trait]
impl Side for RemoteSide {
	fn name(&self) -> SideName {
		SideName::Remote
	}

	async fn read(&self, doc: &Document) -> Result<ByteStream, SyncError> {
		let remote = Self::remote_info(doc)?;
		let stream = self.client.read_file(&remote.id).await?;
		Ok(Box::pin(stream.map_err(SyncError::from)))
	}

	async fn write(&self, doc: &Document, content: ByteStream) -> Result<WriteOutcome, SyncError> {
		let md5sum = doc.md5sum.as_deref().unwrap_or_default();
		let size = doc.size.unwrap_or(0);
		let body = reqwest::Body::wrap_stream(content);
		let written = match &doc.remote {
			None => {
				self.client
					.create_file(&doc.path, md5sum, size, doc.executable, body)
					.await?
			}
			Some(remote) => {
				self.client
					.update_file(&remote.id, &remote.rev, md5sum, size, body)
					.await?
			}
		};
		Ok(WriteOutcome {
			remote: Some(RemoteInfo { id: written.id, rev: written.rev }),
			..Default::default()
		})
	}

	async fn mkdir(&self, doc: &Document) -> Result<WriteOutcome, SyncError> {
		let created = self.client.create_dir(&doc.path).await?;
		Ok(WriteOutcome {
			remote: Some(RemoteInfo { id: created.id, rev: created.rev }),
			..Default::default()
		})
	}

	async fn rename(&self, doc: &Document, _from_path: &str) -> Result<WriteOutcome, SyncError> {
		let remote = Self::remote_info(doc)?;
		let moved = self.client.move_doc(&remote.id, &remote.rev, &doc.path).await?;
		Ok(WriteOutcome {
			local: None,
			remote: Some(RemoteInfo { id: moved.id, rev: moved.rev }),
			md5sum: moved.md5sum,
		})
	}

	async fn trash(&self, doc: &Document) -> Result<(), SyncError> {
		let remote = Self::remote_info(doc)?;
		match self.client.trash(&remote.id, &remote.rev).await {
			Ok(_) => Ok(()),
			// Gone already, trashed along with an ancestor or by another
			// client; the intended state holds.
			Err(err) if is_gone(&err) => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	async fn restore(&self, doc: &Document) -> Result<WriteOutcome, SyncError> {
		let remote = Self::remote_info(doc)?;
		let restored = self.client.restore(&remote.id).await?;
		Ok(WriteOutcome {
			local: None,
			remote: Some(RemoteInfo { id: restored.id, rev: restored.rev }),
			md5sum: restored.md5sum,
		})
	}
}

fn is_gone(err: &cirrus_remote_api::RemoteError) -> bool {
	matches!(
		err,
		cirrus_remote_api::RemoteError::Status { status, .. }
			if *status == reqwest::StatusCode::NOT_FOUND
				|| *status == reqwest::StatusCode::GONE
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::DocType;
	use crate::shared::digest::digest_bytes;

	fn local_side(dir: &Path) -> LocalSide {
		LocalSide::new(
			dir.join("root"),
			dir.join("staging"),
			dir.join("root/.Trash"),
		)
	}

	fn file_doc(path: &str, content: &[u8]) -> Document {
		let mut doc =
			Document::new(path.to_string(), path.to_string(), DocType::File, SideName::Remote);
		doc.md5sum = Some(digest_bytes(content));
		doc.size = Some(content.len() as u64);
		doc
	}

	fn byte_stream(content: Vec<u8>) -> ByteStream {
		Box::pin(futures::stream::once(async move { Ok(Bytes::from(content)) }))
	}

	#[tokio::test]
	async fn write_stages_verifies_and_renames_into_place() {
		let dir = tempfile::tempdir().unwrap();
		let side = local_side(dir.path());
		let doc = file_doc("notes/hello.txt", b"hello");

		let outcome = side.write(&doc, byte_stream(b"hello".to_vec())).await.unwrap();
		let info = outcome.local.unwrap();
		assert_eq!(info.size, 5);
		assert!(info.ino.is_some());
		let on_disk = std::fs::read(dir.path().join("root/notes/hello.txt")).unwrap();
		assert_eq!(on_disk, b"hello");
		// Staging left nothing behind.
		assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
	}

	#[tokio::test]
	async fn write_rejects_digest_mismatch() {
		let dir = tempfile::tempdir().unwrap();
		let side = local_side(dir.path());
		let doc = file_doc("corrupt.bin", b"expected");

		let err = side.write(&doc, byte_stream(b"different".to_vec())).await.unwrap_err();
		assert!(matches!(err, SyncError::Io { .. }));
		assert!(!dir.path().join("root/corrupt.bin").exists());
	}

	#[tokio::test]
	async fn read_streams_file_back() {
		let dir = tempfile::tempdir().unwrap();
		let side = local_side(dir.path());
		let doc = file_doc("data.txt", b"round trip");
		side.write(&doc, byte_stream(b"round trip".to_vec())).await.unwrap();

		let mut stream = side.read(&doc).await.unwrap();
		let mut collected = Vec::new();
		while let Some(chunk) = stream.next().await {
			collected.extend_from_slice(&chunk.unwrap());
		}
		assert_eq!(collected, b"round trip");
	}

	#[tokio::test]
	async fn rename_moves_within_root() {
		let dir = tempfile::tempdir().unwrap();
		let side = local_side(dir.path());
		let doc = file_doc("old.txt", b"x");
		side.write(&doc, byte_stream(b"x".to_vec())).await.unwrap();

		let mut moved = doc.clone();
		moved.path = "sub/new.txt".to_string();
		side.rename(&moved, "old.txt").await.unwrap();
		assert!(!dir.path().join("root/old.txt").exists());
		assert!(dir.path().join("root/sub/new.txt").exists());
	}

	#[tokio::test]
	async fn trash_moves_folder_with_contents_and_tolerates_missing() {
		let dir = tempfile::tempdir().unwrap();
		let side = local_side(dir.path());
		std::fs::create_dir_all(dir.path().join("root/parent/dir/sub")).unwrap();
		std::fs::write(dir.path().join("root/parent/dir/sub/file"), b"f").unwrap();

		let folder = Document::new(
			"parent/dir".into(),
			"parent/dir".into(),
			DocType::Folder,
			SideName::Remote,
		);
		side.trash(&folder).await.unwrap();
		assert!(dir.path().join("root/.Trash/dir/sub/file").exists());
		assert!(!dir.path().join("root/parent/dir").exists());

		// A descendant trashed after its ancestor is already gone.
		let child = Document::new(
			"parent/dir/sub/file".into(),
			"parent/dir/sub/file".into(),
			DocType::File,
			SideName::Remote,
		);
		side.trash(&child).await.unwrap();
	}

	#[tokio::test]
	async fn restore_brings_back_from_trash() {
		let dir = tempfile::tempdir().unwrap();
		let side = local_side(dir.path());
		let doc = file_doc("keep.txt", b"k");
		side.write(&doc, byte_stream(b"k".to_vec())).await.unwrap();
		side.trash(&doc).await.unwrap();
		assert!(!dir.path().join("root/keep.txt").exists());

		side.restore(&doc).await.unwrap();
		assert!(dir.path().join("root/keep.txt").exists());
	}
}
