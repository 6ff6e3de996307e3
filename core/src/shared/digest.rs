//! Content digesting for local files.
//!
//! The remote verifies uploads against a base64 MD5 (`Content-MD5`), so
//! the same digest is what the catalog stores and what move detection
//! compares.

use std::io;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

/// Read size per chunk while streaming a file through the hasher.
const CHUNK_SIZE: usize = 256 * 1024;

/// Pause between the two stats that establish a file as settled.
const SETTLE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
	#[error("I/O error reading {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: io::Error,
	},
	/// The file kept changing for the whole stabilization window.
	#[error("file still being written: {path}")]
	StillChanging { path: String },
}

/// Streams `path` and returns its base64 MD5.
pub async fn digest(path: &Path) -> io::Result<String> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut hasher = Md5::new();
	let mut buffer = vec![0u8; CHUNK_SIZE];
	loop {
		let read = file.read(&mut buffer).await?;
		if read == 0 {
			break;
		}
		hasher.update(&buffer[..read]);
	}
	Ok(BASE64.encode(hasher.finalize()))
}

/// Digest of an in-memory buffer, for tests and small writes.
pub fn digest_bytes(content: &[u8]) -> String {
	BASE64.encode(Md5::digest(content))
}

/// Digests `path` once it has stopped changing.
///
/// A file is considered settled when two stats separated by a short pause
/// agree on (size, mtime). Editors and downloads write in bursts; hashing
/// mid-burst would catalog a digest no full content ever had.
pub async fn stable_digest(path: &Path, max_wait: Duration) -> Result<String, DigestError> {
	let wrap_io = |source: io::Error| DigestError::Io {
		path: path.display().to_string(),
		source,
	};

	let deadline = tokio::time::Instant::now() + max_wait;
	let mut previous = stat_signature(path).await.map_err(wrap_io)?;
	loop {
		tokio::time::sleep(SETTLE_INTERVAL).await;
		let current = stat_signature(path).await.map_err(wrap_io)?;
		if current == previous {
			return digest(path).await.map_err(wrap_io);
		}
		if tokio::time::Instant::now() >= deadline {
			return Err(DigestError::StillChanging { path: path.display().to_string() });
		}
		previous = current;
	}
}

async fn stat_signature(path: &Path) -> io::Result<(u64, Option<std::time::SystemTime>)> {
	let meta = tokio::fs::metadata(path).await?;
	Ok((meta.len(), meta.modified().ok()))
}
