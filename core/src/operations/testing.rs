//! In-memory side and metadata builders shared by operation tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;

use crate::domain::{ChangeMeta, Document, LocalInfo, RemoteInfo, SideName};
use crate::error::SyncError;
use crate::operations::sync::side::{ByteStream, Side, WriteOutcome};
use crate::shared::digest::digest_bytes;

/// A side that stores content in memory and records every mutation.
pub struct RecordingSide {
	name: SideName,
	files: Mutex<HashMap<String, Vec<u8>>>,
	ops: Mutex<Vec<String>>,
	renames: Mutex<Vec<(String, String)>>,
	rev_counter: Mutex<u64>,
}

impl RecordingSide {
	pub fn new(name: SideName) -> Self {
		Self {
			name,
			files: Mutex::new(HashMap::new()),
			ops: Mutex::new(Vec::new()),
			renames: Mutex::new(Vec::new()),
			rev_counter: Mutex::new(0),
		}
	}

	pub fn ops(&self) -> Vec<String> {
		self.ops.lock().unwrap().clone()
	}

	/// (from, to) pairs, in call order.
	pub fn renames(&self) -> Vec<(String, String)> {
		self.renames.lock().unwrap().clone()
	}

	pub fn content(&self, path: &str) -> Option<Vec<u8>> {
		self.files.lock().unwrap().get(path).cloned()
	}

	pub fn insert(&self, path: &str, content: &[u8]) {
		self.files.lock().unwrap().insert(path.to_string(), content.to_vec());
	}

	fn record(&self, op: String) {
		self.ops.lock().unwrap().push(op);
	}

	fn next_remote(&self) -> RemoteInfo {
		let mut counter = self.rev_counter.lock().unwrap();
		*counter += 1;
		RemoteInfo { id: format!("mem-{counter}"), rev: format!("{counter}-mem") }
	}

	fn outcome(&self, size: u64) -> WriteOutcome {
		match self.name {
			SideName::Local => WriteOutcome {
				local: Some(LocalInfo {
					size,
					mtime: Utc::now(),
					ino: Some(size + 1000),
					executable: false,
				}),
				..Default::default()
			},
			SideName::Remote => WriteOutcome {
				remote: Some(self.next_remote()),
				..Default::default()
			},
		}
	}
}

#[async_trait]
impl Side for RecordingSide {
	fn name(&self) -> SideName {
		self.name
	}

	async fn read(&self, doc: &Document) -> Result<ByteStream, SyncError> {
		let content = self.content(&doc.path).ok_or_else(|| SyncError::Io {
			path: doc.path.clone(),
			source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such in-memory file"),
		})?;
		Ok(Box::pin(futures::stream::once(async move { Ok(Bytes::from(content)) })))
	}

	async fn write(&self, doc: &Document, mut content: ByteStream) -> Result<WriteOutcome, SyncError> {
		let mut collected = Vec::new();
		while let Some(chunk) = content.next().await {
			collected.extend_from_slice(&chunk?);
		}
		self.record(format!("write {}", doc.path));
		let size = collected.len() as u64;
		self.files.lock().unwrap().insert(doc.path.clone(), collected);
		Ok(self.outcome(size))
	}

	async fn mkdir(&self, doc: &Document) -> Result<WriteOutcome, SyncError> {
		self.record(format!("mkdir {}", doc.path));
		Ok(self.outcome(0))
	}

	async fn rename(&self, doc: &Document, from_path: &str) -> Result<WriteOutcome, SyncError> {
		self.record(format!("rename {from_path} -> {}", doc.path));
		self.renames.lock().unwrap().push((from_path.to_string(), doc.path.clone()));
		let mut files = self.files.lock().unwrap();
		let moved: Vec<(String, Vec<u8>)> = files
			.iter()
			.filter(|(path, _)| {
				*path == from_path || path.starts_with(&format!("{from_path}/"))
			})
			.map(|(path, content)| {
				(format!("{}{}", doc.path, &path[from_path.len()..]), content.clone())
			})
			.collect();
		files.retain(|path, _| path != from_path && !path.starts_with(&format!("{from_path}/")));
		let size = moved.iter().map(|(_, c)| c.len() as u64).sum();
		files.extend(moved);
		let md5sum = files.get(&doc.path).map(|content| digest_bytes(content));
		drop(files);
		let mut outcome = self.outcome(size);
		outcome.md5sum = md5sum;
		Ok(outcome)
	}

	async fn trash(&self, doc: &Document) -> Result<(), SyncError> {
		self.record(format!("trash {}", doc.path));
		let mut files = self.files.lock().unwrap();
		files.retain(|path, _| path != &doc.path && !path.starts_with(&format!("{}/", doc.path)));
		Ok(())
	}

	async fn restore(&self, doc: &Document) -> Result<WriteOutcome, SyncError> {
		self.record(format!("restore {}", doc.path));
		Ok(self.outcome(0))
	}
}

/// Change metadata as the local watcher would report it.
pub fn meta_local(content: &[u8], ino: u64) -> ChangeMeta {
	ChangeMeta {
		md5sum: Some(digest_bytes(content)),
		size: Some(content.len() as u64),
		mtime: Some(Utc::now()),
		executable: false,
		ino: Some(ino),
		remote: None,
		mime: None,
		class: None,
		tags: Vec::new(),
	}
}

/// Change metadata as the remote watcher would report it.
pub fn meta_remote(content: &[u8], id: &str, rev: &str) -> ChangeMeta {
	ChangeMeta {
		md5sum: Some(digest_bytes(content)),
		size: Some(content.len() as u64),
		mtime: Some(Utc::now()),
		executable: false,
		ino: None,
		remote: Some(RemoteInfo { id: id.to_string(), rev: rev.to_string() }),
		mime: None,
		class: None,
		tags: Vec::new(),
	}
}
