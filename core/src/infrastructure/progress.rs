//! Progress events and their persistence.
//!
//! The shell subscribes to one receiver handed out at construction; the
//! core never broadcasts through shared global state. The most recent
//! transfer entries are also journaled to `last-files.json` so the UI can
//! repopulate after a restart.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::DocType;
use crate::shared::path::Incompatibility;

/// Cap of entries kept in `last-files.json`.
const LAST_FILES_CAP: usize = 250;

/// Events the core reports to its consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Progress {
	TransferStarted { path: String, doc_type: DocType },
	TransferCopy { path: String, doc_type: DocType },
	TransferMove { path: String, old_path: String },
	DeleteFile { path: String },
	UpToDate,
	Online,
	Offline,
	PlatformIncompatibilities { issues: Vec<Incompatibility> },
	SyncError { message: String },
	Revoked,
}

/// Sending half of the progress channel.
///
/// Emission never fails: once the consumer hangs up the events are
/// dropped, which is the correct behavior during shutdown.
#[derive(Clone)]
pub struct ProgressTx {
	tx: mpsc::UnboundedSender<Progress>,
}

impl ProgressTx {
	pub fn emit(&self, event: Progress) {
		trace!(?event, "progress");
		let _ = self.tx.send(event);
	}
}

/// Creates the progress channel; the receiver belongs to the shell.
pub fn progress_channel() -> (ProgressTx, mpsc::UnboundedReceiver<Progress>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(ProgressTx { tx }, rx)
}

/// One journaled transfer, newest first in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastFileEntry {
	pub path: String,
	pub doc_type: DocType,
	/// Operation that produced the entry (`add`, `update`, `move`, `trash`).
	pub action: String,
	pub updated: DateTime<Utc>,
}

/// Bounded journal of recent transfers.
#[derive(Debug)]
pub struct LastFiles {
	file: PathBuf,
	entries: Vec<LastFileEntry>,
}

impl LastFiles {
	/// Loads the journal, tolerating a missing file.
	pub fn load(file: PathBuf) -> io::Result<Self> {
		let entries = match std::fs::read(&file) {
			Ok(bytes) => serde_json::from_slice(&bytes)
				.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
			Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
			Err(e) => return Err(e),
		};
		Ok(Self { file, entries })
	}

	/// Records one transfer and persists the capped journal.
	pub fn record(&mut self, entry: LastFileEntry) -> io::Result<()> {
		// One entry per path; the newest wins.
		self.entries.retain(|e| e.path != entry.path);
		self.entries.push(entry);
		self.entries.sort_by(|a, b| b.updated.cmp(&a.updated));
		self.entries.truncate(LAST_FILES_CAP);
		self.save()
	}

	pub fn entries(&self) -> &[LastFileEntry] {
		&self.entries
	}

	fn save(&self) -> io::Result<()> {
		let json = serde_json::to_vec_pretty(&self.entries)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		write_atomically(&self.file, &json)
	}
}

/// Writes through a sibling temp file so a crash never truncates state.
fn write_atomically(target: &Path, bytes: &[u8]) -> io::Result<()> {
	let tmp = target.with_extension("tmp");
	std::fs::write(&tmp, bytes)?;
	std::fs::rename(&tmp, target)
}
