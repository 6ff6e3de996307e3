//! Core configuration, provided by the shell and persisted as JSON.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cirrus_remote_api::ClientCredentials;

/// Name of the config file inside the data directory.
const CONFIG_FILE: &str = "config.json";

/// Everything the sync core needs from the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Directory that holds the store, journals and staging space.
	pub data_dir: PathBuf,
	/// Root of the synchronized local tree.
	pub sync_root: PathBuf,
	/// Base URL of the remote instance.
	pub remote_url: String,
	/// OAuth client credentials minted at registration.
	pub credentials: Option<ClientCredentials>,
	/// Name this device registered under.
	pub device_name: String,
	/// Local event aggregation window.
	#[serde(default = "default_aggregation_window_ms")]
	pub aggregation_window_ms: u64,
	/// Upper bound of the aggregation window while events keep arriving.
	#[serde(default = "default_aggregation_window_max_ms")]
	pub aggregation_window_max_ms: u64,
	/// Whether a delete/create pair with matching digest and size counts
	/// as a move even when the inode changed.
	#[serde(default = "default_true")]
	pub optimistic_moves: bool,
	/// Executor worker tasks.
	#[serde(default = "default_workers")]
	pub sync_workers: usize,
	/// First retry delay for transient errors, in seconds.
	#[serde(default = "default_retry_base_secs")]
	pub retry_base_secs: u64,
	/// Retry delay ceiling, in seconds.
	#[serde(default = "default_retry_cap_secs")]
	pub retry_cap_secs: u64,
	/// Attempts before a document is parked.
	#[serde(default = "default_retry_attempts")]
	pub retry_max_attempts: u32,
}

fn default_aggregation_window_ms() -> u64 {
	1_000
}

fn default_aggregation_window_max_ms() -> u64 {
	3_000
}

fn default_true() -> bool {
	true
}

fn default_workers() -> usize {
	3
}

fn default_retry_base_secs() -> u64 {
	1
}

fn default_retry_cap_secs() -> u64 {
	300
}

fn default_retry_attempts() -> u32 {
	16
}

impl SyncConfig {
	/// A fresh configuration for `sync_root` against `remote_url`.
	pub fn new(data_dir: PathBuf, sync_root: PathBuf, remote_url: String, device_name: String) -> Self {
		Self {
			data_dir,
			sync_root,
			remote_url,
			credentials: None,
			device_name,
			aggregation_window_ms: default_aggregation_window_ms(),
			aggregation_window_max_ms: default_aggregation_window_max_ms(),
			optimistic_moves: default_true(),
			sync_workers: default_workers(),
			retry_base_secs: default_retry_base_secs(),
			retry_cap_secs: default_retry_cap_secs(),
			retry_max_attempts: default_retry_attempts(),
		}
	}

	/// Loads the config stored in `data_dir`, if any.
	pub fn load(data_dir: &Path) -> io::Result<Option<Self>> {
		match std::fs::read(data_dir.join(CONFIG_FILE)) {
			Ok(bytes) => serde_json::from_slice(&bytes)
				.map(Some)
				.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e),
		}
	}

	pub fn save(&self) -> io::Result<()> {
		std::fs::create_dir_all(&self.data_dir)?;
		let json = serde_json::to_vec_pretty(self)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
		let tmp = self.data_dir.join(format!("{CONFIG_FILE}.tmp"));
		std::fs::write(&tmp, json)?;
		std::fs::rename(tmp, self.data_dir.join(CONFIG_FILE))
	}

	/// Creates the directories the core writes to.
	pub fn ensure_directories(&self) -> io::Result<()> {
		std::fs::create_dir_all(&self.data_dir)?;
		std::fs::create_dir_all(&self.sync_root)?;
		std::fs::create_dir_all(self.staging_dir())?;
		std::fs::create_dir_all(self.local_trash_dir())?;
		Ok(())
	}

	pub fn store_path(&self) -> PathBuf {
		self.data_dir.join("catalog.db")
	}

	pub fn last_files_path(&self) -> PathBuf {
		self.data_dir.join("last-files.json")
	}

	/// Downloads land here before the rename into place.
	pub fn staging_dir(&self) -> PathBuf {
		self.data_dir.join(".cirrus-staging")
	}

	/// Local trash under the sync root.
	pub fn local_trash_dir(&self) -> PathBuf {
		self.sync_root.join(".Trash")
	}

	pub fn aggregation_window(&self) -> Duration {
		Duration::from_millis(self.aggregation_window_ms)
	}

	pub fn aggregation_window_max(&self) -> Duration {
		Duration::from_millis(self.aggregation_window_max_ms)
	}
}
