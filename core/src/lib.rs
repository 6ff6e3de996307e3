//! Cirrus sync core.
//!
//! Reconciles a local directory tree against a remote personal-cloud
//! instance through a persistent, revisioned metadata catalog. Two
//! watchers normalize filesystem and feed events, a single-writer merger
//! decides the canonical state, and an executor mirrors whatever one side
//! has that the other lacks.
//!
//! The desktop shell owns a [`Core`] handle: it injects configuration,
//! consumes the progress receiver returned at construction, and drives
//! the lifecycle through `start`/`stop`.

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod operations;
pub mod services;
pub mod shared;

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cirrus_remote_api::{ClientCredentials, DiskUsage, RemoteClient};

pub use config::SyncConfig;
pub use domain::{Change, DocType, Document, SideName};
pub use error::{Classification, Classify, CoreError};
pub use infrastructure::progress::Progress;

use infrastructure::database::{Store, CHECKPOINT_LOCAL_SCAN, CHECKPOINT_REMOTE_SEQ};
use infrastructure::progress::{progress_channel, LastFiles, ProgressTx};
use operations::locks::IdLocks;
use operations::merge::Merger;
use operations::sync::retry::RetryPolicy;
use operations::sync::side::{LocalSide, RemoteSide, SidePair};
use operations::sync::SyncExecutor;
use services::local_watcher::LocalWatcher;
use services::remote_watcher::RemoteWatcher;
use shared::path::Platform;

/// The sync core. One instance per synchronized root.
pub struct Core {
	config: SyncConfig,
	store: Arc<Store>,
	client: Option<RemoteClient>,
	local_watcher: Arc<LocalWatcher>,
	remote_watcher: Option<Arc<RemoteWatcher>>,
	executor: Arc<SyncExecutor>,
	progress: ProgressTx,
	shutdown: watch::Sender<bool>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
	/// Builds the core from configuration. The returned receiver carries
	/// every progress event; dropping it silently discards them.
	pub async fn open(
		config: SyncConfig,
	) -> Result<(Self, mpsc::UnboundedReceiver<Progress>), CoreError> {
		config.ensure_directories()?;
		let platform = Platform::current();
		let store = Arc::new(Store::open(&config.store_path()).await?);
		let (progress, progress_rx) = progress_channel();
		let locks = IdLocks::new();
		let last_files =
			Arc::new(std::sync::Mutex::new(LastFiles::load(config.last_files_path())?));

		let client = match &config.credentials {
			Some(creds) => {
				Some(RemoteClient::new(&config.remote_url, &creds.access_token)?)
			}
			None => None,
		};

		let local_side = Arc::new(LocalSide::new(
			config.sync_root.clone(),
			config.staging_dir(),
			config.local_trash_dir(),
		));
		// Until the device is linked there is no remote capability; the
		// watchers and executor are wired anyway so `start` can refuse
		// cleanly instead of half-running.
		let remote_side: Arc<dyn operations::sync::side::Side> = match &client {
			Some(client) => Arc::new(RemoteSide::new(client.clone())),
			None => Arc::new(RemoteSide::new(
				RemoteClient::new("https://unlinked.invalid", "")?,
			)),
		};
		let sides = SidePair { local: local_side, remote: remote_side };

		let merger = Arc::new(Merger::new(
			store.clone(),
			sides.clone(),
			locks.clone(),
			platform,
			progress.clone(),
		));

		let retry = RetryPolicy {
			base: std::time::Duration::from_secs(config.retry_base_secs),
			cap: std::time::Duration::from_secs(config.retry_cap_secs),
			max_attempts: config.retry_max_attempts,
		};
		let executor = Arc::new(SyncExecutor::new(
			store.clone(),
			sides,
			locks,
			progress.clone(),
			last_files,
			retry,
			platform,
			config.sync_workers,
		));

		let local_watcher = Arc::new(LocalWatcher::new(
			config.sync_root.clone(),
			store.clone(),
			merger.clone(),
			platform,
			config.aggregation_window(),
			config.aggregation_window_max(),
			config.optimistic_moves,
		));
		let remote_watcher = client.clone().map(|client| {
			Arc::new(RemoteWatcher::new(
				Arc::new(client),
				store.clone(),
				merger.clone(),
				progress.clone(),
			))
		});

		let (shutdown, _) = watch::channel(false);
		Ok((
			Self {
				config,
				store,
				client,
				local_watcher,
				remote_watcher,
				executor,
				progress,
				shutdown,
				tasks: Mutex::new(Vec::new()),
			},
			progress_rx,
		))
	}

	/// Registers this device against `remote_url` and returns the minted
	/// credentials; the caller stores them into the config and re-opens.
	pub async fn register(
		remote_url: &str,
		device_name: &str,
		location: &str,
	) -> Result<ClientCredentials, CoreError> {
		Ok(RemoteClient::register(remote_url, device_name, location).await?)
	}

	/// Spawns the watchers and the executor.
	pub async fn start(&self) -> Result<(), CoreError> {
		let Some(remote_watcher) = &self.remote_watcher else {
			return Err(CoreError::NotLinked);
		};
		let mut tasks = self.tasks.lock().await;
		if !tasks.is_empty() {
			return Err(CoreError::Running);
		}
		// Partial downloads from an interrupted run never made it out of
		// staging; clear them before new transfers begin.
		let staging = self.config.staging_dir();
		if staging.exists() {
			std::fs::remove_dir_all(&staging)?;
		}
		std::fs::create_dir_all(&staging)?;
		// A fresh start after a stop needs the flag lowered.
		self.shutdown.send_replace(false);
		info!(root = %self.config.sync_root.display(), "sync starting");

		let local = self.local_watcher.clone();
		let rx = self.shutdown.subscribe();
		let progress = self.progress.clone();
		tasks.push(tokio::spawn(async move {
			if let Err(err) = local.run(rx).await {
				error!(error = %err, "local watcher failed");
				progress.emit(Progress::SyncError { message: err.to_string() });
			}
		}));

		let remote = remote_watcher.clone();
		let rx = self.shutdown.subscribe();
		let progress = self.progress.clone();
		tasks.push(tokio::spawn(async move {
			if let Err(err) = remote.run(rx).await {
				error!(error = %err, "remote watcher failed");
				progress.emit(Progress::SyncError { message: err.to_string() });
			}
		}));

		let executor = self.executor.clone();
		let rx = self.shutdown.subscribe();
		let progress = self.progress.clone();
		tasks.push(tokio::spawn(async move {
			if let Err(err) = executor.run(rx).await {
				error!(error = %err, "executor halted");
				if !err.classification().halts_sync() {
					progress.emit(Progress::SyncError { message: err.to_string() });
				}
			}
		}));

		Ok(())
	}

	/// Stops the running tasks, letting in-flight operations finish.
	pub async fn stop(&self) {
		let mut tasks = self.tasks.lock().await;
		if tasks.is_empty() {
			return;
		}
		info!("sync stopping");
		self.shutdown.send_replace(true);
		for task in tasks.drain(..) {
			if let Err(err) = task.await {
				warn!(error = %err, "task did not stop cleanly");
			}
		}
		info!("sync stopped");
	}

	/// Space used and allotted on the remote.
	pub async fn disk_usage(&self) -> Result<DiskUsage, CoreError> {
		let client = self.client.as_ref().ok_or(CoreError::NotLinked)?;
		Ok(client.disk_usage().await?)
	}

	/// Forgets the remote cursors so the next `start` rescans everything
	/// and replays the whole feed. Only valid while stopped.
	pub async fn full_synchronize(&self) -> Result<(), CoreError> {
		if !self.tasks.lock().await.is_empty() {
			return Err(CoreError::Running);
		}
		self.store.set_checkpoint(CHECKPOINT_REMOTE_SEQ, "0").await?;
		self.store.set_checkpoint(CHECKPOINT_LOCAL_SCAN, "").await?;
		info!("cursors reset, next start performs a full synchronization");
		Ok(())
	}

	/// Detaches this device: stops sync and discards the credentials.
	/// Local files stay where they are.
	pub async fn unlink(mut self) -> Result<(), CoreError> {
		self.stop().await;
		self.config.credentials = None;
		self.config.save()?;
		info!("device unlinked");
		Ok(())
	}

	pub fn config(&self) -> &SyncConfig {
		&self.config
	}
}
