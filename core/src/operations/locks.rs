//! Per-document mutexes shared by the merger and the executor.
//!
//! The executor holds a document's lock for the duration of one mirrored
//! operation; the merger refuses to batch-move a folder while any
//! descendant is held. Lock entries are pruned once nobody holds them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map size above which released entries are swept.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct IdLocks {
	inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdLocks {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Waits for exclusive use of `id`.
	pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
		self.entry(id).lock_owned().await
	}

	/// Whether someone currently holds `id`.
	pub fn is_locked(&self, id: &str) -> bool {
		let inner = self.inner.lock().expect("lock table poisoned");
		inner.get(id).is_some_and(|m| m.try_lock().is_err())
	}

	fn entry(&self, id: &str) -> Arc<Mutex<()>> {
		let mut inner = self.inner.lock().expect("lock table poisoned");
		if inner.len() > PRUNE_THRESHOLD {
			inner.retain(|_, m| Arc::strong_count(m) > 1 || m.try_lock().is_err());
		}
		inner.entry(id.to_string()).or_default().clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn lock_is_exclusive_per_id() {
		let locks = IdLocks::new();
		let guard = locks.lock("a").await;
		assert!(locks.is_locked("a"));
		assert!(!locks.is_locked("b"));
		drop(guard);
		assert!(!locks.is_locked("a"));
	}

	#[tokio::test]
	async fn second_acquisition_waits() {
		let locks = IdLocks::new();
		let guard = locks.lock("a").await;
		let contender = {
			let locks = locks.clone();
			tokio::spawn(async move { locks.lock("a").await })
		};
		tokio::task::yield_now().await;
		assert!(!contender.is_finished());
		drop(guard);
		contender.await.unwrap();
	}
}
