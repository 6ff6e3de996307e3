//! Error taxonomy.
//!
//! Every component reports typed errors; what downstream consumers act on
//! is the coarse classification: retry, park, auto-resolve, or halt.

use cirrus_remote_api::RemoteError;

use crate::infrastructure::database::StoreError;
use crate::shared::digest::DigestError;
use crate::shared::path::{Incompatibility, PathError};

/// How an error is handled, per the sync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
	/// Retried with backoff.
	Transient,
	/// Parked; surfaced to the user for a rename.
	Incompatible,
	/// Both sides diverged; auto-resolved by conflict rename.
	Conflict,
	/// Credentials no longer valid; sync halts.
	Revoked,
	/// Remote refuses writes for space; sync halts.
	Quota,
	/// Metadata store integrity failure; sync halts.
	Corrupt,
	/// Not retryable, not fixable by the core.
	Permanent,
}

impl Classification {
	pub fn halts_sync(self) -> bool {
		matches!(self, Self::Revoked | Self::Quota | Self::Corrupt)
	}
}

pub trait Classify {
	fn classification(&self) -> Classification;
}

impl Classify for StoreError {
	fn classification(&self) -> Classification {
		match self {
			// A stale write means another writer got in first; reload and retry.
			StoreError::Conflict { .. } => Classification::Transient,
			StoreError::Db(_) => Classification::Transient,
			StoreError::Corrupt(_) => Classification::Corrupt,
		}
	}
}

impl Classify for RemoteError {
	fn classification(&self) -> Classification {
		match self {
			RemoteError::Revoked => Classification::Revoked,
			RemoteError::Quota => Classification::Quota,
			err if err.is_transient() => Classification::Transient,
			_ => Classification::Permanent,
		}
	}
}

impl Classify for DigestError {
	fn classification(&self) -> Classification {
		// Unreadable or still-changing files resolve themselves or recur
		// as new watcher events; either way a later attempt is the answer.
		Classification::Transient
	}
}

impl Classify for PathError {
	fn classification(&self) -> Classification {
		Classification::Permanent
	}
}

/// Error surface of the sync executor.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Remote(#[from] RemoteError),
	#[error(transparent)]
	Digest(#[from] DigestError),
	#[error("I/O error on {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("path unusable on the target side: {}", .0.path)]
	Incompatible(Box<Incompatibility>),
}

impl Classify for SyncError {
	fn classification(&self) -> Classification {
		match self {
			SyncError::Store(err) => err.classification(),
			SyncError::Remote(err) => err.classification(),
			SyncError::Digest(err) => err.classification(),
			SyncError::Io { source, .. } => match source.kind() {
				std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
					Classification::Permanent
				}
				_ => Classification::Transient,
			},
			SyncError::Incompatible(_) => Classification::Incompatible,
		}
	}
}

/// Error surface of the merger.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Path(#[from] PathError),
	/// A descendant of a moving folder is locked by the executor;
	/// the caller backs off and replays the move.
	#[error("subtree of {0} is locked by the executor")]
	SubtreeLocked(String),
	/// The physical rename that resolves a conflict failed; the event
	/// replays and resolution is attempted again.
	#[error("conflict rename of {path} failed: {source}")]
	ConflictRename {
		path: String,
		#[source]
		source: SyncError,
	},
}

impl Classify for MergeError {
	fn classification(&self) -> Classification {
		match self {
			MergeError::Store(err) => err.classification(),
			MergeError::Path(err) => err.classification(),
			MergeError::SubtreeLocked(_) => Classification::Transient,
			MergeError::ConflictRename { source, .. } => source.classification(),
		}
	}
}

/// Errors surfaced by the core handle itself.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Remote(#[from] RemoteError),
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	/// No credentials configured; `register` must run first.
	#[error("this device is not linked to a remote")]
	NotLinked,
	/// The command requires the sync tasks to be stopped first.
	#[error("sync is running")]
	Running,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn halting_classes() {
		assert!(Classification::Revoked.halts_sync());
		assert!(Classification::Quota.halts_sync());
		assert!(Classification::Corrupt.halts_sync());
		assert!(!Classification::Transient.halts_sync());
		assert!(!Classification::Incompatible.halts_sync());
	}

	#[test]
	fn store_conflicts_are_retryable() {
		let err = StoreError::Conflict { id: "x".into() };
		assert_eq!(err.classification(), Classification::Transient);
	}

	#[test]
	fn remote_errors_map_to_policy() {
		assert_eq!(RemoteError::Revoked.classification(), Classification::Revoked);
		assert_eq!(RemoteError::Quota.classification(), Classification::Quota);
		assert_eq!(
			RemoteError::InvalidPayload("x".into()).classification(),
			Classification::Permanent
		);
	}
}
