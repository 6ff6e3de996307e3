//! Conflict rename construction.

use chrono::{DateTime, Utc};

use crate::shared::path;

/// Builds the conflict-suffixed sibling for `original`.
///
/// The timestamp goes before the extension so the platform still
/// recognizes the file type; colons are avoided because Windows refuses
/// them.
pub fn conflict_path(original: &str, now: DateTime<Utc>) -> String {
	let stamp = now.format("%Y-%m-%dT%H_%M_%S%.3fZ");
	let name = path::name(original);
	let parent = path::parent(original);

	let renamed = match name.rsplit_once('.') {
		// A leading dot is a hidden file, not an extension.
		Some((stem, ext)) if !stem.is_empty() => {
			format!("{stem}-conflict-{stamp}.{ext}")
		}
		_ => format!("{name}-conflict-{stamp}"),
	};

	match parent {
		Some(parent) => format!("{parent}/{renamed}"),
		None => renamed,
	}
}
