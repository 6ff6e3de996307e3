//! Canonical path handling and platform naming rules.
//!
//! Every path the core stores or compares is a forward-slash relative
//! path with no empty, `.` or escaping `..` segments. The canonical id
//! folds case on platforms whose filesystems do, so that `Foo/Bar` and
//! `foo/bar` land on the same document.

use crate::domain::DocType;

/// Platform whose naming rules apply to one side of the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
	Linux,
	MacOs,
	Windows,
}

impl Platform {
	/// The platform this process runs on.
	pub fn current() -> Self {
		if cfg!(target_os = "macos") {
			Self::MacOs
		} else if cfg!(target_os = "windows") {
			Self::Windows
		} else {
			Self::Linux
		}
	}

	/// Whether the default filesystem folds case (HFS+/APFS, NTFS).
	pub fn is_case_insensitive(self) -> bool {
		!matches!(self, Self::Linux)
	}

	/// Byte limit for a whole relative path.
	fn max_path_bytes(self) -> usize {
		match self {
			Self::Linux => 4096,
			Self::MacOs => 1024,
			// Without the long-path opt-in.
			Self::Windows => 260,
		}
	}
}

/// Byte limit for a single path segment on every supported platform.
const MAX_SEGMENT_BYTES: usize = 255;

/// Characters a Windows filesystem refuses inside a name.
const WINDOWS_RESERVED_CHARS: &[char] = &[':', '*', '?', '"', '<', '>', '|'];

/// Base names Windows reserves regardless of extension.
const WINDOWS_RESERVED_NAMES: &[&str] = &[
	"CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
	"COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
	#[error("path is empty")]
	Empty,
	#[error("path escapes the synchronized root: {0}")]
	ParentEscape(String),
}

/// One way a path violates a platform's naming rules.
///
/// Findings never block the sync; they are surfaced so the user can rename
/// on the side that accepts the name.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PathIssue {
	ReservedChars { segment: String, chars: Vec<char> },
	ReservedName { segment: String },
	ForbiddenLastChar { segment: String },
	SegmentTooLong { segment: String, byte_len: usize, limit: usize },
	PathTooLong { byte_len: usize, limit: usize },
}

/// A path that cannot exist as-is on `platform`, with every finding.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Incompatibility {
	pub path: String,
	pub doc_type: DocType,
	pub platform_name: String,
	pub issues: Vec<PathIssue>,
}

/// Canonicalizes a raw relative path into forward-slash form.
///
/// Host separators (`/` and `\`) both split; empty and `.` segments drop;
/// `..` resolves against the segments seen so far and is rejected when it
/// would climb out of the root. Trailing separators are trimmed.
pub fn canonicalize(raw: &str) -> Result<String, PathError> {
	let mut segments: Vec<&str> = Vec::new();
	for segment in raw.split(['/', '\\']) {
		match segment {
			"" | "." => continue,
			".." => {
				if segments.pop().is_none() {
					return Err(PathError::ParentEscape(raw.to_string()));
				}
			}
			other => segments.push(other),
		}
	}
	if segments.is_empty() {
		return Err(PathError::Empty);
	}
	Ok(segments.join("/"))
}

/// Derives the canonical document id for a canonical path.
pub fn id(path: &str, platform: Platform) -> String {
	if platform.is_case_insensitive() {
		path.to_lowercase()
	} else {
		path.to_string()
	}
}

/// Checks a canonical path against `platform`'s naming rules.
///
/// Returns `None` when every segment is acceptable.
pub fn check(path: &str, doc_type: DocType, platform: Platform) -> Option<Incompatibility> {
	let mut issues = Vec::new();

	for segment in path.split('/') {
		let reserved: Vec<char> = segment
			.chars()
			.filter(|c| is_reserved_char(*c, platform))
			.collect();
		if !reserved.is_empty() {
			issues.push(PathIssue::ReservedChars {
				segment: segment.to_string(),
				chars: reserved,
			});
		}

		if platform == Platform::Windows {
			if is_windows_reserved_name(segment) {
				issues.push(PathIssue::ReservedName { segment: segment.to_string() });
			}
			if segment.ends_with('.') || segment.ends_with(' ') {
				issues.push(PathIssue::ForbiddenLastChar { segment: segment.to_string() });
			}
		}

		if segment.len() > MAX_SEGMENT_BYTES {
			issues.push(PathIssue::SegmentTooLong {
				segment: segment.to_string(),
				byte_len: segment.len(),
				limit: MAX_SEGMENT_BYTES,
			});
		}
	}

	let limit = platform.max_path_bytes();
	if path.len() > limit {
		issues.push(PathIssue::PathTooLong { byte_len: path.len(), limit });
	}

	if issues.is_empty() {
		return None;
	}
	Some(Incompatibility {
		path: path.to_string(),
		doc_type,
		platform_name: format!("{platform:?}"),
		issues,
	})
}

fn is_reserved_char(c: char, platform: Platform) -> bool {
	match platform {
		Platform::Linux => false,
		Platform::MacOs => c == ':',
		Platform::Windows => WINDOWS_RESERVED_CHARS.contains(&c) || (c as u32) < 0x20,
	}
}

fn is_windows_reserved_name(segment: &str) -> bool {
	let base = segment.split('.').next().unwrap_or(segment);
	WINDOWS_RESERVED_NAMES
		.iter()
		.any(|name| base.eq_ignore_ascii_case(name))
}

/// Final segment of a canonical path.
pub fn name(path: &str) -> &str {
	path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a canonical path, or `None` at the root.
pub fn parent(path: &str) -> Option<&str> {
	path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Number of segments in a canonical path.
pub fn depth(path: &str) -> usize {
	path.split('/').count()
}

/// Whether `path` sits strictly below the folder `prefix`.
pub fn is_inside(prefix: &str, path: &str) -> bool {
	path.len() > prefix.len() + 1
		&& path.starts_with(prefix)
		&& path.as_bytes()[prefix.len()] == b'/'
}

/// Rewrites the `old_prefix` folder prefix of `path` to `new_prefix`.
///
/// Callers must have established `is_inside(old_prefix, path)` first.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> String {
	debug_assert!(is_inside(old_prefix, path));
	format!("{new_prefix}{}", &path[old_prefix.len()..])
}
