//! Wire types for the personal-cloud API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of the remote trash directory.
///
/// Trashing a document moves it under this well-known id; restoring moves
/// it back to its pre-trash parent.
pub const TRASH_DIR_ID: &str = ".cirrus-trash";

/// Kind of a remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteDocType {
	File,
	Directory,
}

/// A document as the remote reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDoc {
	/// Stable remote identifier.
	#[serde(rename = "_id")]
	pub id: String,
	/// Remote revision, opaque but strictly ordered per document.
	#[serde(rename = "_rev")]
	pub rev: String,
	#[serde(rename = "type")]
	pub doc_type: RemoteDocType,
	/// Path relative to the synchronized root, forward slashes.
	pub path: String,
	pub name: String,
	/// Base64 MD5 of the content. Absent for directories.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub md5sum: Option<String>,
	#[serde(default)]
	pub size: u64,
	#[serde(default)]
	pub executable: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub class: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mime: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	/// True once the document lives under the trash directory.
	#[serde(default)]
	pub trashed: bool,
}

impl RemoteDoc {
	pub fn is_file(&self) -> bool {
		self.doc_type == RemoteDocType::File
	}

	pub fn is_directory(&self) -> bool {
		self.doc_type == RemoteDocType::Directory
	}
}

/// One entry of the `changes` feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
	/// Position of this change in the feed.
	pub seq: u64,
	/// Remote identifier of the document the change applies to.
	pub id: String,
	/// Set when the document was erased (not merely trashed).
	#[serde(default)]
	pub deleted: bool,
	/// Current state of the document; absent for erasures.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub doc: Option<RemoteDoc>,
}

/// A page of the `changes` feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesPage {
	pub last_seq: u64,
	#[serde(default)]
	pub changes: Vec<RemoteChange>,
	/// Number of changes the server still holds past this page.
	#[serde(default)]
	pub pending: u64,
}

/// Space accounting as the remote reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiskUsage {
	pub used: u64,
	/// Absent means unlimited.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub quota: Option<u64>,
}

/// OAuth client credentials minted at registration time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
	pub client_id: String,
	pub client_secret: String,
	/// Token used for all subsequent requests.
	pub access_token: String,
	pub refresh_token: Option<String>,
}

impl std::fmt::Debug for ClientCredentials {
	fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		formatter
			.debug_struct("ClientCredentials")
			.field("client_id", &self.client_id)
			.field("client_secret", &"[REDACTED]")
			.field("access_token", &"[REDACTED]")
			.field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
			.finish()
	}
}
