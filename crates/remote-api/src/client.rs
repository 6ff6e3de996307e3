//! HTTP client for the personal-cloud API.

use bytes::Bytes;
use futures::Stream;
use reqwest::{header, Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RemoteError;
use crate::types::{ChangesPage, ClientCredentials, DiskUsage, RemoteDoc};

/// Default server-side hold of the `changes` long poll, in seconds.
const CHANGES_LONGPOLL_SECS: u64 = 25;

/// Authenticated client for one remote instance.
#[derive(Clone)]
pub struct RemoteClient {
	base_url: String,
	access_token: String,
	client: Client,
}

impl std::fmt::Debug for RemoteClient {
	fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		formatter
			.debug_struct("RemoteClient")
			.field("base_url", &self.base_url)
			.field("access_token", &"[REDACTED]")
			.finish()
	}
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
	device_name: &'a str,
	location: &'a str,
}

#[derive(Serialize)]
struct CreateDirRequest<'a> {
	path: &'a str,
}

#[derive(Serialize)]
struct MoveRequest<'a> {
	path: &'a str,
	rev: &'a str,
}

#[derive(Deserialize)]
struct DocEnvelope {
	doc: RemoteDoc,
}

impl RemoteClient {
	/// Creates a client for `base_url` authenticating with `access_token`.
	pub fn new(
		base_url: impl Into<String>,
		access_token: impl Into<String>,
	) -> Result<Self, RemoteError> {
		Ok(Self {
			base_url: normalize_base_url(base_url.into())?,
			access_token: access_token.into(),
			client: Client::new(),
		})
	}

	/// Registers this device as an OAuth client and mints credentials.
	///
	/// This is the only unauthenticated call; everything else requires the
	/// `access_token` obtained here.
	pub async fn register(
		base_url: &str,
		device_name: &str,
		location: &str,
	) -> Result<ClientCredentials, RemoteError> {
		let base_url = normalize_base_url(base_url.to_string())?;
		let response = Client::new()
			.post(format!("{base_url}/auth/register"))
			.json(&RegisterRequest { device_name, location })
			.send()
			.await?;
		let response = check_status(response).await?;
		response
			.json::<ClientCredentials>()
			.await
			.map_err(|err| RemoteError::InvalidPayload(err.to_string()))
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	/// Stats a document by remote id.
	pub async fn stat(&self, id: &str) -> Result<RemoteDoc, RemoteError> {
		let response = self
			.request(reqwest::Method::GET, &format!("files/{id}"))
			.send()
			.await?;
		json_doc(response).await
	}

	/// Stats a document by its root-relative path.
	pub async fn stat_by_path(&self, path: &str) -> Result<Option<RemoteDoc>, RemoteError> {
		let response = self
			.request(reqwest::Method::GET, "files/metadata")
			.query(&[("path", path)])
			.send()
			.await?;
		if response.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		json_doc(response).await.map(Some)
	}

	/// Lists the direct children of a directory.
	pub async fn children(&self, id: &str) -> Result<Vec<RemoteDoc>, RemoteError> {
		#[derive(Deserialize)]
		struct Children {
			docs: Vec<RemoteDoc>,
		}
		let response = self
			.request(reqwest::Method::GET, &format!("files/{id}/children"))
			.send()
			.await?;
		let response = check_status(response).await?;
		let children = response
			.json::<Children>()
			.await
			.map_err(|err| RemoteError::InvalidPayload(err.to_string()))?;
		Ok(children.docs)
	}

	/// Creates a directory at `path`, parents included.
	pub async fn create_dir(&self, path: &str) -> Result<RemoteDoc, RemoteError> {
		let response = self
			.request(reqwest::Method::POST, "files")
			.json(&CreateDirRequest { path })
			.send()
			.await?;
		json_doc(response).await
	}

	/// Uploads a new file as a raw stream guarded by `Content-MD5`.
	pub async fn create_file(
		&self,
		path: &str,
		md5sum: &str,
		size: u64,
		executable: bool,
		body: Body,
	) -> Result<RemoteDoc, RemoteError> {
		debug!(path, size, "uploading new file");
		let response = self
			.request(reqwest::Method::PUT, "files")
			.query(&[("path", path), ("executable", bool_str(executable))])
			.header("Content-MD5", md5sum)
			.header(header::CONTENT_LENGTH, size)
			.header(header::CONTENT_TYPE, "application/octet-stream")
			.body(body)
			.send()
			.await?;
		json_doc(response).await
	}

	/// Replaces the content of an existing file.
	///
	/// `rev` must be the latest known remote revision; the server answers
	/// 409 when it has moved on, which the caller sees as transient and
	/// retries after the next changes pull.
	pub async fn update_file(
		&self,
		id: &str,
		rev: &str,
		md5sum: &str,
		size: u64,
		body: Body,
	) -> Result<RemoteDoc, RemoteError> {
		debug!(id, size, "uploading file content");
		let response = self
			.request(reqwest::Method::PUT, &format!("files/{id}"))
			.query(&[("rev", rev)])
			.header("Content-MD5", md5sum)
			.header(header::CONTENT_LENGTH, size)
			.header(header::CONTENT_TYPE, "application/octet-stream")
			.body(body)
			.send()
			.await?;
		json_doc(response).await
	}

	/// Streams the content of a file.
	pub async fn read_file(
		&self,
		id: &str,
	) -> Result<impl Stream<Item = Result<Bytes, RemoteError>>, RemoteError> {
		use futures::TryStreamExt;
		let response = self
			.request(reqwest::Method::GET, &format!("files/{id}/content"))
			.send()
			.await?;
		let response = check_status(response).await?;
		Ok(response.bytes_stream().map_err(RemoteError::from))
	}

	/// Renames or moves a document.
	pub async fn move_doc(
		&self,
		id: &str,
		rev: &str,
		new_path: &str,
	) -> Result<RemoteDoc, RemoteError> {
		let response = self
			.request(reqwest::Method::POST, &format!("files/{id}/move"))
			.json(&MoveRequest { path: new_path, rev })
			.send()
			.await?;
		json_doc(response).await
	}

	/// Moves a document to the remote trash.
	pub async fn trash(&self, id: &str, rev: &str) -> Result<RemoteDoc, RemoteError> {
		let response = self
			.request(reqwest::Method::DELETE, &format!("files/{id}"))
			.query(&[("rev", rev)])
			.send()
			.await?;
		json_doc(response).await
	}

	/// Restores a trashed document to its pre-trash location.
	pub async fn restore(&self, id: &str) -> Result<RemoteDoc, RemoteError> {
		let response = self
			.request(reqwest::Method::POST, &format!("files/{id}/restore"))
			.send()
			.await?;
		json_doc(response).await
	}

	/// Fetches one page of the changes feed, long-polling on the server.
	pub async fn changes(&self, since: u64) -> Result<ChangesPage, RemoteError> {
		let response = self
			.request(reqwest::Method::GET, "changes")
			.query(&[
				("since", since.to_string()),
				("timeout", CHANGES_LONGPOLL_SECS.to_string()),
			])
			.send()
			.await?;
		let response = check_status(response).await?;
		response
			.json::<ChangesPage>()
			.await
			.map_err(|err| RemoteError::InvalidPayload(err.to_string()))
	}

	/// Reports used and allotted space.
	pub async fn disk_usage(&self) -> Result<DiskUsage, RemoteError> {
		let response = self
			.request(reqwest::Method::GET, "disk-usage")
			.send()
			.await?;
		let response = check_status(response).await?;
		response
			.json::<DiskUsage>()
			.await
			.map_err(|err| RemoteError::InvalidPayload(err.to_string()))
	}

	fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
		self.client
			.request(method, format!("{}/{path}", self.base_url))
			.bearer_auth(&self.access_token)
			.header(header::ACCEPT, "application/json")
	}
}

fn bool_str(value: bool) -> &'static str {
	if value {
		"true"
	} else {
		"false"
	}
}

fn normalize_base_url(raw: String) -> Result<String, RemoteError> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Err(RemoteError::InvalidPayload("remote URL must not be empty".into()));
	}
	if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
		return Err(RemoteError::InvalidPayload(
			"remote URL must include http:// or https://".into(),
		));
	}
	Ok(trimmed.trim_end_matches('/').to_string())
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}
	let message = response.text().await.unwrap_or_default();
	Err(RemoteError::from_status(status, message))
}

async fn json_doc(response: Response) -> Result<RemoteDoc, RemoteError> {
	let response = check_status(response).await?;
	// The server wraps single documents in an envelope on some endpoints
	// and returns them bare on others; accept both.
	let text = response
		.text()
		.await
		.map_err(|err| RemoteError::InvalidPayload(err.to_string()))?;
	if let Ok(envelope) = serde_json::from_str::<DocEnvelope>(&text) {
		return Ok(envelope.doc);
	}
	serde_json::from_str::<RemoteDoc>(&text)
		.map_err(|err| RemoteError::InvalidPayload(err.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn base_url_rejects_empty() {
		assert!(normalize_base_url(String::new()).is_err());
	}

	#[test]
	fn base_url_rejects_missing_scheme() {
		assert!(normalize_base_url("cloud.example.com".to_string()).is_err());
	}

	#[test]
	fn base_url_trims_trailing_slash() {
		let url = normalize_base_url("https://cloud.example.com/".to_string()).unwrap();
		assert_eq!(url, "https://cloud.example.com");
	}

	#[test]
	fn client_debug_redacts_token() {
		let client = RemoteClient::new("https://cloud.example.com", "secret-token").unwrap();
		let debug = format!("{client:?}");
		assert!(!debug.contains("secret-token"));
	}
}
