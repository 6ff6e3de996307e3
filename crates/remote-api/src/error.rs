//! Error mapping for the remote API.

use reqwest::StatusCode;

/// Errors returned by the remote client.
///
/// Status codes are folded into coarse variants the sync core can act on:
/// the distinction that matters downstream is retryable versus halting
/// versus permanently rejected.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
	#[error("HTTP transport error: {0}")]
	Http(#[from] reqwest::Error),
	/// Credentials are no longer valid; sync must halt until re-linked.
	#[error("remote credentials revoked")]
	Revoked,
	/// The remote refused a write for lack of space.
	#[error("remote is out of space")]
	Quota,
	/// The server answered but the payload did not parse.
	#[error("invalid payload from remote: {0}")]
	InvalidPayload(String),
	/// Any other non-success status.
	#[error("remote returned HTTP {status}: {message}")]
	Status { status: StatusCode, message: String },
}

impl RemoteError {
	/// Build the error for a non-success response status.
	pub(crate) fn from_status(status: StatusCode, message: String) -> Self {
		match status {
			StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Revoked,
			StatusCode::PAYMENT_REQUIRED | StatusCode::INSUFFICIENT_STORAGE => Self::Quota,
			_ => Self::Status { status, message },
		}
	}

	/// Whether retrying the same request later can reasonably succeed.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Http(err) => !err.is_builder(),
			Self::Status { status, .. } => {
				status.is_server_error()
					|| *status == StatusCode::TOO_MANY_REQUESTS
					|| *status == StatusCode::REQUEST_TIMEOUT
					|| *status == StatusCode::CONFLICT
			}
			Self::Revoked | Self::Quota | Self::InvalidPayload(_) => false,
		}
	}
}
