//! Error types for the tether-delivery crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the session, the queue, and individual delivery attempts.
///
/// Only the construction variants (`InvalidUrl`, `Certificate`,
/// `ClientBuild`, `InvalidHeader`) ever leave the crate as hard failures;
/// per-request variants are absorbed by the reporter and turned into
/// retries and counters.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The configured base URL could not be parsed.
    #[error("invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The CA bundle could not be read or parsed.
    #[error("failed to load CA certificate {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    /// The HTTP client could not be built (TLS backend init, etc.).
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// Credentials contain bytes that are not valid in an HTTP header.
    #[error("credentials are not a valid header value")]
    InvalidHeader,

    /// The request never produced a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("server returned HTTP {0}")]
    Status(u16),

    /// No response within the per-call timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request body could not be serialized.
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    /// The delivery queue is at capacity; the entry was not accepted.
    #[error("delivery queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },
}
