//! Error types for the tether-control crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while building or (re)establishing the control connection.
///
/// Construction errors stop the agent at startup; connection errors only
/// feed the reconnect backoff.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The backhaul URL could not be derived from the server URL.
    #[error("invalid backhaul URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The CA bundle could not be loaded.
    #[error("failed to load CA certificate {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    /// The TLS connector could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    /// Credentials or origin are not valid header values.
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),

    /// Handshake or transport failure on the websocket.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The handshake did not complete in time.
    #[error("websocket handshake timed out after {0:?}")]
    Timeout(Duration),
}
