//! Error types for the client.
//!
//! All fallible operations return [`Result`]. Variants are classified by
//! [`ClientError::is_retryable`]: retryable failures feed the reconnect
//! backoff, the rest surface to the caller.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Main error type for protocol and connection failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// The byte stream violated the framing contract. Fatal to the
    /// current connection.
    #[error("framing error: {reason}")]
    Framing { reason: String },

    /// The server rejected the login handshake. Not retried.
    #[error("login rejected by server (code {code})")]
    LoginRejected { code: i32 },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: &'static str, duration: Duration },

    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("websocket error")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http request failed: {url}")]
    Http {
        url: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("server config unusable: {reason}")]
    ServerConfig { reason: String },

    /// An operation that requires an active connection was invoked
    /// without one.
    #[error("not connected")]
    NotConnected,

    /// The server refused a room join for the target model.
    #[error("join refused for model {uid}: {reason}")]
    JoinRefused { uid: i64, reason: String },

    /// A pending wait was cancelled by a manual disconnect.
    #[error("disconnected")]
    Disconnected,
}

impl ClientError {
    /// Whether the connection manager may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Framing { .. } => true,
            ClientError::Timeout { .. } => true,
            ClientError::Io(_) => true,
            ClientError::WebSocket(_) => true,
            ClientError::Http { .. } => true,
            ClientError::ServerConfig { .. } => true,
            ClientError::LoginRejected { .. } => false,
            ClientError::NotConnected => false,
            ClientError::JoinRefused { .. } => false,
            ClientError::Disconnected => false,
        }
    }

    pub fn framing(reason: impl Into<String>) -> Self {
        ClientError::Framing { reason: reason.into() }
    }

    pub fn timeout(operation: &'static str, duration: Duration) -> Self {
        ClientError::Timeout { operation, duration }
    }

    pub fn http(
        url: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ClientError::Http { url: url.into(), source: Some(Box::new(source)) }
    }

    pub fn server_config(reason: impl Into<String>) -> Self {
        ClientError::ServerConfig { reason: reason.into() }
    }

    pub fn join_refused(uid: i64, reason: impl Into<String>) -> Self {
        ClientError::JoinRefused { uid, reason: reason.into() }
    }
}
