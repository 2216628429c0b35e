//! Error types for the `kalshi-stream` crate.
//!
//! All fallible operations in this crate return [`Result<T>`], which is an
//! alias for `std::result::Result<T, KalshiError>`.
//!
//! [`KalshiError`] covers:
//! - **API errors**: Structured error responses from the Kalshi REST API
//! - **HTTP status errors**: Unexpected status codes with response body
//! - **HTTP transport errors**: Network, TLS, timeout failures
//! - **JSON errors**: Serialization and deserialization failures
//! - **WebSocket errors**: Handshake and protocol errors
//! - **URL errors**: Malformed endpoint configuration
//! - **Stream lifecycle errors**: `connect()` while an attempt is in flight,
//!   handshake timeouts, and calls racing an intentional `close()`
//!
//! Steady-state streaming failures (drops, decode errors, listener panics) are
//! recovered internally and never surface through this type.

use std::fmt;
use std::time::Duration;

/// Error detail returned by the Kalshi REST API.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ApiErrorDetail {
    /// Machine-readable error code (e.g. `"not_found"`).
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable description of the error.
    #[serde(default)]
    pub message: Option<String>,
    /// Additional detail, when the server supplies it.
    #[serde(default)]
    pub details: Option<String>,
}

/// Error envelope returned by the Kalshi REST API: `{"error": {...}}`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiErrorBody {
    /// The error detail.
    #[serde(default)]
    pub error: ApiErrorDetail,
}

impl fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.error.code.as_deref().unwrap_or("unknown"),
            self.error.message.as_deref().unwrap_or("No message"),
        )?;
        if let Some(details) = &self.error.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// All possible errors produced by the `kalshi-stream` crate.
#[derive(Debug, thiserror::Error)]
pub enum KalshiError {
    /// An error response returned by the Kalshi REST API.
    #[error("API error: {0}")]
    Api(ApiErrorBody),

    /// The server returned an unexpected HTTP status code.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: reqwest::StatusCode,
        /// The response body text.
        body: String,
    },

    /// A network or transport-level error from `reqwest`.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A WebSocket-level error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// An error building or parsing a URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// The caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `connect()` was called while a connection attempt was already running.
    #[error("a connection attempt is already in flight")]
    ConnectInFlight,

    /// The WebSocket handshake did not complete in time.
    #[error("WebSocket handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The stream was closed while the operation was pending.
    #[error("stream closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for KalshiError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KalshiError>;
