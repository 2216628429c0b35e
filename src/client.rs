//! Core HTTP client for the Kalshi REST API v2.
//!
//! The [`KalshiClient`] struct fetches the public market snapshots used to
//! seed application state before (or alongside) the streaming feed. It wraps
//! [`reqwest::Client`] and provides typed `get` helpers; endpoint methods are
//! added via `impl` blocks in the [`crate::api`] module.

use reqwest::header::{self, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::{API_BASE_URL, ENV_API_HOST};
use crate::error::{ApiErrorBody, KalshiError, Result};

/// Core HTTP client for the Kalshi REST API v2.
///
/// # Example
///
/// ```no_run
/// use kalshi_stream::client::KalshiClient;
///
/// # #[tokio::main]
/// # async fn main() -> kalshi_stream::error::Result<()> {
/// let client = KalshiClient::new();
/// let market = client.get_market("KXBTCD-25DEC31").await?;
/// println!("{}", market.market.ticker);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct KalshiClient {
    http: reqwest::Client,
    /// Base URL for REST API requests (defaults to [`API_BASE_URL`]).
    base_url: String,
}

impl Default for KalshiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl KalshiClient {
    /// Create a client for the production API.
    pub fn new() -> Self {
        Self::with_base_url(API_BASE_URL)
    }

    /// Create a client pointing at a custom base URL.
    ///
    /// Useful for the demo environment or a mock server.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    /// Create a client reusing an existing `reqwest::Client`.
    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Create a client whose base URL is read from `KALSHI_API_HOST`, falling
    /// back to the production API.
    pub fn from_env() -> Self {
        match std::env::var(ENV_API_HOST) {
            Ok(host) if !host.trim().is_empty() => Self::with_base_url(host.trim()),
            _ => Self::new(),
        }
    }

    /// Returns a reference to the underlying `reqwest::Client`.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // -----------------------------------------------------------------------
    // Generic HTTP helpers
    // -----------------------------------------------------------------------

    /// Perform a GET request and deserialize the JSON response.
    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");

        let resp = self
            .http
            .get(&url)
            .header(header::ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await?;

        self.handle_response(resp).await
    }

    /// Perform a GET request with URL query parameters and deserialize the
    /// JSON response. `None` fields of `query` are omitted.
    pub async fn get_with_query<Q, R>(&self, path: &str, query: &Q) -> Result<R>
    where
        Q: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        tracing::debug!(%url, "GET (query)");

        let resp = self
            .http
            .get(&url)
            .header(header::ACCEPT, HeaderValue::from_static("application/json"))
            .query(query)
            .send()
            .await?;

        self.handle_response(resp).await
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Build the full URL from a path segment.
    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Read a response, returning either the deserialized body or a `KalshiError`.
    async fn handle_response<R: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<R> {
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if status.is_success() {
            serde_json::from_slice(&bytes).map_err(KalshiError::Json)
        } else {
            let body = String::from_utf8_lossy(&bytes);
            Err(parse_error_body(status, &body))
        }
    }
}

/// Try to parse the API's JSON error structure; fall back to a raw HTTP
/// status error.
pub(crate) fn parse_error_body(status: reqwest::StatusCode, body: &str) -> KalshiError {
    if let Ok(api_err) = serde_json::from_str::<ApiErrorBody>(body) {
        if api_err.error.code.is_some() || api_err.error.message.is_some() {
            return KalshiError::Api(api_err);
        }
    }
    KalshiError::HttpStatus {
        status,
        body: body.to_owned(),
    }
}
