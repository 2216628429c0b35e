//! Public streaming client: configuration, builder and the [`KalshiStream`]
//! façade.
//!
//! `KalshiStream` composes the subscription ledger, the dispatch registry and
//! the connection manager behind one cloneable handle. Subscriptions and
//! listeners can be set up before `connect()`; they take effect as soon as a
//! connection is live and are replayed after every reconnect.
//!
//! # Quick Start
//!
//! ```no_run
//! use kalshi_stream::ws::stream::KalshiStreamBuilder;
//! use kalshi_stream::constants::channels;
//!
//! # #[tokio::main]
//! # async fn main() -> kalshi_stream::error::Result<()> {
//! let stream = KalshiStreamBuilder::new()
//!     .max_delay(std::time::Duration::from_secs(10))
//!     .build();
//!
//! let handle = stream.on(channels::TICKER, |payload| {
//!     println!("ticker: {payload}");
//! });
//! stream.subscribe(&[channels::TICKER], Some(&["KXBTCD-25DEC31"]))?;
//! stream.connect().await?;
//!
//! // ... later
//! handle.release();
//! stream.unsubscribe(&[channels::TICKER], Some(&["KXBTCD-25DEC31"]))?;
//! stream.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::constants::{ENV_WS_URL, WS_FEED_URL, defaults};
use crate::error::{KalshiError, Result};
use crate::ws::connection::{ConnectionManager, ConnectionState, Outbound};
use crate::ws::ledger::{LedgerEntry, SubscriptionLedger};
use crate::ws::registry::{DispatchRegistry, ListenerHandle};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a [`KalshiStream`].
#[derive(Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub max_delay: Duration,
    /// Give up after this many failed reconnect cycles. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Keepalive ping period. `None` disables keepalive.
    pub ping_interval: Option<Duration>,
    /// Extra silence tolerated after a ping before the link is declared dead.
    pub pong_timeout: Duration,
    /// Maximum tickers carried by one subscribe/unsubscribe frame.
    pub max_tickers_per_request: usize,
    /// Extra handshake headers, e.g. pre-computed credentials.
    pub headers: Vec<(String, String)>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: WS_FEED_URL.to_owned(),
            base_delay: defaults::BASE_DELAY,
            max_delay: defaults::MAX_DELAY,
            max_attempts: None,
            connect_timeout: defaults::CONNECT_TIMEOUT,
            ping_interval: Some(defaults::PING_INTERVAL),
            pong_timeout: defaults::PONG_TIMEOUT,
            max_tickers_per_request: defaults::MAX_TICKERS_PER_REQUEST,
            headers: Vec::new(),
        }
    }
}

// Header values may carry credentials.
impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("StreamConfig")
            .field("url", &self.url)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("max_attempts", &self.max_attempts)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("max_tickers_per_request", &self.max_tickers_per_request)
            .field("headers", &header_names)
            .finish()
    }
}

impl StreamConfig {
    /// Defaults, with the endpoint taken from `KALSHI_WS_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(ENV_WS_URL) {
            let url = url.trim();
            if !url.is_empty() {
                config.url = url.to_owned();
            }
        }
        config
    }

    /// Parse the endpoint and check it is a WebSocket URL.
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(KalshiError::InvalidArgument(format!(
                "stream URL must use ws or wss, got {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`KalshiStream`] with custom configuration.
///
/// # Example
///
/// ```no_run
/// use kalshi_stream::ws::stream::KalshiStreamBuilder;
/// use std::time::Duration;
///
/// let stream = KalshiStreamBuilder::new()
///     .url("wss://demo-api.kalshi.co/trade-api/ws/v2")
///     .base_delay(Duration::from_millis(500))
///     .max_attempts(Some(20))
///     .header("KALSHI-ACCESS-KEY", "key-id")
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct KalshiStreamBuilder {
    config: StreamConfig,
}

impl KalshiStreamBuilder {
    /// Start from [`StreamConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Set the WebSocket endpoint. Default: production feed.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the first reconnect delay. Default: 1 s.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set the reconnect delay cap. Default: 30 s.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Limit reconnect cycles. Default: unlimited.
    pub fn max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the handshake timeout. Default: 10 s.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the keepalive ping period, or `None` to disable. Default: 20 s.
    pub fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.ping_interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// Set the pong grace period. Default: 10 s.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.config.pong_timeout = timeout;
        self
    }

    /// Set the per-frame ticker limit. Default: 100.
    pub fn max_tickers_per_request(mut self, n: usize) -> Self {
        self.config.max_tickers_per_request = n.max(1);
        self
    }

    /// Add a handshake header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.push((name.into(), value.into()));
        self
    }

    /// Build the [`KalshiStream`]. Nothing connects until `connect()`.
    pub fn build(self) -> KalshiStream {
        KalshiStream::new(self.config)
    }
}

// ---------------------------------------------------------------------------
// KalshiStream
// ---------------------------------------------------------------------------

struct StreamInner {
    connection: ConnectionManager,
    ledger: Arc<SubscriptionLedger>,
    registry: DispatchRegistry,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Shared streaming connection with reference-counted subscriptions and
/// per-type listeners.
///
/// Cheap to clone; clones share one connection, ledger and registry. The
/// background task is aborted when the last clone is dropped.
#[derive(Clone)]
pub struct KalshiStream {
    inner: Arc<StreamInner>,
}

impl KalshiStream {
    /// Create a stream with the given configuration. Does not connect.
    pub fn new(config: StreamConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let ledger = Arc::new(SubscriptionLedger::new(
            outbound.clone(),
            config.max_tickers_per_request,
        ));
        let registry = DispatchRegistry::new();
        let connection =
            ConnectionManager::new(config, Arc::clone(&ledger), registry.clone(), outbound_rx);

        Self {
            inner: Arc::new(StreamInner {
                connection,
                ledger,
                registry,
                outbound,
            }),
        }
    }

    /// Shorthand for [`KalshiStreamBuilder::new`].
    pub fn builder() -> KalshiStreamBuilder {
        KalshiStreamBuilder::new()
    }

    /// The configuration this stream was built with.
    pub fn config(&self) -> &StreamConfig {
        self.inner.connection.config()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open the connection and replay every active subscription.
    ///
    /// Errors from the initial handshake are returned here; later drops are
    /// handled by reconnecting in the background. Returns
    /// [`KalshiError::ConnectInFlight`] if a connect or reconnect is already
    /// running, and `Ok(())` without doing anything when already connected.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Subscriptions and listeners are retained, so a later `connect()` picks
    /// up where this left off.
    pub async fn close(&self) {
        self.inner.connection.close().await;
    }

    /// Whether the connection is currently live.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_changes()
    }

    /// Number of successful automatic reconnects so far.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.connection.reconnect_count()
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register interest in `channels` for `market_tickers` (`None` or empty
    /// for every instrument on those channels).
    ///
    /// Only pairs nobody held before produce a wire subscribe. Never fails
    /// because the connection is down; the request is covered by the next
    /// replay instead.
    pub fn subscribe(&self, channels: &[&str], market_tickers: Option<&[&str]>) -> Result<()> {
        validate_names(channels, market_tickers)?;
        let sent = self.inner.ledger.acquire(channels, market_tickers);
        tracing::debug!(?channels, ?market_tickers, requests = sent.len(), "subscribe");
        Ok(())
    }

    /// Drop one unit of interest in each pair. A wire unsubscribe goes out
    /// only for pairs whose last holder this was; other holders keep
    /// receiving.
    pub fn unsubscribe(&self, channels: &[&str], market_tickers: Option<&[&str]>) -> Result<()> {
        validate_names(channels, market_tickers)?;
        let sent = self.inner.ledger.release(channels, market_tickers);
        tracing::debug!(?channels, ?market_tickers, requests = sent.len(), "unsubscribe");
        Ok(())
    }

    /// Snapshot of every active subscription and its holder count.
    pub fn active_subscriptions(&self) -> Vec<LedgerEntry> {
        self.inner.ledger.entries()
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Call `callback` with the payload of every inbound message of
    /// `type_key`. Keep the handle and `release()` it when done; dropping it
    /// leaves the listener registered.
    pub fn on<F>(&self, type_key: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.inner.registry.register(type_key, callback)
    }

    /// Remove every listener for `type_key`. Returns how many were removed.
    pub fn clear_listeners(&self, type_key: &str) -> usize {
        self.inner.registry.clear(type_key)
    }

    // -----------------------------------------------------------------------
    // Raw requests
    // -----------------------------------------------------------------------

    /// Queue an arbitrary JSON request. While disconnected it is buffered and
    /// sent after the next replay.
    pub fn send<T: Serialize>(&self, request: &T) -> Result<()> {
        let value = serde_json::to_value(request)?;
        self.inner
            .outbound
            .send(Outbound::Request(value))
            .map_err(|_| KalshiError::Closed)
    }
}

impl fmt::Debug for KalshiStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KalshiStream")
            .field("state", &self.state())
            .field("subscriptions", &self.inner.ledger.entries().len())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

fn validate_names(channels: &[&str], market_tickers: Option<&[&str]>) -> Result<()> {
    if channels.is_empty() {
        return Err(KalshiError::InvalidArgument(
            "at least one channel is required".into(),
        ));
    }
    if channels.iter().any(|c| c.trim().is_empty()) {
        return Err(KalshiError::InvalidArgument("empty channel name".into()));
    }
    if market_tickers.is_some_and(|t| t.iter().any(|s| s.trim().is_empty())) {
        return Err(KalshiError::InvalidArgument("empty market ticker".into()));
    }
    Ok(())
}
