//! Constants for the Kalshi trade API v2.
//!
//! Contains base URLs, the streaming endpoint, well-known channel names, and
//! the default timings used by [`KalshiStream`](crate::ws::stream::KalshiStream).
//! These are used internally but are also exported for advanced usage.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Base URLs
// ---------------------------------------------------------------------------

/// Base URL for the Kalshi REST API v2.
pub const API_BASE_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";

/// WebSocket endpoint for the real-time streaming feed.
pub const WS_FEED_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

/// Overrides [`API_BASE_URL`] in [`KalshiClient::from_env`](crate::client::KalshiClient::from_env).
pub const ENV_API_HOST: &str = "KALSHI_API_HOST";

/// Overrides [`WS_FEED_URL`] in [`StreamConfig::from_env`](crate::ws::stream::StreamConfig::from_env).
pub const ENV_WS_URL: &str = "KALSHI_WS_URL";

// ---------------------------------------------------------------------------
// Channels and message types
// ---------------------------------------------------------------------------

/// Channel names understood by the feed, and the inbound message types
/// listeners can register for.
pub mod channels {
    /// Price ticker updates.
    pub const TICKER: &str = "ticker";
    /// Incremental order book changes.
    pub const ORDERBOOK_DELTA: &str = "orderbook_delta";
    /// Full order book snapshot, sent on the `orderbook_delta` channel.
    pub const ORDERBOOK_SNAPSHOT: &str = "orderbook_snapshot";
    /// Public trades.
    pub const TRADE: &str = "trade";
    /// Fills on the account's own orders (account-scoped, no tickers).
    pub const FILL: &str = "fill";

    /// Acknowledgement of a subscribe request.
    pub const SUBSCRIBED: &str = "subscribed";
    /// Acknowledgement of an unsubscribe request.
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    /// Server-side error or rejection of a request.
    pub const ERROR: &str = "error";
}

// ---------------------------------------------------------------------------
// Stream defaults
// ---------------------------------------------------------------------------

/// Stream timing and batching defaults.
pub mod defaults {
    use super::Duration;

    /// First reconnect delay.
    pub const BASE_DELAY: Duration = Duration::from_secs(1);
    /// Upper bound on the reconnect delay.
    pub const MAX_DELAY: Duration = Duration::from_secs(30);
    /// Time allowed for the WebSocket handshake.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Interval between client keepalive pings.
    pub const PING_INTERVAL: Duration = Duration::from_secs(20);
    /// Extra silence tolerated after a ping before the link is declared dead.
    pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);
    /// Maximum market tickers carried by a single subscribe/unsubscribe frame.
    pub const MAX_TICKERS_PER_REQUEST: usize = 100;
}
