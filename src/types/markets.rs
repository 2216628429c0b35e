#![allow(missing_docs)]
//! Market, event and order book snapshot types (REST).
//!
//! Prices are in cents (1–99). Most fields are optional because the API omits
//! them for markets that have not traded or are not yet open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

/// A single binary market.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Market {
    pub ticker: String,
    #[serde(default)]
    pub event_ticker: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub yes_bid: Option<i64>,
    #[serde(default)]
    pub yes_ask: Option<i64>,
    #[serde(default)]
    pub no_bid: Option<i64>,
    #[serde(default)]
    pub no_ask: Option<i64>,
    #[serde(default)]
    pub last_price: Option<i64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub volume_24h: Option<i64>,
    #[serde(default)]
    pub open_interest: Option<i64>,
    #[serde(default)]
    pub open_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
}

/// Response from `GET /markets`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketsResponse {
    #[serde(default)]
    pub markets: Vec<Market>,
    /// Pagination cursor; empty or absent on the last page.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Response from `GET /markets/{ticker}`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketResponse {
    pub market: Market,
}

/// Filters for `GET /markets`. Unset fields are not sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketsQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_ticker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Comma-separated market tickers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tickers: Option<String>,
}

impl MarketsQuery {
    /// Restrict the result to the given market tickers.
    pub fn tickers<I, S>(mut self, tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: Vec<String> = tickers.into_iter().map(|t| t.as_ref().to_owned()).collect();
        self.tickers = (!joined.is_empty()).then(|| joined.join(","));
        self
    }
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// Resting bids on each side as `(price_cents, quantity)` levels.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Orderbook {
    #[serde(default)]
    pub yes: Option<Vec<(i64, i64)>>,
    #[serde(default)]
    pub no: Option<Vec<(i64, i64)>>,
}

/// Response from `GET /markets/{ticker}/orderbook`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderbookResponse {
    #[serde(default)]
    pub orderbook: Orderbook,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event grouping one or more markets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Event {
    pub event_ticker: String,
    #[serde(default)]
    pub series_ticker: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub sub_title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub mutually_exclusive: Option<bool>,
    /// Present only when requested with `with_nested_markets`.
    #[serde(default)]
    pub markets: Option<Vec<Market>>,
}

/// Response from `GET /events`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsResponse {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Response from `GET /events/{event_ticker}`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventResponse {
    pub event: Event,
    #[serde(default)]
    pub markets: Vec<Market>,
}

/// Filters for `GET /events`. Unset fields are not sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventsQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_ticker: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub with_nested_markets: bool,
}
