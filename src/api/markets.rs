//! Market data endpoints: markets, order books, events.
//!
//! These seed application state; live updates come from the streaming feed.

use crate::client::KalshiClient;
use crate::error::{KalshiError, Result};
use crate::types::markets::*;

impl KalshiClient {
    /// List markets matching `query`. Follow `cursor` for further pages.
    ///
    /// **Endpoint:** `GET /markets`
    pub async fn get_markets(&self, query: &MarketsQuery) -> Result<MarketsResponse> {
        self.get_with_query("/markets", query).await
    }

    /// Retrieve a single market.
    ///
    /// **Endpoint:** `GET /markets/{ticker}`
    pub async fn get_market(&self, ticker: &str) -> Result<MarketResponse> {
        let ticker = path_segment("ticker", ticker)?;
        self.get(&format!("/markets/{ticker}")).await
    }

    /// Retrieve the order book for a market, `depth` levels per side
    /// (`None` for the full book).
    ///
    /// **Endpoint:** `GET /markets/{ticker}/orderbook`
    pub async fn get_market_orderbook(
        &self,
        ticker: &str,
        depth: Option<u32>,
    ) -> Result<OrderbookResponse> {
        let ticker = path_segment("ticker", ticker)?;
        let path = format!("/markets/{ticker}/orderbook");
        match depth {
            Some(depth) => self.get_with_query(&path, &[("depth", depth)]).await,
            None => self.get(&path).await,
        }
    }

    /// List events matching `query`.
    ///
    /// **Endpoint:** `GET /events`
    pub async fn get_events(&self, query: &EventsQuery) -> Result<EventsResponse> {
        self.get_with_query("/events", query).await
    }

    /// Retrieve a single event, optionally with its markets nested.
    ///
    /// **Endpoint:** `GET /events/{event_ticker}`
    pub async fn get_event(
        &self,
        event_ticker: &str,
        with_nested_markets: bool,
    ) -> Result<EventResponse> {
        let event_ticker = path_segment("event_ticker", event_ticker)?;
        let path = format!("/events/{event_ticker}");
        if with_nested_markets {
            self.get_with_query(&path, &[("with_nested_markets", true)]).await
        } else {
            self.get(&path).await
        }
    }
}

/// Trim a ticker used as a path segment and reject values that would
/// change the request path or query.
fn path_segment<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(KalshiError::InvalidArgument(format!("{field} must not be empty")));
    }
    if let Some(bad) = value
        .chars()
        .find(|&c| matches!(c, '/' | '?' | '#' | '%' | '\\') || c.is_whitespace() || c.is_control())
    {
        return Err(KalshiError::InvalidArgument(format!(
            "{field} contains invalid character {bad:?}: {value:?}"
        )));
    }
    Ok(value)
}
