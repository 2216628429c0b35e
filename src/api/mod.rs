//! REST API endpoint implementations.
//!
//! Each sub-module adds high-level `async` methods to
//! [`KalshiClient`](crate::client::KalshiClient) via `impl` blocks. All methods
//! handle query encoding, HTTP transport, and error mapping automatically.
//!
//! ## Usage
//!
//! ```no_run
//! use kalshi_stream::KalshiClient;
//! use kalshi_stream::types::MarketsQuery;
//!
//! # #[tokio::main]
//! # async fn main() -> kalshi_stream::Result<()> {
//! let client = KalshiClient::from_env();
//! let page = client
//!     .get_markets(&MarketsQuery { status: Some("open".into()), ..Default::default() })
//!     .await?;
//! let book = client.get_market_orderbook(&page.markets[0].ticker, Some(10)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Endpoints | Description |
//! |---|---|---|
//! | [`markets`] | 5 | Markets, order books, events |

pub mod markets;
