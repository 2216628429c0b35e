//! # kalshi-stream
//!
//! A streaming client for the [Kalshi trade API v2](https://trading-api.readme.io/)
//! WebSocket feed, with a small REST client for the snapshots that seed it.
//!
//! Many consumers share one connection. Subscriptions are reference-counted
//! per `(channel, market ticker)`, so one consumer unsubscribing never
//! silences another, and the full set is replayed after every reconnect.
//!
//! ## Quick Start
//!
//! ```no_run
//! use kalshi_stream::KalshiStream;
//! use kalshi_stream::constants::channels;
//!
//! #[tokio::main]
//! async fn main() -> kalshi_stream::error::Result<()> {
//!     let stream = KalshiStream::builder().build();
//!     let trades = stream.on(channels::TRADE, |trade| println!("{trade}"));
//!     stream.subscribe(&[channels::TRADE], Some(&["KXBTCD-25DEC31"]))?;
//!     stream.connect().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     trades.release();
//!     stream.close().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod client;
pub mod constants;
pub mod error;
pub mod types;
pub mod ws;

/// Re-export the REST client at crate root for convenience.
pub use client::KalshiClient;
/// Re-export the error type and Result alias.
pub use error::{KalshiError, Result};
/// Re-export the streaming client and its state.
pub use ws::{ConnectionState, KalshiStream, ListenerHandle, StreamConfig};
