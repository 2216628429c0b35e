//! Streaming market data over the Kalshi WebSocket API.
//!
//! One shared connection serves every consumer in the process:
//!
//! - [`ledger`] reference-counts `(channel, market ticker)` subscriptions so
//!   independent consumers never unsubscribe each other,
//! - [`registry`] routes each inbound message to the listeners registered for
//!   its type,
//! - [`connection`] owns the socket, reconnects with exponential
//!   [`backoff`] and replays the ledger after every reconnect,
//! - [`stream`] ties them together behind [`KalshiStream`].
//!
//! Frames are JSON; see [`protocol`].
//!
//! ## Limits
//!
//! - Up to 100 market tickers per subscribe/unsubscribe message (configurable)
//! - Listeners run on the read task; hand heavy work off to another task

pub mod backoff;
pub mod connection;
pub mod ledger;
pub mod protocol;
pub mod registry;
pub mod stream;

pub use connection::ConnectionState;
pub use ledger::{LedgerEntry, LedgerKey, Scope};
pub use registry::{DispatchRegistry, ListenerHandle};
pub use stream::{KalshiStream, KalshiStreamBuilder, StreamConfig};
