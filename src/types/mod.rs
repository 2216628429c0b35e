//! Response and query types for the Kalshi REST API v2.
//!
//! Only the public market-data snapshots used alongside the streaming feed
//! are modelled:
//!
//! - [`markets`]: Markets, events, order book snapshots and their filters

pub mod markets;

pub use markets::*;
