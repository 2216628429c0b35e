//! Binary to connect to the Kalshi streaming feed, subscribe to the `ticker`
//! and `trade` channels for the given markets, and print what arrives.
//!
//! # Usage
//!
//! ```sh
//! export KALSHI_WS_URL="wss://demo-api.kalshi.co/trade-api/ws/v2"   # optional
//! export STREAM_CHECK_SECS=30                                         # optional
//! cargo run --bin stream_check --features cli -- KXBTCD-25DEC31 KXETHD-25DEC31
//! ```
//!
//! With no tickers the public `ticker` channel is subscribed for every market.

use std::env;
use std::time::Duration;

use kalshi_stream::constants::channels;
use kalshi_stream::ws::{KalshiStreamBuilder, StreamConfig};
use tokio::time;

#[tokio::main]
async fn main() -> kalshi_stream::error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let tickers: Vec<String> = env::args().skip(1).collect();
    let secs = env::var("STREAM_CHECK_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10);

    let stream = KalshiStreamBuilder::from_config(StreamConfig::from_env()).build();

    let mut handles = Vec::new();
    for kind in [channels::TICKER, channels::TRADE, channels::ERROR] {
        handles.push(stream.on(kind, move |payload| println!("[{kind}] {payload}")));
    }
    handles.push(stream.on(channels::SUBSCRIBED, |ack| println!("subscribed: {ack}")));

    let refs: Vec<&str> = tickers.iter().map(String::as_str).collect();
    if refs.is_empty() {
        println!("Subscribing to ticker for all markets…");
        stream.subscribe(&[channels::TICKER], None)?;
    } else {
        println!("Subscribing to ticker + trade for {refs:?}…");
        stream.subscribe(&[channels::TICKER, channels::TRADE], Some(&refs))?;
    }

    println!("Connecting to {}…", stream.config().url);
    stream.connect().await?;

    println!("Listening for events for {secs} seconds…\n");
    let mut states = stream.state_changes();
    let deadline = time::sleep(Duration::from_secs(secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                println!("\n{secs} seconds elapsed: disconnecting…");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("connection: {state}");
            }
        }
    }

    for handle in &handles {
        handle.release();
    }
    stream.close().await;
    println!(
        "Done. {} reconnect(s), {} active subscription(s).",
        stream.reconnect_count(),
        stream.active_subscriptions().len()
    );

    Ok(())
}
