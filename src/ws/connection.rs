//! Connection state machine and the background socket task.
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──open──▶ Connected
//!       ▲                          ▲                  │   │
//!       │                   backoff elapsed     drop  │   │ close()
//!       │                          │                  ▼   │
//!       └──── close() / give up ── Reconnecting ◀─────┘   ▼
//!                                                    Disconnected
//! ```
//!
//! A single Tokio task owns the WebSocket. It replays the subscription ledger
//! right after every successful open, then multiplexes inbound frames
//! (decoded and handed to the [`DispatchRegistry`]), the outbound queue, and
//! keepalive pings. Unintentional drops take the reconnect path with
//! exponential backoff; `close()` is the only way to stop it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::constants::channels;
use crate::error::{KalshiError, Result};
use crate::ws::backoff::Backoff;
use crate::ws::ledger::SubscriptionLedger;
use crate::ws::protocol::{self, SubscriptionCommand};
use crate::ws::registry::DispatchRegistry;
use crate::ws::stream::StreamConfig;

/// How long `close()` waits for the task to say goodbye before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle state of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and no attempt running.
    Disconnected,
    /// A handshake is in progress.
    Connecting,
    /// The socket is open; replay is sent before any queued request.
    Connected,
    /// The connection dropped; waiting out the backoff delay.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// Item on the outbound queue drained by the socket task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Produced by a ledger transition while the connection with `epoch` was
    /// live. Dropped if that connection is gone, since replay supersedes it.
    Ledger {
        epoch: u64,
        command: SubscriptionCommand,
    },
    /// Application request; buffered across outages.
    Request(Value),
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    config: StreamConfig,
    ledger: Arc<SubscriptionLedger>,
    registry: DispatchRegistry,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Outbound>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    epoch: AtomicU64,
    /// Bumped by every `connect()` claim and every `close()`. A handshake
    /// only goes live if no other claim or close happened since it started.
    generation: AtomicU64,
    reconnects: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Mark a freshly opened socket live: new epoch, ledger online, state
    /// `Connected`. Returns the epoch and the replay frames to send first.
    fn go_live(&self) -> (u64, Vec<SubscriptionCommand>) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let replay = self.ledger.go_online(epoch);
        self.set_state(ConnectionState::Connected);
        (epoch, replay)
    }

    fn go_down(&self, state: ConnectionState) {
        self.ledger.go_offline();
        self.set_state(state);
    }

    /// Move to `Disconnected` unless a newer `connect()` has claimed the
    /// state since `generation` was taken. Runs under the state lock, so it
    /// cannot interleave with a claim.
    fn settle_disconnected(&self, generation: u64) -> bool {
        let mut settled = false;
        self.state_tx.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            settled = true;
            self.ledger.go_offline();
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
        settled
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Owns the transport and drives the state machine.
pub(crate) struct ConnectionManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: StreamConfig,
        ledger: Arc<SubscriptionLedger>,
        registry: DispatchRegistry,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                ledger,
                registry,
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
                state_tx,
                shutdown_tx,
                epoch: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Open the connection.
    ///
    /// Returns once the handshake has completed (the ledger replay is sent by
    /// the background task before any queued request). Fails fast with
    /// [`KalshiError::ConnectInFlight`] while another attempt is running; a
    /// no-op when already connected.
    pub(crate) async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let url = shared.config.validate()?;

        let mut observed = ConnectionState::Disconnected;
        let mut generation = 0;
        let claimed = shared.state_tx.send_if_modified(|state| {
            observed = *state;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                true
            } else {
                false
            }
        });
        if !claimed {
            return match observed {
                ConnectionState::Connected => {
                    tracing::debug!("connect() called while already connected");
                    Ok(())
                }
                _ => Err(KalshiError::ConnectInFlight),
            };
        }

        shared.shutdown_tx.send_replace(false);
        if let Some(stale) = self.lock_task().take() {
            stale.abort();
        }

        tracing::info!(url = %url, "Connecting to streaming feed");
        let ws = match open(&shared.config).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(error = %e, "Initial connection failed");
                shared.settle_disconnected(generation);
                return Err(e);
            }
        };

        // A close() racing the handshake wins; otherwise the task is stored
        // before close() can look for it.
        let launched = {
            let mut task = self.lock_task();
            if shared.generation.load(Ordering::SeqCst) != generation {
                Err(ws)
            } else {
                let (epoch, replay) = shared.go_live();
                let spawned = tokio::spawn(run(Arc::clone(shared), ws, epoch, replay));
                if let Some(stale) = task.replace(spawned) {
                    stale.abort();
                }
                Ok(epoch)
            }
        };
        // The state already belongs to close() or a newer connect().
        let epoch = match launched {
            Ok(epoch) => epoch,
            Err(mut ws) => {
                tracing::info!("Connection closed during handshake, discarding socket");
                let _ = ws.send(Message::Close(None)).await;
                return Err(KalshiError::Closed);
            }
        };

        tracing::info!(url = %url, epoch, "Streaming feed connected");
        Ok(())
    }

    /// Intentionally close the connection and stop reconnecting.
    ///
    /// Ledger entries and listeners are kept; a later `connect()` replays them.
    pub(crate) async fn close(&self) {
        self.shared.shutdown_tx.send_replace(true);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let task = self.lock_task().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                tracing::warn!("Socket task did not stop in time, aborting");
                task.abort();
            }
        }

        if self.shared.settle_disconnected(generation) {
            tracing::info!("Streaming feed closed");
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub(crate) fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub(crate) fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    pub(crate) fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

enum SessionEnd {
    /// `close()` was requested.
    Shutdown,
    /// The transport failed or the server closed it.
    Dropped,
}

/// Open the WebSocket with the configured headers and handshake timeout.
async fn open(config: &StreamConfig) -> Result<WsStream> {
    let mut request = config.url.as_str().into_client_request()?;
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| KalshiError::InvalidArgument(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| KalshiError::InvalidArgument(format!("header {name}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    match tokio::time::timeout(config.connect_timeout, connect_async(request)).await {
        Ok(Ok((ws, _resp))) => Ok(ws),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(KalshiError::ConnectTimeout(config.connect_timeout)),
    }
}

/// Resolve once `close()` has been requested.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closing| *closing).await;
}

/// Socket task: run sessions back to back, reconnecting with backoff between
/// them, until shutdown or the attempt limit is exhausted.
async fn run(shared: Arc<Shared>, mut ws: WsStream, mut epoch: u64, mut replay: Vec<SubscriptionCommand>) {
    let config = &shared.config;
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut backoff = Backoff::new(config.base_delay, config.max_delay, config.max_attempts);
    let mut outbound = shared.outbound_rx.lock().await;

    loop {
        let end = session(&shared, &mut ws, epoch, replay, &mut outbound, &mut shutdown).await;

        // On shutdown, close() owns the move to `Disconnected`.
        if let SessionEnd::Shutdown = end {
            let _ = ws.send(Message::Close(None)).await;
            shared.ledger.go_offline();
            return;
        }
        shared.go_down(ConnectionState::Reconnecting);

        ws = loop {
            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    attempts = backoff.attempt(),
                    "Reconnect attempts exhausted, giving up"
                );
                shared.go_down(ConnectionState::Disconnected);
                return;
            };
            tracing::info!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Attempting reconnect..."
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => {
                    shared.ledger.go_offline();
                    return;
                }
            }

            shared.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                r = open(config) => r,
                _ = shutdown_requested(&mut shutdown) => {
                    shared.ledger.go_offline();
                    return;
                }
            };
            match attempt {
                Ok(ws) => break ws,
                Err(e) => {
                    tracing::error!(
                        attempt = backoff.attempt(),
                        error = %e,
                        "Reconnection failed"
                    );
                    shared.set_state(ConnectionState::Reconnecting);
                }
            }
        };

        backoff.reset();
        shared.reconnects.fetch_add(1, Ordering::Relaxed);
        (epoch, replay) = shared.go_live();
        tracing::info!(epoch, "Reconnected successfully");
    }
}

/// Drive one open socket until it drops or shutdown is requested.
async fn session(
    shared: &Shared,
    ws: &mut WsStream,
    epoch: u64,
    replay: Vec<SubscriptionCommand>,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let config = &shared.config;

    // Replay goes out before anything buffered on the queue.
    let replayed = replay.len();
    for command in &replay {
        if let Err(e) = send_command(ws, command).await {
            tracing::error!(error = %e, "Failed to replay subscriptions after connect");
            return SessionEnd::Dropped;
        }
    }
    if replayed > 0 {
        tracing::info!(epoch, requests = replayed, "Replayed subscriptions");
    }

    let keepalive = config.ping_interval;
    let period = keepalive.unwrap_or(Duration::from_secs(3600));
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,

            frame = ws.next() => match frame {
                Some(Ok(msg)) => {
                    last_seen = Instant::now();
                    match msg {
                        Message::Text(text) => handle_text(&shared.registry, text.as_str()),
                        Message::Binary(data) => match std::str::from_utf8(&data) {
                            Ok(text) => handle_text(&shared.registry, text),
                            Err(_) => tracing::debug!(bytes = data.len(), "Ignoring non-UTF-8 binary frame"),
                        },
                        Message::Close(frame) => {
                            tracing::info!(epoch, frame = ?frame, "WebSocket closed by server");
                            return SessionEnd::Dropped;
                        }
                        _ => {}
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(epoch, error = %e, "WebSocket error");
                    return SessionEnd::Dropped;
                }
                None => {
                    tracing::info!(epoch, "WebSocket stream ended");
                    return SessionEnd::Dropped;
                }
            },

            item = outbound.recv() => match item {
                Some(Outbound::Ledger { epoch: queued, command }) => {
                    if queued != epoch {
                        tracing::debug!(queued, epoch, "Dropping request superseded by replay");
                        continue;
                    }
                    if let Err(e) = send_command(ws, &command).await {
                        tracing::error!(error = %e, "Failed to send subscription request");
                        return SessionEnd::Dropped;
                    }
                }
                Some(Outbound::Request(request)) => {
                    let sent = ws.send(Message::Text(request.to_string().into())).await;
                    if let Err(e) = sent {
                        tracing::error!(error = %e, "Failed to send request");
                        return SessionEnd::Dropped;
                    }
                }
                None => return SessionEnd::Shutdown,
            },

            _ = ping.tick(), if keepalive.is_some() => {
                if last_seen.elapsed() > period + config.pong_timeout {
                    tracing::warn!(epoch, "No traffic within keepalive window, dropping connection");
                    return SessionEnd::Dropped;
                }
                if let Err(e) = ws.send(Message::Ping(Default::default())).await {
                    tracing::error!(error = %e, "Failed to send ping");
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

async fn send_command(ws: &mut WsStream, command: &SubscriptionCommand) -> Result<()> {
    let json = command.to_json()?;
    ws.send(Message::Text(json.into())).await?;
    tracing::debug!(
        command = ?command.command,
        channels = ?command.channels,
        tickers = command.market_tickers.as_ref().map_or(0, Vec::len),
        "Sent subscription request"
    );
    Ok(())
}

/// Decode one text frame and hand it to the registry. Decode failures are
/// logged and dropped.
fn handle_text(registry: &DispatchRegistry, text: &str) {
    let msg = match protocol::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode inbound frame");
            return;
        }
    };

    if msg.is_ack() {
        tracing::debug!(kind = %msg.kind, channels = ?msg.acked_channels(), "Acknowledged");
    } else if msg.kind == channels::ERROR {
        tracing::warn!(payload = %msg.payload, "Server reported an error");
    }

    registry.dispatch(&msg.kind, &msg.payload);
}
