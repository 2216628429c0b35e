//! Reference-counted subscription ledger.
//!
//! One entry per `(channel, market ticker | global)` pair, counting how many
//! logical `subscribe` calls are outstanding for it. A wire subscribe is
//! produced only on a 0→1 transition (or by [`SubscriptionLedger::replay`]
//! after a reconnect) and a wire unsubscribe only on 1→0, so independent
//! consumers sharing a pair never unsubscribe each other.
//!
//! Entries survive disconnects. While the connection is down, transitions are
//! recorded but nothing is queued; the next replay covers them.
//!
//! Wire frames are pushed onto the outbound queue *inside* the ledger's
//! critical section so that frames for the same pair are queued in the order
//! their transitions happened.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::ws::connection::Outbound;
use crate::ws::protocol::{CommandKind, SubscriptionCommand};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Instrument scope of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Every instrument the server sends on the channel.
    Global,
    /// A single market ticker.
    Market(String),
}

/// Identity of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    /// Channel name.
    pub channel: String,
    /// Instrument scope.
    pub scope: Scope,
}

/// Read-only view of one active entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// The `(channel, scope)` pair being counted.
    pub key: LedgerKey,
    /// Outstanding `subscribe` calls for this pair. Always > 0.
    pub ref_count: usize,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

struct LedgerState {
    entries: HashMap<LedgerKey, usize>,
    /// Epoch of the live connection, `None` while offline.
    online: Option<u64>,
}

/// The authoritative record of what the application wants to receive.
pub(crate) struct SubscriptionLedger {
    state: Mutex<LedgerState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    max_tickers_per_request: usize,
}

impl SubscriptionLedger {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        max_tickers_per_request: usize,
    ) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                entries: HashMap::new(),
                online: None,
            }),
            outbound,
            max_tickers_per_request: max_tickers_per_request.max(1),
        }
    }

    /// Record interest in every `(channel, ticker)` pair.
    ///
    /// Returns the subscribe frames implied by 0→1 transitions. They are
    /// queued for sending when online and deferred to the next replay
    /// otherwise. Never fails.
    pub(crate) fn acquire(
        &self,
        channels: &[&str],
        tickers: Option<&[&str]>,
    ) -> Vec<SubscriptionCommand> {
        let mut state = self.lock();
        let mut opened = Vec::new();
        for key in expand(channels, tickers) {
            let count = state.entries.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                opened.push(key);
            }
        }

        let commands = batch(opened, CommandKind::Subscribe, self.max_tickers_per_request);
        self.enqueue(&state, &commands);
        commands
    }

    /// Drop interest in every `(channel, ticker)` pair.
    ///
    /// Returns the unsubscribe frames implied by 1→0 transitions. Pairs that
    /// are not held are ignored.
    pub(crate) fn release(
        &self,
        channels: &[&str],
        tickers: Option<&[&str]>,
    ) -> Vec<SubscriptionCommand> {
        let mut state = self.lock();
        let mut closed = Vec::new();
        for key in expand(channels, tickers) {
            let Some(count) = state.entries.get_mut(&key) else {
                tracing::debug!(channel = %key.channel, scope = ?key.scope, "Release of unheld pair ignored");
                continue;
            };
            *count -= 1;
            if *count == 0 {
                state.entries.remove(&key);
                closed.push(key);
            }
        }

        let commands = batch(closed, CommandKind::Unsubscribe, self.max_tickers_per_request);
        self.enqueue(&state, &commands);
        commands
    }

    /// Subscribe frames covering every active entry, batched by channel.
    ///
    /// Pure with respect to the ledger: calling it twice yields the same frames.
    #[cfg(test)]
    pub(crate) fn replay(&self) -> Vec<SubscriptionCommand> {
        self.replay_frames(&self.lock())
    }

    /// Mark the connection with `epoch` live and return its replay frames.
    ///
    /// Both happen under one lock, so every transition is covered either by
    /// the returned replay or by a frame queued under the new epoch.
    pub(crate) fn go_online(&self, epoch: u64) -> Vec<SubscriptionCommand> {
        let mut state = self.lock();
        state.online = Some(epoch);
        self.replay_frames(&state)
    }

    /// Stop queueing frames. Entries are kept for the next replay.
    pub(crate) fn go_offline(&self) {
        self.lock().online = None;
    }

    /// Active entries, sorted by key.
    pub(crate) fn entries(&self) -> Vec<LedgerEntry> {
        let state = self.lock();
        let mut out: Vec<_> = state
            .entries
            .iter()
            .map(|(key, &ref_count)| LedgerEntry {
                key: key.clone(),
                ref_count,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn replay_frames(&self, state: &LedgerState) -> Vec<SubscriptionCommand> {
        batch(
            state.entries.keys().cloned().collect(),
            CommandKind::Subscribe,
            self.max_tickers_per_request,
        )
    }

    fn enqueue(&self, state: &LedgerState, commands: &[SubscriptionCommand]) {
        let Some(epoch) = state.online else {
            if !commands.is_empty() {
                tracing::debug!(count = commands.len(), "Offline, wire requests deferred to replay");
            }
            return;
        };
        for command in commands {
            let item = Outbound::Ledger {
                epoch,
                command: command.clone(),
            };
            if self.outbound.send(item).is_err() {
                tracing::warn!("Outbound queue closed, dropping ledger request");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Cartesian product of channels × tickers, deduplicated. Missing or empty
/// tickers mean the global scope.
fn expand(channels: &[&str], tickers: Option<&[&str]>) -> BTreeSet<LedgerKey> {
    let scopes: Vec<Scope> = match tickers {
        Some(t) if !t.is_empty() => t
            .iter()
            .map(|s| Scope::Market((*s).to_owned()))
            .collect(),
        _ => vec![Scope::Global],
    };

    channels
        .iter()
        .flat_map(|c| {
            scopes.iter().map(move |scope| LedgerKey {
                channel: (*c).to_owned(),
                scope: scope.clone(),
            })
        })
        .collect()
}

/// Build the fewest frames that cover exactly `keys`.
///
/// Global entries share one frame without tickers. Tickered entries are
/// grouped by channel, channels with an identical ticker set share a frame,
/// and ticker lists are chunked to `max_tickers`.
fn batch(keys: Vec<LedgerKey>, kind: CommandKind, max_tickers: usize) -> Vec<SubscriptionCommand> {
    let mut global: BTreeSet<String> = BTreeSet::new();
    let mut by_channel: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for key in keys {
        match key.scope {
            Scope::Global => {
                global.insert(key.channel);
            }
            Scope::Market(ticker) => {
                by_channel.entry(key.channel).or_default().insert(ticker);
            }
        }
    }

    let mut commands = Vec::new();
    if !global.is_empty() {
        commands.push(SubscriptionCommand {
            command: kind,
            channels: global.into_iter().collect(),
            market_tickers: None,
        });
    }

    let mut by_tickers: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();
    for (channel, tickers) in by_channel {
        by_tickers
            .entry(tickers.into_iter().collect())
            .or_default()
            .push(channel);
    }
    for (tickers, channels) in by_tickers {
        for chunk in tickers.chunks(max_tickers) {
            commands.push(SubscriptionCommand {
                command: kind,
                channels: channels.clone(),
                market_tickers: Some(chunk.to_vec()),
            });
        }
    }
    commands
}
