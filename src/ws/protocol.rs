#![allow(missing_docs)]
//! JSON wire frames exchanged with the streaming feed.
//!
//! Outbound frames are subscription commands:
//!
//! ```json
//! {"command": "subscribe", "channels": ["ticker"], "market_tickers": ["FOO"]}
//! ```
//!
//! Inbound frames carry a `type` and either a `data` payload or, for the
//! administrative `subscribed` / `unsubscribed` acknowledgements, the
//! acknowledged `channels`.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::constants::channels;
use crate::error::{KalshiError, Result};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Direction of a subscription command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
}

/// A subscribe or unsubscribe frame.
///
/// `market_tickers` is omitted from the wire when `None`, which scopes the
/// request to every instrument the server streams on those channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionCommand {
    pub command: CommandKind,
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_tickers: Option<Vec<String>>,
}

impl SubscriptionCommand {
    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The dispatch key (`ticker`, `trade`, `subscribed`, ...).
    pub kind: String,
    /// The payload handed to listeners of `kind`.
    pub payload: Value,
}

impl InboundMessage {
    /// Whether this is a `subscribed` / `unsubscribed` acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.kind == channels::SUBSCRIBED || self.kind == channels::UNSUBSCRIBED
    }

    /// Channels listed by an acknowledgement frame, if any.
    pub fn acked_channels(&self) -> Vec<&str> {
        self.payload
            .get("channels")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Decode one inbound text frame.
///
/// The type is read from `type`, falling back to a string `msg` field. The
/// payload is `data` when present; acknowledgements and frames without `data`
/// hand the whole object to listeners.
pub fn decode(text: &str) -> Result<InboundMessage> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(obj) = value else {
        return Err(KalshiError::InvalidArgument(
            "inbound frame is not a JSON object".into(),
        ));
    };

    let kind = message_kind(&obj).ok_or_else(|| {
        KalshiError::InvalidArgument("inbound frame has no `type` field".into())
    })?;

    let is_ack = kind == channels::SUBSCRIBED || kind == channels::UNSUBSCRIBED;
    let data = if is_ack { None } else { obj.get("data").cloned() };
    let payload = data.unwrap_or(Value::Object(obj));

    Ok(InboundMessage { kind, payload })
}

fn message_kind(obj: &Map<String, Value>) -> Option<String> {
    obj.get("type")
        .and_then(Value::as_str)
        .or_else(|| obj.get("msg").and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}
