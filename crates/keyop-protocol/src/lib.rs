//! Wire frames exchanged over the WebSocket bridge.
//!
//! Every frame is one JSON object with a `type` tag; `WsFrame` carries
//! them all as a single serializable/deserializable enum.
//!
//! ```json
//! { "type": "message", "queue": "events", "fileName": "20260728.jsonl", "offset": 512, "payload": {...} }
//! ```

use keyop_core::Envelope;
use serde::{Deserialize, Serialize};

/// Client → server: set the full set of channels this connection wants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub channels: Vec<String>,
}

/// Client → server: request a specific start position for `queue`,
/// sent before the `subscribe` that names it. Consumed at most once
/// per queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resume {
    pub queue: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub offset: u64,
}

/// Server → client: one delivered envelope, tagged with the source
/// position it was read from. `offset` is the NEXT byte offset to read
/// after this envelope — the same value the Messenger persists on
/// successful local delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub queue: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub offset: u64,
    pub payload: Envelope,
}

/// Client → server: acknowledge the most recently delivered message on
/// this connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ack {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum WsFrame {
    Subscribe(Subscribe),
    Resume(Resume),
    Message(Message),
    Ack(Ack),
}

impl WsFrame {
    pub fn ack() -> Self {
        WsFrame::Ack(Ack::default())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
