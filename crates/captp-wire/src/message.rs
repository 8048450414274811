//! CapTP message types.
//!
//! Every message is a JSON object tagged by `type` and stamped with the epoch
//! of the connection instance that produced it. Slots inside a message are
//! written from the sender's point of view; receivers reverse them.
//!
//! For byte-stream transports each message is prefixed with a 4-byte
//! big-endian length header.

use captp_types::{CapData, Slot};
use serde::{Deserialize, Serialize};

/// A CapTP message (envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Connection instance; messages from another epoch are ignored.
    #[serde(default)]
    pub epoch: u64,
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl WireMessage {
    pub fn new(epoch: u64, kind: MessageKind) -> Self {
        Self { epoch, kind }
    }
}

/// The different kinds of CapTP messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    /// Ask for the peer's bootstrap object; answered on `question`.
    #[serde(rename = "CTP_BOOTSTRAP")]
    Bootstrap { question: Slot },
    /// Invoke `method(args)` on `target` and resolve `answer` with the result.
    #[serde(rename = "CTP_DELIVER")]
    Deliver {
        target: Slot,
        method: String,
        args: CapData,
        answer: Slot,
    },
    /// Invoke `method(args)` on `target`; nobody waits for the result.
    #[serde(rename = "CTP_DELIVER_ONLY")]
    DeliverOnly {
        target: Slot,
        method: String,
        args: CapData,
    },
    /// Settle a promise or question the receiver holds.
    #[serde(rename = "CTP_RESOLVE")]
    Resolve { answer: Slot, outcome: Outcome },
    /// The sender no longer references `slot`; it has seen it `seen` times.
    #[serde(rename = "CTP_GC_DROP")]
    GcDrop { slot: Slot, seen: u64 },
    /// The sender released its export; the receiver may forget `slot`.
    #[serde(rename = "CTP_GC_RETIRE")]
    GcRetire { slot: Slot },
    /// The sender is closing the connection.
    #[serde(rename = "CTP_ABORT")]
    Abort { reason: String },
}

impl MessageKind {
    /// Wire name of the message kind.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Bootstrap { .. } => "CTP_BOOTSTRAP",
            MessageKind::Deliver { .. } => "CTP_DELIVER",
            MessageKind::DeliverOnly { .. } => "CTP_DELIVER_ONLY",
            MessageKind::Resolve { .. } => "CTP_RESOLVE",
            MessageKind::GcDrop { .. } => "CTP_GC_DROP",
            MessageKind::GcRetire { .. } => "CTP_GC_RETIRE",
            MessageKind::Abort { .. } => "CTP_ABORT",
        }
    }
}

/// Settlement carried by a RESOLVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Fulfilled(CapData),
    Rejected(CapData),
}

impl Outcome {
    pub fn data(&self) -> &CapData {
        match self {
            Outcome::Fulfilled(data) | Outcome::Rejected(data) => data,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }
}

/// Encode a message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
