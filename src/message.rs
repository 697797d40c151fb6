//! # Wire Protocol Messages
//!
//! This module defines the JSON envelope exchanged between nodes, one
//! message per UDP datagram.
//!
//! ## Envelope Layout
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `version` | Protocol version, currently 1 |
//! | `msg_id` | 32-hex identifier, fixed at origination |
//! | `msg_type` / `payload` | One of the 8 message kinds with its payload |
//! | `sender_id` / `sender_addr` | The immediate sender, not the origin |
//! | `timestamp_ms` | Wall-clock epoch milliseconds at send |
//! | `ttl` | Hops remaining; decremented on forward |
//!
//! Forwarding a GOSSIP preserves `msg_id`, `origin_id` and
//! `origin_timestamp_ms`; only the sender fields, the outer timestamp and
//! the ttl change.
//!
//! Decoding tolerates unknown additional fields for forward compatibility
//! and distinguishes structurally broken datagrams ([`DecodeError::Malformed`])
//! from well-formed envelopes of an unrecognised kind
//! ([`DecodeError::UnknownType`]).

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pow::Proof;

/// The only protocol version this engine speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// All recognised message kinds, as they appear in the `msg_type` field.
pub const MSG_TYPES: [&str; 8] = [
    "HELLO",
    "GET_PEERS",
    "PEERS_LIST",
    "GOSSIP",
    "PING",
    "PONG",
    "IHAVE",
    "IWANT",
];

/// TTL carried by control messages, which are never forwarded.
const CONTROL_TTL: u32 = 1;

/// Returns current time as milliseconds since Unix epoch.
/// Wire timestamps only; scheduling uses monotonic `Instant`.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generates a fresh 128-bit identifier rendered as 32 hex characters.
/// Used for node ids, message ids and ping ids.
pub(crate) fn new_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A `(node_id, addr)` pair as exchanged in PEERS_LIST payloads.
/// `node_id` is empty when the peer's identity is not yet known.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: String,
    pub addr: String,
}

/// Type-specific payload, adjacently tagged so the wire shape is
/// `{"msg_type": "...", "payload": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", content = "payload")]
pub enum Body {
    #[serde(rename = "HELLO")]
    Hello {
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pow: Option<Proof>,
    },
    #[serde(rename = "GET_PEERS")]
    GetPeers { max_peers: usize },
    #[serde(rename = "PEERS_LIST")]
    PeersList { peers: Vec<PeerEntry> },
    #[serde(rename = "GOSSIP")]
    Gossip {
        topic: String,
        data: String,
        origin_id: String,
        origin_timestamp_ms: u64,
    },
    #[serde(rename = "PING")]
    Ping { ping_id: String, seq: u64 },
    #[serde(rename = "PONG")]
    Pong { ping_id: String, seq: u64 },
    #[serde(rename = "IHAVE")]
    Ihave { ids: Vec<String>, max_ids: usize },
    #[serde(rename = "IWANT")]
    Iwant { ids: Vec<String> },
}

impl Body {
    /// The wire name of this message kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Hello { .. } => "HELLO",
            Body::GetPeers { .. } => "GET_PEERS",
            Body::PeersList { .. } => "PEERS_LIST",
            Body::Gossip { .. } => "GOSSIP",
            Body::Ping { .. } => "PING",
            Body::Pong { .. } => "PONG",
            Body::Ihave { .. } => "IHAVE",
            Body::Iwant { .. } => "IWANT",
        }
    }
}

/// One protocol message, serialisable to/from JSON bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub msg_id: String,
    pub sender_id: String,
    pub sender_addr: String,
    pub timestamp_ms: u64,
    pub ttl: u32,
    #[serde(flatten)]
    pub body: Body,
}

/// Why an inbound datagram failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bad JSON, wrong or missing version, missing field, out-of-range integer.
    Malformed(String),
    /// Well-formed envelope whose `msg_type` is outside the enumeration.
    UnknownType(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed(reason) => write!(f, "malformed message: {reason}"),
            DecodeError::UnknownType(kind) => write!(f, "unknown message type: {kind}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Envelope {
    fn new(sender_id: &str, sender_addr: &str, ttl: u32, body: Body) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_id: new_id(),
            sender_id: sender_id.to_string(),
            sender_addr: sender_addr.to_string(),
            timestamp_ms: now_ms(),
            ttl,
            body,
        }
    }

    /// Build a HELLO, carrying the admission proof when one is available.
    pub fn hello(sender_id: &str, sender_addr: &str, pow: Option<Proof>) -> Self {
        Self::new(
            sender_id,
            sender_addr,
            CONTROL_TTL,
            Body::Hello {
                capabilities: vec!["udp".to_string(), "json".to_string()],
                pow,
            },
        )
    }

    pub fn get_peers(sender_id: &str, sender_addr: &str, max_peers: usize) -> Self {
        Self::new(sender_id, sender_addr, CONTROL_TTL, Body::GetPeers { max_peers })
    }

    pub fn peers_list(sender_id: &str, sender_addr: &str, peers: Vec<PeerEntry>) -> Self {
        Self::new(sender_id, sender_addr, CONTROL_TTL, Body::PeersList { peers })
    }

    /// Build a freshly originated GOSSIP. The sender is also the origin.
    pub fn gossip(sender_id: &str, sender_addr: &str, topic: &str, data: &str, ttl: u32) -> Self {
        Self::new(
            sender_id,
            sender_addr,
            ttl,
            Body::Gossip {
                topic: topic.to_string(),
                data: data.to_string(),
                origin_id: sender_id.to_string(),
                origin_timestamp_ms: now_ms(),
            },
        )
    }

    pub fn ping(sender_id: &str, sender_addr: &str, seq: u64) -> Self {
        Self::new(
            sender_id,
            sender_addr,
            CONTROL_TTL,
            Body::Ping { ping_id: new_id(), seq },
        )
    }

    pub fn pong(sender_id: &str, sender_addr: &str, ping_id: &str, seq: u64) -> Self {
        Self::new(
            sender_id,
            sender_addr,
            CONTROL_TTL,
            Body::Pong { ping_id: ping_id.to_string(), seq },
        )
    }

    /// Build an IHAVE announcement, truncating `ids` to `max_ids`.
    pub fn ihave(sender_id: &str, sender_addr: &str, mut ids: Vec<String>, max_ids: usize) -> Self {
        ids.truncate(max_ids);
        Self::new(sender_id, sender_addr, CONTROL_TTL, Body::Ihave { ids, max_ids })
    }

    pub fn iwant(sender_id: &str, sender_addr: &str, ids: Vec<String>) -> Self {
        Self::new(sender_id, sender_addr, CONTROL_TTL, Body::Iwant { ids })
    }

    /// A copy of this envelope re-addressed for the next hop: same
    /// `msg_id` and payload (so GOSSIP origin fields survive verbatim),
    /// new sender fields, fresh outer timestamp, caller-chosen ttl.
    pub fn forwarded(&self, sender_id: &str, sender_addr: &str, ttl: u32) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            msg_id: self.msg_id.clone(),
            sender_id: sender_id.to_string(),
            sender_addr: sender_addr.to_string(),
            timestamp_ms: now_ms(),
            ttl,
            body: self.body.clone(),
        }
    }

    /// Serialise to the JSON datagram bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Deserialise datagram bytes into an [`Envelope`].
///
/// Validates the version and message kind up front so callers can
/// distinguish garbage from envelopes of an unknown type.
pub fn decode(data: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(data).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("not a JSON object".to_string()))?;

    match obj.get("version").and_then(Value::as_u64) {
        Some(v) if v == u64::from(PROTOCOL_VERSION) => {}
        Some(v) => return Err(DecodeError::Malformed(format!("unsupported version {v}"))),
        None => return Err(DecodeError::Malformed("missing version".to_string())),
    }

    let kind = obj
        .get("msg_type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing msg_type".to_string()))?;
    if !MSG_TYPES.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}
