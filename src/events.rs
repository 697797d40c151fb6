//! # Protocol Event Stream
//!
//! Every datagram the engine sends, accepts, or drops is reported as a
//! timestamped [`EventRecord`]. The stream is the engine's sole contract
//! with analysis tooling: overhead and convergence metrics are computed
//! downstream from these records, which is why GOSSIP events carry the
//! origin fields needed to reconstruct the dissemination window.
//!
//! The stream is per-instance and bounded; when no consumer keeps up,
//! records are discarded rather than queued without limit.

use serde::Serialize;

/// What happened to the datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Sent,
    Recv,
    Drop,
}

/// One observed protocol event.
#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    /// Wall-clock epoch milliseconds at observation.
    pub timestamp_ms: u64,
    pub direction: Direction,
    /// Wire message kind; for undecodable datagrams this is the claimed
    /// kind when one was readable, otherwise empty.
    pub msg_type: String,
    /// Empty when the datagram did not decode far enough to have one.
    pub msg_id: String,
    /// Remote address the datagram went to or came from.
    pub peer_addr: String,
    /// Origin fields, present on GOSSIP events only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_timestamp_ms: Option<u64>,
}

/// An application message handed to the host exactly once, past the
/// dedup check. Self-originated messages are delivered too.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub msg_id: String,
    pub topic: String,
    pub data: String,
    pub origin_id: String,
    pub origin_timestamp_ms: u64,
}
