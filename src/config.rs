//! Configuration for one gossip node.
//!
//! All options are read at startup and never mutated for the lifetime of
//! the engine.

use std::time::Duration;

/// Dissemination mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Forwarding only.
    Push,
    /// Forwarding plus periodic IHAVE/IWANT reconciliation.
    Hybrid,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Mode::Push),
            "hybrid" => Ok(Mode::Hybrid),
            other => Err(format!("unknown mode '{other}' (expected push or hybrid)")),
        }
    }
}

/// All tuneable parameters for one node.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// UDP port to bind.
    pub port: u16,
    /// Seed peer address, or `None` when this node is its own seed.
    pub bootstrap: Option<String>,
    /// Peers selected per GOSSIP/PING/IHAVE round.
    pub fanout: usize,
    /// Initial ttl for originated GOSSIP.
    pub ttl: u32,
    /// Maximum peer records kept.
    pub peer_limit: usize,
    /// Interval between liveness rounds.
    pub ping_interval: Duration,
    /// Silence before a peer is removed.
    pub peer_timeout: Duration,
    /// RNG seed for reproducible peer selection.
    pub seed: u64,
    pub mode: Mode,
    /// Interval between IHAVE rounds (hybrid mode).
    pub pull_interval: Duration,
    /// Maximum ids per IHAVE announcement.
    pub ihave_max_ids: usize,
    /// Required leading hex zeros for admission; 0 disables the puzzle.
    pub pow_k: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            bootstrap: None,
            fanout: 3,
            ttl: 8,
            peer_limit: 20,
            ping_interval: Duration::from_secs_f64(2.0),
            peer_timeout: Duration::from_secs_f64(6.0),
            seed: 42,
            mode: Mode::Push,
            pull_interval: Duration::from_secs_f64(2.0),
            ihave_max_ids: 32,
            pow_k: 0,
        }
    }
}

impl GossipConfig {
    /// The address this node advertises as `sender_addr` on the wire.
    pub fn self_addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}
