//! # Peer Table
//!
//! Bounded membership set keyed by peer address. Every valid inbound
//! message refreshes the sender's `last_seen`; that timestamp drives both
//! capacity eviction (least recently seen goes first) and dead-peer
//! expiry at liveness ticks.
//!
//! Peer selection for gossip rounds is uniform random without replacement
//! from a per-node seeded RNG. The randomness is what gives epidemic
//! dissemination its redundancy; candidates are drawn from an ordered map
//! so the same seed yields the same selection sequence.

use std::collections::BTreeMap;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::message::PeerEntry;

/// One known peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Unknown until the first message carrying the peer's id arrives.
    pub node_id: Option<String>,
    pub addr: String,
    /// Monotonic timestamp of the most recent inbound from this peer.
    pub last_seen: Instant,
}

/// Bounded peer table with least-recently-seen eviction.
pub struct PeerTable {
    peers: BTreeMap<String, PeerInfo>,
    limit: usize,
    self_addr: String,
    rng: StdRng,
}

impl PeerTable {
    pub fn new(limit: usize, self_addr: &str, seed: u64) -> Self {
        Self {
            peers: BTreeMap::new(),
            limit,
            self_addr: self_addr.to_string(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains_key(addr)
    }

    /// Insert or refresh a peer, setting `last_seen = now`.
    ///
    /// A node never records its own advertised address. When insertion
    /// would exceed the limit, the entry with the smallest `last_seen` is
    /// evicted first. Returns true when the peer was newly inserted.
    pub fn touch(&mut self, addr: &str, node_id: Option<&str>, now: Instant) -> bool {
        if addr == self.self_addr {
            return false;
        }
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.last_seen = now;
            if let Some(id) = node_id {
                if !id.is_empty() {
                    peer.node_id = Some(id.to_string());
                }
            }
            return false;
        }
        if self.peers.len() >= self.limit {
            self.evict_least_recent();
        }
        self.peers.insert(
            addr.to_string(),
            PeerInfo {
                node_id: node_id.filter(|id| !id.is_empty()).map(str::to_string),
                addr: addr.to_string(),
                last_seen: now,
            },
        );
        debug!(peer = %addr, "peer added");
        true
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .peers
            .values()
            .min_by_key(|p| p.last_seen)
            .map(|p| p.addr.clone());
        if let Some(addr) = oldest {
            self.peers.remove(&addr);
            debug!(peer = %addr, "peer evicted at capacity");
        }
    }

    /// Idempotent removal.
    pub fn remove(&mut self, addr: &str) {
        self.peers.remove(addr);
    }

    /// Uniform random selection without replacement of up to `k` peers
    /// whose addresses are not in `exclude`.
    pub fn sample(&mut self, k: usize, exclude: &[&str]) -> Vec<String> {
        let candidates: Vec<&String> = self
            .peers
            .keys()
            .filter(|addr| !exclude.contains(&addr.as_str()))
            .collect();
        let n = k.min(candidates.len());
        candidates
            .choose_multiple(&mut self.rng, n)
            .map(|addr| (*addr).clone())
            .collect()
    }

    /// Up to `max` `(node_id, addr)` pairs for PEERS_LIST replies.
    pub fn snapshot(&self, max: usize) -> Vec<PeerEntry> {
        self.peers
            .values()
            .take(max)
            .map(|p| PeerEntry {
                node_id: p.node_id.clone().unwrap_or_default(),
                addr: p.addr.clone(),
            })
            .collect()
    }

    /// Remove peers silent for longer than `timeout`; returns their addresses.
    pub fn expire(&mut self, now: Instant, timeout: std::time::Duration) -> Vec<String> {
        let dead: Vec<String> = self
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_seen) > timeout)
            .map(|p| p.addr.clone())
            .collect();
        for addr in &dead {
            self.peers.remove(addr);
        }
        dead
    }
}
