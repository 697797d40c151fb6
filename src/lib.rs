//! # Rumor - Epidemic Dissemination over UDP
//!
//! Rumor is a peer-to-peer gossip node: every participant runs the same
//! protocol engine, exchanging JSON datagrams with a dynamically
//! discovered set of peers to spread application messages through the
//! overlay with high probability under best-effort transport.
//!
//! ## Protocol
//!
//! - **Membership**: HELLO / GET_PEERS / PEERS_LIST against a seed node,
//!   kept in a bounded peer table with least-recently-seen eviction
//! - **Dissemination**: GOSSIP forwarded to `fanout` random peers per hop
//!   with a decrementing ttl; duplicate suppression via a bounded seen set
//! - **Liveness**: periodic PING/PONG; silent peers are expired
//! - **Reconciliation** (hybrid mode): periodic IHAVE announcements and
//!   on-demand IWANT repair close the coverage gaps push leaves behind
//! - **Admission** (optional): a SHA-256 client puzzle raises the cost of
//!   Sybil identities before a HELLO is accepted
//!
//! ## Architecture
//!
//! The engine uses the actor pattern: [`Node`] is the public handle, the
//! private actor owns all mutable state and processes commands, datagrams
//! and timers sequentially from one `tokio::select!` loop. CPU-bound
//! puzzle search runs on a blocking worker and re-enters the engine via a
//! completion message.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | Engine actor and the public `Node` handle |
//! | `config` | Per-node tuneables, immutable for a run |
//! | `message` | Wire envelope and JSON codec |
//! | `peers` | Bounded peer table with seeded random sampling |
//! | `store` | Seen set and message store (shared FIFO cap) |
//! | `pow` | Admission puzzle computation and validation |
//! | `events` | SENT/RECV/DROP records for analysis tooling |

mod config;
mod events;
mod message;
mod node;
mod peers;
mod pow;
mod store;

pub use config::{GossipConfig, Mode};
pub use events::{Delivery, Direction, EventRecord};
pub use message::{decode, Body, DecodeError, Envelope, PeerEntry, PROTOCOL_VERSION};
pub use node::{BootstrapPhase, Node, NodeSnapshot};
pub use pow::{compute_pow, validate_pow, Proof};
pub use store::SEEN_CAP;
