//! # Gossip Node Engine
//!
//! The main entry point. A [`Node`] is a handle to an engine actor that
//! owns every piece of protocol state: the peer table, the seen set and
//! message store, pending pings, the bootstrap state machine and the
//! admission proof. The actor processes one event at a time from a
//! `tokio::select!` loop, so all state mutations form a per-node total
//! order.
//!
//! ## Task Set
//!
//! | Task | Purpose |
//! |------|---------|
//! | engine actor | All protocol logic, timers, dispatch |
//! | socket reader | `recv_from` loop feeding the actor |
//! | PoW waiter | Awaits the `spawn_blocking` puzzle search, when enabled |
//!
//! The engine tracks exactly the tasks it spawned and aborts exactly that
//! set at shutdown. Message handlers never await; outbound datagrams use
//! the socket's non-blocking send path and a failed send only costs that
//! datagram.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(GossipConfig::default()).await?;
//! let mut deliveries = node.deliveries().await?;
//! node.originate("news", "hello world").await?;
//! while let Some(msg) = deliveries.recv().await {
//!     println!("{}: {}", msg.topic, msg.data);
//! }
//! node.shutdown().await;
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{GossipConfig, Mode};
use crate::events::{Delivery, Direction, EventRecord};
use crate::message::{self, decode, Body, DecodeError, Envelope, PeerEntry};
use crate::peers::PeerTable;
use crate::pow::{self, Proof};
use crate::store::{MessageCache, SEEN_CAP};

/// Largest datagram the engine will receive. Messages are expected to
/// stay well below typical MTUs; this is the hard ceiling.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Bootstrap backoff unit: attempt `n` waits `n × 500ms`.
const BOOTSTRAP_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Attempts before giving up on the seed and continuing standalone.
const BOOTSTRAP_MAX_ATTEMPTS: u32 = 5;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// Where the node stands in joining the overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Waiting for the local admission proof before sending HELLO.
    AwaitingProof,
    /// HELLO/GET_PEERS sent, waiting for the first peer to be learned.
    Joining,
    /// At least one peer learned.
    Joined,
    /// No seed configured, or all attempts exhausted.
    Standalone,
}

enum BootstrapState {
    AwaitingProof { seed: String },
    Joining { seed: String, attempt: u32, deadline: Instant },
    Joined,
    Standalone,
}

impl BootstrapState {
    fn phase(&self) -> BootstrapPhase {
        match self {
            BootstrapState::AwaitingProof { .. } => BootstrapPhase::AwaitingProof,
            BootstrapState::Joining { .. } => BootstrapPhase::Joining,
            BootstrapState::Joined => BootstrapPhase::Joined,
            BootstrapState::Standalone => BootstrapPhase::Standalone,
        }
    }
}

/// Point-in-time view of the engine for telemetry and tests.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub peers: Vec<PeerEntry>,
    pub seen: usize,
    pub stored: usize,
    pub pending_pings: usize,
    pub sent: u64,
    pub received: u64,
    pub malformed: u64,
    pub pow_rejected: u64,
    pub bootstrap: BootstrapPhase,
}

enum Command {
    Originate { topic: String, data: String },
    Snapshot(oneshot::Sender<NodeSnapshot>),
    ProofReady(Proof),
    Shutdown,
}

#[derive(Default)]
struct Stats {
    sent: u64,
    received: u64,
    malformed: u64,
    pow_rejected: u64,
}

/// Handle to a running gossip engine.
pub struct Node {
    node_id: String,
    local_addr: SocketAddr,
    self_addr: String,
    cmd_tx: mpsc::Sender<Command>,
    events_rx: TakeOnce<EventRecord>,
    deliveries_rx: TakeOnce<Delivery>,
}

impl Node {
    /// Bind the UDP socket and start the engine.
    ///
    /// When `pow_k > 0` the admission puzzle search starts immediately on
    /// a blocking worker; bootstrap waits for the proof while datagram
    /// handling is already live.
    ///
    /// # Errors
    /// Fails only when the socket cannot be bound.
    pub async fn bind(cfg: GossipConfig) -> Result<Node> {
        let socket = UdpSocket::bind(("0.0.0.0", cfg.port))
            .await
            .with_context(|| format!("failed to bind UDP port {}", cfg.port))?;
        let local_addr = socket.local_addr().context("failed to read local address")?;
        let socket = Arc::new(socket);

        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let node_id = hex::encode(id_bytes);
        let self_addr = cfg.self_addr();

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (event_tx, event_rx) = mpsc::channel(4096);
        let (delivery_tx, delivery_rx) = mpsc::channel(1024);

        let reader = tokio::spawn(recv_loop(socket.clone(), inbound_tx));

        let pow_waiter = if cfg.pow_k > 0 {
            let cmd_tx = cmd_tx.clone();
            let node_id = node_id.clone();
            let k = cfg.pow_k;
            Some(tokio::spawn(async move {
                info!(k, "computing admission proof");
                let started = Instant::now();
                match tokio::task::spawn_blocking(move || pow::compute_pow(&node_id, k)).await {
                    Ok(proof) => {
                        info!(
                            nonce = proof.nonce,
                            digest = %&proof.hash[..16],
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "admission proof found"
                        );
                        let _ = cmd_tx.send(Command::ProofReady(proof)).await;
                    }
                    Err(err) => warn!(error = %err, "admission proof worker failed"),
                }
            }))
        } else {
            None
        };

        let actor = Actor::new(
            cfg,
            node_id.clone(),
            self_addr.clone(),
            socket,
            event_tx,
            delivery_tx,
            reader,
            pow_waiter,
        );
        tokio::spawn(actor.run(cmd_rx, inbound_rx));

        info!(id = %node_id, addr = %local_addr, "node started");

        Ok(Node {
            node_id,
            local_addr,
            self_addr,
            cmd_tx,
            events_rx: tokio::sync::Mutex::new(Some(event_rx)),
            deliveries_rx: tokio::sync::Mutex::new(Some(delivery_rx)),
        })
    }

    /// This node's 32-hex identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The `ip:port` string this node advertises on the wire.
    pub fn addr(&self) -> &str {
        &self.self_addr
    }

    /// Enqueue a new application message for origination on the engine.
    pub async fn originate(&self, topic: &str, data: &str) -> Result<()> {
        self.cmd_tx
            .send(Command::Originate {
                topic: topic.to_string(),
                data: data.to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    /// Point-in-time view of peers, caches, counters and bootstrap phase.
    pub async fn snapshot(&self) -> Result<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| anyhow::anyhow!("engine stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    /// Take the protocol event stream. Can be taken exactly once.
    pub async fn events(&self) -> Result<mpsc::Receiver<EventRecord>> {
        self.events_rx
            .lock()
            .await
            .take()
            .context("event stream already taken")
    }

    /// Take the delivery stream (each unique GOSSIP exactly once).
    /// Can be taken exactly once.
    pub async fn deliveries(&self) -> Result<mpsc::Receiver<Delivery>> {
        self.deliveries_rx
            .lock()
            .await
            .take()
            .context("delivery stream already taken")
    }

    /// Stop the engine: close the transport, cancel the engine's own
    /// tasks, drop in-flight sends and purge state. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

/// Socket reader: the one task that waits on the wire, handing datagrams
/// to the engine so handlers themselves never block.
async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<(Vec<u8>, SocketAddr)>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                if tx.send((buf[..len].to_vec(), src)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                // Transient receive errors (e.g. ICMP-induced) are not fatal.
                warn!(error = %err, "udp receive error");
            }
        }
    }
}

struct Actor {
    cfg: GossipConfig,
    node_id: String,
    self_addr: String,
    socket: Arc<UdpSocket>,
    peers: PeerTable,
    cache: MessageCache,
    pending_pings: HashMap<String, Instant>,
    ping_seq: u64,
    proof: Option<Proof>,
    bootstrap: BootstrapState,
    stats: Stats,
    event_tx: mpsc::Sender<EventRecord>,
    delivery_tx: mpsc::Sender<Delivery>,
    reader: JoinHandle<()>,
    pow_waiter: Option<JoinHandle<()>>,
}

impl Actor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        cfg: GossipConfig,
        node_id: String,
        self_addr: String,
        socket: Arc<UdpSocket>,
        event_tx: mpsc::Sender<EventRecord>,
        delivery_tx: mpsc::Sender<Delivery>,
        reader: JoinHandle<()>,
        pow_waiter: Option<JoinHandle<()>>,
    ) -> Self {
        let peers = PeerTable::new(cfg.peer_limit, &self_addr, cfg.seed);
        let bootstrap = match (&cfg.bootstrap, cfg.pow_k) {
            (None, _) => BootstrapState::Standalone,
            (Some(seed), k) if k > 0 => BootstrapState::AwaitingProof { seed: seed.clone() },
            // Placeholder deadline; begin_join() runs before the first select.
            (Some(seed), _) => BootstrapState::Joining {
                seed: seed.clone(),
                attempt: 0,
                deadline: Instant::now(),
            },
        };
        Self {
            cfg,
            node_id,
            self_addr,
            socket,
            peers,
            cache: MessageCache::new(SEEN_CAP),
            pending_pings: HashMap::new(),
            ping_seq: 0,
            proof: None,
            bootstrap,
            stats: Stats::default(),
            event_tx,
            delivery_tx,
            reader,
            pow_waiter,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut inbound_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    ) {
        if let BootstrapState::Joining { seed, .. } = &self.bootstrap {
            let seed = seed.clone();
            self.begin_join(&seed, 1);
        }

        let start = Instant::now();
        let mut ping_timer =
            time::interval_at(start + self.cfg.ping_interval, self.cfg.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pull_timer =
            time::interval_at(start + self.cfg.pull_interval, self.cfg.pull_interval);
        pull_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let hybrid = self.cfg.mode == Mode::Hybrid;
        if hybrid {
            info!(
                pull_interval_ms = self.cfg.pull_interval.as_millis() as u64,
                ihave_max_ids = self.cfg.ihave_max_ids,
                "hybrid mode enabled"
            );
        }

        loop {
            let join_deadline = match &self.bootstrap {
                BootstrapState::Joining { deadline, .. } => Some(*deadline),
                _ => None,
            };

            tokio::select! {
                inbound = inbound_rx.recv() => match inbound {
                    Some((data, src)) => self.on_datagram(&data, src),
                    // Reader gone means the socket is unusable.
                    None => break,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Originate { topic, data }) => self.originate(&topic, &data),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::ProofReady(proof)) => self.on_proof_ready(proof),
                    Some(Command::Shutdown) | None => break,
                },
                _ = ping_timer.tick() => self.on_ping_tick(),
                _ = pull_timer.tick(), if hybrid => self.on_pull_tick(),
                _ = time::sleep_until(join_deadline.unwrap_or_else(Instant::now)),
                    if join_deadline.is_some() => self.on_join_deadline(),
            }
        }

        self.reader.abort();
        if let Some(waiter) = &self.pow_waiter {
            waiter.abort();
        }
        info!(
            sent = self.stats.sent,
            peers = self.peers.len(),
            seen = self.cache.seen_len(),
            "node stopped"
        );
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.node_id.clone(),
            peers: self.peers.snapshot(self.cfg.peer_limit),
            seen: self.cache.seen_len(),
            stored: self.cache.store_len(),
            pending_pings: self.pending_pings.len(),
            sent: self.stats.sent,
            received: self.stats.received,
            malformed: self.stats.malformed,
            pow_rejected: self.stats.pow_rejected,
            bootstrap: self.bootstrap.phase(),
        }
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    fn on_proof_ready(&mut self, proof: Proof) {
        self.proof = Some(proof);
        if let BootstrapState::AwaitingProof { seed } = &self.bootstrap {
            let seed = seed.clone();
            self.begin_join(&seed, 1);
        }
    }

    fn begin_join(&mut self, seed: &str, attempt: u32) {
        info!(seed = %seed, attempt, "bootstrap");
        let hello = Envelope::hello(&self.node_id, &self.self_addr, self.proof.clone());
        self.send_to_one(&hello, seed);
        let get_peers = Envelope::get_peers(&self.node_id, &self.self_addr, self.cfg.peer_limit);
        self.send_to_one(&get_peers, seed);

        self.bootstrap = BootstrapState::Joining {
            seed: seed.to_string(),
            attempt,
            deadline: Instant::now() + BOOTSTRAP_BACKOFF_STEP * attempt,
        };
    }

    fn on_join_deadline(&mut self) {
        let BootstrapState::Joining { seed, attempt, .. } = &self.bootstrap else {
            return;
        };
        let (seed, attempt) = (seed.clone(), *attempt);
        if !self.peers.is_empty() {
            self.bootstrap = BootstrapState::Joined;
            info!(peers = self.peers.len(), "bootstrap complete");
        } else if attempt >= BOOTSTRAP_MAX_ATTEMPTS {
            warn!(
                seed = %seed,
                attempts = attempt,
                "bootstrap failed, continuing standalone"
            );
            self.bootstrap = BootstrapState::Standalone;
        } else {
            self.begin_join(&seed, attempt + 1);
        }
    }

    /// Eager `Joining → Joined` transition, checked whenever the table
    /// gains its first entry.
    fn maybe_join_complete(&mut self) {
        if matches!(self.bootstrap, BootstrapState::Joining { .. }) && !self.peers.is_empty() {
            self.bootstrap = BootstrapState::Joined;
            info!(peers = self.peers.len(), "bootstrap complete");
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn on_datagram(&mut self, data: &[u8], src: SocketAddr) {
        let env = match decode(data) {
            Ok(env) => env,
            Err(err) => {
                self.stats.malformed += 1;
                warn!(peer = %src, error = %err, "dropping undecodable datagram");
                self.emit_decode_drop(&err, src);
                return;
            }
        };

        // Admission gating runs before the liveness touch: a rejected
        // sender must not enter the peer table.
        if self.cfg.pow_k > 0 {
            match &env.body {
                Body::Hello { pow, .. } => {
                    if !pow::validate_pow(&env.sender_id, pow.as_ref(), self.cfg.pow_k) {
                        self.stats.pow_rejected += 1;
                        warn!(
                            peer = %env.sender_addr,
                            "HELLO rejected: missing or invalid admission proof"
                        );
                        self.emit(Direction::Drop, &env, &env.sender_addr);
                        return;
                    }
                }
                Body::GetPeers { .. } if !self.peers.contains(&env.sender_addr) => {
                    warn!(peer = %env.sender_addr, "GET_PEERS ignored: sender not admitted");
                    self.emit(Direction::Drop, &env, &env.sender_addr);
                    return;
                }
                _ => {}
            }
        }

        self.stats.received += 1;
        self.emit(Direction::Recv, &env, &env.sender_addr);

        // Primary liveness signal: every accepted inbound refreshes the sender.
        self.peers
            .touch(&env.sender_addr, Some(&env.sender_id), Instant::now().into_std());
        self.maybe_join_complete();

        match env.body.clone() {
            Body::Hello { .. } => self.handle_hello(&env),
            Body::GetPeers { max_peers } => self.handle_get_peers(&env, max_peers),
            Body::PeersList { peers } => self.handle_peers_list(peers),
            Body::Gossip { .. } => self.handle_gossip(env),
            Body::Ping { ping_id, seq } => self.handle_ping(&env, &ping_id, seq),
            Body::Pong { ping_id, .. } => self.handle_pong(&env, &ping_id),
            Body::Ihave { ids, .. } => self.handle_ihave(&env, ids),
            Body::Iwant { ids } => self.handle_iwant(&env, ids),
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn handle_hello(&mut self, env: &Envelope) {
        info!(peer = %env.sender_addr, id = %short_id(&env.sender_id), "HELLO");
        // Reply with our peer list so the newcomer can discover the overlay.
        self.send_peers_list(&env.sender_addr, self.cfg.peer_limit);
    }

    fn handle_get_peers(&mut self, env: &Envelope, max_peers: usize) {
        debug!(peer = %env.sender_addr, max_peers, "GET_PEERS");
        self.send_peers_list(&env.sender_addr, max_peers);
    }

    fn send_peers_list(&mut self, target: &str, max_peers: usize) {
        let entries = self.peers.snapshot(max_peers);
        let reply = Envelope::peers_list(&self.node_id, &self.self_addr, entries);
        self.send_to_one(&reply, target);
    }

    fn handle_peers_list(&mut self, entries: Vec<PeerEntry>) {
        debug!(count = entries.len(), "PEERS_LIST");
        let now = Instant::now().into_std();
        for entry in entries {
            if !entry.addr.is_empty() {
                let id = (!entry.node_id.is_empty()).then_some(entry.node_id.as_str());
                self.peers.touch(&entry.addr, id, now);
            }
        }
        self.maybe_join_complete();
    }

    fn handle_gossip(&mut self, env: Envelope) {
        if !self.cache.mark_seen(&env.msg_id) {
            trace!(msg_id = %short_id(&env.msg_id), "duplicate gossip");
            return;
        }

        if let Body::Gossip { topic, data, origin_id, origin_timestamp_ms } = &env.body {
            info!(
                msg_id = %short_id(&env.msg_id),
                data = %prefix(data, 40),
                ttl = env.ttl,
                "gossip received"
            );
            let _ = self.delivery_tx.try_send(Delivery {
                msg_id: env.msg_id.clone(),
                topic: topic.clone(),
                data: data.clone(),
                origin_id: origin_id.clone(),
                origin_timestamp_ms: *origin_timestamp_ms,
            });
        }
        self.cache.store(env.clone());

        // ttl 1 becomes 0 after the decrement: record but do not forward.
        if env.ttl <= 1 {
            return;
        }
        let targets = self.peers.sample(self.cfg.fanout, &[env.sender_addr.as_str()]);
        if targets.is_empty() {
            return;
        }
        let fwd = env.forwarded(&self.node_id, &self.self_addr, env.ttl - 1);
        trace!(
            msg_id = %short_id(&fwd.msg_id),
            ttl = fwd.ttl,
            targets = targets.len(),
            "gossip forwarded"
        );
        self.send_to_many(&fwd, &targets);
    }

    fn handle_ping(&mut self, env: &Envelope, ping_id: &str, seq: u64) {
        let pong = Envelope::pong(&self.node_id, &self.self_addr, ping_id, seq);
        self.send_to_one(&pong, &env.sender_addr);
    }

    fn handle_pong(&mut self, env: &Envelope, ping_id: &str) {
        if let Some(sent_at) = self.pending_pings.remove(ping_id) {
            debug!(
                peer = %env.sender_addr,
                rtt_ms = sent_at.elapsed().as_millis() as u64,
                "PONG"
            );
        }
    }

    fn handle_ihave(&mut self, env: &Envelope, ids: Vec<String>) {
        let wanted: Vec<String> = ids
            .into_iter()
            .filter(|id| !self.cache.contains(id))
            .collect();
        if wanted.is_empty() {
            return;
        }
        debug!(peer = %env.sender_addr, missing = wanted.len(), "IHAVE");
        let iwant = Envelope::iwant(&self.node_id, &self.self_addr, wanted);
        self.send_to_one(&iwant, &env.sender_addr);
    }

    fn handle_iwant(&mut self, env: &Envelope, ids: Vec<String>) {
        // Point-to-point repair: ttl 1 so the recipient records the
        // message without re-flooding what push already covers.
        let copies: Vec<Envelope> = ids
            .iter()
            .filter_map(|id| self.cache.fetch(id))
            .map(|stored| stored.forwarded(&self.node_id, &self.self_addr, 1))
            .collect();
        debug!(peer = %env.sender_addr, served = copies.len(), "IWANT");
        for copy in copies {
            self.send_to_one(&copy, &env.sender_addr);
        }
    }

    // ========================================================================
    // Origination and periodic loops
    // ========================================================================

    fn originate(&mut self, topic: &str, data: &str) {
        let env = Envelope::gossip(&self.node_id, &self.self_addr, topic, data, self.cfg.ttl);
        self.cache.mark_seen(&env.msg_id);
        self.cache.store(env.clone());
        info!(
            msg_id = %short_id(&env.msg_id),
            data = %prefix(data, 40),
            "gossip originated"
        );
        if let Body::Gossip { origin_id, origin_timestamp_ms, .. } = &env.body {
            let _ = self.delivery_tx.try_send(Delivery {
                msg_id: env.msg_id.clone(),
                topic: topic.to_string(),
                data: data.to_string(),
                origin_id: origin_id.clone(),
                origin_timestamp_ms: *origin_timestamp_ms,
            });
        }

        let targets = self.peers.sample(self.cfg.fanout, &[]);
        if targets.is_empty() {
            debug!("no peers to gossip to");
            return;
        }
        self.send_to_many(&env, &targets);
    }

    fn on_ping_tick(&mut self) {
        let now = Instant::now();

        for addr in self.peers.expire(now.into_std(), self.cfg.peer_timeout) {
            info!(peer = %addr, "peer removed after silence");
        }

        // Eviction is driven by last_seen above, not by outstanding pings;
        // stale entries just age out here.
        let timeout = self.cfg.peer_timeout;
        self.pending_pings
            .retain(|_, sent_at| now.duration_since(*sent_at) <= timeout);

        if self.peers.is_empty() {
            return;
        }
        for addr in self.peers.sample(self.cfg.fanout, &[]) {
            self.ping_seq += 1;
            let ping = Envelope::ping(&self.node_id, &self.self_addr, self.ping_seq);
            if let Body::Ping { ping_id, .. } = &ping.body {
                self.pending_pings.insert(ping_id.clone(), now);
            }
            self.send_to_one(&ping, &addr);
        }
    }

    fn on_pull_tick(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        let ids = self.cache.recent_ids(self.cfg.ihave_max_ids);
        if ids.is_empty() {
            return;
        }
        let targets = self.peers.sample(self.cfg.fanout, &[]);
        let ihave = Envelope::ihave(&self.node_id, &self.self_addr, ids, self.cfg.ihave_max_ids);
        self.send_to_many(&ihave, &targets);
    }

    // ========================================================================
    // Transport helpers
    // ========================================================================

    fn send_to_one(&mut self, env: &Envelope, target: &str) {
        let target = [target.to_string()];
        self.send_to_many(env, &target);
    }

    /// Encode once, send the same bytes to every target.
    fn send_to_many(&mut self, env: &Envelope, targets: &[String]) {
        let bytes = match env.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "envelope encoding failed");
                return;
            }
        };
        for addr in targets {
            let target: SocketAddr = match addr.parse() {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!(peer = %addr, "unparseable peer address");
                    continue;
                }
            };
            match self.socket.try_send_to(&bytes, target) {
                Ok(_) => {
                    self.stats.sent += 1;
                    self.emit(Direction::Sent, env, addr);
                    trace!(kind = env.body.type_name(), peer = %addr, "sent");
                }
                // The datagram is lost; acceptable under UDP.
                Err(err) => warn!(peer = %addr, error = %err, "send failed"),
            }
        }
    }

    // ========================================================================
    // Event stream
    // ========================================================================

    fn emit(&self, direction: Direction, env: &Envelope, peer_addr: &str) {
        let (origin_id, origin_timestamp_ms) = match &env.body {
            Body::Gossip { origin_id, origin_timestamp_ms, .. } => {
                (Some(origin_id.clone()), Some(*origin_timestamp_ms))
            }
            _ => (None, None),
        };
        let _ = self.event_tx.try_send(EventRecord {
            timestamp_ms: message::now_ms(),
            direction,
            msg_type: env.body.type_name().to_string(),
            msg_id: env.msg_id.clone(),
            peer_addr: peer_addr.to_string(),
            origin_id,
            origin_timestamp_ms,
        });
    }

    fn emit_decode_drop(&self, err: &DecodeError, src: SocketAddr) {
        let msg_type = match err {
            DecodeError::UnknownType(kind) => kind.clone(),
            DecodeError::Malformed(_) => String::new(),
        };
        let _ = self.event_tx.try_send(EventRecord {
            timestamp_ms: message::now_ms(),
            direction: Direction::Drop,
            msg_type,
            msg_id: String::new(),
            peer_addr: src.to_string(),
            origin_id: None,
            origin_timestamp_ms: None,
        });
    }
}

/// First `n` characters, respecting UTF-8 boundaries (ids and payloads
/// from the wire are arbitrary strings).
fn prefix(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn short_id(id: &str) -> &str {
    prefix(id, 8)
}
