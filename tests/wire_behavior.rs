//! On-the-wire behaviour tests: a raw UDP socket poses as a peer to
//! observe exactly what the engine emits: forward invariants, ttl
//! handling, IHAVE/IWANT repair, and resilience to malformed datagrams.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use rumor::{decode, Body, Direction, Envelope, GossipConfig, Node, NodeSnapshot};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(9200);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(port: u16) -> GossipConfig {
    GossipConfig {
        port,
        ping_interval: Duration::from_millis(500),
        // Long enough that a silent raw peer survives the whole test.
        peer_timeout: Duration::from_secs(30),
        ..GossipConfig::default()
    }
}

async fn wait_for<F>(node: &Node, deadline: Duration, mut pred: F) -> bool
where
    F: FnMut(&NodeSnapshot) -> bool,
{
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if let Ok(snap) = node.snapshot().await {
            if pred(&snap) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// A scripted peer: a raw socket with an identity, registered with the
/// node under test via a plain HELLO.
struct RawPeer {
    socket: UdpSocket,
    id: String,
    addr: String,
}

impl RawPeer {
    async fn bind() -> RawPeer {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("raw bind");
        let addr = socket.local_addr().expect("raw addr").to_string();
        let id = format!("{:032x}", rand_suffix());
        RawPeer { socket, id, addr }
    }

    async fn send(&self, env: &Envelope, target: &str) {
        let bytes = env.encode().expect("encode");
        self.socket.send_to(&bytes, target).await.expect("send");
    }

    async fn join(&self, node: &Node) {
        let hello = Envelope::hello(&self.id, &self.addr, None);
        self.send(&hello, node.addr()).await;
        let addr = self.addr.clone();
        assert!(
            wait_for(node, Duration::from_secs(2), |s| {
                s.peers.iter().any(|p| p.addr == addr)
            })
            .await,
            "node never learned the raw peer"
        );
    }

    /// Receive until a datagram of `kind` arrives or the deadline passes.
    async fn recv_kind(&self, kind: &str, deadline: Duration) -> Option<Envelope> {
        let mut buf = vec![0u8; 64 * 1024];
        let end = tokio::time::Instant::now() + deadline;
        loop {
            let now = tokio::time::Instant::now();
            if now >= end {
                return None;
            }
            match timeout(end - now, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    if let Ok(env) = decode(&buf[..len]) {
                        if env.body.type_name() == kind {
                            return Some(env);
                        }
                    }
                }
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }
}

fn rand_suffix() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    // Unique enough for test identities.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[tokio::test]
async fn hello_is_answered_with_peers_list() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");
    let peer = RawPeer::bind().await;

    let hello = Envelope::hello(&peer.id, &peer.addr, None);
    peer.send(&hello, node.addr()).await;

    let reply = peer
        .recv_kind("PEERS_LIST", Duration::from_secs(2))
        .await
        .expect("no PEERS_LIST reply");
    assert_eq!(reply.sender_id, node.node_id());
    assert_eq!(reply.sender_addr, node.addr());

    node.shutdown().await;
}

#[tokio::test]
async fn forward_preserves_origin_and_decrements_ttl() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");
    let observer = RawPeer::bind().await;
    observer.join(&node).await;

    let injector = RawPeer::bind().await;
    let gossip = Envelope::gossip(&injector.id, &injector.addr, "news", "forward me", 3);
    injector.send(&gossip, node.addr()).await;

    // The sender is excluded from sampling, so the observer is the only
    // forwarding target.
    let fwd = observer
        .recv_kind("GOSSIP", Duration::from_secs(2))
        .await
        .expect("no forwarded GOSSIP");

    assert_eq!(fwd.msg_id, gossip.msg_id);
    assert_eq!(fwd.ttl, 2);
    assert_eq!(fwd.sender_id, node.node_id());
    assert_eq!(fwd.sender_addr, node.addr());
    match (&fwd.body, &gossip.body) {
        (
            Body::Gossip { origin_id: a, origin_timestamp_ms: ta, data: da, .. },
            Body::Gossip { origin_id: b, origin_timestamp_ms: tb, data: db, .. },
        ) => {
            assert_eq!(a, b);
            assert_eq!(ta, tb);
            assert_eq!(da, db);
        }
        _ => panic!("wrong variant"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn ttl_zero_gossip_is_recorded_but_not_forwarded() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");
    let mut deliveries = node.deliveries().await.expect("deliveries");
    let observer = RawPeer::bind().await;
    observer.join(&node).await;

    let injector = RawPeer::bind().await;
    let gossip = Envelope::gossip(&injector.id, &injector.addr, "news", "dead end", 0);
    injector.send(&gossip, node.addr()).await;

    // Recorded: the node delivers and retains the message.
    assert!(
        wait_for(&node, Duration::from_secs(2), |s| s.seen == 1 && s.stored == 1).await
    );
    let delivery = deliveries.recv().await.expect("delivery");
    assert_eq!(delivery.msg_id, gossip.msg_id);

    // Not forwarded: the observer sees no GOSSIP.
    assert!(
        observer
            .recv_kind("GOSSIP", Duration::from_secs(1))
            .await
            .is_none(),
        "ttl 0 gossip must not be forwarded"
    );

    node.shutdown().await;
}

#[tokio::test]
async fn duplicate_gossip_is_dropped_before_forwarding() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");
    let observer = RawPeer::bind().await;
    observer.join(&node).await;

    let injector = RawPeer::bind().await;
    let gossip = Envelope::gossip(&injector.id, &injector.addr, "news", "once", 5);
    injector.send(&gossip, node.addr()).await;

    let first = observer.recv_kind("GOSSIP", Duration::from_secs(2)).await;
    assert!(first.is_some());

    // The same msg_id again: dedup stops it past the seen check.
    injector.send(&gossip, node.addr()).await;
    assert!(
        observer
            .recv_kind("GOSSIP", Duration::from_secs(1))
            .await
            .is_none(),
        "duplicate must not be forwarded again"
    );

    node.shutdown().await;
}

#[tokio::test]
async fn ihave_iwant_repair_round() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");
    let peer = RawPeer::bind().await;
    peer.join(&node).await;

    // The node originates; our raw peer is the only target.
    node.originate("news", "repairable").await.expect("originate");
    let published = peer
        .recv_kind("GOSSIP", Duration::from_secs(2))
        .await
        .expect("no published GOSSIP");

    // Announce one id the node has and one it is missing: the reply must
    // request exactly the missing one.
    let missing_id = "ff".repeat(16);
    let ihave = Envelope::ihave(
        &peer.id,
        &peer.addr,
        vec![published.msg_id.clone(), missing_id.clone()],
        32,
    );
    peer.send(&ihave, node.addr()).await;

    let iwant = peer
        .recv_kind("IWANT", Duration::from_secs(2))
        .await
        .expect("no IWANT reply");
    match &iwant.body {
        Body::Iwant { ids } => assert_eq!(ids, &vec![missing_id]),
        _ => panic!("wrong variant"),
    }

    // Request the stored message back: delivered point-to-point with ttl 1.
    let iwant_req = Envelope::iwant(&peer.id, &peer.addr, vec![published.msg_id.clone()]);
    peer.send(&iwant_req, node.addr()).await;

    let repair = peer
        .recv_kind("GOSSIP", Duration::from_secs(2))
        .await
        .expect("no repair copy");
    assert_eq!(repair.msg_id, published.msg_id);
    assert_eq!(repair.ttl, 1);
    assert_eq!(repair.sender_id, node.node_id());

    // An IHAVE covering only known ids draws no IWANT.
    let known_only = Envelope::ihave(&peer.id, &peer.addr, vec![published.msg_id.clone()], 32);
    peer.send(&known_only, node.addr()).await;
    assert!(peer.recv_kind("IWANT", Duration::from_secs(1)).await.is_none());

    node.shutdown().await;
}

#[tokio::test]
async fn ping_is_answered_with_echoing_pong() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");
    let peer = RawPeer::bind().await;

    let ping = Envelope::ping(&peer.id, &peer.addr, 9);
    let ping_id = match &ping.body {
        Body::Ping { ping_id, .. } => ping_id.clone(),
        _ => unreachable!(),
    };
    peer.send(&ping, node.addr()).await;

    let pong = peer
        .recv_kind("PONG", Duration::from_secs(2))
        .await
        .expect("no PONG reply");
    match &pong.body {
        Body::Pong { ping_id: echoed, seq } => {
            assert_eq!(echoed, &ping_id);
            assert_eq!(*seq, 9);
        }
        _ => panic!("wrong variant"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn malformed_datagrams_are_counted_not_fatal() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");
    let mut events = node.events().await.expect("events");
    let peer = RawPeer::bind().await;

    peer.socket
        .send_to(b"\xff\xfe not json", node.addr())
        .await
        .expect("send garbage");
    peer.socket
        .send_to(
            br#"{"version":1,"msg_id":"x","msg_type":"GRAFT","sender_id":"y","sender_addr":"z","timestamp_ms":1,"ttl":1,"payload":{}}"#,
            node.addr(),
        )
        .await
        .expect("send unknown type");

    assert!(wait_for(&node, Duration::from_secs(2), |s| s.malformed == 2).await);

    // The node is still healthy: a valid HELLO is processed.
    peer.join(&node).await;
    let snap = node.snapshot().await.expect("snapshot");
    assert_eq!(snap.peers.len(), 1);

    // Both rejects surfaced as DROP events.
    let mut drops = 0;
    while let Ok(record) = events.try_recv() {
        if record.direction == Direction::Drop {
            drops += 1;
        }
    }
    assert_eq!(drops, 2);

    node.shutdown().await;
}

#[tokio::test]
async fn event_stream_reports_sends_and_receives_with_origin() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");
    let mut events = node.events().await.expect("events");
    let peer = RawPeer::bind().await;
    peer.join(&node).await;

    node.originate("news", "observed").await.expect("originate");
    assert!(peer.recv_kind("GOSSIP", Duration::from_secs(2)).await.is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut saw_hello_recv = false;
    let mut saw_gossip_sent = false;
    while let Ok(record) = events.try_recv() {
        match (record.direction, record.msg_type.as_str()) {
            (Direction::Recv, "HELLO") => saw_hello_recv = true,
            (Direction::Sent, "GOSSIP") => {
                assert_eq!(record.origin_id.as_deref(), Some(node.node_id()));
                assert!(record.origin_timestamp_ms.is_some());
                saw_gossip_sent = true;
            }
            _ => {}
        }
    }
    assert!(saw_hello_recv, "inbound HELLO must be reported");
    assert!(saw_gossip_sent, "outbound GOSSIP must be reported with origin");

    node.shutdown().await;
}

#[tokio::test]
async fn get_peers_respects_requested_maximum() {
    let node = Node::bind(test_config(next_port())).await.expect("bind");

    // Register three scripted peers.
    let mut raws = Vec::new();
    for _ in 0..3 {
        let raw = RawPeer::bind().await;
        raw.join(&node).await;
        raws.push(raw);
    }

    let asker = &raws[0];
    let req = Envelope::get_peers(&asker.id, &asker.addr, 2);
    asker.send(&req, node.addr()).await;

    let reply = asker
        .recv_kind("PEERS_LIST", Duration::from_secs(2))
        .await
        .expect("no PEERS_LIST");
    match &reply.body {
        Body::PeersList { peers } => assert_eq!(peers.len(), 2),
        _ => panic!("wrong variant"),
    }

    node.shutdown().await;
}
