//! Integration tests for end-to-end dissemination: push delivery across a
//! ten-node overlay, hybrid pull recovery, and origination edge cases.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use rumor::{Delivery, GossipConfig, Mode, Node, NodeSnapshot};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(9100);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
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

/// Start `count` nodes where every non-seed bootstraps from the first.
/// The delivery stream of each node is taken before any gossip flows.
async fn start_overlay(
    count: usize,
    fanout: usize,
    mode: Mode,
    pull_interval: Duration,
) -> (Vec<Node>, Vec<mpsc::Receiver<Delivery>>) {
    let mut nodes = Vec::with_capacity(count);
    let mut receivers = Vec::with_capacity(count);

    for i in 0..count {
        let cfg = GossipConfig {
            port: next_port(),
            bootstrap: nodes.first().map(|seed: &Node| seed.addr().to_string()),
            fanout,
            ttl: 8,
            seed: 42 + i as u64,
            ping_interval: Duration::from_millis(500),
            peer_timeout: Duration::from_secs(6),
            mode,
            pull_interval,
            ..GossipConfig::default()
        };
        let node = Node::bind(cfg).await.expect("bind");
        receivers.push(node.deliveries().await.expect("deliveries"));
        nodes.push(node);
    }

    // Let the overlay settle: every node should know at least two peers.
    for node in &nodes {
        assert!(
            wait_for(node, Duration::from_secs(4), |s| s.peers.len() >= 2).await,
            "overlay did not settle for {}",
            node.addr()
        );
    }

    (nodes, receivers)
}

/// Drain matching deliveries per node until the deadline, returning how
/// many copies of `data` each node observed.
async fn collect_deliveries(
    receivers: &mut [mpsc::Receiver<Delivery>],
    data: &str,
    deadline: Duration,
) -> Vec<usize> {
    let end = tokio::time::Instant::now() + deadline;
    let mut counts = vec![0usize; receivers.len()];
    while tokio::time::Instant::now() < end {
        for (i, rx) in receivers.iter_mut().enumerate() {
            while let Ok(delivery) = rx.try_recv() {
                if delivery.data == data {
                    counts[i] += 1;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    counts
}

#[tokio::test]
async fn ten_node_push_delivery() {
    let (nodes, mut receivers) =
        start_overlay(10, 3, Mode::Push, Duration::from_secs(2)).await;

    nodes[0].originate("news", "hello").await.expect("originate");

    let counts = collect_deliveries(&mut receivers, "hello", Duration::from_secs(2)).await;

    let reached = counts.iter().filter(|&&c| c >= 1).count();
    assert!(reached >= 9, "push reached only {reached}/10 nodes: {counts:?}");
    for (i, &count) in counts.iter().enumerate() {
        assert!(count <= 1, "node {i} recorded the message {count} times");
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn hybrid_pull_recovers_full_coverage() {
    // Fanout 2 leaves push coverage gaps; IHAVE/IWANT reconciliation
    // must close them within a few pull rounds.
    let (nodes, mut receivers) =
        start_overlay(10, 2, Mode::Hybrid, Duration::from_secs(1)).await;

    nodes[0].originate("news", "recovered").await.expect("originate");

    let counts = collect_deliveries(&mut receivers, "recovered", Duration::from_secs(5)).await;

    let reached = counts.iter().filter(|&&c| c >= 1).count();
    assert_eq!(reached, 10, "hybrid coverage incomplete: {counts:?}");
    for (i, &count) in counts.iter().enumerate() {
        assert_eq!(count, 1, "node {i} recorded the message {count} times");
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn origination_with_zero_peers_is_silent() {
    let cfg = GossipConfig {
        port: next_port(),
        ping_interval: Duration::from_millis(500),
        ..GossipConfig::default()
    };
    let node = Node::bind(cfg).await.expect("bind");
    let mut deliveries = node.deliveries().await.expect("deliveries");

    node.originate("news", "unheard").await.expect("originate");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snap = node.snapshot().await.expect("snapshot");
    assert_eq!(snap.sent, 0, "no outbound datagrams without peers");
    assert_eq!(snap.seen, 1);
    assert_eq!(snap.stored, 1);

    // The originator still records its own message exactly once.
    let delivery = deliveries.try_recv().expect("local delivery");
    assert_eq!(delivery.data, "unheard");
    assert_eq!(delivery.origin_id, node.node_id());
    assert!(deliveries.try_recv().is_err());

    node.shutdown().await;
}

#[tokio::test]
async fn repeated_origination_uses_fresh_ids() {
    let cfg = GossipConfig {
        port: next_port(),
        ..GossipConfig::default()
    };
    let node = Node::bind(cfg).await.expect("bind");
    let mut deliveries = node.deliveries().await.expect("deliveries");

    for i in 0..5 {
        node.originate("news", &format!("msg-{i}")).await.expect("originate");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut ids = Vec::new();
    while let Ok(delivery) = deliveries.try_recv() {
        ids.push(delivery.msg_id);
    }
    assert_eq!(ids.len(), 5);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5, "msg_ids must be unique");

    let snap = node.snapshot().await.expect("snapshot");
    assert_eq!(snap.seen, 5);
    node.shutdown().await;
}
