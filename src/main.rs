use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rumor::{GossipConfig, Mode, Node};

#[derive(Parser, Debug)]
#[command(name = "rumor")]
#[command(author, version, about = "Gossip protocol node", long_about = None)]
struct Args {
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// ip:port of the seed node; omit when this node is its own seed.
    #[arg(long)]
    bootstrap: Option<String>,

    #[arg(long, default_value_t = 3)]
    fanout: usize,

    #[arg(long, default_value_t = 8)]
    ttl: u32,

    #[arg(long, default_value_t = 20)]
    peer_limit: usize,

    /// Seconds between liveness rounds.
    #[arg(long, default_value_t = 2.0)]
    ping_interval: f64,

    /// Seconds of silence before a peer is removed.
    #[arg(long, default_value_t = 6.0)]
    peer_timeout: f64,

    /// RNG seed for reproducible peer selection.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value = "push", value_parser = ["push", "hybrid"])]
    mode: String,

    /// Seconds between IHAVE rounds (hybrid mode).
    #[arg(long, default_value_t = 2.0)]
    pull_interval: f64,

    #[arg(long, default_value_t = 32)]
    ihave_max_ids: usize,

    /// Required leading hex zeros for admission; 0 disables the puzzle.
    #[arg(long, default_value_t = 0)]
    pow_k: u32,

    /// Write the protocol event stream to this file as JSON lines.
    #[arg(long)]
    event_log: Option<std::path::PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<(GossipConfig, Option<std::path::PathBuf>)> {
        let mode: Mode = self.mode.parse().map_err(anyhow::Error::msg)?;
        let cfg = GossipConfig {
            port: self.port,
            bootstrap: self.bootstrap,
            fanout: self.fanout,
            ttl: self.ttl,
            peer_limit: self.peer_limit,
            ping_interval: Duration::from_secs_f64(self.ping_interval),
            peer_timeout: Duration::from_secs_f64(self.peer_timeout),
            seed: self.seed,
            mode,
            pull_interval: Duration::from_secs_f64(self.pull_interval),
            ihave_max_ids: self.ihave_max_ids,
            pow_k: self.pow_k,
        };
        Ok((cfg, self.event_log))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let (cfg, event_log) = args.into_config()?;
    let node = Node::bind(cfg).await?;
    info!(id = %node.node_id(), addr = %node.addr(), "rumor node running");

    // Delivered gossip goes to the log; analysis reads the event stream.
    let mut deliveries = node.deliveries().await?;
    tokio::spawn(async move {
        while let Some(msg) = deliveries.recv().await {
            let origin: String = msg.origin_id.chars().take(8).collect();
            info!(topic = %msg.topic, origin = %origin, data = %msg.data, "delivered");
        }
    });

    if let Some(path) = event_log {
        let mut events = node.events().await?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create event log {}", path.display()))?;
        tokio::spawn(async move {
            while let Some(record) = events.recv().await {
                let Ok(mut line) = serde_json::to_vec(&record) else {
                    continue;
                };
                line.push(b'\n');
                if file.write_all(&line).await.is_err() {
                    break;
                }
            }
        });
    }

    // Stdin lines become new gossip; EOF just leaves the node running.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        node.originate("news", line).await?;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!(error = %err, "stdin read failed");
                    stdin_open = false;
                }
            },
        }
    }

    node.shutdown().await;
    Ok(())
}
