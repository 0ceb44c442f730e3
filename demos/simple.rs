//! Minimal two-node demo: start two nodes on loopback, let UDP discovery
//! find the peer, stream one payload across, then shut down.
//!
//! Mirrors `examples/simple.py` from the original project one-for-one.

use std::time::Duration;

use asoc::{NodeConfig, NodeEvent, NodeHandle};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("{}", "=".repeat(60));
    println!("ASoc simple demo");
    println!("{}", "=".repeat(60));

    println!("\n1. Creating nodes...");
    let config_a = NodeConfig::from_toml_str(
        r#"
        community = "example-cluster"
        secret = "example-key"
        port = 9001
        "#,
    )?;
    let config_b = NodeConfig::from_toml_str(
        r#"
        community = "example-cluster"
        secret = "example-key"
        port = 9002
        "#,
    )?;

    println!("2. Starting nodes...");
    let (node_a, mut events_a) = NodeHandle::spawn(config_a).await?;
    let (node_b, mut events_b) = NodeHandle::spawn(config_b).await?;

    // Both nodes' event receivers are drained on background tasks so
    // PeerConnected/Data/StreamEnd never back up the node's internal channel.
    let drain_b = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(event) = events_b.recv().await {
            if let NodeEvent::Data { payload, .. } = event {
                received.extend_from_slice(&payload);
            }
        }
        received
    });
    tokio::spawn(async move { while events_a.recv().await.is_some() {} });

    println!("3. Waiting for peer discovery (3 seconds)...");
    sleep(Duration::from_secs(3)).await;

    let peers_a = node_a.peer_ids();
    let peers_b = node_b.peer_ids();
    println!("\nNode A found {} peer(s)", peers_a.len());
    println!("Node B found {} peer(s)", peers_b.len());

    if let Some(peer) = peers_a.first() {
        println!("\n4. Streaming data from Node A to Node B...");
        let payload = b"Example tensor data ".repeat(1000);
        node_a.send_stream(peer, &payload, None, None).await?;
        println!("streamed successfully!");
        sleep(Duration::from_secs(1)).await;
    } else {
        println!("\nno peers discovered; check firewall settings for UDP 9999");
        println!("try the static_peers demo instead");
    }

    println!("\n5. Shutting down...");
    node_a.shutdown().await;
    node_b.shutdown().await;
    let _ = drain_b.await;

    println!("\n{}", "=".repeat(60));
    println!("demo complete");
    println!("{}", "=".repeat(60));
    Ok(())
}
