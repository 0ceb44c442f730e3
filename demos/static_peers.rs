//! Static configuration demo: two nodes pointed at each other's loopback
//! address with discovery disabled, for firewalled/VLAN/Kubernetes
//! deployments where UDP broadcast does not reach.
//!
//! Mirrors `examples/static_peers.py` from the original project.

use std::time::Duration;

use asoc::{NodeConfig, NodeEvent, NodeHandle};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("{}", "=".repeat(60));
    println!("ASoc static configuration demo");
    println!("{}", "=".repeat(60));

    println!("\nThis demo configures peers manually instead of relying on");
    println!("UDP auto-discovery.\n");

    println!("1. Creating Node A (will connect to 127.0.0.1:9002)...");
    let config_a = NodeConfig::from_toml_str(
        r#"
        community = "static-cluster"
        secret = "static-key"
        port = 9001
        peers = ["127.0.0.1:9002"]
        discovery = false
        "#,
    )?;

    println!("2. Creating Node B (will connect to 127.0.0.1:9001)...");
    let config_b = NodeConfig::from_toml_str(
        r#"
        community = "static-cluster"
        secret = "static-key"
        port = 9002
        peers = ["127.0.0.1:9001"]
        discovery = false
        "#,
    )?;

    println!("\n3. Starting nodes...");
    let (node_a, mut events_a) = NodeHandle::spawn(config_a).await?;
    let (node_b, mut events_b) = NodeHandle::spawn(config_b).await?;

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

    println!("4. Waiting for peer connection (5 seconds)...");
    sleep(Duration::from_secs(5)).await;

    let peers_a = node_a.peer_ids();
    println!("\nNode A peers: {}", peers_a.len());

    if let Some(peer) = peers_a.first() {
        println!("\n5. Sending data...");
        let data = b"Static configuration works!".repeat(100);
        node_a.send_stream(peer, &data, None, None).await?;
        println!("data sent successfully!");
        sleep(Duration::from_secs(1)).await;
    } else {
        println!("\nnodes did not connect; check that:");
        println!("  - both nodes are running");
        println!("  - ports 9001, 9002 are not blocked");
        println!("  - community and secret match");
    }

    println!("\n6. Shutting down...");
    node_a.shutdown().await;
    node_b.shutdown().await;
    let _ = drain_b.await;

    println!("\n{}", "=".repeat(60));
    println!("demo complete");
    println!();
    println!("for production deployment with environment variables:");
    println!("  export ASOC_PEERS='10.0.1.10:9000,10.0.2.20:9000'");
    println!("  asoc --community static-cluster --secret static-key");
    println!("{}", "=".repeat(60));
    Ok(())
}
