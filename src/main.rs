//! Operator-facing CLI for the ASoc node.
//!
//! Flag parsing follows the teacher CLI's manual-scan style rather than
//! pulling in an argument-parsing crate. Environment variables are read
//! *only* here, never inside the library: `ASOC_COMMUNITY`, `ASOC_API_KEY`,
//! and `ASOC_PEERS` (a comma-separated peer list) let an operator override
//! or fill in a config file without editing it, matching spec §6.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn, LevelFilter};

use asoc::config::parse_peer_list;
use asoc::{NodeConfig, NodeEvent, NodeHandle};

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn collect_repeated(args: &[String], flag: &str) -> Vec<String> {
    args.iter()
        .zip(args.iter().skip(1))
        .filter(|(a, _)| *a == flag)
        .map(|(_, v)| v.clone())
        .collect()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Build a [`NodeConfig`] from CLI flags and environment variables, used
/// whenever the operator did not pass `--config`.
fn config_from_flags(args: &[String]) -> Result<NodeConfig> {
    let community = flag_value(args, "--community")
        .or_else(|| std::env::var("ASOC_COMMUNITY").ok())
        .context("missing --community (or ASOC_COMMUNITY)")?;
    let secret = flag_value(args, "--secret")
        .or_else(|| std::env::var("ASOC_API_KEY").ok())
        .context("missing --secret (or ASOC_API_KEY)")?;

    let (host, port) = match flag_value(args, "--listen") {
        Some(listen) => match listen.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().context("bad --listen port")?),
            None => bail!("--listen must be host:port, got {listen:?}"),
        },
        None => ("0.0.0.0".to_string(), 9000),
    };

    let mut peers = collect_repeated(args, "--peer");
    if let Ok(env_peers) = std::env::var("ASOC_PEERS") {
        peers.extend(
            env_peers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }

    let discovery = if has_flag(args, "--no-discovery") {
        Some(false)
    } else if has_flag(args, "--discovery") {
        Some(true)
    } else {
        None
    };

    let toml = format!(
        r#"community = {community:?}
secret = {secret:?}
host = {host:?}
port = {port}
peers = {peers:?}
"#
    );
    let mut cfg = NodeConfig::from_toml_str(&toml)?;
    cfg.discovery = discovery;
    Ok(cfg)
}

fn usage() -> &'static str {
    "usage: asoc --config <path.toml>\n       asoc --community <name> --secret <key> [--listen host:port] [--peer host:port ...] [--no-discovery|--discovery]"
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", usage());
        return Ok(());
    }

    let log_dir = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("logs");
    asoc::log::setup_logger(&log_dir, LevelFilter::Info)?;

    let config = match flag_value(&args, "--config") {
        Some(path) => NodeConfig::load(&PathBuf::from(path))?,
        None => config_from_flags(&args).with_context(|| usage().to_string())?,
    };

    // Dropped entries from a malformed --peer/ASOC_PEERS value are already
    // logged by parse_peer_list; we only re-run it here to report the count
    // before the node starts dialing out.
    let resolved = parse_peer_list(&config.peers);
    info!(
        "starting node: community={} listen={}:{} static_peers={} discovery={}",
        config.community,
        config.host,
        config.port,
        resolved.len(),
        config.effective_discovery()
    );

    let (handle, mut events) = NodeHandle::spawn(config).await?;
    info!("node identity: {}", handle.identity());

    let events_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::PeerConnected(peer) => info!("peer connected: {peer}"),
                NodeEvent::PeerDisconnected(peer) => info!("peer disconnected: {peer}"),
                NodeEvent::Data {
                    peer,
                    stream_id,
                    seq,
                    payload,
                } => {
                    debug!(
                        "data from {peer}: stream {stream_id} seq {seq} ({} bytes)",
                        payload.len()
                    );
                }
                NodeEvent::StreamEnd {
                    peer,
                    stream_id,
                    seq,
                } => {
                    info!("stream {stream_id} from {peer} complete ({seq} frames)");
                }
            }
        }
    });

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install ctrl-c handler; shutting down immediately");
    } else {
        info!("ctrl-c received, shutting down");
    }

    handle.shutdown().await;
    events_task.abort();
    Ok(())
}
