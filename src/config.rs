//! Node configuration: TOML file parsing and the static peer list.
//!
//! Grounded in the teacher's `CLI/src/config.rs` (`serde`-derived struct,
//! `#[serde(default = "...")]` for optional fields, `toml::from_str` loading
//! with a generated template on first run). The tri-state discovery switch
//! and static-peer-list shape come from
//! `original_source/asoc/node_ready.py`'s constructor and
//! `static_config.py`'s `load_peers_from_file`.
//!
//! This module never reads environment variables — per spec, `ASOC_PEERS`,
//! `ASOC_COMMUNITY`, and `ASOC_API_KEY` are read only by the operator shell
//! (`src/main.rs`), never by the core.

use std::fs;
use std::path::Path;

use anyhow::Context;
use log::warn;
use serde::Deserialize;

use crate::codec::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PAYLOAD};
use crate::connection::DEFAULT_SEND_GATE;
use crate::error::AsocError;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

fn default_send_gate() -> usize {
    DEFAULT_SEND_GATE
}

/// One entry of the static peer list, after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPeerAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for StaticPeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed and validated node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub community: String,
    pub secret: String,
    pub node_id: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub peers: Vec<String>,

    /// `None` means "decide from whether `peers` is empty", per spec §4.4.
    #[serde(default)]
    pub discovery: Option<bool>,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default = "default_send_gate")]
    pub send_gate: usize,
}

const TEMPLATE: &str = r#"# asoc node configuration
community = "my-community"
secret = "change-me"
# node_id = "00000000-0000-0000-0000-000000000000"

host = "0.0.0.0"
port = 9000

# peers = ["10.0.0.2:9000", "10.0.0.3:9000"]
# discovery = true

# chunk_size = 1048576
# max_payload = 1048640
# send_gate = 10
"#;

impl NodeConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let cfg: NodeConfig = toml::from_str(content).context("parsing node config TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path`, writing a commented template and returning an error
    /// if the file does not yet exist — matching the teacher CLI's
    /// first-run UX.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            fs::write(path, TEMPLATE)
                .with_context(|| format!("writing default config to {}", path.display()))?;
            anyhow::bail!(
                "default config created at {}; edit it and rerun",
                path.display()
            );
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), AsocError> {
        if self.community.is_empty() {
            return Err(AsocError::ConfigInvalid("community must not be empty".into()));
        }
        if self.secret.is_empty() {
            return Err(AsocError::ConfigInvalid("secret must not be empty".into()));
        }
        Ok(())
    }

    /// Parse `peers` into `(host, port)` pairs, logging and dropping any
    /// malformed entry rather than failing the whole config.
    pub fn static_peer_addrs(&self) -> Vec<StaticPeerAddr> {
        parse_peer_list(&self.peers)
    }

    /// Resolve the tri-state discovery switch per spec §4.4: if unset,
    /// discovery is enabled exactly when the static peer list is empty.
    pub fn effective_discovery(&self) -> bool {
        self.discovery.unwrap_or_else(|| self.peers.is_empty())
    }
}

/// Parse a list of `"host:port"` strings, logging and dropping malformed
/// entries. Shared by [`NodeConfig::static_peer_addrs`] and the CLI's
/// `ASOC_PEERS` env-var loader.
pub fn parse_peer_list(entries: &[String]) -> Vec<StaticPeerAddr> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let trimmed = entry.trim();
        match trimmed.rsplit_once(':') {
            Some((host, port_str)) if !host.is_empty() => match port_str.parse::<u16>() {
                Ok(port) => out.push(StaticPeerAddr {
                    host: host.to_string(),
                    port,
                }),
                Err(_) => warn!("dropping malformed peer entry (bad port): {trimmed:?}"),
            },
            _ => warn!("dropping malformed peer entry: {trimmed:?}"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = NodeConfig::from_toml_str(
            r#"
            community = "c"
            secret = "s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(cfg.effective_discovery());
    }

    #[test]
    fn rejects_empty_community() {
        let err = NodeConfig::from_toml_str(
            r#"
            community = ""
            secret = "s"
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn discovery_defaults_off_with_static_peers() {
        let cfg = NodeConfig::from_toml_str(
            r#"
            community = "c"
            secret = "s"
            peers = ["10.0.0.2:9000"]
            "#,
        )
        .unwrap();
        assert!(!cfg.effective_discovery());
    }

    #[test]
    fn explicit_discovery_overrides_peer_presence() {
        let cfg = NodeConfig::from_toml_str(
            r#"
            community = "c"
            secret = "s"
            peers = ["10.0.0.2:9000"]
            discovery = true
            "#,
        )
        .unwrap();
        assert!(cfg.effective_discovery());
    }

    #[test]
    fn static_peer_parsing_drops_malformed_entries() {
        let entries = vec![
            "10.0.0.2:9000".to_string(),
            "not-a-peer".to_string(),
            "10.0.0.3:notaport".to_string(),
            "host.example.com:9100".to_string(),
        ];
        let parsed = parse_peer_list(&entries);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].host, "10.0.0.2");
        assert_eq!(parsed[0].port, 9000);
        assert_eq!(parsed[1].host, "host.example.com");
        assert_eq!(parsed[1].port, 9100);
    }
}
