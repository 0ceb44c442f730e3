//! ASoc — a peer-to-peer transport for streaming large opaque byte blobs
//! between nodes in a trust-bounded community.
//!
//! The public surface is deliberately small: construct a [`NodeConfig`],
//! hand it to [`NodeHandle::spawn`], and drive the returned event receiver.
//! Anyone who only needs the wire format (for interop or tooling) can reach
//! straight for [`codec`] without touching the node manager.

pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod log;
pub mod node;
pub mod stream;

pub use config::NodeConfig;
pub use error::AsocError;
pub use identity::NodeIdentity;
pub use node::{NodeEvent, NodeHandle, PeerKey};
