//! Error taxonomy for the ASoc transport.
//!
//! Codec, authentication, and transport errors are handled internally by the
//! task that produced them (the connection is closed, any `PeerTable` entry is
//! removed) and never escape to the operator. Only operator-facing calls
//! (`send_stream`, `start`, `shutdown`) surface an [`AsocError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AsocError {
    #[error("malformed frame header")]
    BadHeader,

    #[error("malformed HELLO payload")]
    BadHello,

    #[error("malformed ACCEPT payload")]
    BadAccept,

    #[error("malformed discovery datagram")]
    BadDiscovery,

    #[error("authentication tag mismatch")]
    AuthFailed,

    #[error("send timed out")]
    SendTimeout,

    #[error("receive timed out")]
    RecvTimeout,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    RecvFailed(String),

    #[error("connection closed by peer")]
    RecvClosed,

    #[error("peer already connected")]
    Duplicate,

    #[error("no connection to peer")]
    NoPeer,

    #[error("node is stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("payload of {0} bytes exceeds the maximum frame payload of {1} bytes")]
    OversizedPayload(usize, usize),
}
