//! Bidirectional framed I/O over a single TCP stream, with a bounded
//! concurrency gate on sends and per-call timeouts.
//!
//! Grounded in the teacher's `runtime/lan/peer.rs` (split reader/writer
//! halves behind their own mutexes, `MAX_FRAME_SIZE` guard) and in
//! `original_source/asoc/node_ready.py`'s `Connection` class, which is the
//! direct source of the semaphore-gated send / `readexactly`-based recv
//! design this module reimplements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;

use crate::codec::{self, DecodedHeader, HEADER_SIZE};
use crate::error::AsocError;

/// Default number of concurrent in-flight sends a single connection allows
/// before `send_frame` callers start queuing on the gate.
pub const DEFAULT_SEND_GATE: usize = 10;

pub const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const STEADY_STATE_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// A decoded frame: header fields plus the payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: u8,
    pub stream_id: u32,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// A single peer connection. Safe to share across tasks (`send_frame` may be
/// called concurrently up to the send gate's capacity); `recv_frame` is meant
/// to be driven by one owning receive-loop task at a time, but is not itself
/// unsound if called concurrently — callers simply interleave frames.
pub struct Connection {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    send_gate: Semaphore,
    max_payload: usize,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream, max_payload: usize) -> Self {
        Self::with_gate(stream, max_payload, DEFAULT_SEND_GATE)
    }

    pub fn with_gate(stream: TcpStream, max_payload: usize, gate: usize) -> Self {
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            send_gate: Semaphore::new(gate),
            max_payload,
            closed: AtomicBool::new(false),
        }
    }

    /// Encode and write a frame, bounded by the send gate and a 10s drain
    /// timeout. Returns [`AsocError::SendTimeout`] if the gate or the write
    /// itself does not complete in time, [`AsocError::SendFailed`] on an I/O
    /// error, or [`AsocError::Stopped`] if the connection was already closed.
    pub async fn send_frame(
        &self,
        frame_type: u8,
        stream_id: u32,
        seq: u32,
        payload: &[u8],
    ) -> Result<(), AsocError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AsocError::Stopped);
        }
        let frame = codec::encode_frame(frame_type, stream_id, seq, payload, self.max_payload)?;

        let permit = timeout(SEND_DRAIN_TIMEOUT, self.send_gate.acquire())
            .await
            .map_err(|_| AsocError::SendTimeout)?
            .expect("send_gate is never closed while the connection is open");

        let result = timeout(SEND_DRAIN_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;
        drop(permit);

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AsocError::SendFailed(e.to_string())),
            Err(_) => Err(AsocError::SendTimeout),
        }
    }

    /// Read one frame, bounding the whole header+payload read by `deadline`.
    /// Callers pass [`HANDSHAKE_TIMEOUT`] while negotiating and
    /// [`STEADY_STATE_RECV_TIMEOUT`] afterwards, per spec §4.2.
    pub async fn recv_frame(&self, deadline: Duration) -> Result<Frame, AsocError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AsocError::Stopped);
        }
        timeout(deadline, self.recv_frame_inner())
            .await
            .map_err(|_| AsocError::RecvTimeout)?
    }

    async fn recv_frame_inner(&self) -> Result<Frame, AsocError> {
        let mut reader = self.reader.lock().await;

        let mut header_buf = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(AsocError::RecvClosed)
            }
            Err(e) => return Err(AsocError::RecvFailed(e.to_string())),
        }

        let (_version, frame_type, stream_id, seq, length): DecodedHeader =
            codec::decode_header(&header_buf)?;
        let length = length as usize;
        if length > self.max_payload {
            return Err(AsocError::OversizedPayload(length, self.max_payload));
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => AsocError::RecvClosed,
                    _ => AsocError::RecvFailed(e.to_string()),
                })?;
        }

        Ok(Frame {
            frame_type,
            stream_id,
            seq,
            payload,
        })
    }

    /// Mark the connection closed. Idempotent; subsequent `send_frame`/
    /// `recv_frame` calls fail fast with [`AsocError::Stopped`] instead of
    /// touching the socket again. The underlying halves are dropped (and the
    /// socket closed) when the last `Arc<Connection>` referencing them goes
    /// away.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client_result, server_result) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await });
        let client = client_result.unwrap();
        let (server, _) = server_result.unwrap();
        (
            Connection::new(client, codec::DEFAULT_MAX_PAYLOAD),
            Connection::new(server, codec::DEFAULT_MAX_PAYLOAD),
        )
    }

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let (a, b) = connected_pair().await;
        a.send_frame(codec::FRAME_DATA, 1, 0, b"hello").await.unwrap();
        let frame = b.recv_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.frame_type, codec::FRAME_DATA);
        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn recv_reports_closed_on_peer_shutdown() {
        let (a, b) = connected_pair().await;
        drop(a);
        let err = b.recv_frame(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AsocError::RecvClosed));
    }

    #[tokio::test]
    async fn recv_times_out_when_nothing_arrives() {
        let (_a, b) = connected_pair().await;
        let err = b.recv_frame(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, AsocError::RecvTimeout));
    }

    #[tokio::test]
    async fn send_after_close_fails_fast() {
        let (a, _b) = connected_pair().await;
        a.close();
        let err = a.send_frame(codec::FRAME_DATA, 1, 0, b"x").await.unwrap_err();
        assert!(matches!(err, AsocError::Stopped));
    }

    #[tokio::test]
    async fn oversized_incoming_payload_is_rejected() {
        let (a, b) = connected_pair().await;
        // Hand-craft a header claiming an oversized payload without ever
        // writing that much data, so a correct implementation must reject it
        // right after decoding the header rather than hanging on the read.
        let oversized = (codec::DEFAULT_MAX_PAYLOAD + 1) as u32;
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.push(codec::PROTOCOL_VERSION);
        header.push(codec::FRAME_DATA);
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&oversized.to_be_bytes());

        {
            let mut writer = a.writer.lock().await;
            writer.write_all(&header).await.unwrap();
        }
        let err = b.recv_frame(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AsocError::OversizedPayload(_, _)));
    }
}
