//! Stream sender (Component C5): chunk a byte payload into DATA frames
//! followed by a terminal END frame.
//!
//! Grounded in `original_source/asoc/node_ready.py::stream_tensor` (the
//! chunking loop and default 1 MiB chunk size), adapted into a pure function
//! over an already-established [`Connection`].

use crate::codec::{FRAME_DATA, FRAME_END};
use crate::connection::Connection;
use crate::error::AsocError;

/// Send `payload` as a sequence of DATA frames of at most `chunk_size` bytes
/// each, followed by one END frame whose sequence number is the DATA frame
/// count.
///
/// An empty `payload` still produces a single END frame with sequence 0 and
/// no DATA frames, matching `⌈0/C⌉ = 0`.
pub async fn send_stream(
    conn: &Connection,
    stream_id: u32,
    payload: &[u8],
    chunk_size: usize,
) -> Result<(), AsocError> {
    assert!(chunk_size > 0, "chunk_size must be positive");

    let mut seq: u32 = 0;
    for chunk in payload.chunks(chunk_size) {
        conn.send_frame(FRAME_DATA, stream_id, seq, chunk).await?;
        seq += 1;
    }
    conn.send_frame(FRAME_END, stream_id, seq, &[]).await?;
    Ok(())
}
