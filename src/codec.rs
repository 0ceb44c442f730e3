//! Wire codec — pure encode/decode of frames, the HELLO/ACCEPT handshake
//! payloads, and discovery datagrams. No I/O, no global state; every
//! operation here is deterministic given its inputs (aside from the random
//! challenge/token draws, which accept an explicit value for testing).
//!
//! All multi-byte integers are network byte order (big-endian), per spec §6.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::AsocError;
use crate::identity::NodeIdentity;

type HmacSha256 = Hmac<Sha256>;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 14;

pub const FRAME_DATA: u8 = 1;
pub const FRAME_END: u8 = 2;
pub const FRAME_CONTROL: u8 = 3;
pub const FRAME_HELLO: u8 = 4;
pub const FRAME_ACCEPT: u8 = 5;

/// 1 MiB — the default chunk size and the sender's default maximum payload.
pub const DEFAULT_CHUNK_SIZE: usize = 1_048_576;

/// Headroom above [`DEFAULT_CHUNK_SIZE`] so HELLO/ACCEPT frames (well under
/// 64 bytes) always fit under the same cap used for DATA frames.
const HANDSHAKE_HEADROOM: usize = 64;

/// Default maximum payload length enforced by [`encode_frame`].
pub const DEFAULT_MAX_PAYLOAD: usize = DEFAULT_CHUNK_SIZE + HANDSHAKE_HEADROOM;

const HELLO_PAYLOAD_SIZE: usize = 36;
const ACCEPT_PAYLOAD_SIZE: usize = 16;
const DISCOVERY_MESSAGE_SIZE: usize = 50;

/// Compare two equal-length byte slices in constant time.
///
/// `hmac::Mac::verify_slice` only accepts the full MAC output; our tags are
/// truncated (16 or 8 bytes), so we roll the XOR-accumulator idiom by hand
/// rather than pull in a dedicated constant-time-compare crate for one
/// function.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hmac_tag(secret: &[u8], message: &[u8], tag_len: usize) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes()[..tag_len].to_vec()
}

/// First 8 bytes of `SHA256(community)`, used to let peers recognize they
/// share a community without the community string ever going on the wire
/// in cleartext elsewhere.
pub fn community_hash(community: &str) -> [u8; 8] {
    let digest = Sha256::digest(community.as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Prepend a 14-byte header to `payload` and return the full frame.
///
/// Fails with [`AsocError::OversizedPayload`] if `payload` exceeds `max_len`.
pub fn encode_frame(
    frame_type: u8,
    stream_id: u32,
    seq: u32,
    payload: &[u8],
    max_len: usize,
) -> Result<Vec<u8>, AsocError> {
    if payload.len() > max_len {
        return Err(AsocError::OversizedPayload(payload.len(), max_len));
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.push(PROTOCOL_VERSION);
    out.push(frame_type);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decoded frame header: `(version, frame_type, stream_id, seq, payload_len)`.
pub type DecodedHeader = (u8, u8, u32, u32, u32);

/// Decode a 14-byte header slice.
pub fn decode_header(data: &[u8]) -> Result<DecodedHeader, AsocError> {
    if data.len() != HEADER_SIZE {
        return Err(AsocError::BadHeader);
    }
    let version = data[0];
    let frame_type = data[1];
    let stream_id = u32::from_be_bytes(data[2..6].try_into().unwrap());
    let seq = u32::from_be_bytes(data[6..10].try_into().unwrap());
    let length = u32::from_be_bytes(data[10..14].try_into().unwrap());
    Ok((version, frame_type, stream_id, seq, length))
}

/// Encode a HELLO payload: `node_id(16) || tag(16) || challenge(4)`.
///
/// Draws a fresh random challenge from a cryptographic source when `challenge`
/// is `None`.
pub fn encode_hello(node_id: &NodeIdentity, secret: &[u8], challenge: Option<u32>) -> Vec<u8> {
    let challenge = challenge.unwrap_or_else(|| rand::rngs::OsRng.next_u32());
    let node_id_bytes = node_id.as_bytes();

    let mut message = Vec::with_capacity(20);
    message.extend_from_slice(&node_id_bytes);
    message.extend_from_slice(&challenge.to_be_bytes());
    let tag = hmac_tag(secret, &message, 16);

    let mut out = Vec::with_capacity(HELLO_PAYLOAD_SIZE);
    out.extend_from_slice(&node_id_bytes);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&challenge.to_be_bytes());
    out
}

/// Decoded HELLO payload: `(node_id, tag, challenge)`.
pub fn decode_hello(payload: &[u8]) -> Result<([u8; 16], [u8; 16], u32), AsocError> {
    if payload.len() != HELLO_PAYLOAD_SIZE {
        return Err(AsocError::BadHello);
    }
    let mut node_id = [0u8; 16];
    node_id.copy_from_slice(&payload[0..16]);
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&payload[16..32]);
    let challenge = u32::from_be_bytes(payload[32..36].try_into().unwrap());
    Ok((node_id, tag, challenge))
}

/// Recompute the HELLO tag and compare it against the payload's, in constant
/// time.
pub fn verify_hello(payload: &[u8], secret: &[u8]) -> bool {
    let Ok((node_id, tag, challenge)) = decode_hello(payload) else {
        return false;
    };
    let mut message = Vec::with_capacity(20);
    message.extend_from_slice(&node_id);
    message.extend_from_slice(&challenge.to_be_bytes());
    let expected = hmac_tag(secret, &message, 16);
    constant_time_eq(&expected, &tag)
}

/// Encode an ACCEPT payload: `token(8) || tag(8)`. Returns the full 16-byte
/// payload alongside the session token for the caller to retain.
pub fn encode_accept(secret: &[u8]) -> (Vec<u8>, [u8; 8]) {
    let mut token = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut token);
    let tag = hmac_tag(secret, &token, 8);

    let mut out = Vec::with_capacity(ACCEPT_PAYLOAD_SIZE);
    out.extend_from_slice(&token);
    out.extend_from_slice(&tag);
    (out, token)
}

/// Verify an ACCEPT payload's tag and return the session token if it holds.
pub fn decode_accept(payload: &[u8], secret: &[u8]) -> Option<[u8; 8]> {
    if payload.len() != ACCEPT_PAYLOAD_SIZE {
        return None;
    }
    let token = &payload[0..8];
    let tag = &payload[8..16];
    let expected = hmac_tag(secret, token, 8);
    if constant_time_eq(&expected, tag) {
        let mut out = [0u8; 8];
        out.copy_from_slice(token);
        Some(out)
    } else {
        None
    }
}

/// Spec §9 RECOMMENDS extending ACCEPT with the responder's node id so an
/// outbound connector can key its PeerTable by identity immediately instead
/// of a provisional `host:port` key. We implement that as a 16-byte field
/// appended *after* the base 16-byte ACCEPT payload, so bytes 0..16 stay
/// exactly as spec §6 defines them for interop with a minimal peer that only
/// ever sends the base payload.
pub fn encode_accept_with_identity(
    secret: &[u8],
    responder_id: &NodeIdentity,
) -> (Vec<u8>, [u8; 8]) {
    let (mut out, token) = encode_accept(secret);
    out.extend_from_slice(&responder_id.as_bytes());
    (out, token)
}

/// Decode an ACCEPT payload that may or may not carry the trailing
/// responder-identity extension. Accepts both the 16-byte base form and the
/// 32-byte extended form; the tag is always verified over the base 16 bytes.
pub fn decode_accept_extended(
    payload: &[u8],
    secret: &[u8],
) -> Option<([u8; 8], Option<NodeIdentity>)> {
    if payload.len() == ACCEPT_PAYLOAD_SIZE {
        let token = decode_accept(payload, secret)?;
        return Some((token, None));
    }
    if payload.len() == ACCEPT_PAYLOAD_SIZE + 16 {
        let token = decode_accept(&payload[..ACCEPT_PAYLOAD_SIZE], secret)?;
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&payload[ACCEPT_PAYLOAD_SIZE..]);
        return Some((token, Some(NodeIdentity::from_bytes(id_bytes))));
    }
    None
}

/// A validated discovery announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryAnnouncement {
    pub node_id: [u8; 16],
    pub port: u16,
    pub timestamp: u32,
    pub challenge: u32,
}

/// Encode a 50-byte discovery datagram.
pub fn encode_discovery(
    community: &str,
    node_id: &NodeIdentity,
    listen_port: u16,
    secret: &[u8],
    timestamp: Option<u32>,
    challenge: Option<u32>,
) -> Vec<u8> {
    let timestamp = timestamp.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32
    });
    let challenge = challenge.unwrap_or_else(|| rand::rngs::OsRng.next_u32());

    let mut body = Vec::with_capacity(34);
    body.extend_from_slice(&community_hash(community));
    body.extend_from_slice(&node_id.as_bytes());
    body.extend_from_slice(&listen_port.to_be_bytes());
    body.extend_from_slice(&timestamp.to_be_bytes());
    body.extend_from_slice(&challenge.to_be_bytes());

    let tag = hmac_tag(secret, &body, 16);

    let mut out = Vec::with_capacity(DISCOVERY_MESSAGE_SIZE);
    out.extend_from_slice(&body);
    out.extend_from_slice(&tag);
    out
}

/// Decode and validate a discovery datagram. Returns `None` on length
/// mismatch, community-hash mismatch, or tag mismatch — the caller should
/// silently drop the datagram in all three cases (spec §4.5).
pub fn decode_discovery(
    data: &[u8],
    expected_community: &str,
    secret: &[u8],
) -> Option<DiscoveryAnnouncement> {
    if data.len() != DISCOVERY_MESSAGE_SIZE {
        return None;
    }
    let body = &data[0..34];
    let tag = &data[34..50];

    if body[0..8] != community_hash(expected_community) {
        return None;
    }

    let expected_tag = hmac_tag(secret, body, 16);
    if !constant_time_eq(&expected_tag, tag) {
        return None;
    }

    let mut node_id = [0u8; 16];
    node_id.copy_from_slice(&body[8..24]);
    let port = u16::from_be_bytes(body[24..26].try_into().unwrap());
    let timestamp = u32::from_be_bytes(body[26..30].try_into().unwrap());
    let challenge = u32::from_be_bytes(body[30..34].try_into().unwrap());

    Some(DiscoveryAnnouncement {
        node_id,
        port,
        timestamp,
        challenge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let payload = b"tensor-bytes";
        let frame = encode_frame(FRAME_DATA, 7, 3, payload, DEFAULT_MAX_PAYLOAD).unwrap();
        let (version, frame_type, stream_id, seq, length) =
            decode_header(&frame[..HEADER_SIZE]).unwrap();
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(frame_type, FRAME_DATA);
        assert_eq!(stream_id, 7);
        assert_eq!(seq, 3);
        assert_eq!(length as usize, payload.len());
        assert_eq!(&frame[HEADER_SIZE..], payload);
    }

    #[test]
    fn decode_header_rejects_wrong_length() {
        assert!(matches!(decode_header(&[0u8; 13]), Err(AsocError::BadHeader)));
        assert!(matches!(decode_header(&[0u8; 15]), Err(AsocError::BadHeader)));
    }

    #[test]
    fn encode_frame_rejects_oversized_payload() {
        let payload = vec![0u8; DEFAULT_MAX_PAYLOAD + 1];
        let err = encode_frame(FRAME_DATA, 1, 0, &payload, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, AsocError::OversizedPayload(_, _)));
    }

    #[test]
    fn hello_round_trips_and_verifies() {
        let id = NodeIdentity::generate();
        let secret = b"community-secret";
        let payload = encode_hello(&id, secret, Some(42));
        assert_eq!(payload.len(), HELLO_PAYLOAD_SIZE);
        assert!(verify_hello(&payload, secret));

        let (node_id, _tag, challenge) = decode_hello(&payload).unwrap();
        assert_eq!(node_id, id.as_bytes());
        assert_eq!(challenge, 42);
    }

    #[test]
    fn hello_verification_fails_on_bit_flip() {
        let id = NodeIdentity::generate();
        let secret = b"community-secret";
        let mut payload = encode_hello(&id, secret, Some(1));
        payload[16] ^= 0x01; // flip a bit in the tag
        assert!(!verify_hello(&payload, secret));
    }

    #[test]
    fn hello_verification_fails_on_wrong_secret() {
        let id = NodeIdentity::generate();
        let payload = encode_hello(&id, b"secret-a", Some(1));
        assert!(!verify_hello(&payload, b"secret-b"));
    }

    #[test]
    fn accept_round_trips() {
        let secret = b"community-secret";
        let (payload, token) = encode_accept(secret);
        assert_eq!(payload.len(), ACCEPT_PAYLOAD_SIZE);
        let decoded = decode_accept(&payload, secret).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn accept_rejects_wrong_secret() {
        let (payload, _token) = encode_accept(b"secret-a");
        assert!(decode_accept(&payload, b"secret-b").is_none());
    }

    #[test]
    fn extended_accept_carries_responder_identity() {
        let secret = b"community-secret";
        let responder = NodeIdentity::generate();
        let (payload, token) = encode_accept_with_identity(secret, &responder);
        assert_eq!(payload.len(), ACCEPT_PAYLOAD_SIZE + 16);

        let (decoded_token, decoded_id) = decode_accept_extended(&payload, secret).unwrap();
        assert_eq!(decoded_token, token);
        assert_eq!(decoded_id, Some(responder));
    }

    #[test]
    fn extended_accept_decoder_accepts_base_payload() {
        let secret = b"community-secret";
        let (payload, token) = encode_accept(secret);
        let (decoded_token, decoded_id) = decode_accept_extended(&payload, secret).unwrap();
        assert_eq!(decoded_token, token);
        assert_eq!(decoded_id, None);
    }

    #[test]
    fn discovery_round_trips() {
        let id = NodeIdentity::generate();
        let secret = b"community-secret";
        let msg = encode_discovery("my-community", &id, 9001, secret, Some(1000), Some(55));
        assert_eq!(msg.len(), DISCOVERY_MESSAGE_SIZE);

        let decoded = decode_discovery(&msg, "my-community", secret).unwrap();
        assert_eq!(decoded.node_id, id.as_bytes());
        assert_eq!(decoded.port, 9001);
        assert_eq!(decoded.timestamp, 1000);
        assert_eq!(decoded.challenge, 55);
    }

    #[test]
    fn discovery_rejects_mismatched_community() {
        let id = NodeIdentity::generate();
        let secret = b"community-secret";
        let msg = encode_discovery("community-a", &id, 9001, secret, Some(1000), Some(55));
        assert!(decode_discovery(&msg, "community-b", secret).is_none());
    }

    #[test]
    fn discovery_rejects_mismatched_secret() {
        let id = NodeIdentity::generate();
        let msg = encode_discovery("community", &id, 9001, b"secret-a", Some(1000), Some(55));
        assert!(decode_discovery(&msg, "community", b"secret-b").is_none());
    }

    #[test]
    fn discovery_rejects_wrong_length() {
        assert!(decode_discovery(&[0u8; 49], "c", b"s").is_none());
    }
}
