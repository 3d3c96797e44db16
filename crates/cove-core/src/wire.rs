//! Cove wire format — on-wire types for the per-folder gossip protocol.
//!
//! These types ARE the protocol. Every field, every size is part of the
//! wire format; changing anything here is a breaking change for the whole
//! mesh. A frame is a u32 LE length, a kind byte, and a payload. Fixed-size
//! payloads are #[repr(C, packed)] with zerocopy derives for deterministic
//! layout and allocation-free parsing. There is no unsafe code in this
//! module.
//!
//! The transport below this layer already authenticated the stream and
//! told us the remote's public key; nothing in a frame is secret beyond
//! what is already ciphertext (names, chunk payloads).

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::meta::SignedMeta;

// ── Frame kinds ───────────────────────────────────────────────────────────────

/// Message kind tag, the first payload byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// First frame in each direction. Binds the stream to a folder and a
    /// node identity.
    Handshake = 0x01,
    /// Receiver must not send chunk requests while choked.
    Choke = 0x02,
    Unchoke = 0x03,
    /// Advisory: sender wants at least one chunk the receiver has.
    Interested = 0x04,
    NotInterested = 0x05,
    /// Announces a meta the sender holds.
    HaveMeta = 0x06,
    /// Announces a chunk the sender holds.
    HaveChunk = 0x07,
    /// Ask for the sender's current SignedMeta for a path.
    MetaRequest = 0x08,
    MetaReply = 0x09,
    /// Range request into an encrypted chunk.
    ChunkRequest = 0x0A,
    ChunkReply = 0x0B,
    /// Cancels an outstanding ChunkRequest.
    Cancel = 0x0C,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Handshake),
            0x02 => Ok(FrameKind::Choke),
            0x03 => Ok(FrameKind::Unchoke),
            0x04 => Ok(FrameKind::Interested),
            0x05 => Ok(FrameKind::NotInterested),
            0x06 => Ok(FrameKind::HaveMeta),
            0x07 => Ok(FrameKind::HaveChunk),
            0x08 => Ok(FrameKind::MetaRequest),
            0x09 => Ok(FrameKind::MetaReply),
            0x0A => Ok(FrameKind::ChunkRequest),
            0x0B => Ok(FrameKind::ChunkReply),
            0x0C => Ok(FrameKind::Cancel),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Fixed-size payloads ───────────────────────────────────────────────────────

/// Handshake payload — must be the first frame on a session, both ways.
///
/// `auth_token` = keyed BLAKE3 of `node_pubkey` under the folder auth key,
/// proving possession of (at least) a Download secret and binding the
/// channel to the claimed identity.
///
/// Wire size: 96 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Handshake {
    pub folder_id: [u8; 32],
    pub node_pubkey: [u8; 32],
    pub auth_token: [u8; 32],
}

assert_eq_size!(Handshake, [u8; 96]);

/// Meta announcement. Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HaveMeta {
    pub path_hash: [u8; 32],
    pub revision: u64,
}

assert_eq_size!(HaveMeta, [u8; 40]);

/// Chunk announcement. Wire size: 32 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HaveChunk {
    pub ct_hash: [u8; 32],
}

assert_eq_size!(HaveChunk, [u8; 32]);

/// Request for the sender's current SignedMeta. Wire size: 32 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MetaRequest {
    pub path_hash: [u8; 32],
}

assert_eq_size!(MetaRequest, [u8; 32]);

/// Range request into an encrypted chunk. Also the Cancel payload.
/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkRequest {
    pub ct_hash: [u8; 32],
    pub offset: u32,
    pub length: u32,
}

assert_eq_size!(ChunkRequest, [u8; 40]);

/// Header of a ChunkReply; the requested bytes follow it in the payload.
/// Wire size: 36 bytes + data.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkReplyHeader {
    pub ct_hash: [u8; 32],
    pub offset: u32,
}

assert_eq_size!(ChunkReplyHeader, [u8; 36]);

// ── Variable-size payloads ────────────────────────────────────────────────────

/// Encode a MetaReply payload: u32 LE meta length, canonical meta bytes,
/// 64-byte signature.
pub fn encode_meta_reply(signed: &SignedMeta) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + signed.meta_bytes.len() + 64);
    out.extend_from_slice(&(signed.meta_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&signed.meta_bytes);
    out.extend_from_slice(&signed.signature);
    out
}

/// Decode a MetaReply payload.
pub fn decode_meta_reply(payload: &[u8]) -> Result<SignedMeta, WireError> {
    if payload.len() < 4 + 64 {
        return Err(WireError::BadPayload("meta reply too short"));
    }
    let meta_len = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    if payload.len() != 4 + meta_len + 64 {
        return Err(WireError::BadPayload("meta reply length mismatch"));
    }
    let meta_bytes = payload[4..4 + meta_len].to_vec();
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&payload[4 + meta_len..]);
    Ok(SignedMeta {
        meta_bytes,
        signature,
    })
}

/// Encode a ChunkReply payload: header then the raw encrypted bytes.
pub fn encode_chunk_reply(ct_hash: [u8; 32], offset: u32, data: &[u8]) -> Vec<u8> {
    let header = ChunkReplyHeader { ct_hash, offset };
    let mut out = Vec::with_capacity(36 + data.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out
}

/// Decode a ChunkReply payload into its header and data slice.
pub fn decode_chunk_reply(payload: &[u8]) -> Result<(ChunkReplyHeader, &[u8]), WireError> {
    if payload.len() < 36 {
        return Err(WireError::BadPayload("chunk reply too short"));
    }
    let header = ChunkReplyHeader::read_from_prefix(&payload[..36])
        .ok_or(WireError::BadPayload("bad chunk reply header"))?;
    Ok((header, &payload[36..]))
}

/// Parse a fixed-size payload struct, rejecting length mismatches.
pub fn parse_exact<T: FromBytes>(payload: &[u8]) -> Result<T, WireError> {
    if payload.len() != std::mem::size_of::<T>() {
        return Err(WireError::BadPayload("fixed payload length mismatch"));
    }
    T::read_from(payload).ok_or(WireError::BadPayload("unparseable payload"))
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum accepted frame payload (kind byte excluded). Bounds memory per
/// frame read; a ChunkReply carrying a full reply segment fits comfortably.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Replies to a single ChunkRequest are segmented into pieces of at most
/// this many data bytes; the last segment satisfies offset+len = requested.
pub const CHUNK_REPLY_SEGMENT: usize = 64 * 1024;

/// Default cap on outstanding chunk requests per session.
pub const MAX_OUTSTANDING_REQUESTS: usize = 16;

/// Default per-request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Request timeouts tolerated before a session is dropped.
pub const MAX_REQUEST_TIMEOUTS: u32 = 3;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that arise when interpreting wire-format data.
/// All of them are protocol violations that close the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("bad frame payload: {0}")]
    BadPayload(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_roundtrip() {
        for byte in 0x01..=0x0Cu8 {
            let kind = FrameKind::try_from(byte).unwrap();
            assert_eq!(kind as u8, byte);
        }
        assert!(FrameKind::try_from(0x00).is_err());
        assert!(FrameKind::try_from(0x0D).is_err());
        assert!(FrameKind::try_from(0xFF).is_err());
    }

    #[test]
    fn handshake_roundtrip() {
        let original = Handshake {
            folder_id: [0x11; 32],
            node_pubkey: [0x22; 32],
            auth_token: [0x33; 32],
        };
        let bytes = original.as_bytes();
        assert_eq!(bytes.len(), 96);
        let recovered: Handshake = parse_exact(bytes).unwrap();
        assert_eq!(recovered.folder_id, original.folder_id);
        assert_eq!(recovered.node_pubkey, original.node_pubkey);
        assert_eq!(recovered.auth_token, original.auth_token);
    }

    #[test]
    fn have_meta_roundtrip() {
        let original = HaveMeta {
            path_hash: [0x44; 32],
            revision: 0x0102030405060708,
        };
        let bytes = original.as_bytes();
        assert_eq!(bytes.len(), 40);
        let recovered: HaveMeta = parse_exact(bytes).unwrap();
        assert_eq!(recovered.path_hash, original.path_hash);
        // copy packed field to a local before asserting
        let revision = recovered.revision;
        assert_eq!(revision, 0x0102030405060708);
    }

    #[test]
    fn parse_exact_rejects_wrong_length() {
        let err = parse_exact::<HaveChunk>(&[0u8; 31]).unwrap_err();
        assert!(matches!(err, WireError::BadPayload(_)));
        let err = parse_exact::<HaveChunk>(&[0u8; 33]).unwrap_err();
        assert!(matches!(err, WireError::BadPayload(_)));
    }

    #[test]
    fn chunk_request_roundtrip() {
        let original = ChunkRequest {
            ct_hash: [0x55; 32],
            offset: 65536,
            length: 4096,
        };
        let recovered: ChunkRequest = parse_exact(original.as_bytes()).unwrap();
        let offset = recovered.offset;
        let length = recovered.length;
        assert_eq!(offset, 65536);
        assert_eq!(length, 4096);
    }

    #[test]
    fn meta_reply_roundtrip() {
        let signed = SignedMeta {
            meta_bytes: vec![0xAB; 120],
            signature: [0xCD; 64],
        };
        let payload = encode_meta_reply(&signed);
        let recovered = decode_meta_reply(&payload).unwrap();
        assert_eq!(recovered, signed);
    }

    #[test]
    fn meta_reply_length_mismatch_rejected() {
        let signed = SignedMeta {
            meta_bytes: vec![0xAB; 120],
            signature: [0xCD; 64],
        };
        let mut payload = encode_meta_reply(&signed);
        payload.push(0);
        assert!(decode_meta_reply(&payload).is_err());
        assert!(decode_meta_reply(&payload[..10]).is_err());
    }

    #[test]
    fn chunk_reply_roundtrip() {
        let payload = encode_chunk_reply([0x77; 32], 1024, b"encrypted bytes");
        let (header, data) = decode_chunk_reply(&payload).unwrap();
        assert_eq!(header.ct_hash, [0x77; 32]);
        let offset = header.offset;
        assert_eq!(offset, 1024);
        assert_eq!(data, b"encrypted bytes");
    }
}
