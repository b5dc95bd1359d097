//! Core types for the Arbor transport boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Daemon rank. Mirrors the routing layer's rank space; the transport
/// treats it as an opaque address.
pub type Rank = u64;

/// Frames larger than this are a protocol violation, not a payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message tag, so receivers can dispatch without peeking at payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// A failure notice: ranks died.
    DaemonDied,
    /// An adoption notice: a repaired daemon's new ancestor chain.
    DaemonAdopted,
    /// Dependent traffic multiplexed over the same links.
    User(u16),
}

impl Tag {
    fn to_wire(self) -> [u8; 3] {
        match self {
            Tag::DaemonDied => [0, 0, 0],
            Tag::DaemonAdopted => [1, 0, 0],
            Tag::User(n) => {
                let b = n.to_le_bytes();
                [2, b[0], b[1]]
            }
        }
    }

    fn from_wire(bytes: [u8; 3]) -> Option<Self> {
        match bytes[0] {
            0 => Some(Tag::DaemonDied),
            1 => Some(Tag::DaemonAdopted),
            2 => Some(Tag::User(u16::from_le_bytes([bytes[1], bytes[2]]))),
            _ => None,
        }
    }
}

/// What an endpoint's event stream yields.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A frame arrived.
    Message {
        from: Rank,
        tag: Tag,
        payload: Bytes,
    },
    /// The connection to a rank is gone. Fires once per loss.
    PeerLost(Rank),
}

/// Encode one frame body: sender rank, tag, payload. The length prefix is
/// written separately by the stream writer.
pub(crate) fn encode_frame(from: Rank, tag: Tag, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + 3 + payload.len());
    buf.put_u64_le(from);
    buf.put_slice(&tag.to_wire());
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode one frame body.
pub(crate) fn decode_frame(mut body: Bytes) -> Option<(Rank, Tag, Bytes)> {
    if body.len() < 11 {
        return None;
    }
    let from = body.get_u64_le();
    let mut tag_bytes = [0u8; 3];
    body.copy_to_slice(&mut tag_bytes);
    let tag = Tag::from_wire(tag_bytes)?;
    Some((from, tag, body))
}
