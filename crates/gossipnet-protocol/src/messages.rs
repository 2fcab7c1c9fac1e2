//! Payload encodings for the built-in commands.
//!
//! Ping carries no payload. Handshake carries the sender's id and listening
//! port. Peer exchange carries a counted list of node records.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::identity::PeerId;
use crate::ProtocolError;

// ============================================================================
// Handshake
// ============================================================================

/// Identity and listening port announced during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePayload {
    pub peer_id: PeerId,
    pub port: u16,
}

impl HandshakePayload {
    pub const LENGTH: usize = PeerId::LENGTH + 2;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LENGTH);
        buf.put_slice(self.peer_id.as_bytes());
        buf.put_u16_le(self.port);
        buf.freeze()
    }

    /// Decode a handshake payload. The slice must be exactly [`Self::LENGTH`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != Self::LENGTH {
            return Err(ProtocolError::LengthMismatch {
                declared: Self::LENGTH,
                actual: buf.len(),
            });
        }
        let mut cur = buf;
        let mut id = [0u8; PeerId::LENGTH];
        cur.copy_to_slice(&mut id);
        let port = cur.get_u16_le();
        Ok(Self {
            peer_id: PeerId::from_bytes(id),
            port,
        })
    }
}

// ============================================================================
// Peer exchange
// ============================================================================

/// A peer known through exchange, not necessarily connected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub peer_id: PeerId,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16, peer_id: PeerId) -> Self {
        Self {
            host: host.into(),
            port,
            peer_id,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Counted list of node records.
///
/// Layout: count (u16) then per node: PeerId (20) | host len (u8) | host | port (u16).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerList {
    pub nodes: Vec<Node>,
}

impl PeerList {
    /// Most records a single list may carry.
    pub const MAX_NODES: usize = u16::MAX as usize;
    /// Smallest encoded node: id, host length, empty host, port.
    const MIN_RECORD: usize = PeerId::LENGTH + 1 + 2;

    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Encode the list. Records beyond [`Self::MAX_NODES`] and hosts longer
    /// than 255 bytes are skipped.
    pub fn encode(&self) -> Bytes {
        let nodes: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| {
                let fits = n.host.len() <= u8::MAX as usize;
                if !fits {
                    tracing::debug!(peer = %n.peer_id, "peer list: host too long, skipped");
                }
                fits
            })
            .take(Self::MAX_NODES)
            .collect();

        let mut buf = BytesMut::with_capacity(
            2 + nodes
                .iter()
                .map(|n| PeerId::LENGTH + 1 + n.host.len() + 2)
                .sum::<usize>(),
        );
        buf.put_u16_le(nodes.len() as u16);
        for node in nodes {
            buf.put_slice(node.peer_id.as_bytes());
            buf.put_u8(node.host.len() as u8);
            buf.put_slice(node.host.as_bytes());
            buf.put_u16_le(node.port);
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut cur = buf;
        if cur.remaining() < 2 {
            return Err(malformed("missing node count"));
        }
        let count = cur.get_u16_le() as usize;

        // the count is untrusted; size by the smallest record that could follow
        let mut nodes = Vec::with_capacity(count.min(cur.remaining() / Self::MIN_RECORD));
        for i in 0..count {
            if cur.remaining() < PeerId::LENGTH + 1 {
                return Err(malformed(format!("node {i}: truncated record")));
            }
            let mut id = [0u8; PeerId::LENGTH];
            cur.copy_to_slice(&mut id);
            let host_len = cur.get_u8() as usize;

            if cur.remaining() < host_len + 2 {
                return Err(malformed(format!("node {i}: truncated host")));
            }
            let host = std::str::from_utf8(&cur[..host_len])
                .map_err(|e| malformed(format!("node {i}: host is not utf-8: {e}")))?
                .to_string();
            cur.advance(host_len);
            let port = cur.get_u16_le();

            nodes.push(Node {
                host,
                port,
                peer_id: PeerId::from_bytes(id),
            });
        }

        if cur.has_remaining() {
            return Err(malformed(format!("{} trailing bytes", cur.remaining())));
        }

        Ok(Self { nodes })
    }
}

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedPayload(msg.into())
}
