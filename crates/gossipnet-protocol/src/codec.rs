//! Frame header, frame and the streaming codec for TCP sockets.
//!
//! Header layout (27 bytes, little-endian):
//!   net id (1) | command (1) | flags (1) | sender PeerId (20) | payload length (4)
//!
//! Flags bit 0 marks a request; clear means response.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::identity::PeerId;
use crate::{ProtocolError, READ_BUFFER_SIZE};

const FLAG_REQUEST: u8 = 0x01;

/// Fixed-length frame metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub net_id: u8,
    pub command: u8,
    pub is_request: bool,
    pub peer_id: PeerId,
    pub data_length: u32,
}

impl Header {
    /// Encoded header size in bytes.
    pub const LENGTH: usize = 3 + PeerId::LENGTH + 4;

    pub fn new(net_id: u8, command: u8, is_request: bool, peer_id: PeerId, data_length: u32) -> Self {
        Self {
            net_id,
            command,
            is_request,
            peer_id,
            data_length,
        }
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Fails with [`ProtocolError::NoHeader`] when fewer than [`Header::LENGTH`]
    /// bytes are available. Bytes after the header are not inspected.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::LENGTH {
            return Err(ProtocolError::NoHeader {
                len: buf.len(),
                needed: Self::LENGTH,
            });
        }

        let mut cur = &buf[..Self::LENGTH];
        let net_id = cur.get_u8();
        let command = cur.get_u8();
        let flags = cur.get_u8();
        let mut id = [0u8; PeerId::LENGTH];
        cur.copy_to_slice(&mut id);
        let data_length = cur.get_u32_le();

        Ok(Self {
            net_id,
            command,
            is_request: flags & FLAG_REQUEST != 0,
            peer_id: PeerId::from_bytes(id),
            data_length,
        })
    }

    /// Total frame size this header announces.
    pub fn frame_len(&self) -> usize {
        Self::LENGTH + self.data_length as usize
    }

    pub fn put(&self, dst: &mut BytesMut) {
        dst.put_u8(self.net_id);
        dst.put_u8(self.command);
        dst.put_u8(if self.is_request { FLAG_REQUEST } else { 0 });
        dst.put_slice(self.peer_id.as_bytes());
        dst.put_u32_le(self.data_length);
    }
}

/// Header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame whose header length matches `payload`.
    pub fn new(
        net_id: u8,
        command: u8,
        is_request: bool,
        peer_id: PeerId,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        let header = Header::new(net_id, command, is_request, peer_id, payload.len() as u32);
        Self { header, payload }
    }

    /// Parse a complete frame. The buffer must hold exactly one frame:
    /// `buf.len() == Header::LENGTH + declared length`.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::parse(buf)?;
        let actual = buf.len() - Header::LENGTH;
        if actual != header.data_length as usize {
            return Err(ProtocolError::LengthMismatch {
                declared: header.data_length as usize,
                actual,
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[Header::LENGTH..]),
        })
    }

    pub fn command(&self) -> u8 {
        self.header.command
    }

    pub fn is_request(&self) -> bool {
        self.header.is_request
    }

    /// Whether the declared length agrees with the payload carried.
    pub fn is_consistent(&self) -> bool {
        self.header.data_length as usize == self.payload.len()
    }

    /// Encode header + payload. Does not validate consistency.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Header::LENGTH + self.payload.len());
        self.header.put(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Streaming codec for frames on a TCP byte stream.
///
/// Partial frames wait for more bytes. A foreign net id or an oversized
/// declared length is an error, after which the stream should be dropped.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    net_id: u8,
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(net_id: u8) -> Self {
        Self {
            net_id,
            max_payload: READ_BUFFER_SIZE,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the whole header first
        if src.len() < Header::LENGTH {
            src.reserve(Header::LENGTH - src.len());
            return Ok(None);
        }

        // Peek; nothing is consumed until the payload is here too
        let header = Header::parse(&src[..])?;
        if header.net_id != self.net_id {
            return Err(ProtocolError::NetMismatch {
                expected: self.net_id,
                got: header.net_id,
            });
        }

        let len = header.data_length as usize;
        if len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: self.max_payload,
            });
        }

        // Wait for the rest of the payload
        let total = header.frame_len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        // Consume header, then split off the payload
        src.advance(Header::LENGTH);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Header length must describe the payload we are about to write
        if !item.is_consistent() {
            return Err(ProtocolError::LengthMismatch {
                declared: item.header.data_length as usize,
                actual: item.payload.len(),
            });
        }
        if item.payload.len() > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: item.payload.len(),
                max: self.max_payload,
            });
        }

        dst.reserve(Header::LENGTH + item.payload.len());
        item.header.put(dst);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
