//! Binary packet framing.
//!
//! On-wire layout (all integers big-endian):
//!
//! ```text
//! +----------+----------+---------------+-------------+--------+------+
//! | operator | sequence | header_length | body_length | header | body |
//! | 4 bytes  | 8 bytes  |   4 bytes     |   4 bytes   | H      | B    |
//! +----------+----------+---------------+-------------+--------+------+
//! ```
//!
//! The total framed size is `20 + H + B`; frames exceeding the configured
//! max payload are rejected before the header or body is consumed.

use crate::error::ProtocolError;
use crate::plugin::PacketPlugin;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Size of the fixed packet preamble in bytes (4 + 8 + 4 + 4).
pub const PREAMBLE_SIZE: usize = 20;

/// Derives an operator code from a route pattern (CRC32-IEEE).
pub fn operator_code(pattern: &str) -> u32 {
    crc32fast::hash(pattern.as_bytes())
}

/// An immutable framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Operator code (CRC32-IEEE of the route pattern, or 0 for heartbeat).
    pub operator: u32,
    /// Correlation token chosen by the sender and echoed by the peer.
    pub sequence: i64,
    /// Raw `k=v;` header bytes.
    pub header: Bytes,
    /// Raw body bytes.
    pub body: Bytes,
}

impl Packet {
    /// Creates a packet from raw header and body bytes.
    pub fn new(operator: u32, sequence: i64, header: Bytes, body: Bytes) -> Self {
        Self {
            operator,
            sequence,
            header,
            body,
        }
    }

    /// Creates a packet, passing header and body through an ordered
    /// transform chain first.
    pub fn with_plugins(
        operator: u32,
        sequence: i64,
        header: Bytes,
        body: Bytes,
        plugins: &[Arc<dyn PacketPlugin>],
    ) -> Result<Self, ProtocolError> {
        let (header, body) = crate::plugin::apply_chain(plugins, header, body)?;
        Ok(Self::new(operator, sequence, header, body))
    }

    pub fn header_length(&self) -> u32 {
        self.header.len() as u32
    }

    pub fn body_length(&self) -> u32 {
        self.body.len() as u32
    }

    /// Total framed size including the preamble.
    pub fn frame_length(&self) -> usize {
        PREAMBLE_SIZE + self.header.len() + self.body.len()
    }

    /// Serializes the whole frame into one contiguous buffer.
    ///
    /// A single buffer means a single write on the socket, so frames from
    /// concurrent handlers never interleave.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.frame_length());
        buf.put_u32(self.operator);
        buf.put_i64(self.sequence);
        buf.put_u32(self.header_length());
        buf.put_u32(self.body_length());
        buf.put_slice(&self.header);
        buf.put_slice(&self.body);
        buf
    }

    /// Decodes the next frame from a streaming buffer.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a complete frame.
    /// Oversize frames fail with `PayloadTooLarge` without consuming the
    /// declared header or body.
    pub fn decode(buf: &mut BytesMut, max_payload: u32) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < PREAMBLE_SIZE {
            return Ok(None);
        }

        let operator = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let sequence = i64::from_be_bytes(buf[4..12].try_into().unwrap());
        let header_length = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let body_length = u32::from_be_bytes(buf[16..20].try_into().unwrap());

        let frame_length = (PREAMBLE_SIZE as u64) + header_length as u64 + body_length as u64;
        if frame_length > max_payload as u64 {
            return Err(ProtocolError::PayloadTooLarge {
                size: frame_length as u32,
                max: max_payload,
            });
        }

        if (buf.len() as u64) < frame_length {
            return Ok(None);
        }

        buf.advance(PREAMBLE_SIZE);
        let header = buf.split_to(header_length as usize).freeze();
        let body = buf.split_to(body_length as usize).freeze();

        Ok(Some(Self {
            operator,
            sequence,
            header,
            body,
        }))
    }

    /// Decodes one frame from a single datagram.
    ///
    /// The whole frame must fit in the datagram; a datagram shorter than
    /// the declared lengths is an error (the caller drops it).
    pub fn from_datagram(data: &[u8], max_payload: u32) -> Result<Self, ProtocolError> {
        if data.len() < PREAMBLE_SIZE {
            return Err(ProtocolError::ShortRead {
                needed: PREAMBLE_SIZE - data.len(),
            });
        }

        let mut buf = BytesMut::from(data);
        match Self::decode(&mut buf, max_payload)? {
            Some(packet) => Ok(packet),
            None => Err(ProtocolError::ShortRead {
                needed: PREAMBLE_SIZE,
            }),
        }
    }
}

/// Accumulates socket reads and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Appends raw bytes read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete frame.
    pub fn decode(&mut self, max_payload: u32) -> Result<Option<Packet>, ProtocolError> {
        Packet::decode(&mut self.buffer, max_payload)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
