//! Wire format for the seekable socket protocol.
//!
//! Every packet is a fixed 12-byte header followed by a type-dependent
//! payload. All multi-byte integers are little-endian on both peers.
//!
//! ```text
//! Offset  Size  Field
//! 0       4     tag (0xF1F20001)
//! 4       2     packet_type (1=HEADER, 2=DATA, 3=SEEK, 4=SEEK_RESULT)
//! 6       2     data_size (payload bytes that follow)
//! 8       4     reserved (zero on write, ignored on read)
//! 12      N     payload
//! ```
//!
//! A zero-length DATA packet is the end-of-stream marker.

use crate::error::{ProtoError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic tag leading every packet; guards against misaligned reads.
pub const PACKET_TAG: u32 = 0xF1F2_0001;

/// Fixed packet header size: tag(4) + type(2) + data_size(2) + reserved(4).
pub const HEADER_LEN: usize = 12;

/// Maximum payload bytes in a single DATA packet.
pub const MAX_DATA_SIZE: usize = 4 * 1024;

/// HEADER payload: total_length(8) + max_chunk_size(4).
pub const STREAM_HEADER_PAYLOAD_LEN: usize = 12;

/// Minimum SEEK payload: offset_bytes(8). A trailing ms hint adds 4.
pub const SEEK_PAYLOAD_MIN_LEN: usize = 8;

/// SEEK_RESULT payload: new_position(8).
pub const SEEK_RESULT_PAYLOAD_LEN: usize = 8;

/// Sentinel for "no millisecond hint" in a SEEK payload.
pub const SEEK_MS_NONE: i32 = i32::MIN;

// =============================================================================
// Packet header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    Header = 1,
    Data = 2,
    Seek = 3,
    SeekResult = 4,
}

impl PacketType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Header),
            2 => Some(Self::Data),
            3 => Some(Self::Seek),
            4 => Some(Self::SeekResult),
            _ => None,
        }
    }
}

/// Decoded/encodable fixed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub data_size: u16,
}

impl PacketHeader {
    /// Builds a header, validating the payload size against the
    /// protocol maximum. Oversized requests are caller bugs and are
    /// reported as [`ProtoError::InvalidArgument`].
    pub fn new(packet_type: PacketType, data_size: usize) -> Result<Self> {
        if data_size > MAX_DATA_SIZE {
            return Err(ProtoError::InvalidArgument(format!(
                "data_size {} exceeds MAX_DATA_SIZE {}",
                data_size, MAX_DATA_SIZE
            )));
        }
        Ok(Self {
            packet_type,
            // data_size fits u16: MAX_DATA_SIZE is 4096
            data_size: data_size as u16,
        })
    }

    /// Appends the 12 header bytes to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u32_le(PACKET_TAG);
        buf.put_u16_le(self.packet_type as u16);
        buf.put_u16_le(self.data_size);
        buf.put_u32_le(0); // reserved
    }

    /// Validates and decodes a received header.
    ///
    /// Returns `None` unless the tag matches, the type is known, and
    /// the declared size is non-zero. This deliberately rejects the
    /// zero-length EOF marker: the sender-side read path only ever
    /// expects SEEK packets, and malformed input must map to "no
    /// request" rather than an error (the stream may be truncated by a
    /// partial read, which is not a protocol violation).
    pub fn decode(buf: &[u8]) -> Option<PacketHeader> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut buf = buf;
        if buf.get_u32_le() != PACKET_TAG {
            return None;
        }
        let packet_type = PacketType::from_u16(buf.get_u16_le())?;
        let data_size = buf.get_u16_le();
        if data_size == 0 {
            return None;
        }
        Some(PacketHeader {
            packet_type,
            data_size,
        })
    }
}

// =============================================================================
// HEADER - stream metadata, sent once after connect
// =============================================================================

/// First packet on the wire: advertises the total stream length and the
/// largest DATA payload the sender will use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Total track length in bytes. Always > 0.
    pub total_length: i64,
    /// Upper bound on DATA payload sizes this sender will emit.
    pub max_chunk_size: u32,
}

impl StreamHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + STREAM_HEADER_PAYLOAD_LEN);
        PacketHeader {
            packet_type: PacketType::Header,
            data_size: STREAM_HEADER_PAYLOAD_LEN as u16,
        }
        .encode_into(&mut buf);
        buf.put_i64_le(self.total_length);
        buf.put_u32_le(self.max_chunk_size);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < STREAM_HEADER_PAYLOAD_LEN {
            return Err(ProtoError::InvalidPacket(format!(
                "HEADER payload too short: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            total_length: payload.get_i64_le(),
            max_chunk_size: payload.get_u32_le(),
        })
    }
}

// =============================================================================
// SEEK - consumer requests a new stream position
// =============================================================================

/// Decoded seek request from the consumer.
///
/// `offset_bytes >= 0` seeks from the start of the stream, `< 0` from
/// the end. Returned by value; nothing is retained by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub offset_bytes: i64,
    /// Optional position hint in milliseconds, for senders that map
    /// time to byte offsets themselves (e.g. VBR streams).
    pub hint_ms: Option<i32>,
}

impl SeekRequest {
    pub fn encode(&self) -> Bytes {
        let payload_len = match self.hint_ms {
            Some(_) => SEEK_PAYLOAD_MIN_LEN + 4,
            None => SEEK_PAYLOAD_MIN_LEN,
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        PacketHeader {
            packet_type: PacketType::Seek,
            data_size: payload_len as u16,
        }
        .encode_into(&mut buf);
        buf.put_i64_le(self.offset_bytes);
        if let Some(ms) = self.hint_ms {
            buf.put_i32_le(ms);
        }
        buf.freeze()
    }

    /// Decodes a SEEK payload. The trailing millisecond hint is
    /// optional; its sentinel value also means "absent".
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < SEEK_PAYLOAD_MIN_LEN {
            return Err(ProtoError::InvalidPacket(format!(
                "SEEK payload too short: {} bytes",
                payload.len()
            )));
        }
        let offset_bytes = payload.get_i64_le();
        let hint_ms = if payload.remaining() >= 4 {
            match payload.get_i32_le() {
                SEEK_MS_NONE => None,
                ms => Some(ms),
            }
        } else {
            None
        };
        Ok(Self {
            offset_bytes,
            hint_ms,
        })
    }
}

// =============================================================================
// SEEK_RESULT - sender acknowledges a seek
// =============================================================================

/// Sender's definitive reply to a SEEK. The consumer holds off
/// processing any other packet until this arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekResult {
    /// New absolute byte position, or negative if the seek failed.
    pub new_position: i64,
}

impl SeekResult {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + SEEK_RESULT_PAYLOAD_LEN);
        PacketHeader {
            packet_type: PacketType::SeekResult,
            data_size: SEEK_RESULT_PAYLOAD_LEN as u16,
        }
        .encode_into(&mut buf);
        buf.put_i64_le(self.new_position);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < SEEK_RESULT_PAYLOAD_LEN {
            return Err(ProtoError::InvalidPacket(format!(
                "SEEK_RESULT payload too short: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            new_position: payload.get_i64_le(),
        })
    }

    pub fn is_failure(&self) -> bool {
        self.new_position < 0
    }
}
