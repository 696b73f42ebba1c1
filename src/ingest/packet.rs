//! Wire format of sample packets.
//!
//! Every packet starts with a 16-byte little-endian header followed by
//! `times_per_packet × nr_subbands × nr_receivers × bytes_per_sample`
//! payload bytes. The payload is time-major: all subbands of the first
//! time sample, then all subbands of the next, each subband holding one
//! sample per receiver.

use thiserror::Error;

/// Packet header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest packet a source has to accept (jumbo frame).
pub const MAX_PACKET_SIZE: usize = 9000;

/// Errors that can occur while decoding a packet.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet too short: {size} bytes")]
    Truncated { size: usize },

    #[error("packet size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("packet carries {actual} subbands, expected {expected}")]
    SubbandMismatch { expected: usize, actual: usize },
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Sample count of the first time sample in the payload.
    pub timestamp: i64,
    /// Receiver group the packet belongs to.
    pub group: u16,
    pub nr_subbands: u16,
}

/// Shape of the packets of one receiver group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub times_per_packet: usize,
    pub nr_subbands: usize,
    pub nr_receivers: usize,
    pub bytes_per_sample: usize,
}

impl PacketLayout {
    /// Bytes holding every receiver's sample for one (time, subband).
    pub fn block_size(&self) -> usize {
        self.nr_receivers * self.bytes_per_sample
    }

    pub fn payload_size(&self) -> usize {
        self.times_per_packet * self.nr_subbands * self.block_size()
    }

    pub fn packet_size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }

    /// Payload offset of the block for `(time, subband)`.
    pub fn block_offset(&self, time: usize, subband: usize) -> usize {
        (time * self.nr_subbands + subband) * self.block_size()
    }

    /// Validate a full packet and decode its header.
    pub fn check(&self, data: &[u8]) -> Result<PacketHeader, ParseError> {
        let header = parse_header(data)?;

        if data.len() != self.packet_size() {
            return Err(ParseError::SizeMismatch {
                expected: self.packet_size(),
                actual: data.len(),
            });
        }

        if header.nr_subbands as usize != self.nr_subbands {
            return Err(ParseError::SubbandMismatch {
                expected: self.nr_subbands,
                actual: header.nr_subbands as usize,
            });
        }

        Ok(header)
    }
}

/// Decode the header of a raw packet.
pub fn parse_header(data: &[u8]) -> Result<PacketHeader, ParseError> {
    if data.len() < HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    Ok(PacketHeader {
        timestamp: read_u64_le(data, 0) as i64,
        group: read_u16_le(data, 8),
        nr_subbands: read_u16_le(data, 10),
    })
}

/// Build a packet from a header and payload.
pub fn encode_packet(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(header.timestamp as u64).to_le_bytes());
    buf.extend_from_slice(&header.group.to_le_bytes());
    buf.extend_from_slice(&header.nr_subbands.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(payload);
    buf
}

// ---------------------------------------------------------------------------
// Byte-reading helpers; callers check lengths first.
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
