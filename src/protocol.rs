// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! LoRa link frame format
//!
//! ```text
//! byte 0          kind     (0x10 DATA, 0x20 ACK, 0x30 NACK, 0x50 PACKET_ACK)
//! byte 1          seq
//! byte 2          total
//! byte 3          len      (0..=26)
//! bytes 4..4+len  payload
//! byte 4+len      CRC-8 over everything before it
//! ```

use crc::{Algorithm, Crc};

// ============================================================================
// Constants
// ============================================================================

/// Largest payload carried by a single frame
pub const MAX_PAYLOAD: usize = 26;

/// Kind, seq, total and len
pub const HEADER_LEN: usize = 4;

/// Header plus checksum, i.e. a frame with no payload
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + MAX_PAYLOAD;

/// A packet cannot have more chunks than `total` can count
pub const MAX_CHUNKS: usize = u8::MAX as usize;

pub const MAX_PACKET: usize = MAX_CHUNKS * MAX_PAYLOAD;

/// CRC-8, polynomial 0x31, init 0x00, MSB first, no reflection, no final XOR
const CRC_8_LORA_LINK: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xa2,
    residue: 0x00,
};

static CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_LORA_LINK);

// ============================================================================
// Frame Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Carries one chunk of a packet
    Data = 0x10,
    /// Receiver got the chunk named by seq/total
    Ack = 0x20,
    /// Reserved, never sent
    Nack = 0x30,
    /// Receiver reassembled the whole packet
    PacketAck = 0x50,
}

impl TryFrom<u8> for FrameKind {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x10 => Ok(FrameKind::Data),
            0x20 => Ok(FrameKind::Ack),
            0x30 => Ok(FrameKind::Nack),
            0x50 => Ok(FrameKind::PacketAck),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq: u8,
    pub total: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn ack(seq: u8, total: u8) -> Self {
        Frame { kind: FrameKind::Ack, seq, total, payload: Vec::new() }
    }

    pub fn packet_ack(total: u8) -> Self {
        Frame { kind: FrameKind::PacketAck, seq: 0, total, payload: Vec::new() }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self.kind, self.seq, self.total, &self.payload)
    }

    /// Number of bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        MIN_FRAME_LEN + self.payload.len().min(MAX_PAYLOAD)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short: {0} bytes, need at least {min}", min = MIN_FRAME_LEN)]
    TooShort(usize),

    #[error("declared payload length {0} exceeds maximum {max}", max = MAX_PAYLOAD)]
    PayloadTooLong(usize),

    #[error("frame truncated: declared {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("checksum mismatch: computed 0x{expected:02X}, frame carries 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    #[error("unknown frame kind: 0x{0:02X}")]
    UnknownKind(u8),
}

// ============================================================================
// Codec
// ============================================================================

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Builds a frame. Payloads longer than [`MAX_PAYLOAD`] are cut to fit;
/// chunking upstream never produces them.
pub fn encode(kind: FrameKind, seq: u8, total: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(MAX_PAYLOAD)];

    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
    frame.push(kind as u8);
    frame.push(seq);
    frame.push(total);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame.push(crc8(&frame));
    frame
}

/// Parses the frame at the start of `raw`. Bytes after the checksum are
/// ignored.
pub fn decode(raw: &[u8]) -> Result<Frame, DecodeError> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort(raw.len()));
    }

    let len = raw[3] as usize;
    if len > MAX_PAYLOAD {
        return Err(DecodeError::PayloadTooLong(len));
    }

    let body_len = HEADER_LEN + len;
    if raw.len() < body_len + 1 {
        return Err(DecodeError::Truncated { needed: body_len + 1, available: raw.len() });
    }

    let expected = crc8(&raw[..body_len]);
    let actual = raw[body_len];
    if expected != actual {
        return Err(DecodeError::Checksum { expected, actual });
    }

    Ok(Frame {
        kind: FrameKind::try_from(raw[0])?,
        seq: raw[1],
        total: raw[2],
        payload: raw[HEADER_LEN..body_len].to_vec(),
    })
}

/// Decodes every frame found in `raw`, skipping a byte at a time past
/// anything that does not parse.
pub fn decode_all(raw: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while raw.len() - offset >= MIN_FRAME_LEN {
        match decode(&raw[offset..]) {
            Ok(frame) => {
                offset += frame.wire_len();
                frames.push(frame);
            }
            Err(_) => offset += 1,
        }
    }

    frames
}

// ============================================================================
// Tests
// ============================================================================
