//! CAN frame encoding and decoding
//!
//! Wire format (13 bytes, network byte order):
//!
//! ```text
//! [PRIO] [CMD] [HASH_H HASH_L] [DLC] [D0..D7]
//! ```
//!
//! The command byte carries the protocol command code shifted left by one;
//! the least significant bit is the response flag. The hash identifies the
//! sending participant and correlates replies to addressed requests.

use crate::error::{Error, Result};

/// Size of a CAN frame on the wire
pub const FRAME_SIZE: usize = 13;

/// Maximum payload length (DLC)
pub const MAX_DLC: u8 = 8;

/// A decoded CAN frame
///
/// Immutable value type. Outbound frames awaiting replies collect their
/// correlated responses in a [`crate::transport::Exchange`], not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub priority: u8,
    /// Raw command byte including the response bit
    pub command: u8,
    pub hash: u16,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    /// Build a frame from a raw command byte and payload
    ///
    /// The payload is truncated to 8 bytes; DLC reflects the stored length.
    pub fn new(command: u8, hash: u16, payload: &[u8]) -> Self {
        let mut data = [0u8; 8];
        let len = payload.len().min(8);
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            priority: 0,
            command,
            hash,
            dlc: len as u8,
            data,
        }
    }

    /// Encode into the 13-byte wire representation
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = self.priority;
        bytes[1] = self.command;
        bytes[2..4].copy_from_slice(&self.hash.to_be_bytes());
        bytes[4] = self.dlc;
        bytes[5..13].copy_from_slice(&self.data);
        bytes
    }

    /// Decode from a 13-byte wire representation
    ///
    /// Fails only on wrong length or a DLC above 8. Unknown command bytes
    /// decode fine; classification happens downstream so the dispatcher can
    /// skip codes it does not understand.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FRAME_SIZE {
            return Err(Error::MalformedFrame(format!(
                "expected {} bytes, got {}",
                FRAME_SIZE,
                bytes.len()
            )));
        }
        let dlc = bytes[4];
        if dlc > MAX_DLC {
            return Err(Error::MalformedFrame(format!("DLC {} exceeds 8", dlc)));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[5..13]);
        Ok(Self {
            priority: bytes[0],
            command: bytes[1],
            hash: u16::from_be_bytes([bytes[2], bytes[3]]),
            dlc,
            data,
        })
    }

    /// Whether the response bit is set
    #[inline]
    pub fn is_response(&self) -> bool {
        self.command & 0x01 != 0
    }

    /// Protocol command code with the response bit stripped
    #[inline]
    pub fn command_code(&self) -> u8 {
        self.command >> 1
    }

    /// Device uid embedded in the first four payload bytes
    #[inline]
    pub fn device_uid(&self) -> u32 {
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Valid payload bytes
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Whether this frame is a reply correlated to `request`
    ///
    /// A reply matches when the command codes pair up (request code with the
    /// response bit set) and either the hash bytes are equal or the uid in
    /// the reply payload equals the addressed uid. A payload-less request is
    /// a broadcast (member ping): every reply with the paired code counts.
    pub fn is_response_to(&self, request: &CanFrame) -> bool {
        if !self.is_response() || request.is_response() {
            return false;
        }
        if self.command_code() != request.command_code() {
            return false;
        }
        if request.dlc == 0 {
            return true;
        }
        if self.hash == request.hash {
            return true;
        }
        self.dlc >= 4 && request.dlc >= 4 && self.device_uid() == request.device_uid()
    }
}

/// Derive a participant hash from a uid
///
/// The high and low uid halves are folded together, then bits 7..9 are
/// forced to the 0b110 marker that distinguishes software participants on
/// the bus.
pub fn generate_hash(uid: u32) -> u16 {
    let folded = ((uid >> 16) ^ (uid & 0xFFFF)) as u16;
    (folded & 0xFC7F) | 0x0300
}
