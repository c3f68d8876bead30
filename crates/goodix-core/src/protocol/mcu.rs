//! MCU sub-envelope, nested inside category `0xD` / command `1` messages.
//!
//! Wire layout: `tag: u32 LE, total_length: u32 LE, payload` where
//! `total_length` counts the 8 header bytes as well.

use byteorder::{ByteOrder, LittleEndian};

use super::message::ProtocolError;

const MCU_HEADER_LEN: usize = 8;

/// A typed sub-message used during the handshake and config exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuEnvelope {
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl McuEnvelope {
    pub fn new(tag: u32, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// Serialize into the payload of a carrier message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MCU_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&((self.payload.len() + MCU_HEADER_LEN) as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse from a carrier message payload. The declared `total_length`
    /// must match the actual buffer size exactly.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < MCU_HEADER_LEN {
            return Err(ProtocolError::Malformed {
                expected: MCU_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let tag = LittleEndian::read_u32(&bytes[0..4]);
        let total = LittleEndian::read_u32(&bytes[4..8]) as usize;
        if total != bytes.len() {
            return Err(ProtocolError::Malformed {
                expected: total,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            tag,
            payload: bytes[MCU_HEADER_LEN..].to_vec(),
        })
    }
}
