//! Message framing and parsing.
//!
//! A reassembled protocol message looks like:
//!
//! ```text
//! byte 0      cmd byte: category << 4 | command << 1
//!             (the low bit is reserved for the chunk continuation marker)
//! bytes 1..3  length: u16 LE = payload length + 2
//! bytes 3..N  payload
//! last 2      checksum: u16 LE, or 0x8888 meaning "not computed"
//! ```

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{CATEGORY_ACK, CMD_ACK};

/// Sentinel checksum value meaning the sender skipped checksum computation.
pub const NO_CHECKSUM_SENTINEL: u16 = 0x8888;

/// Seed for the message checksum.
const CHECKSUM_BASE: u16 = 0xAAAA;

/// Header (cmd + length) plus trailing checksum.
const ENVELOPE_OVERHEAD: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: need {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },

    #[error("checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumMismatch { computed: u16, received: u16 },

    #[error(
        "reply identity mismatch: expected category {expected_category:#x} command \
         {expected_command:#x}, received category {category:#x} command {command:#x}"
    )]
    IdentityMismatch {
        expected_category: u8,
        expected_command: u8,
        category: u8,
        command: u8,
    },

    #[error("firmware did not acknowledge category {category:#x} command {command:#x}")]
    NotAcknowledged { category: u8, command: u8 },

    #[error("continuation byte mismatch: expected {expected:#04x}, received {received:#04x}")]
    ContinuationMismatch { expected: u8, received: u8 },
}

/// A single protocol message. Identity for request/response matching is
/// `(category, command)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub category: u8,
    pub command: u8,
    pub payload: Vec<u8>,
    /// Checksum carried on the wire, `None` when the sender used the
    /// no-checksum sentinel.
    pub checksum: Option<u16>,
}

impl Message {
    pub fn new(category: u8, command: u8, payload: Vec<u8>) -> Self {
        debug_assert!(category <= 0xF, "category must fit in 4 bits");
        debug_assert!(command <= 0x7, "command must fit in 3 bits");
        Self {
            category,
            command,
            payload,
            checksum: None,
        }
    }

    /// Leading wire byte. The low bit stays clear; the chunk layer sets it
    /// on continuation packets.
    pub fn cmd_byte(&self) -> u8 {
        self.category << 4 | self.command << 1
    }
}

/// Serialize a message into the buffer consumed by the chunk layer.
///
/// With `with_checksum = false` the trailer holds the `0x8888` sentinel and
/// the receiver skips verification. With `with_envelope = false` only the
/// payload and trailer are emitted, without the cmd/length header; every
/// current call site passes `true`.
pub fn encode(message: &Message, with_checksum: bool, with_envelope: bool) -> Vec<u8> {
    let length = (message.payload.len() + 2) as u16;
    let mut out = Vec::with_capacity(message.payload.len() + ENVELOPE_OVERHEAD);
    if with_envelope {
        out.push(message.cmd_byte());
        out.extend_from_slice(&length.to_le_bytes());
    }
    out.extend_from_slice(&message.payload);

    let trailer = if with_checksum {
        checksum_over(&out)
    } else {
        NO_CHECKSUM_SENTINEL
    };
    out.extend_from_slice(&trailer.to_le_bytes());
    out
}

/// Parse a reassembled buffer back into a message.
///
/// Trailing bytes beyond the declared length are ignored; IN transfers are
/// padded to the packet size by the firmware.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    if bytes.len() < ENVELOPE_OVERHEAD {
        return Err(ProtocolError::Malformed {
            expected: ENVELOPE_OVERHEAD,
            actual: bytes.len(),
        });
    }

    let cmd = bytes[0];
    let length = LittleEndian::read_u16(&bytes[1..3]) as usize;
    let total = 3 + length;
    if length < 2 || bytes.len() < total {
        return Err(ProtocolError::Malformed {
            expected: total.max(ENVELOPE_OVERHEAD),
            actual: bytes.len(),
        });
    }

    let payload = bytes[3..total - 2].to_vec();
    let stored = LittleEndian::read_u16(&bytes[total - 2..total]);

    let checksum = if stored == NO_CHECKSUM_SENTINEL {
        None
    } else {
        let computed = checksum_over(&bytes[..total - 2]);
        if computed != stored {
            return Err(ProtocolError::ChecksumMismatch {
                computed,
                received: stored,
            });
        }
        Some(stored)
    };

    Ok(Message {
        category: cmd >> 4,
        command: (cmd >> 1) & 0x7,
        payload,
        checksum,
    })
}

/// Validate a generic firmware acknowledgment.
///
/// An ACK is category `0xB` / command `0` with a payload whose first byte
/// echoes the acknowledged cmd byte.
pub fn check_ack(message: &Message) -> Result<(), ProtocolError> {
    if message.category != CATEGORY_ACK || message.command != CMD_ACK || message.payload.is_empty()
    {
        return Err(ProtocolError::NotAcknowledged {
            category: message.category,
            command: message.command,
        });
    }
    Ok(())
}

/// Identity equality used by the command layer to validate replies.
pub fn matches(expected_category: u8, expected_command: u8, message: &Message) -> bool {
    message.category == expected_category && message.command == expected_command
}

/// Like [`matches`] but reports both identities on disagreement.
pub fn expect_identity(
    expected_category: u8,
    expected_command: u8,
    message: &Message,
) -> Result<(), ProtocolError> {
    if matches(expected_category, expected_command, message) {
        Ok(())
    } else {
        Err(ProtocolError::IdentityMismatch {
            expected_category,
            expected_command,
            category: message.category,
            command: message.command,
        })
    }
}

fn checksum_over(bytes: &[u8]) -> u16 {
    let sum = bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    CHECKSUM_BASE.wrapping_sub(sum)
}
