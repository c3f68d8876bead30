//! Protocol layer: constants, message codec, MCU sub-envelope.

pub mod constants;
pub mod mcu;
pub mod message;

pub use constants::*;
pub use mcu::McuEnvelope;
pub use message::{Message, ProtocolError, check_ack, decode, encode, expect_identity, matches};
