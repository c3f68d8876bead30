//! Chunked transfer of protocol messages over fixed-size bulk packets.
//!
//! A message longer than one OUT packet is split: the first packet carries
//! the message verbatim, every continuation packet repeats the message's
//! leading byte with its low bit forced to 1 (the continuation marker)
//! followed by further payload bytes. Inbound, the first packet's
//! `{cmd, length: u16 LE}` header says how much payload to reassemble.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{EMPTY_READ_LIMIT, EP_IN_MAX, EP_OUT_MAX};
use crate::protocol::message::ProtocolError;

/// Continuation marker: low bit of a chunk's leading byte.
pub const CONTINUATION_BIT: u8 = 0x01;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Split a wire message into OUT packets, each padded to `EP_OUT_MAX`.
pub fn split_packets(data: &[u8]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut sent = 0usize;
    while sent < data.len() {
        let mut packet = Vec::with_capacity(EP_OUT_MAX);
        if sent == 0 {
            let take = data.len().min(EP_OUT_MAX);
            packet.extend_from_slice(&data[..take]);
            sent += take;
        } else {
            packet.push(data[0] | CONTINUATION_BIT);
            let take = (data.len() - sent).min(EP_OUT_MAX - 1);
            packet.extend_from_slice(&data[sent..sent + take]);
            sent += take;
        }
        // The firmware expects full-size OUT transfers.
        packet.resize(EP_OUT_MAX, 0);
        packets.push(packet);
    }
    packets
}

/// Send one wire message as a sequence of bulk OUT packets.
///
/// Any transfer failure aborts the whole send; remaining data is discarded.
pub fn send_chunked<T: UsbTransport + ?Sized>(
    transport: &T,
    data: &[u8],
    timeout: Duration,
) -> Result<(), TransportError> {
    for packet in split_packets(data) {
        transport.bulk_out(&packet, timeout)?;
        trace!(chunk = %hex::encode(&packet), "Chunk sent");
    }
    Ok(())
}

/// Read one bulk IN packet, skipping zero-length packets.
///
/// The firmware idles with empty packets; the retry is bounded so a wedged
/// sensor cannot spin the caller forever.
pub fn receive_chunk<T: UsbTransport + ?Sized>(
    transport: &T,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    for _ in 0..EMPTY_READ_LIMIT {
        let chunk = transport.bulk_in(EP_IN_MAX, timeout)?;
        if !chunk.is_empty() {
            trace!(chunk = %hex::encode(&chunk), "Chunk received");
            return Ok(chunk);
        }
    }
    Err(TransportError::NoData {
        attempts: EMPTY_READ_LIMIT,
    })
}

/// Reassemble one wire message from bulk IN packets.
///
/// Returns the full buffer (header included) for the message codec.
pub fn receive_message<T: UsbTransport + ?Sized>(
    transport: &T,
    timeout: Duration,
) -> Result<Vec<u8>, ChunkError> {
    let mut buffer = receive_chunk(transport, timeout)?;
    if buffer.len() < 3 {
        return Err(ProtocolError::Malformed {
            expected: 3,
            actual: buffer.len(),
        }
        .into());
    }

    let cmd = buffer[0];
    let length = u16::from_le_bytes([buffer[1], buffer[2]]) as usize;
    let total = 3 + length;

    let mut bare_chunks = 0u32;
    while buffer.len() < total {
        let chunk = receive_chunk(transport, timeout)?;
        let contd = chunk[0];
        if contd & !CONTINUATION_BIT != cmd {
            return Err(ProtocolError::ContinuationMismatch {
                expected: cmd,
                received: contd,
            }
            .into());
        }
        if chunk.len() < 2 {
            // A lone continuation byte carries no payload; bound it like
            // the empty-packet case so a wedged sensor cannot stall
            // reassembly forever.
            bare_chunks += 1;
            if bare_chunks >= EMPTY_READ_LIMIT {
                return Err(TransportError::NoData {
                    attempts: bare_chunks,
                }
                .into());
            }
            continue;
        }
        buffer.extend_from_slice(&chunk[1..]);
    }

    debug!(cmd = %format!("{cmd:#04x}"), length, "Message reassembled");
    Ok(buffer)
}
