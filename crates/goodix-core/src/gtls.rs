//! GTLS handshake state machine.
//!
//! Three strictly sequential steps establish a mutually-authenticated
//! session: `ClientHello -> ServerIdentify -> ServerDone`. There are no
//! back-transitions; any failure aborts the whole machine and the session
//! must be re-initialized before another attempt. The transport IO for each
//! step lives in the session layer; this module owns the state, the key
//! material, and the pure per-step validation.

use std::fmt;

use thiserror::Error;

use crate::crypto::{DerivedSession, IDENTITY_LEN, NONCE_LEN, SessionKeys};
use crate::protocol::constants::{CLIENT_CONFIRM_MARKER, SERVER_IDENTITY_LEN};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("wrong SERVER_IDENTIFY length: expected {expected}, received {received}")]
    WrongLength { expected: usize, received: usize },

    #[error("client and server identity don't match: client {client}, server {server}")]
    IdentityMismatch { client: String, server: String },

    #[error("server rejected the handshake: {payload}")]
    ServerRejected { payload: String },

    #[error("wrong envelope tag: expected {expected:#06x}, received {received:#06x}")]
    UnexpectedTag { expected: u32, received: u32 },

    #[error("handshake step {step} entered out of order (state {state})")]
    OutOfOrder { step: &'static str, state: String },
}

/// Handshake progress. `Complete` is the only state in which the session
/// key material may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtlsState {
    ClientHello,
    ServerIdentify,
    ServerDone,
    Complete,
}

impl fmt::Display for GtlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GtlsState::ClientHello => write!(f, "CLIENT_HELLO"),
            GtlsState::ServerIdentify => write!(f, "SERVER_IDENTIFY"),
            GtlsState::ServerDone => write!(f, "SERVER_DONE"),
            GtlsState::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Session parameters owned exclusively by the device session.
///
/// Created at handshake start, mutated once per step, unusable before
/// `SERVER_DONE` is passed.
#[derive(Debug, Clone)]
pub struct GtlsParams {
    pub state: GtlsState,
    pub client_random: [u8; NONCE_LEN],
    pub server_random: Option<[u8; NONCE_LEN]>,
    pub server_identity: Option<[u8; IDENTITY_LEN]>,
    pub client_identity: Option<[u8; IDENTITY_LEN]>,
    pub keys: Option<SessionKeys>,
    pub hmac_client_counter: Option<u32>,
    pub hmac_server_counter: Option<u32>,
}

impl GtlsParams {
    pub fn new(client_random: [u8; NONCE_LEN]) -> Self {
        Self {
            state: GtlsState::ClientHello,
            client_random,
            server_random: None,
            server_identity: None,
            client_identity: None,
            keys: None,
            hmac_client_counter: None,
            hmac_server_counter: None,
        }
    }

    /// Whether the handshake finished and key material is usable.
    pub fn is_established(&self) -> bool {
        self.state == GtlsState::Complete
    }

    fn goto_state(&mut self, new_state: GtlsState) {
        tracing::debug!(from = %self.state, to = %new_state, "Handshake transition");
        self.state = new_state;
    }

    /// CLIENT_HELLO sent; await the server identity.
    pub fn on_client_hello_sent(&mut self) -> Result<(), HandshakeError> {
        self.expect_state(GtlsState::ClientHello, "CLIENT_HELLO")?;
        self.goto_state(GtlsState::ServerIdentify);
        Ok(())
    }

    /// Apply the SERVER_IDENTIFY payload and the derived key material,
    /// returning the CLIENT_CONFIRM reply payload.
    ///
    /// Fails with [`HandshakeError::IdentityMismatch`] unless the locally
    /// computed identity equals the one the sensor sent: the mutual proof
    /// that both ends hold the same pre-shared key.
    pub fn on_server_identify(
        &mut self,
        payload: &[u8],
        derived: DerivedSession,
    ) -> Result<Vec<u8>, HandshakeError> {
        self.expect_state(GtlsState::ServerIdentify, "SERVER_IDENTIFY")?;
        let (server_random, server_identity) = split_server_hello(payload)?;

        if derived.client_identity != server_identity {
            return Err(HandshakeError::IdentityMismatch {
                client: hex::encode(derived.client_identity),
                server: hex::encode(server_identity),
            });
        }

        self.server_random = Some(server_random);
        self.server_identity = Some(server_identity);
        self.client_identity = Some(derived.client_identity);
        self.keys = Some(derived.keys);
        self.goto_state(GtlsState::ServerDone);
        Ok(confirm_payload(&server_identity))
    }

    /// Validate the SERVER_DONE payload and arm the running HMAC counters.
    pub fn on_server_done(&mut self, payload: &[u8]) -> Result<(), HandshakeError> {
        self.expect_state(GtlsState::ServerDone, "SERVER_DONE")?;
        match payload.first() {
            Some(0) => {}
            _ => {
                return Err(HandshakeError::ServerRejected {
                    payload: hex::encode(payload),
                });
            }
        }

        // Keys are always present here: SERVER_IDENTIFY stores them before
        // this state becomes reachable.
        let (client_init, server_init) = match self.keys.as_ref() {
            Some(keys) => (keys.hmac_client_counter_init, keys.hmac_server_counter_init),
            None => {
                return Err(HandshakeError::OutOfOrder {
                    step: "SERVER_DONE",
                    state: self.state.to_string(),
                });
            }
        };
        self.hmac_client_counter = Some(client_init);
        self.hmac_server_counter = Some(server_init);
        self.goto_state(GtlsState::Complete);
        Ok(())
    }

    fn expect_state(&self, state: GtlsState, step: &'static str) -> Result<(), HandshakeError> {
        if self.state == state {
            Ok(())
        } else {
            Err(HandshakeError::OutOfOrder {
                step,
                state: self.state.to_string(),
            })
        }
    }
}

/// Split the 64-byte SERVER_IDENTIFY payload into random and identity.
pub fn split_server_hello(
    payload: &[u8],
) -> Result<([u8; NONCE_LEN], [u8; IDENTITY_LEN]), HandshakeError> {
    if payload.len() != SERVER_IDENTITY_LEN {
        return Err(HandshakeError::WrongLength {
            expected: SERVER_IDENTITY_LEN,
            received: payload.len(),
        });
    }
    let mut server_random = [0u8; NONCE_LEN];
    let mut server_identity = [0u8; IDENTITY_LEN];
    server_random.copy_from_slice(&payload[..NONCE_LEN]);
    server_identity.copy_from_slice(&payload[NONCE_LEN..]);
    Ok((server_random, server_identity))
}

/// Build the CLIENT_CONFIRM payload: server identity plus the fixed marker.
pub fn confirm_payload(server_identity: &[u8; IDENTITY_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(IDENTITY_LEN + CLIENT_CONFIRM_MARKER.len());
    out.extend_from_slice(server_identity);
    out.extend_from_slice(&CLIENT_CONFIRM_MARKER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, HmacSha256Provider};

    fn derived_for(cr: [u8; 32], sr: [u8; 32], psk: &[u8]) -> DerivedSession {
        HmacSha256Provider.derive_session_keys(&cr, &sr, psk)
    }

    fn server_hello(sr: [u8; 32], identity: [u8; 32]) -> Vec<u8> {
        let mut p = sr.to_vec();
        p.extend_from_slice(&identity);
        p
    }

    #[test]
    fn test_full_transition_sequence() {
        let psk = [0u8; 32];
        let cr = [0x11u8; 32];
        let sr = [0x22u8; 32];
        let derived = derived_for(cr, sr, &psk);

        let mut params = GtlsParams::new(cr);
        params.on_client_hello_sent().unwrap();
        assert_eq!(params.state, GtlsState::ServerIdentify);

        let hello = server_hello(sr, derived.client_identity);
        let confirm = params
            .on_server_identify(&hello, derived_for(cr, sr, &psk))
            .unwrap();
        assert_eq!(&confirm[..32], &derived.client_identity);
        assert_eq!(&confirm[32..], &CLIENT_CONFIRM_MARKER);
        assert_eq!(params.state, GtlsState::ServerDone);
        assert!(!params.is_established());

        params.on_server_done(&[0]).unwrap();
        assert!(params.is_established());
        let keys = params.keys.as_ref().unwrap();
        assert_eq!(params.hmac_client_counter, Some(keys.hmac_client_counter_init));
        assert_eq!(params.hmac_server_counter, Some(keys.hmac_server_counter_init));
    }

    #[test]
    fn test_wrong_length_fails() {
        let mut params = GtlsParams::new([0u8; 32]);
        params.on_client_hello_sent().unwrap();
        let derived = derived_for([0u8; 32], [0u8; 32], &[0u8; 32]);
        let err = params.on_server_identify(&[0u8; 63], derived).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::WrongLength {
                expected: 0x40,
                received: 63,
            }
        );
    }

    #[test]
    fn test_mismatched_psk_fails_identity_check() {
        let cr = [0x11u8; 32];
        let sr = [0x22u8; 32];
        // Sensor derived its identity from a different PSK.
        let sensor_side = derived_for(cr, sr, &[0xFFu8; 32]);

        let mut params = GtlsParams::new(cr);
        params.on_client_hello_sent().unwrap();
        let hello = server_hello(sr, sensor_side.client_identity);
        let err = params
            .on_server_identify(&hello, derived_for(cr, sr, &[0u8; 32]))
            .unwrap_err();
        assert!(matches!(err, HandshakeError::IdentityMismatch { .. }));
    }

    #[test]
    fn test_server_done_rejects_nonzero_status() {
        let psk = [0u8; 32];
        let cr = [1u8; 32];
        let sr = [2u8; 32];
        let derived = derived_for(cr, sr, &psk);

        let mut params = GtlsParams::new(cr);
        params.on_client_hello_sent().unwrap();
        let hello = server_hello(sr, derived.client_identity);
        params.on_server_identify(&hello, derived).unwrap();

        let err = params.on_server_done(&[0x05, 0xAA]).unwrap_err();
        assert_eq!(
            err,
            HandshakeError::ServerRejected {
                payload: "05aa".into(),
            }
        );
    }

    #[test]
    fn test_no_back_transitions() {
        let mut params = GtlsParams::new([0u8; 32]);
        params.on_client_hello_sent().unwrap();
        let err = params.on_client_hello_sent().unwrap_err();
        assert!(matches!(err, HandshakeError::OutOfOrder { .. }));
    }

    #[test]
    fn test_confirm_payload_layout() {
        let identity = [0xABu8; 32];
        let payload = confirm_payload(&identity);
        assert_eq!(payload.len(), 36);
        assert_eq!(&payload[..32], &identity);
        assert_eq!(&payload[32..], &[0xEE, 0xEE, 0xEE, 0xEE]);
    }
}
