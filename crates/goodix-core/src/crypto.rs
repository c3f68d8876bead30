//! Opaque crypto provider consumed by the handshake.
//!
//! The protocol layer only needs a random nonce source and a key-derivation
//! function over the client/server randoms and the pre-shared key. The
//! default provider derives everything with HMAC-SHA256; swap it out if the
//! firmware revision uses a different KDF.

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 32;
pub const IDENTITY_LEN: usize = 32;

/// Symmetric session material produced by the key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub symmetric_key: [u8; 16],
    pub symmetric_iv: [u8; 16],
    pub hmac_key: [u8; 32],
    pub hmac_client_counter_init: u32,
    pub hmac_server_counter_init: u32,
}

/// Key derivation output: session keys plus the locally computed identity
/// that must match the one the sensor sent.
#[derive(Debug, Clone)]
pub struct DerivedSession {
    pub keys: SessionKeys,
    pub client_identity: [u8; IDENTITY_LEN],
}

/// Cryptographic operations the session layer depends on.
pub trait CryptoProvider: Send + Sync {
    /// Fresh random nonce for the CLIENT_HELLO step.
    fn random_nonce(&self) -> [u8; NONCE_LEN];

    /// Derive session key material and the local identity from both randoms
    /// and the pre-shared key.
    fn derive_session_keys(
        &self,
        client_random: &[u8; NONCE_LEN],
        server_random: &[u8; NONCE_LEN],
        psk: &[u8],
    ) -> DerivedSession;
}

/// Default provider: HMAC-SHA256 expansion keyed with the PSK.
pub struct HmacSha256Provider;

impl HmacSha256Provider {
    fn prf_block(
        psk: &[u8],
        label: &[u8],
        index: u8,
        client_random: &[u8],
        server_random: &[u8],
    ) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(psk).expect("HMAC accepts any key length");
        mac.update(label);
        mac.update(&[index]);
        mac.update(client_random);
        mac.update(server_random);
        mac.finalize().into_bytes().into()
    }
}

impl CryptoProvider for HmacSha256Provider {
    fn random_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    fn derive_session_keys(
        &self,
        client_random: &[u8; NONCE_LEN],
        server_random: &[u8; NONCE_LEN],
        psk: &[u8],
    ) -> DerivedSession {
        let block1 = Self::prf_block(psk, b"gtls-session", 1, client_random, server_random);
        let block2 = Self::prf_block(psk, b"gtls-session", 2, client_random, server_random);
        let block3 = Self::prf_block(psk, b"gtls-session", 3, client_random, server_random);
        let identity = Self::prf_block(psk, b"gtls-identity", 0, client_random, server_random);

        let mut symmetric_key = [0u8; 16];
        let mut symmetric_iv = [0u8; 16];
        symmetric_key.copy_from_slice(&block1[..16]);
        symmetric_iv.copy_from_slice(&block1[16..]);

        let keys = SessionKeys {
            symmetric_key,
            symmetric_iv,
            hmac_key: block2,
            hmac_client_counter_init: u32::from_le_bytes(block3[0..4].try_into().unwrap()),
            hmac_server_counter_init: u32::from_le_bytes(block3[4..8].try_into().unwrap()),
        };

        DerivedSession {
            keys,
            client_identity: identity,
        }
    }
}
