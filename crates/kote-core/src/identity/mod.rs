//! Identity management for kote.
//!
//! A peer is identified by its I2P b32 address plus the Ed25519 key it signs
//! messages with. The address is self-certifying for the transport (the
//! router only delivers streams from the destination that hashes to it); the
//! key is learned on the first verified handshake and pinned from then on.
//!
//! ## Identity Properties
//!
//! - Address: `<52 base32 chars>.b32.i2p`
//! - Ed25519 verification key (32 bytes)
//! - SHA-256 fingerprint of the key for out-of-band comparison
//! - Equality is by address and key, never by nickname

mod address;
mod local;

pub use address::{decode_i2p_base64, encode_i2p_base64, Address, B32_SUFFIX};
pub use local::{DestinationKeys, LocalIdentity};

use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

/// A peer identity: address plus signature verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    address: Address,
    key: VerifyingKey,
}

impl Identity {
    /// Create an identity.
    pub fn new(address: Address, key: VerifyingKey) -> Self {
        Self { address, key }
    }

    /// The peer's address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The peer's verification key.
    pub fn key(&self) -> &VerifyingKey {
        &self.key
    }

    /// Canonical byte representation: address bytes followed by key bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.address.as_bytes().len() + 32);
        bytes.extend_from_slice(self.address.as_bytes());
        bytes.extend_from_slice(self.key.as_bytes());
        bytes
    }

    /// Hex fingerprint of the verification key.
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(&self.key)
    }
}

/// Compute SHA-256 fingerprint of a public key.
pub fn compute_fingerprint(public_key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(public_key.as_bytes()))
}

/// Format a fingerprint for human-readable display.
///
/// Splits into groups of 4 characters for easier verbal comparison.
pub fn format_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .as_bytes()
        .chunks(4)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect::<Vec<_>>()
        .join(" ")
}
