//! The local node identity.
//!
//! Two independent keys make up the local identity: the I2P destination
//! issued by the router (which determines our address) and an Ed25519
//! signing key used for message signatures.

use super::{Address, Identity};
use crate::error::{Error, Result};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// Destination key pair in I2P base64, as issued by the router.
#[derive(Clone, PartialEq, Eq)]
pub struct DestinationKeys {
    /// Public destination.
    pub public: String,
    /// Private destination (public destination followed by private keys).
    pub private: String,
}

impl DestinationKeys {
    /// Address of this destination.
    pub fn address(&self) -> Result<Address> {
        Address::from_destination_b64(&self.public)
    }
}

impl fmt::Debug for DestinationKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationKeys")
            .field("public", &crate::logging::RedactedBytes(self.public.as_bytes()))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Our own identity: destination keys plus the message signing key.
#[derive(Clone)]
pub struct LocalIdentity {
    destination: DestinationKeys,
    signing_key: SigningKey,
    identity: Identity,
}

impl LocalIdentity {
    /// Create an identity for a freshly provisioned destination.
    pub fn generate(destination: DestinationKeys) -> Result<Self> {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_parts(destination, signing_key)
    }

    /// Restore from persisted parts.
    pub fn from_secret_bytes(destination: DestinationKeys, secret: &[u8]) -> Result<Self> {
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
            secret
                .try_into()
                .map_err(|_| Error::Storage("signing key must be 32 bytes".into()))?,
        );
        Self::from_parts(destination, SigningKey::from_bytes(&secret))
    }

    fn from_parts(destination: DestinationKeys, signing_key: SigningKey) -> Result<Self> {
        let address = destination.address()?;
        let identity = Identity::new(address, signing_key.verifying_key());
        Ok(Self {
            destination,
            signing_key,
            identity,
        })
    }

    /// Replace the destination keys, keeping the signing key.
    ///
    /// Used when the router hands back keys that differ from the persisted
    /// ones (e.g. the destination was regenerated).
    pub fn with_destination(self, destination: DestinationKeys) -> Result<Self> {
        Self::from_parts(destination, self.signing_key)
    }

    /// Public identity advertised to peers.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Our address.
    pub fn address(&self) -> &Address {
        self.identity.address()
    }

    /// Destination keys to hand to the transport.
    pub fn destination(&self) -> &DestinationKeys {
        &self.destination
    }

    /// Signing key seed for persistence.
    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Sign a message body.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
