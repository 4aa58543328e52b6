//! I2P base32 addresses.
//!
//! A b32 address is derived from the full destination bytes:
//!
//! 1. Hash: SHA-256(destination)
//! 2. Encode: base32(hash), lowercase, no padding (52 characters)
//! 3. Append ".b32.i2p"

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use std::fmt;

/// Suffix of every b32 address.
pub const B32_SUFFIX: &str = ".b32.i2p";

/// Length of the base32 part of an address.
const B32_HOST_LEN: usize = 52;

const ALPHABET: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// An I2P base32 address.
///
/// Format: `<52 base32 chars>.b32.i2p`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Parse and validate an address string.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();

        let host = s
            .strip_suffix(B32_SUFFIX)
            .ok_or_else(|| Error::InvalidAddress("must end with .b32.i2p".into()))?;

        if host.len() != B32_HOST_LEN {
            return Err(Error::InvalidAddress(
                "address must be 52 characters plus .b32.i2p".into(),
            ));
        }

        match base32::decode(ALPHABET, &host.to_ascii_uppercase()) {
            Some(bytes) if bytes.len() == 32 => Ok(Self(s)),
            _ => Err(Error::InvalidAddress("invalid base32 encoding".into())),
        }
    }

    /// Derive the address of a destination from its raw bytes.
    pub fn from_destination(destination: &[u8]) -> Self {
        let hash = Sha256::digest(destination);
        let host = base32::encode(ALPHABET, &hash).to_ascii_lowercase();
        Self(format!("{}{}", host, B32_SUFFIX))
    }

    /// Derive the address of a destination given in I2P base64.
    pub fn from_destination_b64(destination: &str) -> Result<Self> {
        let bytes = decode_i2p_base64(destination)
            .map_err(|_| Error::InvalidAddress("invalid destination encoding".into()))?;
        Ok(Self::from_destination(&bytes))
    }

    /// Get the full address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the base32 part without the suffix.
    pub fn host(&self) -> &str {
        &self.0[..B32_HOST_LEN]
    }

    /// Address bytes used in signatures and the handshake tie-break.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", crate::logging::RedactedAddress(&self.0))
    }
}

impl std::str::FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Decode I2P's base64 variant (`-` and `~` instead of `+` and `/`).
pub fn decode_i2p_base64(s: &str) -> Result<Vec<u8>> {
    let standard: String = s
        .trim()
        .chars()
        .map(|c| match c {
            '-' => '+',
            '~' => '/',
            c => c,
        })
        .collect();
    BASE64
        .decode(standard)
        .map_err(|e| Error::Format(format!("invalid base64: {}", e)))
}

/// Encode bytes with I2P's base64 variant.
pub fn encode_i2p_base64(bytes: &[u8]) -> String {
    BASE64
        .encode(bytes)
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '~',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_destination_is_valid() {
        let addr = Address::from_destination(b"some destination bytes");
        assert!(addr.as_str().ends_with(".b32.i2p"));
        assert_eq!(addr.as_str().len(), 52 + 8);

        let parsed = Address::parse(addr.as_str()).expect("derived address should parse");
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let addr = Address::from_destination(b"x");
        let upper = addr.as_str().to_uppercase();
        assert_eq!(Address::parse(&upper).expect("should parse"), addr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Address::parse("example.i2p").is_err());
        assert!(Address::parse("abc.b32.i2p").is_err());
        let bad = format!("{}{}", "1".repeat(52), B32_SUFFIX);
        assert!(Address::parse(&bad).is_err());
    }

    #[test]
    fn test_i2p_base64_alphabet() {
        let bytes = [0xfbu8, 0xff, 0xfe];
        let encoded = encode_i2p_base64(&bytes);
        assert_eq!(encoded, "-~~-");
        assert_eq!(decode_i2p_base64(&encoded).expect("decode"), bytes);
    }

    #[test]
    fn test_address_from_b64_matches_raw() {
        let dest = vec![7u8; 391];
        let b64 = encode_i2p_base64(&dest);
        assert_eq!(
            Address::from_destination_b64(&b64).expect("derive"),
            Address::from_destination(&dest)
        );
    }
}
