//! Protocol messages and their signatures.

use super::PROTOCOL_VERSION;
use crate::error::{Error, Result};
use crate::identity::{Identity, LocalIdentity};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Maximum length of a text or broadcast payload in bytes.
pub const MAX_TEXT_LEN: usize = 1024;

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Session opening: proves possession of the signing key.
    Handshake = 0x01,
    /// Authorization request; payload is the requester's proposed nickname.
    AuthRequest = 0x02,
    /// Authorization verdict; payload is one byte, 1 = accept.
    AuthResponse = 0x03,
    /// Private text.
    Text = 0x04,
    /// Text sent to every authorized contact.
    Broadcast = 0x05,
    /// Delivery acknowledgment; `sequence` is the acknowledged sequence.
    Ack = 0x06,
    /// Content refused because the sender is not authorized; `sequence`
    /// echoes the refused message.
    Unauthorized = 0x07,
    /// Presence check, answered with an `Ack` of its sequence.
    Ping = 0x08,
}

impl MessageKind {
    /// Parse kind from byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::AuthRequest),
            0x03 => Ok(Self::AuthResponse),
            0x04 => Ok(Self::Text),
            0x05 => Ok(Self::Broadcast),
            0x06 => Ok(Self::Ack),
            0x07 => Ok(Self::Unauthorized),
            0x08 => Ok(Self::Ping),
            _ => Err(Error::Format(format!("unknown message kind: {:#04x}", byte))),
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Authorization traffic is dispatched ahead of queued text.
    pub fn is_auth(self) -> bool {
        matches!(self, Self::AuthRequest | Self::AuthResponse)
    }

    /// Text and broadcast carry user content and are sequence-checked.
    pub fn is_content(self) -> bool {
        matches!(self, Self::Text | Self::Broadcast)
    }
}

/// A signed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Claimed sender.
    pub sender: Identity,
    /// Sender's sequence number (acked sequence for `Ack`).
    pub sequence: u64,
    /// Message kind.
    pub kind: MessageKind,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
    /// Ed25519 signature over all other fields.
    pub signature: [u8; 64],
}

impl Message {
    /// Build and sign a message from the local identity.
    pub fn signed(
        local: &LocalIdentity,
        kind: MessageKind,
        sequence: u64,
        payload: Vec<u8>,
    ) -> Self {
        let sender = local.identity().clone();
        let signature = local.sign(&signing_bytes(&sender, kind, sequence, &payload));
        Self {
            sender,
            sequence,
            kind,
            payload,
            signature,
        }
    }

    /// Signed handshake.
    pub fn handshake(local: &LocalIdentity) -> Self {
        Self::signed(local, MessageKind::Handshake, 0, Vec::new())
    }

    /// Signed acknowledgment of `sequence`.
    pub fn ack(local: &LocalIdentity, sequence: u64) -> Self {
        Self::signed(local, MessageKind::Ack, sequence, Vec::new())
    }

    /// Signed refusal of content sent with `sequence`.
    pub fn unauthorized(local: &LocalIdentity, sequence: u64) -> Self {
        Self::signed(local, MessageKind::Unauthorized, sequence, Vec::new())
    }

    /// Signed presence check. Pings are never queued, so they carry
    /// sequence 0 and their ack matches no envelope.
    pub fn ping(local: &LocalIdentity) -> Self {
        Self::signed(local, MessageKind::Ping, 0, Vec::new())
    }

    /// Verify the signature against the claimed sender key.
    pub fn verify(&self) -> Result<()> {
        self.verify_with(self.sender.key())
    }

    /// Verify the signature against a pinned key.
    pub fn verify_with(&self, key: &VerifyingKey) -> Result<()> {
        if key != self.sender.key() {
            return Err(Error::Signature("sender key does not match known key".into()));
        }
        let signature = Signature::from_bytes(&self.signature);
        key.verify(
            &signing_bytes(&self.sender, self.kind, self.sequence, &self.payload),
            &signature,
        )
        .map_err(|_| Error::Signature("invalid signature".into()))
    }

    /// Text content of a text or broadcast message.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.payload.clone())
            .map_err(|_| Error::Format("text payload is not utf-8".into()))
    }

    /// Verdict of an authorization response.
    pub fn verdict(&self) -> Result<bool> {
        match self.payload.as_slice() {
            [1] => Ok(true),
            [0] => Ok(false),
            _ => Err(Error::Format("invalid authorization verdict".into())),
        }
    }
}

/// Bytes covered by the signature.
///
/// `version | kind | address length | address | key | sequence | payload
/// length | payload`, matching the frame body minus the signature.
fn signing_bytes(sender: &Identity, kind: MessageKind, sequence: u64, payload: &[u8]) -> Vec<u8> {
    let address = sender.address().as_bytes();
    let mut bytes = Vec::with_capacity(2 + 1 + address.len() + 32 + 8 + 4 + payload.len());
    bytes.push(PROTOCOL_VERSION);
    bytes.push(kind.to_byte());
    bytes.push(address.len() as u8);
    bytes.extend_from_slice(address);
    bytes.extend_from_slice(sender.key().as_bytes());
    bytes.extend_from_slice(&sequence.to_be_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::local_identity;

    #[test]
    fn test_signed_message_verifies() {
        let local = local_identity(1);
        let msg = Message::signed(&local, MessageKind::Text, 42, b"hi".to_vec());
        msg.verify().expect("fresh signature should verify");
        msg.verify_with(local.identity().key()).expect("pinned key should verify");
    }

    #[test]
    fn test_tampered_message_fails() {
        let local = local_identity(1);
        let mut msg = Message::signed(&local, MessageKind::Text, 42, b"hi".to_vec());
        msg.sequence = 43;
        assert!(matches!(msg.verify(), Err(Error::Signature(_))));

        let mut msg = Message::signed(&local, MessageKind::Text, 42, b"hi".to_vec());
        msg.payload = b"ho".to_vec();
        assert!(msg.verify().is_err());
    }

    #[test]
    fn test_wrong_pinned_key_fails() {
        let alice = local_identity(1);
        let mallory = local_identity(2);
        let msg = Message::signed(&alice, MessageKind::Text, 1, b"hi".to_vec());
        assert!(msg.verify_with(mallory.identity().key()).is_err());
    }

    #[test]
    fn test_verdict_parsing() {
        let local = local_identity(1);
        let yes = Message::signed(&local, MessageKind::AuthResponse, 1, vec![1]);
        let no = Message::signed(&local, MessageKind::AuthResponse, 2, vec![0]);
        let junk = Message::signed(&local, MessageKind::AuthResponse, 3, vec![7, 7]);
        assert!(yes.verdict().expect("verdict"));
        assert!(!no.verdict().expect("verdict"));
        assert!(junk.verdict().is_err());
    }

    #[test]
    fn test_unknown_kind() {
        assert!(MessageKind::from_byte(0x00).is_err());
        assert!(MessageKind::from_byte(0x09).is_err());
        assert_eq!(MessageKind::from_byte(0x07).expect("kind"), MessageKind::Unauthorized);
        assert_eq!(MessageKind::from_byte(0x08).expect("kind"), MessageKind::Ping);
        assert_eq!(MessageKind::from_byte(0x04).expect("kind"), MessageKind::Text);
    }
}
