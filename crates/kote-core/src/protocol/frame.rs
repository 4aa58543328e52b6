//! Frame encoding and decoding.
//!
//! Decoding is total: any byte string either yields a [`Message`] or a
//! `Format` error. Signatures are not checked here.

use super::message::{Message, MessageKind};
use super::PROTOCOL_VERSION;
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use ed25519_dalek::VerifyingKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header size: version (1) + kind (1) + length (4) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Maximum body size (64 KiB).
pub const MAX_FRAME_BODY: usize = 64 * 1024;

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version.
    pub version: u8,
    /// Message kind.
    pub kind: MessageKind,
    /// Body length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.version;
        bytes[1] = self.kind.to_byte();
        bytes[2..6].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Parse and validate a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Format("header too short".into()));
        }

        let version = bytes[0];
        super::validate_version(version)?;

        let kind = MessageKind::from_byte(bytes[1])?;
        let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        if length as usize > MAX_FRAME_BODY {
            return Err(Error::Format("frame too large".into()));
        }

        Ok(Self {
            version,
            kind,
            length,
        })
    }
}

/// Encode a message into a frame.
pub fn encode(message: &Message) -> Vec<u8> {
    let address = message.sender.address().as_bytes();
    let body_len = 1 + address.len() + 32 + 8 + 4 + message.payload.len() + 64;

    let header = FrameHeader {
        version: PROTOCOL_VERSION,
        kind: message.kind,
        length: body_len as u32,
    };

    let mut bytes = Vec::with_capacity(HEADER_SIZE + body_len);
    bytes.extend_from_slice(&header.to_bytes());
    bytes.push(address.len() as u8);
    bytes.extend_from_slice(address);
    bytes.extend_from_slice(message.sender.key().as_bytes());
    bytes.extend_from_slice(&message.sequence.to_be_bytes());
    bytes.extend_from_slice(&(message.payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&message.payload);
    bytes.extend_from_slice(&message.signature);
    bytes
}

/// Decode a complete frame.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let header = FrameHeader::from_bytes(bytes)?;
    let body = &bytes[HEADER_SIZE..];

    if body.len() < header.length as usize {
        return Err(Error::Format("truncated frame".into()));
    }
    if body.len() > header.length as usize {
        return Err(Error::Format("trailing bytes after frame".into()));
    }

    let mut cursor = Cursor { bytes: body };

    let address_len = cursor.take(1)?[0] as usize;
    let address = std::str::from_utf8(cursor.take(address_len)?)
        .map_err(|_| Error::Format("address is not utf-8".into()))?;
    let address =
        Address::parse(address).map_err(|_| Error::Format("invalid sender address".into()))?;

    let key = cursor.array::<32>()?;
    let key =
        VerifyingKey::from_bytes(&key).map_err(|_| Error::Format("invalid sender key".into()))?;

    let sequence = u64::from_be_bytes(cursor.array::<8>()?);

    let payload_len = u32::from_be_bytes(cursor.array::<4>()?) as usize;
    let payload = cursor.take(payload_len)?.to_vec();

    let signature = cursor.array::<64>()?;

    if !cursor.bytes.is_empty() {
        return Err(Error::Format("trailing bytes in body".into()));
    }

    Ok(Message {
        sender: Identity::new(address, key),
        sequence,
        kind: header.kind,
        payload,
        signature,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(Error::Format("truncated field".into()));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Read one frame from a stream.
///
/// Returns the raw frame with a validated header. A bad header is returned
/// as `Format` and leaves the stream unusable; the body is decoded by the
/// caller so that a malformed body only costs that one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header_buf)
        .await
        .map_err(|_| Error::ConnectionClosed)?;

    let header = FrameHeader::from_bytes(&header_buf)?;

    let mut frame = vec![0u8; HEADER_SIZE + header.length as usize];
    frame[..HEADER_SIZE].copy_from_slice(&header_buf);
    reader
        .read_exact(&mut frame[HEADER_SIZE..])
        .await
        .map_err(|_| Error::ConnectionClosed)?;

    Ok(frame)
}

/// Write a message to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let bytes = encode(message);
    writer
        .write_all(&bytes)
        .await
        .map_err(|_| Error::ConnectionClosed)?;
    writer.flush().await.map_err(|_| Error::ConnectionClosed)?;
    Ok(())
}
