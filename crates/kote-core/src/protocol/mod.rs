//! Wire protocol for kote.
//!
//! A strict binary, versioned protocol carried over I2P streams. Every
//! message is signed by its sender; decoding never checks signatures, that is
//! the session layer's job since it knows which key is pinned for the peer.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌─────────┬─────────┬──────────┬────────────────────────────────────────────┐
//! │ Version │  Kind   │  Length  │                 Body                       │
//! │ (1 byte)│ (1 byte)│ (4 bytes)│                                            │
//! └─────────┴─────────┴──────────┴────────────────────────────────────────────┘
//!
//! Body:
//! ┌──────────┬─────────┬─────────┬──────────┬─────────────┬─────────┬───────────┐
//! │ Addr len │ Address │   Key   │ Sequence │ Payload len │ Payload │ Signature │
//! │ (1 byte) │         │ (32)    │ (8, BE)  │ (4, BE)     │         │ (64)      │
//! └──────────┴─────────┴─────────┴──────────┴─────────────┴─────────┴───────────┘
//! ```
//!
//! Maximum body size: 64 KiB

mod frame;
mod message;

pub use frame::{
    decode, encode, read_frame, write_frame, FrameHeader, HEADER_SIZE, MAX_FRAME_BODY,
};
pub use message::{Message, MessageKind, MAX_TEXT_LEN};

use crate::error::{Error, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Minimum supported protocol version.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Validate that a protocol version is supported.
pub fn validate_version(version: u8) -> Result<()> {
    if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return Err(Error::Format(format!(
            "unsupported protocol version: {}",
            version
        )));
    }
    Ok(())
}
