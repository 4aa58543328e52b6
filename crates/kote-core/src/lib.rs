//! # kote core library
//!
//! An anonymous peer-to-peer messenger running over I2P, driven from any
//! IRC client. Peers are identified by their I2P destination; there are no
//! accounts and no servers beyond the local router.
//!
//! ## Trust Model
//!
//! - Every frame is signed with the sender's Ed25519 key; the first key
//!   seen for an address is pinned
//! - Nothing but authorization traffic is accepted from a contact until
//!   both sides agreed
//! - A blocked contact is silently ignored
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           bridge (IRC server)           │
//! ├─────────────────────────────────────────┤
//! │  messaging (dispatcher, sessions)       │
//! ├──────────────┬─────────────┬────────────┤
//! │   contacts   │  delivery   │  storage   │
//! ├──────────────┴─────────────┴────────────┤
//! │     protocol (wire)  │  identity        │
//! ├─────────────────────────────────────────┤
//! │   transport (SAM, in-memory loopback)   │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod bridge;
pub mod config;
pub mod contacts;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod messaging;
pub mod protocol;
pub mod sam;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
