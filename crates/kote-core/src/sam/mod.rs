//! I2P integration through the router's SAM v3 bridge.
//!
//! ## Design
//!
//! kote talks to a local I2P router over SAM. One long-lived control socket
//! holds the stream session; every `STREAM ACCEPT` and `STREAM CONNECT`
//! opens its own socket that then carries the peer's bytes. There is no
//! clearnet fallback.
//!
//! The router may drop the session at any time. A keeper task notices,
//! marks the transport offline and re-creates the session after
//! [`SESSION_RESTART_SECS`].

mod control;
mod transport;

pub use control::{result_error, SamControl, SamReply, SAM_VERSION, SIGNATURE_TYPE};
pub use transport::SamTransport;

use rand::RngCore;

/// Default SAM bridge address.
pub const DEFAULT_SAM_ADDRESS: &str = "127.0.0.1:7656";

/// Delay before re-creating a dead session (seconds).
pub const SESSION_RESTART_SECS: u64 = 30;

/// Upper bound on lookup plus `STREAM CONNECT` (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 120;

/// SAM connection settings.
#[derive(Debug, Clone)]
pub struct SamConfig {
    /// SAM bridge `host:port`.
    pub sam_addr: String,
    /// Session nickname registered with the router.
    pub session_name: String,
}

impl SamConfig {
    /// Settings with a random session name.
    pub fn new(sam_addr: impl Into<String>) -> Self {
        Self {
            sam_addr: sam_addr.into(),
            session_name: session_name("kote"),
        }
    }
}

impl Default for SamConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SAM_ADDRESS)
    }
}

/// Random session name: `<prefix>-<6 hex chars>`.
pub fn session_name(prefix: &str) -> String {
    let mut bytes = [0u8; 3];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{}-{}", prefix, hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name() {
        let name = session_name("kote");
        assert!(name.starts_with("kote-"));
        assert_eq!(name.len(), "kote-".len() + 6);
        assert!(name[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
