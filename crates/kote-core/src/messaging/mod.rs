//! Messaging system for kote.
//!
//! Sessions carry signed messages over transport streams; the daemon owns
//! contacts and the delivery queue and turns protocol traffic into
//! [`DaemonEvent`]s.
//!
//! ## Features
//!
//! - Authorization handshake with deterministic tie-break
//! - Private text and broadcast to all authorized contacts
//! - Acknowledged delivery with persisted retry
//! - Presence from pings and last-seen times

mod daemon;
mod presence;
mod session;

pub use daemon::{
    ContactView, DaemonCommand, DaemonConfig, DaemonEvent, DaemonHandle, MessagingDaemon,
};
pub use presence::{
    PresenceConfig, FULL_ROUND_EVERY, MAX_IDLE_SECS, PING_ALL_WINDOW_SECS, PING_INTERVAL_SECS,
};
pub use session::{
    run_session, spawn_accepted, spawn_connect, Role, SessionConfig, SessionEvent, SessionHandle,
    SessionId, HANDSHAKE_TIMEOUT_SECS, SESSION_IDLE_SECS,
};
