//! Contact store and trust state machine.
//!
//! ```text
//!                 local request              remote accept
//!   unknown ─────────────────▶ pending_outbound ─────────────▶ authorized
//!      │                            │  ▲ remote request           ▲
//!      │ remote request             │  └──── (tie-break) ─────────┤
//!      ▼                            │ remote reject               │
//!   pending_inbound ────────────────┼──── local accept ───────────┘
//!      │ local reject               ▼
//!      └──────────────────────▶  blocked  ◀──── local block (any state)
//! ```
//!
//! `blocked` is left only through an explicit unblock, which deletes the
//! record and returns the peer to `unknown`.

mod state;
mod store;

pub use state::{transition, AuthReply, Transition, TrustEvent, TrustState};
pub use store::{is_valid_nickname, Contact, ContactStore, MAX_NICKNAME_LEN};
