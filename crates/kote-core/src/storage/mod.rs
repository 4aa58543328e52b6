//! Local storage for kote.
//!
//! A single SQLite database holds everything that must survive a restart:
//!
//! - the local identity (destination keys and signing key)
//! - contacts with their trust state and sequence counters
//! - outbound envelopes, stored as encoded signed frames
//!
//! The dispatcher writes through on every change and checkpoints on
//! shutdown, so an unclean exit loses nothing that was acknowledged to the
//! user.

mod database;
mod schema;

pub use database::{Database, DatabaseConfig};
pub use schema::SCHEMA_VERSION;

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "kote.db";
