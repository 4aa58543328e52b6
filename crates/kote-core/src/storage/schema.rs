//! Database schema definitions.

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the database schema.
pub const CREATE_SCHEMA: &str = r#"
-- Local identity (only one row)
CREATE TABLE IF NOT EXISTS identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    destination_public TEXT NOT NULL,
    destination_private TEXT NOT NULL,
    signing_key BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

-- Contacts
CREATE TABLE IF NOT EXISTS contacts (
    address TEXT PRIMARY KEY,
    verify_key BLOB,
    state TEXT NOT NULL,
    nickname TEXT,
    proposed_nickname TEXT,
    last_seen INTEGER,
    send_sequence INTEGER NOT NULL,
    recv_sequence INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

-- Outbound envelopes (frame holds the signed, encoded message)
CREATE TABLE IF NOT EXISTS envelopes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    frame BLOB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_envelopes_target ON envelopes(target);

-- Settings table
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

-- Schema version
INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?);
"#;
