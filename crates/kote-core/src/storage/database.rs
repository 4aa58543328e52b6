//! SQLite persistence for identity, contacts and envelopes.

use super::schema::{CREATE_SCHEMA, SCHEMA_VERSION};
use crate::contacts::{Contact, TrustState};
use crate::delivery::Envelope;
use crate::error::{Error, Result};
use crate::identity::{Address, DestinationKeys, LocalIdentity};
use crate::protocol::{decode, encode, Message};
use ed25519_dalek::VerifyingKey;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file.
    pub path: PathBuf,
    /// Whether to use in-memory database (for testing).
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(super::DEFAULT_DB_NAME),
            in_memory: false,
        }
    }
}

impl DatabaseConfig {
    /// Database file inside a data directory.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(super::DEFAULT_DB_NAME),
            in_memory: false,
        }
    }

    /// In-memory database.
    pub fn memory() -> Self {
        Self {
            path: PathBuf::new(),
            in_memory: true,
        }
    }
}

/// Database handle.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::Storage(format!("failed to create directory: {}", e))
                    })?;
                }
            }

            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )
        .map_err(|e| Error::Storage(format!("failed to set pragmas: {}", e)))?;

        let db = Self { conn };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig::memory())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(&CREATE_SCHEMA.replace('?', &SCHEMA_VERSION.to_string()))
            .map_err(|e| Error::Storage(format!("failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Store the local identity (only one allowed).
    pub fn store_identity(&self, identity: &LocalIdentity) -> Result<()> {
        let secret = identity.secret_key_bytes();
        let destination = identity.destination();
        let now = chrono::Utc::now().timestamp();

        self.conn
            .execute(
                r#"INSERT OR REPLACE INTO identity
                   (id, destination_public, destination_private, signing_key, created_at)
                   VALUES (1, ?, ?, ?, ?)"#,
                params![
                    destination.public,
                    destination.private,
                    secret.as_slice(),
                    now
                ],
            )
            .map_err(|e| Error::Storage(format!("failed to store identity: {}", e)))?;

        Ok(())
    }

    /// Load the local identity.
    pub fn load_identity(&self) -> Result<Option<LocalIdentity>> {
        let row = self
            .conn
            .query_row(
                "SELECT destination_public, destination_private, signing_key FROM identity WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((public, private, secret)) => {
                let secret = zeroize::Zeroizing::new(secret);
                let destination = DestinationKeys { public, private };
                Ok(Some(LocalIdentity::from_secret_bytes(destination, &secret)?))
            }
            None => Ok(None),
        }
    }

    /// Insert or update a contact.
    pub fn save_contact(&self, contact: &Contact) -> Result<()> {
        save_contact_row(&self.conn, contact)
    }

    /// Delete a contact.
    pub fn delete_contact(&self, address: &Address) -> Result<()> {
        self.conn.execute(
            "DELETE FROM contacts WHERE address = ?",
            params![address.as_str()],
        )?;
        Ok(())
    }

    /// Load all contacts.
    pub fn load_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT address, verify_key, state, nickname, proposed_nickname, last_seen,
                      send_sequence, recv_sequence, created_at
               FROM contacts ORDER BY address"#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ContactRow {
                    address: row.get(0)?,
                    key: row.get(1)?,
                    state: row.get(2)?,
                    nickname: row.get(3)?,
                    proposed_nickname: row.get(4)?,
                    last_seen: row.get(5)?,
                    send_sequence: row.get(6)?,
                    recv_sequence: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(ContactRow::into_contact).collect()
    }

    /// Persist a new envelope. Returns its id.
    pub fn insert_envelope(&self, target: &Address, message: &Message, now: i64) -> Result<i64> {
        self.conn.execute(
            r#"INSERT INTO envelopes (target, sequence, frame, attempts, next_retry_at, created_at)
               VALUES (?, ?, ?, 0, ?, ?)"#,
            params![
                target.as_str(),
                message.sequence as i64,
                encode(message),
                now,
                now
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Persist retry bookkeeping.
    pub fn update_envelope(&self, envelope: &Envelope) -> Result<()> {
        update_envelope_row(&self.conn, envelope)
    }

    /// Delete an envelope.
    pub fn delete_envelope(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM envelopes WHERE id = ?", params![id])?;
        Ok(())
    }

    /// Load all envelopes in enqueue order.
    pub fn load_envelopes(&self) -> Result<Vec<Envelope>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, target, frame, attempts, next_retry_at, created_at
               FROM envelopes ORDER BY id"#,
        )?;

        let rows = stmt
            .query_map([], |row: &Row<'_>| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, target, frame, attempts, next_retry_at, created_at)| {
                let target = Address::parse(&target)
                    .map_err(|_| Error::Storage(format!("corrupt envelope {}: target", id)))?;
                let message = decode(&frame)
                    .map_err(|_| Error::Storage(format!("corrupt envelope {}: frame", id)))?;
                Ok(Envelope {
                    id,
                    target,
                    message,
                    attempts,
                    next_retry_at,
                    created_at,
                })
            })
            .collect()
    }

    /// Write every contact and envelope in one transaction.
    pub fn checkpoint<'a>(
        &mut self,
        contacts: impl IntoIterator<Item = &'a Contact>,
        envelopes: impl IntoIterator<Item = &'a Envelope>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for contact in contacts {
            save_contact_row(&tx, contact)?;
        }
        for envelope in envelopes {
            update_envelope_row(&tx, envelope)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn save_contact_row(conn: &Connection, contact: &Contact) -> Result<()> {
    if contact.state == TrustState::Unknown {
        return Err(Error::Storage("refusing to persist an unknown contact".into()));
    }

    conn.execute(
        r#"INSERT INTO contacts
           (address, verify_key, state, nickname, proposed_nickname, last_seen,
            send_sequence, recv_sequence, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(address) DO UPDATE SET
             verify_key = excluded.verify_key,
             state = excluded.state,
             nickname = excluded.nickname,
             proposed_nickname = excluded.proposed_nickname,
             last_seen = excluded.last_seen,
             send_sequence = excluded.send_sequence,
             recv_sequence = excluded.recv_sequence"#,
        params![
            contact.address.as_str(),
            contact.key.as_ref().map(|k| k.as_bytes().to_vec()),
            contact.state.as_str(),
            contact.nickname,
            contact.proposed_nickname,
            contact.last_seen,
            contact.send_sequence as i64,
            contact.recv_sequence as i64,
            contact.created_at,
        ],
    )?;

    Ok(())
}

fn update_envelope_row(conn: &Connection, envelope: &Envelope) -> Result<()> {
    conn.execute(
        "UPDATE envelopes SET attempts = ?, next_retry_at = ? WHERE id = ?",
        params![envelope.attempts, envelope.next_retry_at, envelope.id],
    )?;
    Ok(())
}

struct ContactRow {
    address: String,
    key: Option<Vec<u8>>,
    state: String,
    nickname: Option<String>,
    proposed_nickname: Option<String>,
    last_seen: Option<i64>,
    send_sequence: i64,
    recv_sequence: i64,
    created_at: i64,
}

impl ContactRow {
    fn into_contact(self) -> Result<Contact> {
        let address = Address::parse(&self.address)
            .map_err(|_| Error::Storage("corrupt contact address".into()))?;
        let key = match self.key {
            Some(bytes) => {
                let bytes: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt contact key".into()))?;
                Some(
                    VerifyingKey::from_bytes(&bytes)
                        .map_err(|_| Error::Storage("corrupt contact key".into()))?,
                )
            }
            None => None,
        };

        Ok(Contact {
            address,
            key,
            state: TrustState::parse(&self.state)?,
            nickname: self.nickname,
            proposed_nickname: self.proposed_nickname,
            last_seen: self.last_seen,
            send_sequence: self.send_sequence as u64,
            recv_sequence: self.recv_sequence as u64,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::Contact;
    use crate::protocol::tests::local_identity;
    use crate::protocol::MessageKind;

    const NOW: i64 = 1_700_000_000_000_000;

    #[test]
    fn test_identity_roundtrip() {
        let db = Database::open_in_memory().expect("open");
        assert!(db.load_identity().expect("load").is_none());

        let local = local_identity(4);
        db.store_identity(&local).expect("store");

        let loaded = db.load_identity().expect("load").expect("present");
        assert_eq!(loaded.identity(), local.identity());
        assert_eq!(loaded.destination(), local.destination());
    }

    #[test]
    fn test_contact_upsert() {
        let db = Database::open_in_memory().expect("open");
        let peer = local_identity(8);

        let mut contact = Contact::new(peer.address().clone(), TrustState::PendingOutbound, NOW);
        contact.nickname = Some("bob".into());
        db.save_contact(&contact).expect("insert");

        contact.state = TrustState::Authorized;
        contact.key = Some(*peer.identity().key());
        contact.recv_sequence = 77;
        db.save_contact(&contact).expect("update");

        let loaded = db.load_contacts().expect("load");
        assert_eq!(loaded, vec![contact.clone()]);

        db.delete_contact(&contact.address).expect("delete");
        assert!(db.load_contacts().expect("load").is_empty());
    }

    #[test]
    fn test_unknown_contact_not_persisted() {
        let db = Database::open_in_memory().expect("open");
        let contact = Contact::new(local_identity(8).address().clone(), TrustState::Unknown, NOW);
        assert!(matches!(db.save_contact(&contact), Err(Error::Storage(_))));
    }

    #[test]
    fn test_envelope_lifecycle() {
        let db = Database::open_in_memory().expect("open");
        let local = local_identity(1);
        let target = local_identity(2).address().clone();
        let message = Message::signed(&local, MessageKind::Text, 5, b"hello".to_vec());

        let id = db.insert_envelope(&target, &message, 1_000).expect("insert");
        let mut loaded = db.load_envelopes().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].message, message);
        assert_eq!(loaded[0].target, target);

        loaded[0].attempts = 3;
        loaded[0].next_retry_at = 9_000;
        db.update_envelope(&loaded[0]).expect("update");
        let reloaded = db.load_envelopes().expect("load");
        assert_eq!(reloaded[0].attempts, 3);
        assert_eq!(reloaded[0].next_retry_at, 9_000);

        db.delete_envelope(id).expect("delete");
        assert!(db.load_envelopes().expect("load").is_empty());
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DatabaseConfig::in_dir(dir.path().join("nested"));
        let local = local_identity(3);

        {
            let db = Database::open(&config).expect("open");
            db.store_identity(&local).expect("store");
        }

        let db = Database::open(&config).expect("reopen");
        let loaded = db.load_identity().expect("load").expect("present");
        assert_eq!(loaded.address(), local.address());
    }
}
