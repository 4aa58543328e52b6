//! Contact records and the in-memory contact store.

use super::state::{transition, TrustEvent, TrustState, Transition};
use crate::error::{Error, Result};
use crate::identity::Address;
use ed25519_dalek::VerifyingKey;
use std::collections::BTreeMap;

/// Longest nickname accepted.
pub const MAX_NICKNAME_LEN: usize = 51;

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Peer address.
    pub address: Address,
    /// Verification key pinned on the first verified handshake.
    pub key: Option<VerifyingKey>,
    /// Trust state. Never `Unknown` for a stored contact.
    pub state: TrustState,
    /// Local display name, unique across contacts.
    pub nickname: Option<String>,
    /// Name the peer proposed in its authorization request.
    pub proposed_nickname: Option<String>,
    /// Last verified traffic (unix seconds).
    pub last_seen: Option<i64>,
    /// Last sequence we assigned to an outbound message.
    pub send_sequence: u64,
    /// Highest text/broadcast sequence accepted from the peer.
    pub recv_sequence: u64,
    /// Record creation time (unix seconds).
    pub created_at: i64,
}

impl Contact {
    /// New record. Sequences start at the creation time in microseconds so a
    /// removed and re-added contact keeps counting above anything the peer
    /// already accepted.
    pub fn new(address: Address, state: TrustState, now_micros: i64) -> Self {
        let start = now_micros.max(0) as u64;
        Self {
            address,
            key: None,
            state,
            nickname: None,
            proposed_nickname: None,
            last_seen: None,
            send_sequence: start,
            recv_sequence: 0,
            created_at: now_micros / 1_000_000,
        }
    }

    /// Nickname if set, address otherwise.
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(self.address.as_str())
    }

    /// Allocate the next outbound sequence.
    pub fn next_send_sequence(&mut self) -> u64 {
        self.send_sequence += 1;
        self.send_sequence
    }

    /// Record an inbound content sequence. Returns false for replays and
    /// reordered retransmissions, which must not be delivered again.
    pub fn accept_sequence(&mut self, sequence: u64) -> bool {
        if sequence <= self.recv_sequence {
            return false;
        }
        self.recv_sequence = sequence;
        true
    }
}

/// Whether `nick` is usable as an IRC nickname.
///
/// Mirrors `^[][\`_^{|}A-Za-z][][\`_^{|}A-Za-z0-9-]{0,50}$`.
pub fn is_valid_nickname(nick: &str) -> bool {
    fn special(c: char) -> bool {
        matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}')
    }

    let mut chars = nick.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || special(c) => {}
        _ => return false,
    }
    nick.len() <= MAX_NICKNAME_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || special(c) || c == '-')
}

/// The contact store. Owned by the dispatcher; no I/O.
#[derive(Debug, Default)]
pub struct ContactStore {
    contacts: BTreeMap<Address, Contact>,
}

impl ContactStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records.
    pub fn from_contacts(contacts: impl IntoIterator<Item = Contact>) -> Self {
        Self {
            contacts: contacts
                .into_iter()
                .map(|c| (c.address.clone(), c))
                .collect(),
        }
    }

    /// Look up a contact.
    pub fn get(&self, address: &Address) -> Option<&Contact> {
        self.contacts.get(address)
    }

    /// Look up a contact for mutation.
    pub fn get_mut(&mut self, address: &Address) -> Option<&mut Contact> {
        self.contacts.get_mut(address)
    }

    /// Trust state, `Unknown` when there is no record.
    pub fn state(&self, address: &Address) -> TrustState {
        self.contacts
            .get(address)
            .map(|c| c.state)
            .unwrap_or(TrustState::Unknown)
    }

    /// Resolve a nickname (case-insensitive) or an address.
    pub fn find(&self, query: &str) -> Option<&Contact> {
        let query = query.trim();
        if let Ok(address) = Address::parse(query) {
            if let Some(contact) = self.contacts.get(&address) {
                return Some(contact);
            }
        }
        self.contacts.values().find(|c| {
            c.nickname
                .as_deref()
                .map_or(false, |n| n.eq_ignore_ascii_case(query))
        })
    }

    /// Apply a trust event, creating the record when the contact leaves
    /// `Unknown`.
    pub fn apply(
        &mut self,
        address: &Address,
        event: TrustEvent,
        local_wins: bool,
        now_micros: i64,
    ) -> Result<Transition> {
        let outcome = transition(self.state(address), event, local_wins)?;

        match self.contacts.get_mut(address) {
            Some(contact) => contact.state = outcome.next,
            None if outcome.next != TrustState::Unknown => {
                self.contacts.insert(
                    address.clone(),
                    Contact::new(address.clone(), outcome.next, now_micros),
                );
            }
            None => {}
        }

        Ok(outcome)
    }

    /// Pin the peer's key, or check it against the pinned one.
    pub fn pin_key(&mut self, address: &Address, key: &VerifyingKey) -> Result<()> {
        let contact = self
            .contacts
            .get_mut(address)
            .ok_or_else(|| Error::NotFound("unknown contact".into()))?;
        match contact.key {
            None => {
                contact.key = Some(*key);
                Ok(())
            }
            Some(pinned) if pinned == *key => Ok(()),
            Some(_) => Err(Error::Signature("key differs from pinned key".into())),
        }
    }

    /// Set or clear the local nickname. Nicknames are unique.
    pub fn set_nickname(&mut self, address: &Address, nickname: Option<String>) -> Result<()> {
        if let Some(nick) = &nickname {
            if !is_valid_nickname(nick) {
                return Err(Error::InvalidState(format!("invalid nickname: {}", nick)));
            }
            if self.nickname_taken(nick, Some(address)) {
                return Err(Error::InvalidState(format!("nickname already in use: {}", nick)));
            }
        }

        let contact = self
            .contacts
            .get_mut(address)
            .ok_or_else(|| Error::NotFound("unknown contact".into()))?;
        contact.nickname = nickname;
        Ok(())
    }

    /// Give a contact a nickname if it has none: the proposed one when free,
    /// a name derived from the address otherwise.
    pub fn ensure_nickname(&mut self, address: &Address) -> Result<()> {
        let contact = self
            .contacts
            .get(address)
            .ok_or_else(|| Error::NotFound("unknown contact".into()))?;
        if contact.nickname.is_some() {
            return Ok(());
        }

        let proposed = contact
            .proposed_nickname
            .clone()
            .filter(|n| is_valid_nickname(n) && !self.nickname_taken(n, Some(address)));

        let nick = match proposed {
            Some(nick) => nick,
            None => {
                let base = format!("i2p-{}", &address.host()[..8]);
                let mut candidate = base.clone();
                let mut n = 1;
                while self.nickname_taken(&candidate, Some(address)) {
                    n += 1;
                    candidate = format!("{}-{}", base, n);
                }
                candidate
            }
        };

        self.set_nickname(address, Some(nick))
    }

    /// Whether another contact already uses `nick`.
    pub fn nickname_taken(&self, nick: &str, except: Option<&Address>) -> bool {
        self.contacts.values().any(|c| {
            Some(&c.address) != except
                && c.nickname
                    .as_deref()
                    .map_or(false, |n| n.eq_ignore_ascii_case(nick))
        })
    }

    /// Record verified traffic.
    pub fn touch(&mut self, address: &Address, now: i64) {
        if let Some(contact) = self.contacts.get_mut(address) {
            contact.last_seen = Some(now);
        }
    }

    /// Delete a record.
    pub fn remove(&mut self, address: &Address) -> Option<Contact> {
        self.contacts.remove(address)
    }

    /// All contacts, ordered by address.
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    /// Contacts in the given state.
    pub fn in_state(&self, state: TrustState) -> impl Iterator<Item = &Contact> {
        self.contacts.values().filter(move |c| c.state == state)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
