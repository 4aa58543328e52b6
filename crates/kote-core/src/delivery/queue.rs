//! Per-contact mailboxes.

use super::DeliveryConfig;
use crate::contacts::TrustState;
use crate::identity::Address;
use crate::protocol::{Message, MessageKind};
use std::collections::{HashMap, VecDeque};

/// A queued outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Storage row id.
    pub id: i64,
    /// Recipient.
    pub target: Address,
    /// Signed message.
    pub message: Message,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Earliest next attempt (unix milliseconds).
    pub next_retry_at: i64,
    /// Enqueue time (unix milliseconds).
    pub created_at: i64,
}

/// The envelope currently awaiting an ack for a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    /// Envelope id.
    pub envelope_id: i64,
    /// Ack deadline (unix milliseconds).
    pub deadline: i64,
}

/// Outbound mailboxes for all contacts.
#[derive(Debug)]
pub struct DeliveryQueue {
    config: DeliveryConfig,
    mailboxes: HashMap<Address, VecDeque<Envelope>>,
    in_flight: HashMap<Address, InFlight>,
}

impl DeliveryQueue {
    /// Empty queue.
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            mailboxes: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Append an envelope to its contact's mailbox.
    pub fn push(&mut self, envelope: Envelope) {
        self.mailboxes
            .entry(envelope.target.clone())
            .or_default()
            .push_back(envelope);
    }

    /// Contacts with queued envelopes.
    pub fn targets(&self) -> Vec<Address> {
        self.mailboxes.keys().cloned().collect()
    }

    /// Envelopes queued for a contact, in order.
    pub fn envelopes(&self, target: &Address) -> impl Iterator<Item = &Envelope> {
        self.mailboxes.get(target).into_iter().flatten()
    }

    /// All envelopes.
    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.mailboxes.values().flatten()
    }

    /// Number of envelopes queued for a contact.
    pub fn pending(&self, target: &Address) -> usize {
        self.mailboxes.get(target).map_or(0, VecDeque::len)
    }

    /// Total number of envelopes.
    pub fn len(&self) -> usize {
        self.mailboxes.values().map(VecDeque::len).sum()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The envelope that would go out next for a contact in `state`,
    /// ignoring its retry time.
    pub fn select(&self, target: &Address, state: TrustState) -> Option<&Envelope> {
        let mailbox = self.mailboxes.get(target)?;
        match state {
            TrustState::Unknown | TrustState::Blocked => None,
            TrustState::PendingOutbound => mailbox
                .iter()
                .find(|e| e.message.kind == MessageKind::AuthRequest),
            TrustState::PendingInbound => mailbox.iter().find(|e| e.message.kind.is_auth()),
            TrustState::Authorized => mailbox
                .iter()
                .find(|e| e.message.kind.is_auth())
                .or_else(|| mailbox.front()),
        }
    }

    /// The selected envelope if it is due and nothing is in flight.
    pub fn ready(&self, target: &Address, state: TrustState, now: i64) -> Option<&Envelope> {
        if self.in_flight.contains_key(target) {
            return None;
        }
        self.select(target, state)
            .filter(|e| e.next_retry_at <= now)
    }

    /// Earliest time the selected envelope becomes due, or the in-flight ack
    /// deadline.
    pub fn deadline(&self, target: &Address, state: TrustState) -> Option<i64> {
        if let Some(flight) = self.in_flight.get(target) {
            return Some(flight.deadline);
        }
        self.select(target, state).map(|e| e.next_retry_at)
    }

    /// Mark an envelope as sent and awaiting its ack.
    pub fn mark_in_flight(&mut self, target: &Address, envelope_id: i64, now: i64) {
        let deadline = now + self.config.ack_timeout.as_millis() as i64;
        self.in_flight.insert(
            target.clone(),
            InFlight {
                envelope_id,
                deadline,
            },
        );
    }

    /// In-flight envelope for a contact.
    pub fn in_flight(&self, target: &Address) -> Option<InFlight> {
        self.in_flight.get(target).copied()
    }

    /// Contacts whose ack deadline has passed.
    pub fn expired(&self, now: i64) -> Vec<Address> {
        self.in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(a, _)| a.clone())
            .collect()
    }

    /// Remove the envelope acknowledged by `sequence`.
    pub fn ack(&mut self, target: &Address, sequence: u64) -> Option<Envelope> {
        let mailbox = self.mailboxes.get_mut(target)?;
        let index = mailbox
            .iter()
            .position(|e| e.message.sequence == sequence)?;
        let envelope = mailbox.remove(index)?;

        if self
            .in_flight
            .get(target)
            .map_or(false, |f| f.envelope_id == envelope.id)
        {
            self.in_flight.remove(target);
        }
        if mailbox.is_empty() {
            self.mailboxes.remove(target);
        }
        Some(envelope)
    }

    /// Record a failed attempt for an envelope and schedule its retry.
    /// Clears the contact's in-flight slot. Returns the updated envelope.
    pub fn fail(&mut self, target: &Address, envelope_id: i64, now: i64) -> Option<&Envelope> {
        self.in_flight.remove(target);
        let backoff = &self.config;
        let envelope = self
            .mailboxes
            .get_mut(target)?
            .iter_mut()
            .find(|e| e.id == envelope_id)?;
        envelope.attempts += 1;
        envelope.next_retry_at = now + backoff.backoff(envelope.attempts).as_millis() as i64;
        Some(envelope)
    }

    /// Make every envelope for a contact due now.
    pub fn make_ready(&mut self, target: &Address, now: i64) {
        if let Some(mailbox) = self.mailboxes.get_mut(target) {
            for envelope in mailbox.iter_mut() {
                envelope.next_retry_at = envelope.next_retry_at.min(now);
            }
        }
    }

    /// Remove everything queued for a contact.
    pub fn purge(&mut self, target: &Address) -> Vec<Envelope> {
        self.in_flight.remove(target);
        self.mailboxes
            .remove(target)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Remove queued text and broadcast for a contact, keeping authorization
    /// traffic.
    pub fn cancel(&mut self, target: &Address) -> Vec<Envelope> {
        let Some(mailbox) = self.mailboxes.get_mut(target) else {
            return Vec::new();
        };

        let (cancelled, kept): (Vec<_>, Vec<_>) = mailbox
            .drain(..)
            .partition(|e| e.message.kind.is_content());
        mailbox.extend(kept);

        if let Some(flight) = self.in_flight.get(target) {
            if cancelled.iter().any(|e| e.id == flight.envelope_id) {
                self.in_flight.remove(target);
            }
        }
        if mailbox.is_empty() {
            self.mailboxes.remove(target);
        }
        cancelled
    }
}
