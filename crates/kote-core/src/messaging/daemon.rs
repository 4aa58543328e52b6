//! kote messaging daemon.
//!
//! Manages the complete messaging lifecycle:
//! - Brings up our I2P destination and accepts inbound streams
//! - Runs the contact trust state machine
//! - Queues, sends and retries outbound messages
//! - Pings contacts and tracks who is online
//! - Provides event notifications to the bridge
//!
//! A single dispatcher task owns the contact store, the delivery queue and
//! the database. Everything else talks to it through [`DaemonHandle`].

use super::presence::{Presence, PresenceConfig};
use super::session::{
    spawn_accepted, spawn_connect, SessionConfig, SessionEvent, SessionHandle, SessionId,
};
use crate::contacts::{AuthReply, Contact, ContactStore, TrustEvent, TrustState};
use crate::delivery::{now_millis, DeliveryConfig, DeliveryQueue, Envelope};
use crate::error::{Error, Result};
use crate::identity::{Address, LocalIdentity};
use crate::logging::RedactedAddress;
use crate::protocol::{Message, MessageKind, MAX_TEXT_LEN};
use crate::storage::Database;
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Command channel depth.
const COMMAND_CAPACITY: usize = 100;

/// Event channel depth.
const EVENT_CAPACITY: usize = 256;

/// Session event channel depth.
const SESSION_EVENT_CAPACITY: usize = 256;

/// Pause after a failed accept (seconds).
const ACCEPT_RETRY_SECS: u64 = 5;

/// Daemon settings.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    /// Retry and ack timing.
    pub delivery: DeliveryConfig,
    /// Session timing.
    pub session: SessionConfig,
    /// Ping and idle timing.
    pub presence: PresenceConfig,
    /// Drop sessions and requests from addresses with no contact record.
    pub ignore_unauthorized: bool,
}

/// A contact as seen from outside the dispatcher.
#[derive(Debug, Clone)]
pub struct ContactView {
    /// The record.
    pub contact: Contact,
    /// Whether the contact was heard from recently.
    pub online: bool,
    /// Envelopes waiting for delivery.
    pub queued: usize,
}

/// Events emitted by the daemon.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// A peer asked to be authorized.
    AuthorizationRequested {
        /// Peer address.
        address: Address,
        /// Display name.
        name: String,
        /// Nickname the peer proposed, if any.
        proposed: Option<String>,
    },
    /// A contact became authorized.
    ContactAuthorized {
        /// Peer address.
        address: Address,
        /// Display name.
        name: String,
    },
    /// A contact became blocked.
    ContactBlocked {
        /// Peer address.
        address: Address,
        /// Display name.
        name: String,
        /// True when the peer rejected our request.
        by_peer: bool,
    },
    /// Text or broadcast from an authorized contact.
    MessageReceived {
        /// Sender address.
        address: Address,
        /// Display name.
        name: String,
        /// `Text` or `Broadcast`.
        kind: MessageKind,
        /// Content.
        text: String,
    },
    /// The peer acknowledged an envelope.
    Delivered {
        /// Recipient address.
        address: Address,
        /// Display name.
        name: String,
        /// Kind of the delivered message.
        kind: MessageKind,
        /// Its sequence.
        sequence: u64,
    },
    /// An attempt failed; the envelope stays queued.
    DeliveryFailed {
        /// Recipient address.
        address: Address,
        /// Display name.
        name: String,
        /// Failed attempts so far.
        attempts: u32,
        /// When the failure was recorded (unix milliseconds).
        failed_at: i64,
        /// Next attempt (unix milliseconds).
        next_retry_at: i64,
        /// Error description.
        error: String,
    },
    /// The peer refused our text because it has not authorized us. The
    /// envelope stays queued.
    AuthorizationRequired {
        /// Peer address.
        address: Address,
        /// Display name.
        name: String,
        /// Refused attempts so far.
        attempts: u32,
    },
    /// An authorized contact was heard from after being offline.
    ContactOnline {
        /// Peer address.
        address: Address,
        /// Display name.
        name: String,
    },
    /// Nothing was heard from a contact for the idle limit.
    ContactOffline {
        /// Peer address.
        address: Address,
        /// Display name.
        name: String,
    },
}

/// Commands to send to the daemon.
#[derive(Debug)]
pub enum DaemonCommand {
    /// Add a contact and ask it for authorization.
    RequestAuthorization {
        /// Peer address.
        address: Address,
        /// Local nickname for the contact.
        nickname: Option<String>,
        /// Nickname we propose for ourselves.
        introduce_as: String,
        /// Outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Accept a pending request.
    Accept {
        /// Nickname or address.
        target: String,
        /// Local nickname for the contact.
        nickname: Option<String>,
        /// Outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Reject a pending request.
    Reject {
        /// Nickname or address.
        target: String,
        /// Outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Block a contact or an address.
    Block {
        /// Nickname or address.
        target: String,
        /// Outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Forget a blocked contact.
    Unblock {
        /// Nickname or address.
        target: String,
        /// Outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Delete a contact and its queue.
    Remove {
        /// Nickname or address.
        target: String,
        /// Outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Queue a private message.
    SendText {
        /// Nickname or address.
        target: String,
        /// Content.
        text: String,
        /// Outcome.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Queue a message for every authorized contact.
    Broadcast {
        /// Content.
        text: String,
        /// Number of envelopes created.
        reply: oneshot::Sender<Result<usize>>,
    },
    /// Drop queued text and broadcast for a contact.
    Cancel {
        /// Nickname or address.
        target: String,
        /// Number of envelopes dropped.
        reply: oneshot::Sender<Result<usize>>,
    },
    /// List contacts.
    Contacts {
        /// All contacts.
        reply: oneshot::Sender<Vec<ContactView>>,
    },
    /// Find one contact.
    Lookup {
        /// Nickname or address.
        target: String,
        /// The contact, if known.
        reply: oneshot::Sender<Option<ContactView>>,
    },
    /// Checkpoint and stop.
    Shutdown {
        /// Signalled once state is saved.
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable client of the dispatcher.
#[derive(Clone)]
pub struct DaemonHandle {
    commands: mpsc::Sender<DaemonCommand>,
    events: broadcast::Sender<DaemonEvent>,
    address: Address,
}

impl DaemonHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> DaemonCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::InvalidState("messaging daemon is not running".into()))?;
        rx.await
            .map_err(|_| Error::InvalidState("messaging daemon is not running".into()))
    }

    /// Our address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Subscribe to daemon events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.events.subscribe()
    }

    /// Add a contact and ask for authorization.
    pub async fn request_authorization(
        &self,
        address: Address,
        nickname: Option<String>,
        introduce_as: impl Into<String>,
    ) -> Result<()> {
        let introduce_as = introduce_as.into();
        self.request(|reply| DaemonCommand::RequestAuthorization {
            address,
            nickname,
            introduce_as,
            reply,
        })
        .await?
    }

    /// Accept a pending request.
    pub async fn accept(&self, target: impl Into<String>, nickname: Option<String>) -> Result<()> {
        let target = target.into();
        self.request(|reply| DaemonCommand::Accept {
            target,
            nickname,
            reply,
        })
        .await?
    }

    /// Reject a pending request.
    pub async fn reject(&self, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        self.request(|reply| DaemonCommand::Reject { target, reply })
            .await?
    }

    /// Block a contact.
    pub async fn block(&self, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        self.request(|reply| DaemonCommand::Block { target, reply })
            .await?
    }

    /// Unblock (forget) a blocked contact.
    pub async fn unblock(&self, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        self.request(|reply| DaemonCommand::Unblock { target, reply })
            .await?
    }

    /// Remove a contact.
    pub async fn remove(&self, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        self.request(|reply| DaemonCommand::Remove { target, reply })
            .await?
    }

    /// Queue a private message.
    pub async fn send_text(&self, target: impl Into<String>, text: impl Into<String>) -> Result<()> {
        let (target, text) = (target.into(), text.into());
        self.request(|reply| DaemonCommand::SendText {
            target,
            text,
            reply,
        })
        .await?
    }

    /// Queue a broadcast. Returns the number of recipients.
    pub async fn broadcast(&self, text: impl Into<String>) -> Result<usize> {
        let text = text.into();
        self.request(|reply| DaemonCommand::Broadcast { text, reply })
            .await?
    }

    /// Drop queued messages for a contact. Returns how many were dropped.
    pub async fn cancel(&self, target: impl Into<String>) -> Result<usize> {
        let target = target.into();
        self.request(|reply| DaemonCommand::Cancel { target, reply })
            .await?
    }

    /// All contacts.
    pub async fn contacts(&self) -> Result<Vec<ContactView>> {
        self.request(|reply| DaemonCommand::Contacts { reply }).await
    }

    /// Find a contact by nickname or address.
    pub async fn lookup(&self, target: impl Into<String>) -> Result<Option<ContactView>> {
        let target = target.into();
        self.request(|reply| DaemonCommand::Lookup { target, reply })
            .await
    }

    /// Checkpoint state and stop the dispatcher.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| DaemonCommand::Shutdown { reply }).await
    }
}

/// kote messaging daemon.
pub struct MessagingDaemon {
    handle: DaemonHandle,
    identity: Arc<LocalIdentity>,
    dispatcher: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

impl MessagingDaemon {
    /// Restore state from the database, bring up the destination and start
    /// the dispatcher and the accept loop.
    pub async fn start(
        config: DaemonConfig,
        transport: Arc<dyn Transport>,
        database: Database,
    ) -> Result<Self> {
        info!("Starting messaging daemon...");

        let persisted = database.load_identity()?;
        let keys = transport
            .open_destination(persisted.as_ref().map(|local| local.destination().clone()))
            .await?;

        let local = match persisted {
            Some(local) if local.destination() == &keys => local,
            Some(local) => {
                let local = local.with_destination(keys)?;
                database.store_identity(&local)?;
                local
            }
            None => {
                let local = LocalIdentity::generate(keys)?;
                database.store_identity(&local)?;
                local
            }
        };
        let local = Arc::new(local);

        info!(
            address = %RedactedAddress(local.address().as_str()),
            fingerprint = %local.identity().fingerprint(),
            "Destination ready"
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);

        let dispatcher = Dispatcher::new(
            local.clone(),
            transport.clone(),
            config.clone(),
            database,
            event_tx.clone(),
            session_tx.clone(),
        )?;
        let dispatcher = tokio::spawn(dispatcher.run(command_rx, session_rx));

        let acceptor = tokio::spawn(accept_loop(
            transport,
            local.clone(),
            config.session,
            session_tx,
        ));

        Ok(Self {
            handle: DaemonHandle {
                commands: command_tx,
                events: event_tx,
                address: local.address().clone(),
            },
            identity: local,
            dispatcher,
            acceptor,
        })
    }

    /// A client of the dispatcher.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// Our identity.
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Stop accepting, checkpoint and wait for the dispatcher to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.acceptor.abort();
        let result = self.handle.shutdown().await;
        let _ = self.dispatcher.await;
        info!("Messaging daemon stopped");
        result
    }
}

async fn accept_loop(
    transport: Arc<dyn Transport>,
    local: Arc<LocalIdentity>,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
) {
    info!("Listening for incoming streams...");

    loop {
        match transport.accept().await {
            Ok((remote, stream)) => {
                debug!(from = %RedactedAddress(remote.as_str()), "Incoming stream");
                spawn_accepted(stream, remote, local.clone(), config.clone(), events.clone());
            }
            Err(e) => {
                if events.is_closed() {
                    break;
                }
                debug!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_secs(ACCEPT_RETRY_SECS)).await;
            }
        }
    }
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Single owner of contacts, queue and database.
pub(crate) struct Dispatcher {
    local: Arc<LocalIdentity>,
    transport: Arc<dyn Transport>,
    config: DaemonConfig,
    contacts: ContactStore,
    queue: DeliveryQueue,
    database: Database,
    sessions: HashMap<Address, Vec<SessionHandle>>,
    connecting: HashSet<Address>,
    presence: Presence,
    events: broadcast::Sender<DaemonEvent>,
    session_tx: mpsc::Sender<SessionEvent>,
}

impl Dispatcher {
    pub(crate) fn new(
        local: Arc<LocalIdentity>,
        transport: Arc<dyn Transport>,
        config: DaemonConfig,
        database: Database,
        events: broadcast::Sender<DaemonEvent>,
        session_tx: mpsc::Sender<SessionEvent>,
    ) -> Result<Self> {
        let contacts = ContactStore::from_contacts(database.load_contacts()?);
        let mut queue = DeliveryQueue::new(config.delivery.clone());

        let now = now_millis();
        for envelope in database.load_envelopes()? {
            match contacts.state(&envelope.target) {
                TrustState::Unknown | TrustState::Blocked => {
                    database.delete_envelope(envelope.id)?;
                }
                _ => queue.push(envelope),
            }
        }
        for target in queue.targets() {
            queue.make_ready(&target, now);
        }

        info!(
            contacts = contacts.len(),
            queued = queue.len(),
            "Restored messaging state"
        );

        let presence = Presence::new(&config.presence, now);
        Ok(Self {
            local,
            transport,
            config,
            contacts,
            queue,
            database,
            sessions: HashMap::new(),
            connecting: HashSet::new(),
            presence,
            events,
            session_tx,
        })
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<DaemonCommand>,
        mut session_events: mpsc::Receiver<SessionEvent>,
    ) {
        loop {
            let now = now_millis();
            self.expire_in_flight(now);
            self.dispatch_ready(now);
            self.run_presence(now);
            let wake = self.next_wake(now);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(DaemonCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = session_events.recv() => self.handle_session_event(event),
                _ = tokio::time::sleep(wake) => {}
            }
        }
    }

    fn emit(&self, event: DaemonEvent) {
        let _ = self.events.send(event);
    }

    fn display_name(&self, address: &Address) -> String {
        self.contacts
            .get(address)
            .map(|c| c.display_name().to_string())
            .unwrap_or_else(|| address.to_string())
    }

    fn persist_contact(&self, address: &Address) {
        if let Some(contact) = self.contacts.get(address) {
            if let Err(e) = self.database.save_contact(contact) {
                error!(error = %e, "Failed to save contact");
            }
        }
    }

    fn save_contact(&self, address: &Address) -> Result<()> {
        match self.contacts.get(address) {
            Some(contact) => self.database.save_contact(contact),
            None => Ok(()),
        }
    }

    fn resolve(&self, target: &str) -> Result<Address> {
        self.contacts
            .find(target)
            .map(|c| c.address.clone())
            .ok_or_else(|| Error::NotFound(format!("no such contact: {}", target)))
    }

    fn resolve_or_parse(&self, target: &str) -> Result<Address> {
        self.resolve(target).or_else(|e| Address::parse(target).map_err(|_| e))
    }

    fn check_nickname(&self, address: &Address, nickname: Option<&str>) -> Result<()> {
        if let Some(nick) = nickname {
            if !crate::contacts::is_valid_nickname(nick) {
                return Err(Error::InvalidState(format!("invalid nickname: {}", nick)));
            }
            if self.contacts.nickname_taken(nick, Some(address)) {
                return Err(Error::InvalidState(format!("nickname already in use: {}", nick)));
            }
        }
        Ok(())
    }

    fn view(&self, contact: &Contact) -> ContactView {
        ContactView {
            contact: contact.clone(),
            online: self.presence.is_online(&contact.address),
            queued: self.queue.pending(&contact.address),
        }
    }

    fn primary(&self, address: &Address) -> Option<&SessionHandle> {
        self.sessions
            .get(address)
            .and_then(|handles| handles.iter().find(|h| !h.is_closed()))
    }

    fn session(&self, address: &Address, id: SessionId) -> Option<&SessionHandle> {
        self.sessions
            .get(address)
            .and_then(|handles| handles.iter().find(|h| h.id == id))
    }

    fn close_sessions(&mut self, address: &Address) {
        if self.sessions.remove(address).is_some() {
            debug!(peer = %RedactedAddress(address.as_str()), "Closing sessions");
        }
    }

    // Outbound

    /// Sign and persist a message for `target`, then queue it.
    fn enqueue(&mut self, target: &Address, kind: MessageKind, payload: Vec<u8>) -> Result<()> {
        let sequence = self
            .contacts
            .get_mut(target)
            .ok_or_else(|| Error::NotFound("unknown contact".into()))?
            .next_send_sequence();
        self.save_contact(target)?;

        let message = Message::signed(&self.local, kind, sequence, payload);
        let now = now_millis();
        let id = self.database.insert_envelope(target, &message, now)?;

        debug!(to = %RedactedAddress(target.as_str()), ?kind, sequence, "Queued envelope");
        self.queue.push(Envelope {
            id,
            target: target.clone(),
            message,
            attempts: 0,
            next_retry_at: now,
            created_at: now,
        });
        Ok(())
    }

    fn dispatch_ready(&mut self, now: i64) {
        for target in self.queue.targets() {
            let state = self.contacts.state(&target);
            let Some(envelope) = self.queue.ready(&target, state, now) else {
                continue;
            };
            let (id, message) = (envelope.id, envelope.message.clone());

            if let Some(handle) = self.primary(&target) {
                match handle.send(message) {
                    Ok(()) => {
                        debug!(to = %RedactedAddress(target.as_str()), envelope = id, "Sent envelope");
                        self.queue.mark_in_flight(&target, id, now);
                    }
                    Err(_) => {
                        let handle_id = handle.id;
                        if let Some(handles) = self.sessions.get_mut(&target) {
                            handles.retain(|h| h.id != handle_id);
                        }
                    }
                }
            } else {
                self.connect(&target);
            }
        }
    }

    /// Open a session to `target` unless one is being opened already.
    fn connect(&mut self, target: &Address) {
        if !self.connecting.insert(target.clone()) {
            return;
        }
        debug!(to = %RedactedAddress(target.as_str()), "Connecting");
        spawn_connect(
            self.transport.clone(),
            target.clone(),
            self.local.clone(),
            self.config.session.clone(),
            self.session_tx.clone(),
        );
    }

    fn expire_in_flight(&mut self, now: i64) {
        for target in self.queue.expired(now) {
            warn!(to = %RedactedAddress(target.as_str()), "Ack timeout");
            self.close_sessions(&target);
            if let Some(flight) = self.queue.in_flight(&target) {
                self.record_failure(&target, flight.envelope_id, now, "no acknowledgment".into());
            }
        }
    }

    /// Count a failed attempt and schedule the retry. Returns the attempts
    /// so far and the retry time.
    fn back_off(&mut self, target: &Address, envelope_id: i64, now: i64) -> Option<(u32, i64)> {
        let envelope = self.queue.fail(target, envelope_id, now)?;
        let (attempts, next_retry_at) = (envelope.attempts, envelope.next_retry_at);
        if let Err(e) = self.database.update_envelope(envelope) {
            error!(error = %e, "Failed to persist retry state");
        }
        Some((attempts, next_retry_at))
    }

    fn record_failure(&mut self, target: &Address, envelope_id: i64, now: i64, error: String) {
        let Some((attempts, next_retry_at)) = self.back_off(target, envelope_id, now) else {
            return;
        };

        debug!(
            to = %RedactedAddress(target.as_str()),
            attempts,
            retry_in_ms = next_retry_at - now,
            "Delivery attempt failed"
        );
        self.emit(DaemonEvent::DeliveryFailed {
            address: target.clone(),
            name: self.display_name(target),
            attempts,
            failed_at: now,
            next_retry_at,
            error,
        });
    }

    /// Record a failure against the envelope that is due for `target`, if
    /// any. Envelopes still waiting out their backoff are left alone.
    fn fail_due(&mut self, target: &Address, now: i64, error: String) {
        let state = self.contacts.state(target);
        if let Some(id) = self.queue.ready(target, state, now).map(|e| e.id) {
            self.record_failure(target, id, now, error);
        }
    }

    fn next_wake(&self, now: i64) -> Duration {
        let earliest = self
            .queue
            .targets()
            .iter()
            .filter(|target| !self.connecting.contains(*target))
            .filter_map(|target| self.queue.deadline(target, self.contacts.state(target)))
            .fold(self.presence.deadline(), i64::min);

        Duration::from_millis(earliest.saturating_sub(now).max(0) as u64)
    }

    // Presence

    fn run_presence(&mut self, now: i64) {
        for address in self.presence.expire(now) {
            debug!(peer = %RedactedAddress(address.as_str()), "Contact went quiet");
            self.emit(DaemonEvent::ContactOffline {
                name: self.display_name(&address),
                address,
            });
        }

        if self.presence.round_due(now) {
            let authorized: Vec<Address> = self
                .contacts
                .in_state(TrustState::Authorized)
                .map(|c| c.address.clone())
                .collect();
            self.presence.round(now, &authorized);
        }
        for address in self.presence.take_due(now) {
            self.ping(&address);
        }
    }

    /// Ping over an open session, or open one; the handshake answers too.
    fn ping(&mut self, address: &Address) {
        if self.contacts.state(address) != TrustState::Authorized {
            return;
        }
        match self.primary(address) {
            Some(handle) => {
                if handle.send(Message::ping(&self.local)).is_err() {
                    debug!(to = %RedactedAddress(address.as_str()), "Could not send ping");
                }
            }
            None => self.connect(address),
        }
    }

    /// Note traffic from an authorized contact.
    fn mark_seen(&mut self, address: &Address, now: i64) {
        if self.contacts.state(address) != TrustState::Authorized {
            return;
        }
        if self.presence.seen(address, now) {
            debug!(peer = %RedactedAddress(address.as_str()), "Contact online");
            self.emit(DaemonEvent::ContactOnline {
                address: address.clone(),
                name: self.display_name(address),
            });
        }
    }

    // Trust transitions

    fn on_authorized(&mut self, address: &Address) {
        if let Err(e) = self.contacts.ensure_nickname(address) {
            warn!(error = %e, "Could not assign nickname");
        }
        self.persist_contact(address);
        self.queue.make_ready(address, now_millis());

        info!(peer = %RedactedAddress(address.as_str()), "Contact authorized");
        self.emit(DaemonEvent::ContactAuthorized {
            address: address.clone(),
            name: self.display_name(address),
        });
    }

    fn on_blocked(&mut self, address: &Address, by_peer: bool) {
        for envelope in self.queue.purge(address) {
            if let Err(e) = self.database.delete_envelope(envelope.id) {
                error!(error = %e, "Failed to delete envelope");
            }
        }
        self.close_sessions(address);
        self.presence.forget(address);
        self.persist_contact(address);

        info!(peer = %RedactedAddress(address.as_str()), by_peer, "Contact blocked");
        self.emit(DaemonEvent::ContactBlocked {
            address: address.clone(),
            name: self.display_name(address),
            by_peer,
        });
    }

    fn send_reply(&mut self, address: &Address, reply: Option<AuthReply>, introduce_as: &str) -> Result<()> {
        match reply {
            Some(AuthReply::Request) => {
                self.enqueue(address, MessageKind::AuthRequest, introduce_as.as_bytes().to_vec())
            }
            Some(AuthReply::Accept) => self.enqueue(address, MessageKind::AuthResponse, vec![1]),
            Some(AuthReply::Reject) => {
                // Best effort: only over a session that is already open.
                let sequence = self
                    .contacts
                    .get_mut(address)
                    .map(Contact::next_send_sequence)
                    .unwrap_or_default();
                let message =
                    Message::signed(&self.local, MessageKind::AuthResponse, sequence, vec![0]);
                if let Some(handle) = self.primary(address) {
                    let _ = handle.send(message);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    // Commands

    fn handle_command(&mut self, command: DaemonCommand) {
        match command {
            DaemonCommand::RequestAuthorization {
                address,
                nickname,
                introduce_as,
                reply,
            } => {
                let _ = reply.send(self.request_authorization(&address, nickname, &introduce_as));
            }
            DaemonCommand::Accept {
                target,
                nickname,
                reply,
            } => {
                let _ = reply.send(self.accept(&target, nickname));
            }
            DaemonCommand::Reject { target, reply } => {
                let _ = reply.send(self.local_block(&target, TrustEvent::LocalReject));
            }
            DaemonCommand::Block { target, reply } => {
                let _ = reply.send(self.local_block(&target, TrustEvent::LocalBlock));
            }
            DaemonCommand::Unblock { target, reply } => {
                let _ = reply.send(self.unblock(&target));
            }
            DaemonCommand::Remove { target, reply } => {
                let _ = reply.send(self.remove(&target));
            }
            DaemonCommand::SendText {
                target,
                text,
                reply,
            } => {
                let _ = reply.send(self.send_text(&target, text));
            }
            DaemonCommand::Broadcast { text, reply } => {
                let _ = reply.send(self.broadcast(text));
            }
            DaemonCommand::Cancel { target, reply } => {
                let _ = reply.send(self.cancel(&target));
            }
            DaemonCommand::Contacts { reply } => {
                let views = self.contacts.iter().map(|c| self.view(c)).collect();
                let _ = reply.send(views);
            }
            DaemonCommand::Lookup { target, reply } => {
                let view = self.contacts.find(&target).map(|c| self.view(c));
                let _ = reply.send(view);
            }
            DaemonCommand::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn request_authorization(
        &mut self,
        address: &Address,
        nickname: Option<String>,
        introduce_as: &str,
    ) -> Result<()> {
        if address == self.local.address() {
            return Err(Error::InvalidState("cannot add yourself".into()));
        }
        self.check_nickname(address, nickname.as_deref())?;

        let outcome = self
            .contacts
            .apply(address, TrustEvent::LocalRequest, false, now_micros())?;
        if nickname.is_some() {
            self.contacts.set_nickname(address, nickname)?;
        }
        self.save_contact(address)?;

        info!(to = %RedactedAddress(address.as_str()), "Requesting authorization");
        self.send_reply(address, outcome.reply, introduce_as)?;
        if outcome.next == TrustState::Authorized {
            self.on_authorized(address);
        }
        Ok(())
    }

    fn accept(&mut self, target: &str, nickname: Option<String>) -> Result<()> {
        let address = self.resolve(target)?;
        self.check_nickname(&address, nickname.as_deref())?;

        let outcome = self
            .contacts
            .apply(&address, TrustEvent::LocalAccept, false, now_micros())?;
        if nickname.is_some() {
            self.contacts.set_nickname(&address, nickname)?;
        }
        self.save_contact(&address)?;
        self.send_reply(&address, outcome.reply, "")?;
        self.on_authorized(&address);
        Ok(())
    }

    fn local_block(&mut self, target: &str, event: TrustEvent) -> Result<()> {
        let address = match event {
            TrustEvent::LocalBlock => self.resolve_or_parse(target)?,
            _ => self.resolve(target)?,
        };
        let outcome = self.contacts.apply(&address, event, false, now_micros())?;
        self.send_reply(&address, outcome.reply, "")?;
        self.on_blocked(&address, false);
        Ok(())
    }

    fn unblock(&mut self, target: &str) -> Result<()> {
        let address = self.resolve_or_parse(target)?;
        if self.contacts.state(&address) != TrustState::Blocked {
            return Err(Error::InvalidState(format!("{} is not blocked", target)));
        }
        self.contacts.remove(&address);
        self.database.delete_contact(&address)?;
        info!(peer = %RedactedAddress(address.as_str()), "Contact unblocked");
        Ok(())
    }

    fn remove(&mut self, target: &str) -> Result<()> {
        let address = self.resolve(target)?;
        for envelope in self.queue.purge(&address) {
            self.database.delete_envelope(envelope.id)?;
        }
        self.close_sessions(&address);
        self.presence.forget(&address);
        self.contacts.remove(&address);
        self.database.delete_contact(&address)?;
        info!(peer = %RedactedAddress(address.as_str()), "Contact removed");
        Ok(())
    }

    fn send_text(&mut self, target: &str, text: String) -> Result<()> {
        let address = self.resolve(target)?;
        check_text(&text)?;
        if self.contacts.state(&address) == TrustState::Blocked {
            return Err(Error::InvalidState(format!("{} is blocked", target)));
        }
        self.enqueue(&address, MessageKind::Text, text.into_bytes())
    }

    fn broadcast(&mut self, text: String) -> Result<usize> {
        check_text(&text)?;
        let recipients: Vec<Address> = self
            .contacts
            .in_state(TrustState::Authorized)
            .map(|c| c.address.clone())
            .collect();
        for address in &recipients {
            self.enqueue(address, MessageKind::Broadcast, text.as_bytes().to_vec())?;
        }
        Ok(recipients.len())
    }

    fn cancel(&mut self, target: &str) -> Result<usize> {
        let address = self.resolve(target)?;
        let cancelled = self.queue.cancel(&address);
        for envelope in &cancelled {
            self.database.delete_envelope(envelope.id)?;
        }
        Ok(cancelled.len())
    }

    fn shutdown(&mut self) {
        info!("Saving messaging state");
        if let Err(e) = self
            .database
            .checkpoint(self.contacts.iter(), self.queue.iter())
        {
            error!(error = %e, "Checkpoint failed");
        }
        self.sessions.clear();
    }

    // Session events

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened(handle) => self.on_session_opened(handle),
            SessionEvent::Inbound {
                id,
                address,
                message,
            } => self.on_inbound(id, &address, message),
            SessionEvent::Closed { id, address } => self.on_session_closed(id, &address),
            SessionEvent::ConnectFailed { address, error } => {
                self.connecting.remove(&address);
                if self.primary(&address).is_some() {
                    return;
                }
                self.fail_due(&address, now_millis(), error.to_string());
            }
        }
    }

    fn on_session_opened(&mut self, handle: SessionHandle) {
        let address = handle.address.clone();
        self.connecting.remove(&address);
        let now = now_millis();

        let known = self.contacts.get(&address).map(|c| (c.state, c.key));
        match known {
            Some((TrustState::Blocked, _)) => {
                debug!(peer = %RedactedAddress(address.as_str()), "Dropping session from blocked contact");
                return;
            }
            Some((_, Some(pinned))) if pinned != handle.key => {
                warn!(peer = %RedactedAddress(address.as_str()), "Handshake key differs from pinned key, dropping session");
                self.fail_due(
                    &address,
                    now,
                    "peer signing key changed; remove and re-add the contact".into(),
                );
                return;
            }
            None if self.config.ignore_unauthorized => {
                debug!(peer = %RedactedAddress(address.as_str()), "Ignoring session from unknown peer");
                return;
            }
            _ => {}
        }

        self.sessions.entry(address.clone()).or_default().push(handle);
        self.queue.make_ready(&address, now);

        if known.is_some() {
            self.contacts.touch(&address, now / 1000);
            self.mark_seen(&address, now);
        }
    }

    fn on_session_closed(&mut self, id: SessionId, address: &Address) {
        let Some(handles) = self.sessions.get_mut(address) else {
            return;
        };
        handles.retain(|h| h.id != id && !h.is_closed());
        if !handles.is_empty() {
            return;
        }
        self.sessions.remove(address);

        if let Some(flight) = self.queue.in_flight(address) {
            self.record_failure(address, flight.envelope_id, now_millis(), "session closed".into());
        }
    }

    fn send_ack(&self, address: &Address, session: SessionId, sequence: u64) {
        self.reply(address, session, Message::ack(&self.local, sequence));
    }

    /// Answer over the session the request came in on, or any open one.
    fn reply(&self, address: &Address, session: SessionId, message: Message) {
        if let Some(handle) = self.session(address, session).or_else(|| self.primary(address)) {
            if handle.send(message).is_err() {
                debug!(to = %RedactedAddress(address.as_str()), "Could not send reply");
            }
        }
    }

    fn on_inbound(&mut self, session: SessionId, address: &Address, message: Message) {
        let state = self.contacts.state(address);
        if state == TrustState::Blocked {
            return;
        }
        if state == TrustState::Unknown && self.config.ignore_unauthorized {
            return;
        }

        let key = match self.contacts.get(address).and_then(|c| c.key) {
            Some(pinned) => pinned,
            None => match self.session(address, session) {
                Some(handle) => handle.key,
                None => return,
            },
        };
        if let Err(e) = message.verify_with(&key) {
            warn!(from = %RedactedAddress(address.as_str()), error = %e, "Dropping message");
            return;
        }

        let now = now_millis();
        self.contacts.touch(address, now / 1000);

        match message.kind {
            MessageKind::Handshake => {}
            MessageKind::Ack => self.on_ack(address, message.sequence),
            MessageKind::Ping => self.send_ack(address, session, message.sequence),
            MessageKind::Unauthorized => self.on_unauthorized(address, message.sequence, now),
            MessageKind::AuthRequest => {
                self.on_auth_request(address, &message);
                self.send_ack(address, session, message.sequence);
            }
            MessageKind::AuthResponse => {
                self.on_auth_response(address, &message);
                self.send_ack(address, session, message.sequence);
            }
            MessageKind::Text | MessageKind::Broadcast => {
                if state != TrustState::Authorized {
                    debug!(from = %RedactedAddress(address.as_str()), "Refusing text from unauthorized peer");
                    let refusal = Message::unauthorized(&self.local, message.sequence);
                    self.reply(address, session, refusal);
                    return;
                }
                self.on_content(address, &message);
                self.send_ack(address, session, message.sequence);
            }
        }
        self.mark_seen(address, now);
    }

    /// The peer has not authorized us. The refused envelope backs off like a
    /// failed attempt and stays queued.
    fn on_unauthorized(&mut self, address: &Address, sequence: u64, now: i64) {
        let Some(id) = self
            .queue
            .envelopes(address)
            .find(|e| e.message.sequence == sequence && e.message.kind.is_content())
            .map(|e| e.id)
        else {
            return;
        };
        let Some((attempts, _)) = self.back_off(address, id, now) else {
            return;
        };

        info!(peer = %RedactedAddress(address.as_str()), attempts, "Peer requires authorization");
        self.emit(DaemonEvent::AuthorizationRequired {
            address: address.clone(),
            name: self.display_name(address),
            attempts,
        });
    }

    fn on_ack(&mut self, address: &Address, sequence: u64) {
        let Some(envelope) = self.queue.ack(address, sequence) else {
            return;
        };
        if let Err(e) = self.database.delete_envelope(envelope.id) {
            error!(error = %e, "Failed to delete delivered envelope");
        }

        debug!(to = %RedactedAddress(address.as_str()), sequence, "Delivered");
        self.emit(DaemonEvent::Delivered {
            address: address.clone(),
            name: self.display_name(address),
            kind: envelope.message.kind,
            sequence,
        });
    }

    fn on_auth_request(&mut self, address: &Address, message: &Message) {
        let previous = self.contacts.state(address);
        let local_wins = self.local.identity().canonical_bytes() < message.sender.canonical_bytes();

        let outcome = match self
            .contacts
            .apply(address, TrustEvent::RemoteRequest, local_wins, now_micros())
        {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(from = %RedactedAddress(address.as_str()), error = %e, "Ignoring authorization request");
                return;
            }
        };

        if let Err(e) = self.contacts.pin_key(address, message.sender.key()) {
            warn!(from = %RedactedAddress(address.as_str()), error = %e, "Key pinning failed");
            return;
        }
        let proposed = String::from_utf8(message.payload.clone())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(contact) = self.contacts.get_mut(address) {
            if proposed.is_some() {
                contact.proposed_nickname = proposed.clone();
            }
        }
        self.persist_contact(address);

        if let Err(e) = self.send_reply(address, outcome.reply, "") {
            error!(error = %e, "Failed to queue authorization reply");
        }

        match outcome.next {
            TrustState::PendingInbound => {
                info!(from = %RedactedAddress(address.as_str()), "Authorization requested");
                self.emit(DaemonEvent::AuthorizationRequested {
                    address: address.clone(),
                    name: self.display_name(address),
                    proposed,
                });
            }
            TrustState::Authorized if previous != TrustState::Authorized => {
                self.on_authorized(address);
            }
            _ => {}
        }
    }

    fn on_auth_response(&mut self, address: &Address, message: &Message) {
        let event = match message.verdict() {
            Ok(true) => TrustEvent::RemoteAccept,
            Ok(false) => TrustEvent::RemoteReject,
            Err(e) => {
                debug!(error = %e, "Malformed authorization response");
                return;
            }
        };

        let previous = self.contacts.state(address);
        let outcome = match self.contacts.apply(address, event, false, now_micros()) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(from = %RedactedAddress(address.as_str()), error = %e, "Ignoring authorization response");
                return;
            }
        };
        if let Err(e) = self.contacts.pin_key(address, message.sender.key()) {
            warn!(error = %e, "Key pinning failed");
            return;
        }

        match outcome.next {
            TrustState::Authorized if previous != TrustState::Authorized => {
                self.on_authorized(address)
            }
            TrustState::Blocked if previous != TrustState::Blocked => {
                self.on_blocked(address, true)
            }
            _ => self.persist_contact(address),
        }
    }

    fn on_content(&mut self, address: &Address, message: &Message) {
        let text = match message.text() {
            Ok(text) if text.len() <= MAX_TEXT_LEN => text,
            _ => {
                debug!(from = %RedactedAddress(address.as_str()), "Dropping malformed text");
                return;
            }
        };

        let fresh = self
            .contacts
            .get_mut(address)
            .map_or(false, |c| c.accept_sequence(message.sequence));
        if !fresh {
            debug!(
                from = %RedactedAddress(address.as_str()),
                sequence = message.sequence,
                "Dropping replayed message"
            );
            return;
        }
        self.persist_contact(address);

        self.emit(DaemonEvent::MessageReceived {
            address: address.clone(),
            name: self.display_name(address),
            kind: message.kind,
            text,
        });
    }
}

fn check_text(text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(Error::InvalidState("empty message".into()));
    }
    if text.len() > MAX_TEXT_LEN {
        return Err(Error::InvalidState(format!(
            "message longer than {} bytes",
            MAX_TEXT_LEN
        )));
    }
    Ok(())
}
