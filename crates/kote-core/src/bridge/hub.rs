//! Connected IRC clients and the scrollback kept while none is attached.

use super::line::privmsg;
use super::{CONTACTS_BOT, CONTACTS_CHANNEL};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Maximum retained scrollback entries.
pub const SCROLLBACK_LIMIT: usize = 1000;

pub(crate) type ClientId = u64;

/// Something to show to IRC clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outgoing {
    /// A line identical for every client.
    Raw(String),
    /// PRIVMSG to a channel.
    Channel {
        from: String,
        channel: String,
        text: String,
    },
    /// PRIVMSG addressed to whichever nick the client uses.
    Direct { from: String, text: String },
}

impl Outgoing {
    /// A ContactsBot line in #contacts.
    pub fn bot(text: impl Into<String>) -> Self {
        Outgoing::Channel {
            from: CONTACTS_BOT.to_string(),
            channel: CONTACTS_CHANNEL.to_string(),
            text: text.into(),
        }
    }

    pub fn render(&self, nick: &str) -> Vec<String> {
        match self {
            Outgoing::Raw(line) => vec![line.clone()],
            Outgoing::Channel {
                from,
                channel,
                text,
            } => privmsg(from, channel, text),
            Outgoing::Direct { from, text } => privmsg(from, nick, text),
        }
    }
}

struct Slot {
    nick: String,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<ClientId, Slot>,
    scrollback: VecDeque<Outgoing>,
}

impl HubState {
    fn send(&self, slot: &Slot, outgoing: &Outgoing) {
        for line in outgoing.render(&slot.nick) {
            if slot.tx.try_send(line).is_err() {
                warn!("IRC client is not keeping up, dropping output");
                return;
            }
        }
    }
}

/// Shared registry of registered clients.
#[derive(Clone, Default)]
pub(crate) struct Hub {
    state: Arc<Mutex<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Returns `None` when `nick` is in use.
    ///
    /// The first client to arrive while nobody was connected receives the
    /// scrollback, returned here for replay after its welcome burst.
    pub async fn register(
        &self,
        id: ClientId,
        nick: &str,
        tx: mpsc::Sender<String>,
    ) -> Option<Vec<Outgoing>> {
        let mut state = self.state.lock().await;
        if state
            .clients
            .values()
            .any(|slot| slot.nick.eq_ignore_ascii_case(nick))
        {
            return None;
        }
        let replay = if state.clients.is_empty() {
            state.scrollback.drain(..).collect()
        } else {
            Vec::new()
        };
        state.clients.insert(
            id,
            Slot {
                nick: nick.to_string(),
                tx,
            },
        );
        Some(replay)
    }

    /// Change a registered client's nick. Returns false when `nick` is in use.
    pub async fn rename(&self, id: ClientId, nick: &str) -> bool {
        let mut state = self.state.lock().await;
        if state
            .clients
            .iter()
            .any(|(other, slot)| *other != id && slot.nick.eq_ignore_ascii_case(nick))
        {
            return false;
        }
        if let Some(slot) = state.clients.get_mut(&id) {
            slot.nick = nick.to_string();
        }
        true
    }

    pub async fn unregister(&self, id: ClientId) {
        self.state.lock().await.clients.remove(&id);
    }

    /// Whether another client uses `nick`.
    pub async fn nick_in_use(&self, nick: &str, except: ClientId) -> bool {
        self.state
            .lock()
            .await
            .clients
            .iter()
            .any(|(id, slot)| *id != except && slot.nick.eq_ignore_ascii_case(nick))
    }

    /// Nicks of all registered clients.
    pub async fn nicks(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut nicks: Vec<String> = state.clients.values().map(|s| s.nick.clone()).collect();
        nicks.sort();
        nicks
    }

    /// Show `outgoing` to every client. With nobody connected it goes to the
    /// scrollback when `keep` is set and is dropped otherwise.
    pub async fn publish(&self, outgoing: Outgoing, keep: bool) {
        let mut state = self.state.lock().await;
        if state.clients.is_empty() {
            if keep {
                if state.scrollback.len() >= SCROLLBACK_LIMIT {
                    state.scrollback.pop_front();
                }
                state.scrollback.push_back(outgoing);
            }
            return;
        }
        for slot in state.clients.values() {
            state.send(slot, &outgoing);
        }
    }

    /// Show `outgoing` to every client except `origin`.
    pub async fn echo(&self, origin: ClientId, outgoing: Outgoing) {
        let state = self.state.lock().await;
        for (id, slot) in &state.clients {
            if *id != origin {
                state.send(slot, &outgoing);
            }
        }
    }

    pub async fn scrollback_len(&self) -> usize {
        self.state.lock().await.scrollback.len()
    }
}
