//! IRC front end.
//!
//! A local IRC server through which any IRC client drives the messenger.
//! Contacts appear as IRC users; private messages to them are private
//! messages on the network. Two channels are joined on registration:
//!
//! - `#contacts`: contact management through [`ControlCommand`]s, with
//!   ContactsBot reporting requests and presence
//! - `#public`: broadcast to every authorized contact
//!
//! Several clients may be attached at once. Lines typed in one are echoed
//! to the others; while none is attached, inbound traffic is kept in a
//! bounded scrollback for the next client.

mod client;
mod control;
mod hub;
mod line;
mod reply;

pub use client::{DISCONNECT_AFTER_SECS, PING_AFTER_SECS};
pub use control::{ControlCommand, HELP_TEXT};
pub use hub::SCROLLBACK_LIMIT;
pub use line::{IrcLine, MAX_CLIENT_LINE_LEN, MAX_LINE_LEN};

use crate::error::{Error, Result};
use crate::logging::Redacted;
use crate::messaging::{DaemonEvent, DaemonHandle};
use crate::protocol::MessageKind;
use hub::{Hub, Outgoing};
use line::{action, contact_prefix};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Server name used as the prefix of numeric replies.
pub const SERVER_NAME: &str = "kote";

/// Default listen address.
pub const DEFAULT_BRIDGE_ADDRESS: &str = "127.0.0.1:17772";

/// Contact management channel.
pub const CONTACTS_CHANNEL: &str = "#contacts";

/// Broadcast channel.
pub const PUBLIC_CHANNEL: &str = "#public";

/// Pseudo-user answering in #contacts.
pub const CONTACTS_BOT: &str = "ContactsBot";

const CHANNELS: [&str; 2] = [CONTACTS_CHANNEL, PUBLIC_CHANNEL];

const ACCEPT_RETRY_MILLIS: u64 = 500;

fn canonical_channel(name: &str) -> Option<&'static str> {
    CHANNELS
        .into_iter()
        .find(|channel| channel.eq_ignore_ascii_case(name))
}

fn channel_topic(channel: &str) -> Option<&'static str> {
    match channel {
        CONTACTS_CHANNEL => Some("Manage contacts here. Type HELP for assistance"),
        PUBLIC_CHANNEL => Some("Broadcast messages to all of your peers"),
        _ => None,
    }
}

/// Bridge settings.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Listen address.
    pub listen_addr: String,
    /// Password required through PASS, if any.
    pub password: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_BRIDGE_ADDRESS.to_string(),
            password: None,
        }
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("listen_addr", &self.listen_addr)
            .field("password", &self.password.as_ref().map(Redacted))
            .finish()
    }
}

pub(crate) struct BridgeContext {
    password: Option<String>,
    daemon: DaemonHandle,
    hub: Hub,
}

/// The IRC server.
pub struct IrcBridge {
    listener: TcpListener,
    events: broadcast::Receiver<DaemonEvent>,
    ctx: Arc<BridgeContext>,
}

impl IrcBridge {
    /// Bind the listener and subscribe to daemon events.
    pub async fn bind(config: BridgeConfig, daemon: DaemonHandle) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await.map_err(|e| {
            Error::Transport(format!(
                "failed to bind IRC server on {}: {}",
                config.listen_addr, e
            ))
        })?;
        info!("IRC server listening on {}", config.listen_addr);

        Ok(Self {
            listener,
            events: daemon.subscribe(),
            ctx: Arc::new(BridgeContext {
                password: config.password,
                daemon,
                hub: Hub::new(),
            }),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients and relay daemon events until the task is dropped.
    pub async fn run(self) {
        let pump = tokio::spawn(pump_events(self.events, self.ctx.hub.clone()));
        let _pump = AbortOnDrop(pump);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("IRC client connected from {}", peer);
                    tokio::spawn(client::serve(stream, self.ctx.clone()));
                }
                Err(e) => {
                    warn!("IRC accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(ACCEPT_RETRY_MILLIS)).await;
                }
            }
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn pump_events(mut events: broadcast::Receiver<DaemonEvent>, hub: Hub) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let (lines, keep) = render_event(&event);
                for outgoing in lines {
                    hub.publish(outgoing, keep).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("IRC bridge lagged, {} events not shown", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("daemon event stream closed");
                return;
            }
        }
    }
}

/// Turn a daemon event into client output. The flag says whether the
/// output belongs in the scrollback.
fn render_event(event: &DaemonEvent) -> (Vec<Outgoing>, bool) {
    match event {
        DaemonEvent::AuthorizationRequested {
            address, proposed, ..
        } => (
            vec![Outgoing::bot(format!(
                "Authorization request --> {}:{}. Type 'accept {} [nick]' or 'reject {}'",
                proposed.as_deref().unwrap_or("?"),
                address,
                address,
                address
            ))],
            true,
        ),
        DaemonEvent::ContactAuthorized { address, name } => {
            let prefix = contact_prefix(name, address.as_str());
            (
                vec![
                    Outgoing::Raw(format!(":{} JOIN {}", prefix, CONTACTS_CHANNEL)),
                    Outgoing::Raw(format!(":{} JOIN {}", prefix, PUBLIC_CHANNEL)),
                    Outgoing::bot(format!("{} is now authorized", name)),
                ],
                true,
            )
        }
        DaemonEvent::ContactBlocked { name, by_peer, .. } => {
            let text = if *by_peer {
                format!("{} rejected the authorization request", name)
            } else {
                format!("{} is blocked", name)
            };
            (vec![Outgoing::bot(text)], true)
        }
        DaemonEvent::MessageReceived {
            address,
            name,
            kind,
            text,
        } => {
            let from = contact_prefix(name, address.as_str());
            let outgoing = match kind {
                MessageKind::Broadcast => Outgoing::Channel {
                    from,
                    channel: PUBLIC_CHANNEL.to_string(),
                    text: text.clone(),
                },
                _ => Outgoing::Direct {
                    from,
                    text: text.clone(),
                },
            };
            (vec![outgoing], true)
        }
        DaemonEvent::Delivered {
            name,
            kind: MessageKind::AuthRequest,
            ..
        } => (
            vec![Outgoing::bot(format!(
                "Authorization request delivered to {}",
                name
            ))],
            false,
        ),
        DaemonEvent::Delivered { .. } => (Vec::new(), false),
        DaemonEvent::DeliveryFailed {
            name,
            attempts: 1,
            error,
            ..
        } => (
            vec![Outgoing::bot(format!(
                "Cannot reach {} ({}), will keep trying",
                name, error
            ))],
            false,
        ),
        DaemonEvent::DeliveryFailed { .. } => (Vec::new(), false),
        DaemonEvent::AuthorizationRequired {
            address,
            name,
            attempts: 1,
        } => (
            vec![Outgoing::Channel {
                from: contact_prefix(name, address.as_str()),
                channel: CONTACTS_CHANNEL.to_string(),
                text: action("Authorization required"),
            }],
            true,
        ),
        DaemonEvent::AuthorizationRequired { .. } => (Vec::new(), false),
        DaemonEvent::ContactOnline { address, name } => (
            vec![Outgoing::Channel {
                from: contact_prefix(name, address.as_str()),
                channel: CONTACTS_CHANNEL.to_string(),
                text: action("is online"),
            }],
            false,
        ),
        DaemonEvent::ContactOffline { address, name } => (
            vec![Outgoing::Channel {
                from: contact_prefix(name, address.as_str()),
                channel: CONTACTS_CHANNEL.to_string(),
                text: action("is offline"),
            }],
            false,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Address;

    fn bob() -> Address {
        Address::from_destination(b"bob destination")
    }

    #[test]
    fn test_render_private_text() {
        let (lines, keep) = render_event(&DaemonEvent::MessageReceived {
            address: bob(),
            name: "bob".into(),
            kind: MessageKind::Text,
            text: "hi\nthere".into(),
        });
        assert!(keep);
        let rendered = lines[0].render("alice");
        let prefix = contact_prefix("bob", bob().as_str());
        assert_eq!(
            rendered,
            vec![
                format!(":{} PRIVMSG alice :hi", prefix),
                format!(":{} PRIVMSG alice :there", prefix),
            ]
        );
    }

    #[test]
    fn test_render_broadcast_goes_to_public() {
        let (lines, _) = render_event(&DaemonEvent::MessageReceived {
            address: bob(),
            name: "bob".into(),
            kind: MessageKind::Broadcast,
            text: "news".into(),
        });
        let rendered = lines[0].render("alice");
        assert!(rendered[0].ends_with("PRIVMSG #public :news"));
    }

    #[test]
    fn test_render_presence() {
        let (lines, keep) = render_event(&DaemonEvent::ContactOnline {
            address: bob(),
            name: "bob".into(),
        });
        assert!(!keep);
        assert!(lines[0].render("alice")[0].ends_with("PRIVMSG #contacts :\x01ACTION is online\x01"));
    }

    #[test]
    fn test_render_authorization_required() {
        let required = |attempts| DaemonEvent::AuthorizationRequired {
            address: bob(),
            name: "bob".into(),
            attempts,
        };
        let (lines, keep) = render_event(&required(1));
        assert!(keep);
        let prefix = contact_prefix("bob", bob().as_str());
        assert_eq!(
            lines[0].render("alice"),
            vec![format!(
                ":{} PRIVMSG #contacts :\x01ACTION Authorization required\x01",
                prefix
            )]
        );
        assert!(render_event(&required(2)).0.is_empty());
    }

    #[test]
    fn test_render_rejected_by_peer() {
        let (lines, keep) = render_event(&DaemonEvent::ContactBlocked {
            address: bob(),
            name: "bob".into(),
            by_peer: true,
        });
        assert!(keep);
        assert_eq!(
            lines[0].render("alice"),
            vec![":ContactsBot PRIVMSG #contacts :bob rejected the authorization request".to_string()]
        );
    }

    #[test]
    fn test_render_failure_only_first_attempt() {
        let failed = |attempts| DaemonEvent::DeliveryFailed {
            address: bob(),
            name: "bob".into(),
            attempts,
            failed_at: 0,
            next_retry_at: 0,
            error: "peer unreachable".into(),
        };
        assert_eq!(render_event(&failed(1)).0.len(), 1);
        assert!(render_event(&failed(2)).0.is_empty());
    }

    #[test]
    fn test_render_auth_request() {
        let (lines, keep) = render_event(&DaemonEvent::AuthorizationRequested {
            address: bob(),
            name: bob().to_string(),
            proposed: Some("bob".into()),
        });
        assert!(keep);
        let line = &lines[0].render("alice")[0];
        assert!(line.starts_with(":ContactsBot PRIVMSG #contacts :Authorization request --> bob:"));
    }

    #[test]
    fn test_channels() {
        assert_eq!(canonical_channel("#CONTACTS"), Some(CONTACTS_CHANNEL));
        assert_eq!(canonical_channel("#other"), None);
        assert_eq!(
            channel_topic(PUBLIC_CHANNEL),
            Some("Broadcast messages to all of your peers")
        );
    }
}
