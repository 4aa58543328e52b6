//! Commands typed into #contacts.

use super::hub::Outgoing;
use super::line::{action, contact_prefix};
use super::CONTACTS_CHANNEL;
use crate::contacts::TrustState;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::messaging::{ContactView, DaemonHandle};

/// Help shown by `help` and the HELP command.
pub const HELP_TEXT: &[&str] = &[
    "Commands available in #contacts:",
    "  add <nick>:<address>       request authorization from a new contact",
    "  add <address> [nick]       same, with the nickname after the address",
    "  accept <nick|address> [nick]  authorize a pending request",
    "  reject <nick|address>      reject a pending request",
    "  block <nick|address>       drop everything from a contact",
    "  unblock <nick|address>     forget a blocked contact",
    "  remove <nick|address>      delete a contact and its queued messages (alias: del)",
    "  cancel <nick|address>      drop undelivered messages to a contact",
    "  list                       show all contacts",
    "  pending                    show requests waiting for your decision",
    "  online                     show contacts heard from recently",
    "  broadcast <text>           send text to every authorized contact",
    "  whoami                     show your own address",
    "Write to a contact by sending a private message to its nick.",
    "Lines written in #public are broadcast to all authorized contacts.",
];

/// A parsed #contacts command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Show the command list.
    Help,
    /// Request authorization.
    Add {
        /// Address as typed.
        address: String,
        /// Local nickname.
        nickname: Option<String>,
    },
    /// Accept a pending inbound request.
    Accept {
        /// Nickname or address.
        target: String,
        /// Local nickname override.
        nickname: Option<String>,
    },
    /// Reject a pending inbound request.
    Reject(String),
    /// Block a contact.
    Block(String),
    /// Unblock a contact.
    Unblock(String),
    /// Remove a contact.
    Remove(String),
    /// Drop queued text.
    Cancel(String),
    /// List contacts.
    List,
    /// List pending inbound requests.
    Pending,
    /// List contacts heard from recently.
    Online,
    /// Broadcast text.
    Broadcast(String),
    /// Show the local address.
    WhoAmI,
}

fn usage(text: &str) -> Error {
    Error::InvalidState(format!("usage: {}", text))
}

impl ControlCommand {
    /// Parse a line. The verb is case-insensitive.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (verb, rest) = match input.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (input, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let one = |name: &str| -> Result<String> {
            match args.as_slice() {
                [target] => Ok(target.to_string()),
                _ => Err(usage(&format!("{} <nick|address>", name))),
            }
        };

        match verb.to_ascii_lowercase().as_str() {
            "help" => Ok(ControlCommand::Help),
            "add" => match args.as_slice() {
                [arg] => match arg.split_once(':') {
                    Some((nick, address)) if !nick.is_empty() && !address.is_empty() => {
                        Ok(ControlCommand::Add {
                            address: address.to_string(),
                            nickname: Some(nick.to_string()),
                        })
                    }
                    Some(_) => Err(usage("add <nick>:<address>")),
                    None => Ok(ControlCommand::Add {
                        address: arg.to_string(),
                        nickname: None,
                    }),
                },
                [address, nick] => Ok(ControlCommand::Add {
                    address: address.to_string(),
                    nickname: Some(nick.to_string()),
                }),
                _ => Err(usage("add <nick>:<address>")),
            },
            "accept" => match args.as_slice() {
                [target] => Ok(ControlCommand::Accept {
                    target: target.to_string(),
                    nickname: None,
                }),
                [target, nick] => Ok(ControlCommand::Accept {
                    target: target.to_string(),
                    nickname: Some(nick.to_string()),
                }),
                _ => Err(usage("accept <nick|address> [nick]")),
            },
            "reject" => one("reject").map(ControlCommand::Reject),
            "block" => one("block").map(ControlCommand::Block),
            "unblock" => one("unblock").map(ControlCommand::Unblock),
            "remove" | "del" => one("remove").map(ControlCommand::Remove),
            "cancel" => one("cancel").map(ControlCommand::Cancel),
            "list" => Ok(ControlCommand::List),
            "pending" => Ok(ControlCommand::Pending),
            "online" => Ok(ControlCommand::Online),
            "whoami" => Ok(ControlCommand::WhoAmI),
            "broadcast" if !rest.is_empty() => Ok(ControlCommand::Broadcast(rest.to_string())),
            "broadcast" => Err(usage("broadcast <text>")),
            "" => Err(Error::InvalidState("empty command, type 'help'".into())),
            other => Err(Error::InvalidState(format!(
                "unknown command '{}', type 'help'",
                other
            ))),
        }
    }
}

fn whoami(daemon: &DaemonHandle, nick: &str) -> Outgoing {
    Outgoing::bot(format!("Your address --> {}:{}", nick, daemon.address()))
}

fn format_last_seen(seconds: Option<i64>) -> String {
    seconds
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn describe(view: &ContactView) -> String {
    let contact = &view.contact;
    format!(
        "{}:{} {}{}, last seen {}, {} queued",
        contact.nickname.as_deref().unwrap_or("?"),
        contact.address,
        contact.state,
        if view.online { " (online)" } else { "" },
        format_last_seen(contact.last_seen),
        view.queued
    )
}

async fn resolve(daemon: &DaemonHandle, target: &str) -> Result<ContactView> {
    daemon
        .lookup(target)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no contact '{}'", target)))
}

/// Run a command on behalf of the client `nick`. Lines to show to every
/// client are returned; errors go back to the issuing client only.
pub(crate) async fn execute(
    command: ControlCommand,
    daemon: &DaemonHandle,
    nick: &str,
) -> Result<Vec<Outgoing>> {
    match command {
        ControlCommand::Help => {
            let mut out: Vec<Outgoing> = HELP_TEXT.iter().map(|l| Outgoing::bot(*l)).collect();
            out.push(whoami(daemon, nick));
            Ok(out)
        }
        ControlCommand::WhoAmI => Ok(vec![whoami(daemon, nick)]),
        ControlCommand::Add { address, nickname } => {
            let address = Address::parse(&address)?;
            daemon
                .request_authorization(address.clone(), nickname.clone(), nick)
                .await?;
            let name = nickname.unwrap_or_else(|| address.to_string());
            Ok(vec![Outgoing::bot(format!(
                "Authorization request to {} queued",
                name
            ))])
        }
        // Accept, reject and block are announced through daemon events.
        ControlCommand::Accept { target, nickname } => {
            daemon.accept(target, nickname).await?;
            Ok(Vec::new())
        }
        ControlCommand::Reject(target) => {
            daemon.reject(target).await?;
            Ok(Vec::new())
        }
        ControlCommand::Block(target) => {
            daemon.block(target).await?;
            Ok(Vec::new())
        }
        ControlCommand::Unblock(target) => {
            daemon.unblock(target.clone()).await?;
            Ok(vec![Outgoing::bot(format!("{} is no longer blocked", target))])
        }
        ControlCommand::Remove(target) => {
            let view = resolve(daemon, &target).await?;
            daemon.remove(view.contact.address.to_string()).await?;
            let name = view.contact.display_name().to_string();
            let mut out = Vec::new();
            if view.contact.nickname.is_some() {
                out.push(Outgoing::Raw(format!(
                    ":{} QUIT :removed",
                    contact_prefix(&name, view.contact.address.as_str())
                )));
            }
            out.push(Outgoing::bot(format!("{} removed", name)));
            Ok(out)
        }
        ControlCommand::Cancel(target) => {
            let dropped = daemon.cancel(target.clone()).await?;
            Ok(vec![Outgoing::bot(format!(
                "Dropped {} queued message(s) for {}",
                dropped, target
            ))])
        }
        ControlCommand::Broadcast(text) => {
            let count = daemon.broadcast(text).await?;
            Ok(vec![Outgoing::bot(format!(
                "Broadcast queued for {} contact(s)",
                count
            ))])
        }
        ControlCommand::List => {
            let contacts = daemon.contacts().await?;
            if contacts.is_empty() {
                return Ok(vec![Outgoing::bot("No contacts yet, type 'help'")]);
            }
            Ok(contacts.iter().map(|v| Outgoing::bot(describe(v))).collect())
        }
        ControlCommand::Pending => {
            let pending: Vec<Outgoing> = daemon
                .contacts()
                .await?
                .into_iter()
                .filter(|v| v.contact.state == TrustState::PendingInbound)
                .map(|v| {
                    Outgoing::bot(format!(
                        "{}:{} waits for your decision",
                        v.contact.proposed_nickname.as_deref().unwrap_or("?"),
                        v.contact.address
                    ))
                })
                .collect();
            if pending.is_empty() {
                return Ok(vec![Outgoing::bot("No pending requests")]);
            }
            Ok(pending)
        }
        ControlCommand::Online => {
            let online: Vec<Outgoing> = daemon
                .contacts()
                .await?
                .into_iter()
                .filter(|v| v.online)
                .map(|v| Outgoing::Channel {
                    from: contact_prefix(v.contact.display_name(), v.contact.address.as_str()),
                    channel: CONTACTS_CHANNEL.to_string(),
                    text: action("is online"),
                })
                .collect();
            if online.is_empty() {
                return Ok(vec![Outgoing::bot("Nobody is online")]);
            }
            Ok(online)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_forms() {
        assert_eq!(
            ControlCommand::parse("add bob:abc.b32.i2p").expect("add"),
            ControlCommand::Add {
                address: "abc.b32.i2p".into(),
                nickname: Some("bob".into()),
            }
        );
        assert_eq!(
            ControlCommand::parse("ADD abc.b32.i2p bob").expect("add"),
            ControlCommand::Add {
                address: "abc.b32.i2p".into(),
                nickname: Some("bob".into()),
            }
        );
        assert_eq!(
            ControlCommand::parse("add abc.b32.i2p").expect("add"),
            ControlCommand::Add {
                address: "abc.b32.i2p".into(),
                nickname: None,
            }
        );
        assert!(ControlCommand::parse("add :abc.b32.i2p").is_err());
        assert!(ControlCommand::parse("add").is_err());
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            ControlCommand::parse("Accept bob").expect("accept"),
            ControlCommand::Accept {
                target: "bob".into(),
                nickname: None,
            }
        );
        assert_eq!(
            ControlCommand::parse("accept abc.b32.i2p robert").expect("accept"),
            ControlCommand::Accept {
                target: "abc.b32.i2p".into(),
                nickname: Some("robert".into()),
            }
        );
        assert_eq!(
            ControlCommand::parse("del bob").expect("del"),
            ControlCommand::Remove("bob".into())
        );
        assert_eq!(
            ControlCommand::parse("block  bob ").expect("block"),
            ControlCommand::Block("bob".into())
        );
        assert!(ControlCommand::parse("reject").is_err());
        assert!(ControlCommand::parse("unblock a b").is_err());
    }

    #[test]
    fn test_parse_broadcast_keeps_text() {
        assert_eq!(
            ControlCommand::parse("broadcast hello   everyone").expect("broadcast"),
            ControlCommand::Broadcast("hello   everyone".into())
        );
        assert!(ControlCommand::parse("broadcast").is_err());
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(ControlCommand::parse("LIST").expect("list"), ControlCommand::List);
        assert_eq!(ControlCommand::parse("whoami").expect("whoami"), ControlCommand::WhoAmI);
        let err = ControlCommand::parse("frobnicate x").expect_err("unknown");
        assert!(err.to_string().contains("frobnicate"));
        assert!(ControlCommand::parse("   ").is_err());
    }

    #[test]
    fn test_last_seen_format() {
        assert_eq!(format_last_seen(None), "never");
        assert_eq!(format_last_seen(Some(0)), "1970-01-01 00:00:00 UTC");
    }
}
