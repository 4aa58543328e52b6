//! Contact trust state machine.

use crate::error::{Error, Result};
use std::fmt;

/// Trust state of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustState {
    /// No record. Never persisted.
    Unknown,
    /// We sent an authorization request and await the verdict.
    PendingOutbound,
    /// The peer asked for authorization and awaits our decision.
    PendingInbound,
    /// Both sides exchange text.
    Authorized,
    /// Everything from the peer is dropped until an explicit unblock.
    Blocked,
}

impl TrustState {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Unknown => "unknown",
            TrustState::PendingOutbound => "pending_outbound",
            TrustState::PendingInbound => "pending_inbound",
            TrustState::Authorized => "authorized",
            TrustState::Blocked => "blocked",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending_outbound" => Ok(TrustState::PendingOutbound),
            "pending_inbound" => Ok(TrustState::PendingInbound),
            "authorized" => Ok(TrustState::Authorized),
            "blocked" => Ok(TrustState::Blocked),
            other => Err(Error::Storage(format!("unknown trust state: {}", other))),
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustEvent {
    /// User asked to add the contact.
    LocalRequest,
    /// Peer sent an authorization request.
    RemoteRequest,
    /// User accepted a pending request.
    LocalAccept,
    /// User rejected a pending request.
    LocalReject,
    /// User blocked the contact.
    LocalBlock,
    /// Peer accepted our request.
    RemoteAccept,
    /// Peer rejected our request.
    RemoteReject,
}

/// Authorization message to send as a consequence of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReply {
    /// Send an authorization request.
    Request,
    /// Send an accepting authorization response.
    Accept,
    /// Send a rejecting authorization response.
    Reject,
}

/// Outcome of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State after the event.
    pub next: TrustState,
    /// Message owed to the peer.
    pub reply: Option<AuthReply>,
}

impl Transition {
    fn to(next: TrustState) -> Self {
        Self { next, reply: None }
    }

    fn reply(next: TrustState, reply: AuthReply) -> Self {
        Self {
            next,
            reply: Some(reply),
        }
    }
}

/// Apply an event to a state.
///
/// `local_wins` is true when our identity's canonical bytes sort before the
/// peer's. It only matters when a request crosses ours in flight: the
/// smaller side treats its own request as authoritative and stays silent,
/// the larger side answers with an accept.
///
/// Local misuse yields `InvalidState`; remote messages that make no sense in
/// the current state yield `ProtocolViolation`. Remote traffic for a blocked
/// contact is absorbed without a reply.
pub fn transition(state: TrustState, event: TrustEvent, local_wins: bool) -> Result<Transition> {
    use AuthReply::*;
    use TrustEvent::*;
    use TrustState::*;

    let outcome = match (state, event) {
        (Unknown, LocalRequest) => Transition::reply(PendingOutbound, Request),
        (Unknown, RemoteRequest) => Transition::to(PendingInbound),
        (Unknown, LocalAccept) | (Unknown, LocalReject) => {
            return Err(Error::NotFound("no pending request from this contact".into()))
        }
        (Unknown, LocalBlock) => Transition::to(Blocked),
        (Unknown, RemoteAccept) | (Unknown, RemoteReject) => {
            return Err(Error::ProtocolViolation(
                "authorization response from unknown peer".into(),
            ))
        }

        (PendingOutbound, LocalRequest) => Transition::to(PendingOutbound),
        (PendingOutbound, RemoteRequest) if local_wins => Transition::to(Authorized),
        (PendingOutbound, RemoteRequest) => Transition::reply(Authorized, Accept),
        (PendingOutbound, LocalAccept) => {
            return Err(Error::InvalidState("no pending request from this contact".into()))
        }
        (PendingOutbound, LocalReject) | (PendingOutbound, LocalBlock) => Transition::to(Blocked),
        (PendingOutbound, RemoteAccept) => Transition::to(Authorized),
        (PendingOutbound, RemoteReject) => Transition::to(Blocked),

        (PendingInbound, LocalRequest) | (PendingInbound, LocalAccept) => {
            Transition::reply(Authorized, Accept)
        }
        (PendingInbound, RemoteRequest) => Transition::to(PendingInbound),
        (PendingInbound, LocalReject) => Transition::reply(Blocked, Reject),
        (PendingInbound, LocalBlock) => Transition::to(Blocked),
        (PendingInbound, RemoteAccept) | (PendingInbound, RemoteReject) => {
            return Err(Error::ProtocolViolation(
                "authorization response without a request".into(),
            ))
        }

        (Authorized, LocalRequest) | (Authorized, LocalAccept) => {
            return Err(Error::InvalidState("contact is already authorized".into()))
        }
        (Authorized, RemoteRequest) => Transition::reply(Authorized, Accept),
        (Authorized, LocalReject) | (Authorized, LocalBlock) => Transition::to(Blocked),
        (Authorized, RemoteAccept) => Transition::to(Authorized),
        (Authorized, RemoteReject) => {
            return Err(Error::ProtocolViolation(
                "rejection for an authorized contact".into(),
            ))
        }

        (Blocked, LocalRequest) | (Blocked, LocalAccept) => {
            return Err(Error::InvalidState(
                "contact is blocked, unblock it first".into(),
            ))
        }
        (Blocked, _) => Transition::to(Blocked),
    };

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [TrustState; 5] = [
        TrustState::Unknown,
        TrustState::PendingOutbound,
        TrustState::PendingInbound,
        TrustState::Authorized,
        TrustState::Blocked,
    ];

    #[test]
    fn test_request_flow() {
        let t = transition(TrustState::Unknown, TrustEvent::LocalRequest, false).expect("request");
        assert_eq!(t, Transition::reply(TrustState::PendingOutbound, AuthReply::Request));

        let t = transition(TrustState::PendingOutbound, TrustEvent::RemoteAccept, false)
            .expect("accept");
        assert_eq!(t.next, TrustState::Authorized);
        assert_eq!(t.reply, None);
    }

    #[test]
    fn test_inbound_flow() {
        let t = transition(TrustState::Unknown, TrustEvent::RemoteRequest, false).expect("inbound");
        assert_eq!(t.next, TrustState::PendingInbound);

        let t = transition(TrustState::PendingInbound, TrustEvent::LocalAccept, false)
            .expect("accept");
        assert_eq!(t, Transition::reply(TrustState::Authorized, AuthReply::Accept));
    }

    #[test]
    fn test_reject_goes_to_blocked() {
        let t = transition(TrustState::PendingOutbound, TrustEvent::RemoteReject, false)
            .expect("reject");
        assert_eq!(t.next, TrustState::Blocked);

        let t = transition(TrustState::PendingInbound, TrustEvent::LocalReject, false)
            .expect("reject");
        assert_eq!(t, Transition::reply(TrustState::Blocked, AuthReply::Reject));
    }

    #[test]
    fn test_crossing_requests_converge() {
        // smaller identity stays silent, larger one answers
        let small = transition(TrustState::PendingOutbound, TrustEvent::RemoteRequest, true)
            .expect("small side");
        let large = transition(TrustState::PendingOutbound, TrustEvent::RemoteRequest, false)
            .expect("large side");

        assert_eq!(small, Transition::to(TrustState::Authorized));
        assert_eq!(large, Transition::reply(TrustState::Authorized, AuthReply::Accept));

        // the small side then sees the accept while already authorized
        let t = transition(TrustState::Authorized, TrustEvent::RemoteAccept, true).expect("noop");
        assert_eq!(t, Transition::to(TrustState::Authorized));
    }

    #[test]
    fn test_block_from_every_state() {
        for state in ALL_STATES {
            let t = transition(state, TrustEvent::LocalBlock, false).expect("block always allowed");
            assert_eq!(t.next, TrustState::Blocked);
        }
    }

    #[test]
    fn test_blocked_absorbs_remote_events() {
        for event in [
            TrustEvent::RemoteRequest,
            TrustEvent::RemoteAccept,
            TrustEvent::RemoteReject,
        ] {
            let t = transition(TrustState::Blocked, event, false).expect("absorbed");
            assert_eq!(t, Transition::to(TrustState::Blocked));
        }
        assert!(transition(TrustState::Blocked, TrustEvent::LocalRequest, false).is_err());
    }

    #[test]
    fn test_violations() {
        assert!(matches!(
            transition(TrustState::Unknown, TrustEvent::RemoteAccept, false),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            transition(TrustState::PendingInbound, TrustEvent::RemoteAccept, false),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            transition(TrustState::Authorized, TrustEvent::LocalRequest, false),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_remote_request_when_authorized_resends_accept() {
        let t = transition(TrustState::Authorized, TrustEvent::RemoteRequest, true).expect("resend");
        assert_eq!(t.reply, Some(AuthReply::Accept));
    }

    #[test]
    fn test_state_storage_names() {
        for state in &ALL_STATES[1..] {
            assert_eq!(TrustState::parse(state.as_str()).expect("parse"), *state);
        }
        assert!(TrustState::parse("unknown").is_err());
    }
}
