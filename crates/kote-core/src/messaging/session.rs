//! Per-stream session tasks.
//!
//! A session owns one transport stream. It runs the handshake, then shuttles
//! frames: inbound frames are decoded and handed to the dispatcher, outbound
//! messages arrive on the session's channel and are written in order.
//!
//! ```text
//!   connecting side                 accepting side
//!   ---------------                 --------------
//!   handshake  ------------------>  verify (self-signed, address == stream)
//!   verify     <------------------  handshake
//!   ... signed messages and acks in both directions ...
//! ```
//!
//! Trust decisions (pinned keys, blocked contacts, sequences) belong to the
//! dispatcher; the session only checks that the peer is who the stream says.

use crate::error::{Error, Result};
use crate::identity::{Address, LocalIdentity};
use crate::logging::RedactedAddress;
use crate::protocol::{decode, read_frame, write_frame, Message, MessageKind};
use crate::transport::{BoxStream, Transport};
use ed25519_dalek::VerifyingKey;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Time allowed for the handshake (seconds).
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 60;

/// A session with no traffic in either direction closes after this long
/// (seconds).
pub const SESSION_IDLE_SECS: u64 = 300;

/// Outbound messages buffered per session.
const OUTBOUND_CAPACITY: usize = 64;

/// Decoded frames buffered between the reader and the session loop.
const INBOUND_CAPACITY: usize = 32;

/// Session identifier, unique within the process.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed for the handshake.
    pub handshake_timeout: Duration,
    /// Idle time before the session closes.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(SESSION_IDLE_SECS),
        }
    }
}

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We connected; we speak first.
    Initiator,
    /// The peer connected; we answer.
    Acceptor,
}

/// Dispatcher-side handle to a running session. Dropping every handle
/// closes the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Session id.
    pub id: SessionId,
    /// Peer address, as reported by the transport.
    pub address: Address,
    /// Key the peer signed its handshake with.
    pub key: VerifyingKey,
    /// Side that opened the stream.
    pub role: Role,
    outbound: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        address: Address,
        key: VerifyingKey,
        role: Role,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            address,
            key,
            role,
            outbound,
        }
    }

    /// Queue a message for the peer. Fails when the session is gone or its
    /// buffer is full.
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .try_send(message)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Whether the session task has exited.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Reports from session and connect tasks to the dispatcher.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed.
    Opened(SessionHandle),
    /// A decoded message. Not yet verified against the pinned key.
    Inbound {
        /// Session the message arrived on.
        id: SessionId,
        /// Peer address.
        address: Address,
        /// The message.
        message: Message,
    },
    /// The session ended.
    Closed {
        /// Session id.
        id: SessionId,
        /// Peer address.
        address: Address,
    },
    /// An outbound connection could not be established.
    ConnectFailed {
        /// Target address.
        address: Address,
        /// Why.
        error: Error,
    },
}

/// Connect to `target` and run a session on the stream. Failures before the
/// handshake completes are reported as [`SessionEvent::ConnectFailed`].
pub fn spawn_connect(
    transport: Arc<dyn Transport>,
    target: Address,
    local: Arc<LocalIdentity>,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
) {
    tokio::spawn(async move {
        let stream = match transport.connect(&target).await {
            Ok(stream) => stream,
            Err(error) => {
                debug!(to = %RedactedAddress(target.as_str()), error = %error, "Connect failed");
                let _ = events
                    .send(SessionEvent::ConnectFailed {
                        address: target,
                        error,
                    })
                    .await;
                return;
            }
        };

        if let Err(error) =
            run_session(stream, target.clone(), Role::Initiator, local, config, events.clone()).await
        {
            let _ = events
                .send(SessionEvent::ConnectFailed {
                    address: target,
                    error,
                })
                .await;
        }
    });
}

/// Run a session on an accepted stream.
pub fn spawn_accepted(
    stream: BoxStream,
    remote: Address,
    local: Arc<LocalIdentity>,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
) {
    tokio::spawn(async move {
        let from = remote.clone();
        if let Err(e) = run_session(stream, remote, Role::Acceptor, local, config, events).await {
            debug!(from = %RedactedAddress(from.as_str()), error = %e, "Inbound handshake failed");
        }
    });
}

/// Drive one session to completion. Returns an error only when the handshake
/// fails; after that, the end of the session is reported as
/// [`SessionEvent::Closed`].
pub async fn run_session(
    mut stream: BoxStream,
    remote: Address,
    role: Role,
    local: Arc<LocalIdentity>,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
) -> Result<()> {
    let key = tokio::time::timeout(
        config.handshake_timeout,
        handshake(&mut stream, &remote, role, &local),
    )
    .await
    .map_err(|_| Error::Timeout)??;

    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let handle = SessionHandle::new(id, remote.clone(), key, role, outbound_tx);
    if events.send(SessionEvent::Opened(handle)).await.is_err() {
        return Ok(());
    }

    debug!(id, peer = %RedactedAddress(remote.as_str()), ?role, "Session open");

    let (mut reader, mut writer) = tokio::io::split(stream);
    let (frames_tx, mut frames_rx) = mpsc::channel(INBOUND_CAPACITY);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader).await;
            let done = frame.is_err();
            if frames_tx.send(frame).await.is_err() || done {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = frames_rx.recv() => match frame {
                Some(Ok(bytes)) => match decode(&bytes) {
                    Ok(message) if message.sender.address() == &remote => {
                        let event = SessionEvent::Inbound {
                            id,
                            address: remote.clone(),
                            message,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        warn!(id, "Dropping message with mismatched sender address");
                    }
                    Err(e) => {
                        debug!(id, error = %e, "Skipping malformed frame");
                    }
                },
                Some(Err(e)) => {
                    debug!(id, error = %e, "Session stream ended");
                    break;
                }
                None => break,
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = write_frame(&mut writer, &message).await {
                        debug!(id, error = %e, "Session write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(config.idle_timeout) => {
                debug!(id, "Session idle, closing");
                break;
            }
        }
    }

    reader_task.abort();
    let _ = events
        .send(SessionEvent::Closed {
            id,
            address: remote.clone(),
        })
        .await;
    debug!(id, peer = %RedactedAddress(remote.as_str()), "Session closed");

    Ok(())
}

/// Exchange handshakes. Returns the key the peer signed with.
async fn handshake(
    stream: &mut BoxStream,
    remote: &Address,
    role: Role,
    local: &LocalIdentity,
) -> Result<VerifyingKey> {
    let ours = Message::handshake(local);

    if role == Role::Initiator {
        write_frame(stream, &ours).await?;
    }

    let bytes = read_frame(stream).await?;
    let theirs = decode(&bytes)?;
    if theirs.kind != MessageKind::Handshake {
        return Err(Error::ProtocolViolation(format!(
            "expected handshake, got {:?}",
            theirs.kind
        )));
    }
    theirs.verify()?;
    if theirs.sender.address() != remote {
        return Err(Error::Signature(
            "handshake address differs from stream address".into(),
        ));
    }

    if role == Role::Acceptor {
        write_frame(stream, &ours).await?;
    }

    Ok(*theirs.sender.key())
}
