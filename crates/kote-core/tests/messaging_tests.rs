//! End-to-end messaging scenarios over the in-memory network.
//!
//! Every node runs a full daemon (dispatcher, sessions, database) on a
//! [`MemoryNetwork`]; only the I2P router is replaced.

use async_trait::async_trait;
use kote_core::contacts::TrustState;
use kote_core::delivery::DeliveryConfig;
use kote_core::identity::{Address, DestinationKeys, LocalIdentity};
use kote_core::messaging::{
    DaemonConfig, DaemonEvent, DaemonHandle, MessagingDaemon, PresenceConfig,
};
use kote_core::protocol::MessageKind;
use kote_core::storage::{Database, DatabaseConfig};
use kote_core::transport::{BoxStream, MemoryNetwork, MemoryTransport, Transport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_WAIT: Duration = Duration::from_secs(10);

fn test_config() -> DaemonConfig {
    DaemonConfig {
        delivery: DeliveryConfig {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(70),
            ack_timeout: Duration::from_secs(2),
        },
        ..DaemonConfig::default()
    }
}

struct Node {
    daemon: MessagingDaemon,
    handle: DaemonHandle,
    events: broadcast::Receiver<DaemonEvent>,
}

/// Memory transport that counts outbound connects.
struct CountingTransport {
    inner: MemoryTransport,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn open_destination(
        &self,
        persisted: Option<DestinationKeys>,
    ) -> kote_core::Result<DestinationKeys> {
        self.inner.open_destination(persisted).await
    }

    async fn accept(&self) -> kote_core::Result<(Address, BoxStream)> {
        self.inner.accept().await
    }

    async fn connect(&self, target: &Address) -> kote_core::Result<BoxStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(target).await
    }
}

impl Node {
    async fn start(network: &MemoryNetwork, database: Database) -> Self {
        Self::launch(test_config(), Arc::new(network.transport()), database).await
    }

    async fn launch(
        config: DaemonConfig,
        transport: Arc<dyn Transport>,
        database: Database,
    ) -> Self {
        let daemon = MessagingDaemon::start(config, transport, database)
            .await
            .expect("start daemon");
        let handle = daemon.handle();
        let events = handle.subscribe();
        Self {
            daemon,
            handle,
            events,
        }
    }

    async fn in_memory(network: &MemoryNetwork) -> Self {
        Self::start(network, Database::open_in_memory().expect("open db")).await
    }

    fn address(&self) -> Address {
        self.handle.address().clone()
    }

    async fn wait_for(&mut self, mut matches: impl FnMut(&DaemonEvent) -> bool) -> DaemonEvent {
        tokio::time::timeout(EVENT_WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn state_of(&self, target: &Address) -> TrustState {
        self.handle
            .lookup(target.to_string())
            .await
            .expect("lookup")
            .map(|view| view.contact.state)
            .unwrap_or(TrustState::Unknown)
    }

    async fn online(&self, target: &Address) -> bool {
        self.handle
            .lookup(target.to_string())
            .await
            .expect("lookup")
            .map_or(false, |view| view.online)
    }

    /// Events received so far, without waiting.
    fn drain(&mut self) -> Vec<DaemonEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    async fn queued_for(&self, target: &Address) -> usize {
        self.handle
            .lookup(target.to_string())
            .await
            .expect("lookup")
            .map(|view| view.queued)
            .unwrap_or(0)
    }
}

/// `from` asks `to` for authorization under `nick`, `to` accepts.
async fn authorize(from: &mut Node, to: &mut Node, nick: &str) {
    from.handle
        .request_authorization(to.address(), Some(nick.to_string()), "alice")
        .await
        .expect("request authorization");
    to.wait_for(|e| matches!(e, DaemonEvent::AuthorizationRequested { .. }))
        .await;
    to.handle
        .accept(from.address().to_string(), None)
        .await
        .expect("accept");
    let expected = nick.to_string();
    from.wait_for(|e| matches!(e, DaemonEvent::ContactAuthorized { name, .. } if *name == expected))
        .await;
}

/// Request, accept, and text queued before the accept is delivered after it.
#[tokio::test]
async fn test_authorization_then_queued_text() {
    let network = MemoryNetwork::new();
    let mut alice = Node::in_memory(&network).await;
    let mut bob = Node::in_memory(&network).await;

    alice
        .handle
        .request_authorization(bob.address(), Some("bob".into()), "alice")
        .await
        .expect("request");
    assert_eq!(alice.state_of(&bob.address()).await, TrustState::PendingOutbound);

    let request = bob
        .wait_for(|e| matches!(e, DaemonEvent::AuthorizationRequested { .. }))
        .await;
    match request {
        DaemonEvent::AuthorizationRequested {
            address, proposed, ..
        } => {
            assert_eq!(address, alice.address());
            assert_eq!(proposed.as_deref(), Some("alice"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(bob.state_of(&alice.address()).await, TrustState::PendingInbound);

    alice
        .handle
        .send_text("bob", "written before the accept")
        .await
        .expect("queue text");
    assert_eq!(alice.queued_for(&bob.address()).await, 1);

    bob.handle
        .accept(alice.address().to_string(), None)
        .await
        .expect("accept");
    assert_eq!(bob.state_of(&alice.address()).await, TrustState::Authorized);

    alice
        .wait_for(|e| matches!(e, DaemonEvent::ContactAuthorized { .. }))
        .await;
    assert_eq!(alice.state_of(&bob.address()).await, TrustState::Authorized);

    let received = bob
        .wait_for(|e| matches!(e, DaemonEvent::MessageReceived { .. }))
        .await;
    match received {
        DaemonEvent::MessageReceived {
            name, kind, text, ..
        } => {
            assert_eq!(name, "alice");
            assert_eq!(kind, MessageKind::Text);
            assert_eq!(text, "written before the accept");
        }
        other => panic!("unexpected event {:?}", other),
    }

    alice
        .wait_for(|e| {
            matches!(
                e,
                DaemonEvent::Delivered {
                    kind: MessageKind::Text,
                    ..
                }
            )
        })
        .await;
    assert_eq!(alice.queued_for(&bob.address()).await, 0);
}

/// Requests crossing each other end with both sides authorized.
#[tokio::test]
async fn test_mutual_requests_converge() {
    let network = MemoryNetwork::new();
    let mut alice = Node::in_memory(&network).await;
    let mut bob = Node::in_memory(&network).await;

    let (a, b) = tokio::join!(
        alice
            .handle
            .request_authorization(bob.address(), Some("bob".into()), "alice"),
        bob.handle
            .request_authorization(alice.address(), Some("alice".into()), "bob"),
    );
    a.expect("alice request");
    b.expect("bob request");

    alice
        .wait_for(|e| matches!(e, DaemonEvent::ContactAuthorized { .. }))
        .await;
    bob.wait_for(|e| matches!(e, DaemonEvent::ContactAuthorized { .. }))
        .await;

    assert_eq!(alice.state_of(&bob.address()).await, TrustState::Authorized);
    assert_eq!(bob.state_of(&alice.address()).await, TrustState::Authorized);

    bob.handle.send_text("alice", "we agree").await.expect("send");
    let received = alice
        .wait_for(|e| matches!(e, DaemonEvent::MessageReceived { .. }))
        .await;
    assert!(matches!(received, DaemonEvent::MessageReceived { text, .. } if text == "we agree"));
}

/// A broadcast makes one envelope per authorized contact; blocking an
/// offline contact drops its copy.
#[tokio::test]
async fn test_broadcast_and_block_offline_contact() {
    let network = MemoryNetwork::new();
    let mut alice = Node::in_memory(&network).await;
    let mut bob = Node::in_memory(&network).await;
    let mut carol = Node::in_memory(&network).await;
    let mut dave = Node::in_memory(&network).await;

    authorize(&mut alice, &mut bob, "bob").await;
    authorize(&mut alice, &mut carol, "carol").await;
    authorize(&mut alice, &mut dave, "dave").await;

    let dave_address = dave.address();
    dave.daemon.shutdown().await.expect("stop dave");
    network.detach(&dave_address);

    let recipients = alice.handle.broadcast("hello everyone").await.expect("broadcast");
    assert_eq!(recipients, 3);

    for node in [&mut bob, &mut carol] {
        let received = node
            .wait_for(|e| matches!(e, DaemonEvent::MessageReceived { .. }))
            .await;
        match received {
            DaemonEvent::MessageReceived { kind, text, .. } => {
                assert_eq!(kind, MessageKind::Broadcast);
                assert_eq!(text, "hello everyone");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    alice
        .wait_for(|e| matches!(e, DaemonEvent::DeliveryFailed { name, .. } if name == "dave"))
        .await;
    assert_eq!(alice.queued_for(&dave_address).await, 1);

    alice.handle.block("dave").await.expect("block");
    assert_eq!(alice.state_of(&dave_address).await, TrustState::Blocked);
    assert_eq!(alice.queued_for(&dave_address).await, 0);
}

/// Failed connects back off by 20, 40, then 70 ms (capped).
#[tokio::test]
async fn test_offline_contact_backs_off() {
    let network = MemoryNetwork::new();
    let mut alice = Node::in_memory(&network).await;
    let nowhere = MemoryTransport::generate_keys()
        .address()
        .expect("address");

    alice
        .handle
        .request_authorization(nowhere.clone(), None, "alice")
        .await
        .expect("request");

    let mut gaps = Vec::new();
    let mut attempts_seen = Vec::new();
    while gaps.len() < 3 {
        let event = alice
            .wait_for(|e| matches!(e, DaemonEvent::DeliveryFailed { .. }))
            .await;
        if let DaemonEvent::DeliveryFailed {
            attempts,
            failed_at,
            next_retry_at,
            ..
        } = event
        {
            attempts_seen.push(attempts);
            gaps.push(next_retry_at - failed_at);
        }
    }

    assert_eq!(attempts_seen, vec![1, 2, 3]);
    assert_eq!(gaps, vec![20, 40, 70]);
    assert_eq!(alice.state_of(&nowhere).await, TrustState::PendingOutbound);
    assert_eq!(alice.queued_for(&nowhere).await, 1);
}

/// Queued envelopes and a pending request survive a restart and go out
/// once the peer appears, without a new handshake.
#[tokio::test]
async fn test_restart_keeps_queue_and_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let network = MemoryNetwork::new();

    // Bob's identity exists before he ever comes online.
    let bob_db = Database::open_in_memory().expect("bob db");
    let bob_identity =
        LocalIdentity::generate(MemoryTransport::generate_keys()).expect("bob identity");
    bob_db.store_identity(&bob_identity).expect("store bob");
    let bob_address = bob_identity.address().clone();

    let alice_db = || Database::open(&DatabaseConfig::in_dir(dir.path())).expect("alice db");

    let alice = Node::start(&network, alice_db()).await;
    let alice_address = alice.address();
    alice
        .handle
        .request_authorization(bob_address.clone(), Some("bob".into()), "alice")
        .await
        .expect("request");
    alice
        .handle
        .send_text("bob", "see you after the restart")
        .await
        .expect("queue text");
    assert_eq!(alice.queued_for(&bob_address).await, 2);
    alice.daemon.shutdown().await.expect("stop alice");

    let mut alice = Node::start(&network, alice_db()).await;
    assert_eq!(alice.address(), alice_address);
    assert_eq!(alice.state_of(&bob_address).await, TrustState::PendingOutbound);
    assert_eq!(alice.queued_for(&bob_address).await, 2);

    let mut bob = Node::start(&network, bob_db).await;
    assert_eq!(bob.address(), bob_address);

    bob.wait_for(|e| matches!(e, DaemonEvent::AuthorizationRequested { .. }))
        .await;
    bob.handle
        .accept(alice_address.to_string(), None)
        .await
        .expect("accept");

    alice
        .wait_for(|e| matches!(e, DaemonEvent::ContactAuthorized { .. }))
        .await;
    let received = bob
        .wait_for(|e| matches!(e, DaemonEvent::MessageReceived { .. }))
        .await;
    assert!(matches!(
        received,
        DaemonEvent::MessageReceived { text, .. } if text == "see you after the restart"
    ));
}

/// Unknown peers are refused when configured to ignore them.
#[tokio::test]
async fn test_ignore_unauthorized_drops_requests() {
    let network = MemoryNetwork::new();
    let mut alice = Node::in_memory(&network).await;

    let config = DaemonConfig {
        ignore_unauthorized: true,
        ..test_config()
    };
    let bob = MessagingDaemon::start(
        config,
        Arc::new(network.transport()),
        Database::open_in_memory().expect("bob db"),
    )
    .await
    .expect("start bob");
    let bob_handle = bob.handle();

    alice
        .handle
        .request_authorization(bob_handle.address().clone(), None, "alice")
        .await
        .expect("request");
    alice
        .wait_for(|e| matches!(e, DaemonEvent::DeliveryFailed { .. }))
        .await;

    assert!(bob_handle.contacts().await.expect("contacts").is_empty());
}

/// A rejected request blocks the contact and drops what was queued for it.
#[tokio::test]
async fn test_rejected_request_blocks_and_purges() {
    let network = MemoryNetwork::new();
    let mut alice = Node::in_memory(&network).await;
    let mut bob = Node::in_memory(&network).await;
    let bob_address = bob.address();

    alice
        .handle
        .request_authorization(bob_address.clone(), Some("bob".into()), "alice")
        .await
        .expect("request");
    alice
        .handle
        .send_text("bob", "waiting for the verdict")
        .await
        .expect("queue text");

    bob.wait_for(|e| matches!(e, DaemonEvent::AuthorizationRequested { .. }))
        .await;
    bob.handle
        .reject(alice.address().to_string())
        .await
        .expect("reject");
    assert_eq!(bob.state_of(&alice.address()).await, TrustState::Blocked);

    let blocked = alice
        .wait_for(|e| matches!(e, DaemonEvent::ContactBlocked { .. }))
        .await;
    assert!(matches!(
        blocked,
        DaemonEvent::ContactBlocked { by_peer: true, ref name, .. } if name == "bob"
    ));
    assert_eq!(alice.state_of(&bob_address).await, TrustState::Blocked);
    assert_eq!(alice.queued_for(&bob_address).await, 0);
    assert!(alice.handle.send_text("bob", "still there?").await.is_err());
}

/// A contact that comes back on the same address with a different signing
/// key is refused, and the retry schedule keeps reconnects in check.
#[tokio::test]
async fn test_changed_signing_key_backs_off() {
    let network = MemoryNetwork::new();
    let connects = Arc::new(AtomicUsize::new(0));
    let transport = CountingTransport {
        inner: network.transport(),
        connects: connects.clone(),
    };
    let mut alice = Node::launch(
        test_config(),
        Arc::new(transport),
        Database::open_in_memory().expect("alice db"),
    )
    .await;
    let mut bob = Node::in_memory(&network).await;
    authorize(&mut alice, &mut bob, "bob").await;

    let bob_address = bob.address();
    let bob_keys = bob.daemon.identity().destination().clone();
    bob.daemon.shutdown().await.expect("stop bob");

    let impostor_db = Database::open_in_memory().expect("impostor db");
    let impostor_identity = LocalIdentity::generate(bob_keys).expect("impostor identity");
    impostor_db
        .store_identity(&impostor_identity)
        .expect("store impostor");
    let mut impostor = Node::start(&network, impostor_db).await;
    assert_eq!(impostor.address(), bob_address);

    alice
        .handle
        .send_text("bob", "is this still you?")
        .await
        .expect("queue text");
    alice
        .wait_for(|e| {
            matches!(e, DaemonEvent::DeliveryFailed { error, .. } if error.contains("signing key"))
        })
        .await;

    let before = connects.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let during = connects.load(Ordering::SeqCst) - before;
    assert!(during <= 20, "{} connects in 300 ms", during);

    assert_eq!(alice.queued_for(&bob_address).await, 1);
    assert_eq!(alice.state_of(&bob_address).await, TrustState::Authorized);
    assert!(!impostor
        .drain()
        .iter()
        .any(|e| matches!(e, DaemonEvent::MessageReceived { .. })));
}

/// Text to a peer that forgot us is refused, not lost: the sender is told
/// and the envelope stays queued.
#[tokio::test]
async fn test_text_to_peer_that_forgot_us() {
    let network = MemoryNetwork::new();
    let mut alice = Node::in_memory(&network).await;
    let mut bob = Node::in_memory(&network).await;
    authorize(&mut alice, &mut bob, "bob").await;

    let bob_address = bob.address();
    bob.handle
        .remove(alice.address().to_string())
        .await
        .expect("remove");
    bob.drain();

    alice
        .handle
        .send_text("bob", "remember me?")
        .await
        .expect("queue text");
    alice
        .wait_for(|e| {
            matches!(e, DaemonEvent::AuthorizationRequired { name, .. } if name == "bob")
        })
        .await;

    assert_eq!(alice.queued_for(&bob_address).await, 1);
    assert_eq!(alice.state_of(&bob_address).await, TrustState::Authorized);
    assert_eq!(bob.state_of(&alice.address()).await, TrustState::Unknown);
    assert!(!bob
        .drain()
        .iter()
        .any(|e| matches!(e, DaemonEvent::MessageReceived { .. })));
}

/// Pings keep a live contact online; one that stops answering goes offline
/// after the idle limit.
#[tokio::test]
async fn test_silent_contact_goes_offline() {
    let network = MemoryNetwork::new();
    let config = DaemonConfig {
        presence: PresenceConfig {
            ping_interval: Duration::from_millis(50),
            max_idle: Duration::from_millis(300),
            ping_all_window: Duration::from_millis(50),
        },
        ..test_config()
    };
    let mut alice = Node::launch(
        config,
        Arc::new(network.transport()),
        Database::open_in_memory().expect("alice db"),
    )
    .await;
    let mut bob = Node::in_memory(&network).await;
    authorize(&mut alice, &mut bob, "bob").await;

    let bob_address = bob.address();
    alice
        .wait_for(|e| matches!(e, DaemonEvent::ContactOnline { name, .. } if name == "bob"))
        .await;
    assert!(alice.online(&bob_address).await);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(alice.online(&bob_address).await, "pings keep bob online");

    bob.daemon.shutdown().await.expect("stop bob");
    network.detach(&bob_address);
    alice
        .wait_for(|e| matches!(e, DaemonEvent::ContactOffline { name, .. } if name == "bob"))
        .await;
    assert!(!alice.online(&bob_address).await);
}
