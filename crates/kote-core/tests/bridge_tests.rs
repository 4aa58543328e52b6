//! IRC bridge driven by a real TCP client against daemons on the
//! in-memory network.

use kote_core::bridge::{BridgeConfig, IrcBridge, MAX_CLIENT_LINE_LEN};
use kote_core::delivery::DeliveryConfig;
use kote_core::messaging::{DaemonConfig, DaemonEvent, DaemonHandle, MessagingDaemon};
use kote_core::storage::Database;
use kote_core::transport::MemoryNetwork;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

async fn start_daemon(network: &MemoryNetwork) -> MessagingDaemon {
    let config = DaemonConfig {
        delivery: DeliveryConfig {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(70),
            ack_timeout: Duration::from_secs(2),
        },
        ..DaemonConfig::default()
    };
    MessagingDaemon::start(
        config,
        Arc::new(network.transport()),
        Database::open_in_memory().expect("db"),
    )
    .await
    .expect("start daemon")
}

async fn start_bridge(daemon: DaemonHandle, password: Option<&str>) -> SocketAddr {
    let config = BridgeConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        password: password.map(str::to_string),
    };
    let bridge = IrcBridge::bind(config, daemon).await.expect("bind bridge");
    let addr = bridge.local_addr().expect("local addr");
    tokio::spawn(bridge.run());
    addr
}

struct IrcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl IrcClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .expect("write");
    }

    /// Read lines until one satisfies `matches`.
    async fn expect(&mut self, matches: impl Fn(&str) -> bool) -> String {
        tokio::time::timeout(WAIT, async {
            loop {
                let mut line = String::new();
                let read = self.reader.read_line(&mut line).await.expect("read");
                assert!(read > 0, "server closed the connection");
                let line = line.trim_end().to_string();
                if matches(&line) {
                    return line;
                }
            }
        })
        .await
        .expect("timed out waiting for IRC line")
    }

    async fn register(&mut self, nick: &str) {
        self.send(&format!("NICK {}", nick)).await;
        self.send(&format!("USER {} 0 * :{}", nick, nick)).await;
        self.expect(|l| l.contains(" 001 ")).await;
        self.expect(|l| l.contains(" 366 ") && l.contains("#public"))
            .await;
    }
}

async fn wait_event(
    events: &mut broadcast::Receiver<DaemonEvent>,
    matches: impl Fn(&DaemonEvent) -> bool,
) -> DaemonEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Registration burst, auto-join and the error paths.
#[tokio::test]
async fn test_registration_and_errors() {
    let network = MemoryNetwork::new();
    let alice = start_daemon(&network).await;
    let addr = start_bridge(alice.handle(), None).await;

    let mut client = IrcClient::connect(addr).await;
    client.send("CAP LS 302").await;
    client.expect(|l| l == ":kote CAP * LS :").await;
    client.send("NICK alice").await;
    client.send("USER alice 0 * :Alice").await;
    for code in ["001", "002", "003", "004", "251", "422"] {
        let wanted = format!(":kote {} alice", code);
        client.expect(|l| l.starts_with(&wanted)).await;
    }
    client
        .expect(|l| l == ":kote 332 alice #contacts :Manage contacts here. Type HELP for assistance")
        .await;
    client
        .expect(|l| l.starts_with(":kote 353 alice = #contacts :") && l.contains("ContactsBot"))
        .await;
    client
        .expect(|l| l == ":kote 332 alice #public :Broadcast messages to all of your peers")
        .await;

    client.send("FROB x").await;
    client
        .expect(|l| l == ":kote 421 alice FROB :Unknown command")
        .await;

    client.send("PRIVMSG").await;
    client.expect(|l| l.starts_with(":kote 411 alice")).await;

    client.send("PRIVMSG #contacts :frobnicate").await;
    client
        .expect(|l| l.starts_with(":kote NOTICE alice :unknown command 'frobnicate'"))
        .await;

    client.send("PING :token").await;
    client.expect(|l| l == ":kote PONG kote :token").await;

    client.send("PRIVMSG #contacts :whoami").await;
    let whoami = client
        .expect(|l| l.contains("Your address --> alice:"))
        .await;
    assert!(whoami.ends_with(alice.identity().address().as_str()));
}

/// The configured password must come with PASS.
#[tokio::test]
async fn test_password_required() {
    let network = MemoryNetwork::new();
    let alice = start_daemon(&network).await;
    let addr = start_bridge(alice.handle(), Some("secret")).await;

    let mut client = IrcClient::connect(addr).await;
    client.send("NICK alice").await;
    client.send("USER alice 0 * :Alice").await;
    client.expect(|l| l.starts_with(":kote 464 alice")).await;

    let mut client = IrcClient::connect(addr).await;
    client.send("PASS secret").await;
    client.register("alice").await;
}

/// Add a contact from #contacts, receive its text and answer it.
#[tokio::test]
async fn test_contact_conversation() {
    let network = MemoryNetwork::new();
    let alice = start_daemon(&network).await;
    let bob = start_daemon(&network).await;
    let bob_handle = bob.handle();
    let mut bob_events = bob_handle.subscribe();
    let alice_address = alice.identity().address().clone();
    let bob_address = bob.identity().address().clone();

    let addr = start_bridge(alice.handle(), None).await;
    let mut client = IrcClient::connect(addr).await;
    client.register("alice").await;

    client
        .send(&format!("PRIVMSG #contacts :add bob:{}", bob_address))
        .await;
    client
        .expect(|l| l == ":ContactsBot PRIVMSG #contacts :Authorization request to bob queued")
        .await;

    let request = wait_event(&mut bob_events, |e| {
        matches!(e, DaemonEvent::AuthorizationRequested { .. })
    })
    .await;
    assert!(matches!(
        request,
        DaemonEvent::AuthorizationRequested { proposed: Some(ref nick), .. } if nick == "alice"
    ));
    bob_handle
        .accept(alice_address.to_string(), None)
        .await
        .expect("accept");

    let bob_prefix = format!("bob!bob@{}", bob_address);
    let join = format!(":{} JOIN #contacts", bob_prefix);
    client.expect(|l| l == join).await;
    client
        .expect(|l| l == ":ContactsBot PRIVMSG #contacts :bob is now authorized")
        .await;

    bob_handle
        .send_text("alice", "hi alice\nsecond line")
        .await
        .expect("bob sends");
    let first = format!(":{} PRIVMSG alice :hi alice", bob_prefix);
    let second = format!(":{} PRIVMSG alice :second line", bob_prefix);
    client.expect(|l| l == first).await;
    client.expect(|l| l == second).await;

    client.send("PRIVMSG bob :hello bob").await;
    let received = wait_event(&mut bob_events, |e| {
        matches!(e, DaemonEvent::MessageReceived { .. })
    })
    .await;
    assert!(matches!(
        received,
        DaemonEvent::MessageReceived { ref text, .. } if text == "hello bob"
    ));

    client.send("WHOIS bob").await;
    let whois = client.expect(|l| l.contains(" 311 alice bob ")).await;
    assert!(whois.contains(bob_address.as_str()));
    client.expect(|l| l.contains(" 318 alice bob ")).await;
}

/// Lines typed by one client show up in the other.
#[tokio::test]
async fn test_second_client_sees_echo() {
    let network = MemoryNetwork::new();
    let alice = start_daemon(&network).await;
    let addr = start_bridge(alice.handle(), None).await;

    let mut first = IrcClient::connect(addr).await;
    first.register("alice").await;
    let mut second = IrcClient::connect(addr).await;
    second.register("laptop").await;

    first.send("PRIVMSG #public :nobody is listening").await;
    second
        .expect(|l| l == ":alice!alice@kote PRIVMSG #public :nobody is listening")
        .await;

    second.send("NICK alice").await;
    second.expect(|l| l.contains(" 433 laptop alice ")).await;
}

/// An unterminated flood is discarded without ending the connection.
#[tokio::test]
async fn test_overlong_line_is_discarded() {
    let network = MemoryNetwork::new();
    let alice = start_daemon(&network).await;
    let addr = start_bridge(alice.handle(), None).await;

    let mut client = IrcClient::connect(addr).await;
    client.register("alice").await;

    let flood = vec![b'A'; 1024 * 1024];
    client.writer.write_all(&flood).await.expect("write flood");
    client.send("").await;
    client.send("PING :still-here").await;
    client
        .expect(|l| l == ":kote PONG kote :still-here")
        .await;

    let limit = format!("PRIVMSG #public :{}", "x".repeat(MAX_CLIENT_LINE_LEN));
    client.send(&limit).await;
    client.send("PING :again").await;
    client.expect(|l| l == ":kote PONG kote :again").await;
}
