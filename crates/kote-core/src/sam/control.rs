//! SAM v3 control socket.
//!
//! Every SAM conversation starts on a fresh TCP connection with a `HELLO`
//! exchange. Replies are single lines of the form
//! `TOPIC SUBTOPIC KEY=VALUE ...`, where values may be double-quoted.
//!
//! `STREAM CONNECT` and `STREAM ACCEPT` turn the control socket itself into
//! the data stream, so `stream_connect` and `stream_accept` hand out the
//! buffered socket without losing bytes the router already sent.

use crate::error::{Error, Result};
use crate::identity::DestinationKeys;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// SAM protocol version we speak.
pub const SAM_VERSION: &str = "3.1";

/// Ed25519 signature type for new destinations.
pub const SIGNATURE_TYPE: u8 = 7;

/// A parsed SAM reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamReply {
    /// First word, e.g. `HELLO`, `SESSION`, `STREAM`.
    pub topic: String,
    /// Second word, e.g. `REPLY`, `STATUS`.
    pub subtopic: String,
    /// `KEY=VALUE` pairs with quotes removed.
    pub values: HashMap<String, String>,
}

impl SamReply {
    /// Parse one reply line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = tokenize(line.trim_end()).into_iter();
        let topic = tokens
            .next()
            .ok_or_else(|| Error::Transport("empty SAM reply".into()))?;
        let subtopic = tokens.next().unwrap_or_default();

        let values = tokens
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (token, String::new()),
            })
            .collect();

        Ok(Self {
            topic,
            subtopic,
            values,
        })
    }

    /// Value of a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Required value of a key.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            Error::Transport(format!("SAM {} {} reply without {}", self.topic, self.subtopic, key))
        })
    }

    /// Fail unless `RESULT` is absent or `OK`.
    pub fn check(self) -> Result<Self> {
        match self.get("RESULT") {
            None | Some("OK") => Ok(self),
            Some(result) => Err(result_error(result, self.get("MESSAGE"))),
        }
    }
}

/// Map a SAM `RESULT` code to an error.
pub fn result_error(result: &str, message: Option<&str>) -> Error {
    let detail = match message {
        Some(message) => format!("{}: {}", result, message),
        None => result.to_string(),
    };
    match result {
        "CANT_REACH_PEER" | "TIMEOUT" | "PEER_NOT_FOUND" | "INVALID_KEY" | "KEY_NOT_FOUND" => {
            Error::Unreachable(detail)
        }
        _ => Error::Transport(detail),
    }
}

/// Split a reply on whitespace, keeping double-quoted runs together.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => quoted = !quoted,
            '\\' if quoted => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// One SAM control connection.
pub struct SamControl {
    stream: BufReader<TcpStream>,
}

impl SamControl {
    /// Connect to the SAM bridge and say hello.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("SAM API is unavailable at {}: {}", addr, e)))?;

        let mut control = Self {
            stream: BufReader::new(stream),
        };
        let hello = control
            .command(&format!("HELLO VERSION MIN={} MAX={}", SAM_VERSION, SAM_VERSION))
            .await?;
        if hello.topic != "HELLO" {
            return Err(Error::Transport(format!("unexpected SAM greeting: {}", hello.topic)));
        }

        Ok(control)
    }

    /// Send a command and read the single-line reply.
    pub async fn command(&mut self, cmd: &str) -> Result<SamReply> {
        self.stream
            .get_mut()
            .write_all(format!("{}\n", cmd).as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("failed to send SAM command: {}", e)))?;
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("failed to flush: {}", e)))?;

        let line = self.read_line().await?;
        SamReply::parse(&line)?.check()
    }

    /// Read one line. End of stream is `ConnectionClosed`.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Transport(format!("failed to read SAM reply: {}", e)))?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        Ok(line.trim_end().to_string())
    }

    /// Generate a new Ed25519 destination.
    pub async fn dest_generate(&mut self) -> Result<DestinationKeys> {
        let reply = self
            .command(&format!("DEST GENERATE SIGNATURE_TYPE={}", SIGNATURE_TYPE))
            .await?;
        Ok(DestinationKeys {
            public: reply.require("PUB")?.to_string(),
            private: reply.require("PRIV")?.to_string(),
        })
    }

    /// Create a stream session. The session lives as long as this socket.
    pub async fn session_create(&mut self, session: &str, private: &str) -> Result<()> {
        self.command(&format!(
            "SESSION CREATE STYLE=STREAM ID={} DESTINATION={} SIGNATURE_TYPE={}",
            session, private, SIGNATURE_TYPE
        ))
        .await?;
        Ok(())
    }

    /// Resolve a name (a b32 address here) to a full destination.
    pub async fn naming_lookup(&mut self, name: &str) -> Result<String> {
        let reply = self.command(&format!("NAMING LOOKUP NAME={}", name)).await?;
        Ok(reply.require("VALUE")?.to_string())
    }

    /// Turn this socket into a stream to `destination`.
    pub async fn stream_connect(
        mut self,
        session: &str,
        destination: &str,
    ) -> Result<BufReader<TcpStream>> {
        self.command(&format!(
            "STREAM CONNECT ID={} DESTINATION={} SILENT=false",
            session, destination
        ))
        .await?;
        Ok(self.stream)
    }

    /// Wait for an inbound stream on this socket. Returns the remote
    /// destination (base64) and the stream.
    pub async fn stream_accept(mut self, session: &str) -> Result<(String, BufReader<TcpStream>)> {
        self.command(&format!("STREAM ACCEPT ID={} SILENT=false", session))
            .await?;

        let line = self.read_line().await?;
        let destination = line
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::Transport("empty destination line".into()))?
            .to_string();

        Ok((destination, self.stream))
    }
}
