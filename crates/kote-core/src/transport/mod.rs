//! Transport seam between the messenger and the overlay network.
//!
//! The messenger only needs three primitives: provision our destination,
//! accept inbound streams, and open outbound streams. [`crate::sam`]
//! implements them against an I2P router; [`memory`] implements them
//! in-process for running several nodes in one runtime.
//!
//! Streams are ordered byte pipes that may close at any time. End of stream
//! and I/O failures surface as [`Error::ConnectionClosed`](crate::Error).

pub mod memory;

use crate::error::Result;
use crate::identity::{Address, DestinationKeys};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{MemoryNetwork, MemoryTransport};

/// A bidirectional byte stream to a peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Boxed peer stream.
pub type BoxStream = Box<dyn PeerStream>;

/// Overlay network transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring up our destination, generating one when nothing is persisted.
    /// Returns the keys in use, which the caller persists.
    async fn open_destination(&self, persisted: Option<DestinationKeys>)
        -> Result<DestinationKeys>;

    /// Wait for the next inbound stream.
    async fn accept(&self) -> Result<(Address, BoxStream)>;

    /// Open a stream to a peer. Fails with `Unreachable` when the network
    /// cannot reach it.
    async fn connect(&self, target: &Address) -> Result<BoxStream>;
}
