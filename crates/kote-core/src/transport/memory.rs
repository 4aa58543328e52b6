//! In-process transport.
//!
//! Nodes opened on the same [`MemoryNetwork`] reach each other through
//! `tokio::io::duplex` pipes. Detaching a node makes it unreachable, which
//! is how tests take a peer offline.

use super::{BoxStream, Transport};
use crate::error::{Error, Result};
use crate::identity::{encode_i2p_base64, Address, DestinationKeys};
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Pending inbound streams per node.
const BACKLOG: usize = 32;

type Incoming = (Address, DuplexStream);

/// A shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<Address, mpsc::Sender<Incoming>>>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport attached to this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: Mutex::new(None),
            incoming: TokioMutex::new(None),
        }
    }

    /// Take a node off the network.
    pub fn detach(&self, address: &Address) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.remove(address);
        }
    }

    fn register(&self, address: Address, sender: mpsc::Sender<Incoming>) -> Result<()> {
        let mut nodes = self
            .nodes
            .lock()
            .map_err(|_| Error::Transport("network lock poisoned".into()))?;
        nodes.insert(address, sender);
        Ok(())
    }

    fn route(&self, target: &Address) -> Result<mpsc::Sender<Incoming>> {
        let nodes = self
            .nodes
            .lock()
            .map_err(|_| Error::Transport("network lock poisoned".into()))?;
        nodes
            .get(target)
            .cloned()
            .ok_or_else(|| Error::Unreachable("no such destination".into()))
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Mutex<Option<Address>>,
    incoming: TokioMutex<Option<mpsc::Receiver<Incoming>>>,
}

impl MemoryTransport {
    /// Fresh random destination keys.
    pub fn generate_keys() -> DestinationKeys {
        let mut public = vec![0u8; 391];
        let mut private = vec![0u8; 663];
        rand::rngs::OsRng.fill_bytes(&mut public);
        rand::rngs::OsRng.fill_bytes(&mut private);
        private[..public.len()].copy_from_slice(&public);
        DestinationKeys {
            public: encode_i2p_base64(&public),
            private: encode_i2p_base64(&private),
        }
    }

    fn local_address(&self) -> Result<Address> {
        self.local
            .lock()
            .map_err(|_| Error::Transport("transport lock poisoned".into()))?
            .clone()
            .ok_or_else(|| Error::Transport("destination not open".into()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_destination(
        &self,
        persisted: Option<DestinationKeys>,
    ) -> Result<DestinationKeys> {
        let keys = persisted.unwrap_or_else(Self::generate_keys);
        let address = keys.address()?;

        let (tx, rx) = mpsc::channel(BACKLOG);
        self.network.register(address.clone(), tx)?;
        *self.incoming.lock().await = Some(rx);
        *self
            .local
            .lock()
            .map_err(|_| Error::Transport("transport lock poisoned".into()))? = Some(address);

        Ok(keys)
    }

    async fn accept(&self) -> Result<(Address, BoxStream)> {
        let mut incoming = self.incoming.lock().await;
        let rx = incoming
            .as_mut()
            .ok_or_else(|| Error::Transport("destination not open".into()))?;
        let (remote, stream) = rx.recv().await.ok_or(Error::ConnectionClosed)?;
        Ok((remote, Box::new(stream)))
    }

    async fn connect(&self, target: &Address) -> Result<BoxStream> {
        let local = self.local_address()?;
        let route = self.network.route(target)?;

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        route
            .send((local, theirs))
            .await
            .map_err(|_| Error::Unreachable("destination went away".into()))?;

        Ok(Box::new(ours))
    }
}
