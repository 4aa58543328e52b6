//! Self-healing SAM stream session.

use super::control::SamControl;
use super::{SamConfig, CONNECT_TIMEOUT_SECS, SESSION_RESTART_SECS};
use crate::error::{Error, Result};
use crate::identity::{Address, DestinationKeys};
use crate::logging::RedactedAddress;
use crate::transport::{BoxStream, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct Inner {
    config: SamConfig,
    online: watch::Sender<bool>,
    destinations: Mutex<HashMap<Address, String>>,
}

impl Inner {
    fn ensure_online(&self) -> Result<()> {
        if *self.online.borrow() {
            Ok(())
        } else {
            Err(Error::Transport("SAM session is offline".into()))
        }
    }

    fn cached(&self, target: &Address) -> Option<String> {
        self.destinations
            .lock()
            .ok()
            .and_then(|cache| cache.get(target).cloned())
    }

    fn remember(&self, target: &Address, destination: String) {
        if let Ok(mut cache) = self.destinations.lock() {
            cache.insert(target.clone(), destination);
        }
    }

    async fn create_session(&self, keys: &DestinationKeys) -> Result<SamControl> {
        let mut control = SamControl::connect(&self.config.sam_addr).await?;
        control
            .session_create(&self.config.session_name, &keys.private)
            .await?;
        Ok(control)
    }

    /// Hold the session socket open; re-create the session when the router
    /// drops it.
    async fn keep_alive(self: Arc<Self>, keys: DestinationKeys, mut control: SamControl) {
        loop {
            loop {
                match control.read_line().await {
                    Ok(line) => debug!(line = %line, "SAM session notice"),
                    Err(_) => break,
                }
            }

            error!("SAM session is dead");
            self.online.send_replace(false);

            loop {
                info!(
                    "Restarting SAM session in {} seconds...",
                    SESSION_RESTART_SECS
                );
                tokio::time::sleep(Duration::from_secs(SESSION_RESTART_SECS)).await;

                match self.create_session(&keys).await {
                    Ok(fresh) => {
                        control = fresh;
                        self.online.send_replace(true);
                        info!(session = %self.config.session_name, "SAM session re-created");
                        break;
                    }
                    Err(e) => error!(error = %e, "failed to re-create SAM session"),
                }
            }
        }
    }
}

/// I2P transport over the router's SAM bridge.
pub struct SamTransport {
    inner: Arc<Inner>,
    keeper: Mutex<Option<JoinHandle<()>>>,
}

impl SamTransport {
    /// Transport for the given bridge and session name. Nothing is contacted
    /// until [`Transport::open_destination`].
    pub fn new(config: SamConfig) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                online,
                destinations: Mutex::new(HashMap::new()),
            }),
            keeper: Mutex::new(None),
        }
    }

    /// Whether the SAM session is currently up.
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    async fn lookup(&self, target: &Address) -> Result<String> {
        if let Some(destination) = self.inner.cached(target) {
            return Ok(destination);
        }

        let mut control = SamControl::connect(&self.inner.config.sam_addr).await?;
        let destination = control.naming_lookup(target.as_str()).await?;
        self.inner.remember(target, destination.clone());
        Ok(destination)
    }
}

impl Drop for SamTransport {
    fn drop(&mut self) {
        if let Ok(mut keeper) = self.keeper.lock() {
            if let Some(task) = keeper.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for SamTransport {
    async fn open_destination(
        &self,
        persisted: Option<DestinationKeys>,
    ) -> Result<DestinationKeys> {
        let keys = match persisted {
            Some(keys) => keys,
            None => {
                let mut control = SamControl::connect(&self.inner.config.sam_addr).await?;
                let keys = control.dest_generate().await?;
                info!(address = %RedactedAddress(keys.address()?.as_str()), "Generated new destination");
                keys
            }
        };

        let control = self.inner.create_session(&keys).await?;
        self.inner.online.send_replace(true);
        info!(
            session = %self.inner.config.session_name,
            address = %RedactedAddress(keys.address()?.as_str()),
            "SAM session created"
        );

        let task = tokio::spawn(self.inner.clone().keep_alive(keys.clone(), control));
        let mut keeper = self
            .keeper
            .lock()
            .map_err(|_| Error::Transport("keeper lock poisoned".into()))?;
        if let Some(previous) = keeper.replace(task) {
            previous.abort();
        }

        Ok(keys)
    }

    async fn accept(&self) -> Result<(Address, BoxStream)> {
        self.inner.ensure_online()?;

        let control = SamControl::connect(&self.inner.config.sam_addr).await?;
        let (destination, stream) = control
            .stream_accept(&self.inner.config.session_name)
            .await?;
        let remote = Address::from_destination_b64(&destination)?;
        self.inner.remember(&remote, destination);

        debug!(from = %RedactedAddress(remote.as_str()), "Accepted stream");
        Ok((remote, Box::new(stream)))
    }

    async fn connect(&self, target: &Address) -> Result<BoxStream> {
        self.inner.ensure_online()?;

        let attempt = async {
            let destination = self.lookup(target).await?;
            let control = SamControl::connect(&self.inner.config.sam_addr).await?;
            control
                .stream_connect(&self.inner.config.session_name, &destination)
                .await
        };

        let stream = tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), attempt)
            .await
            .map_err(|_| Error::Timeout)??;

        debug!(to = %RedactedAddress(target.as_str()), "Stream connected");
        Ok(Box::new(stream))
    }
}
