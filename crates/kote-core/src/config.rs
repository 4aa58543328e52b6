//! Runtime configuration.
//!
//! Built by the launcher from flags and environment; the core never reads
//! the environment itself.

use crate::bridge::{BridgeConfig, DEFAULT_BRIDGE_ADDRESS};
use crate::delivery::{
    DeliveryConfig, ACK_TIMEOUT_SECS, INITIAL_RETRY_DELAY_SECS, MAX_RETRY_DELAY_SECS,
};
use crate::error::{Error, Result};
use crate::logging::Redacted;
use crate::messaging::DaemonConfig;
use crate::sam::{SamConfig, DEFAULT_SAM_ADDRESS};
use crate::storage::DatabaseConfig;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Retry timing in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Delay after the first failed attempt.
    pub initial_backoff_secs: u64,
    /// Upper bound on the retry delay.
    pub max_backoff_secs: u64,
    /// Time allowed for an ack.
    pub ack_timeout_secs: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            initial_backoff_secs: INITIAL_RETRY_DELAY_SECS,
            max_backoff_secs: MAX_RETRY_DELAY_SECS,
            ack_timeout_secs: ACK_TIMEOUT_SECS,
        }
    }
}

impl From<&DeliverySettings> for DeliveryConfig {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            initial_backoff: Duration::from_secs(settings.initial_backoff_secs),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            ack_timeout: Duration::from_secs(settings.ack_timeout_secs),
        }
    }
}

/// Everything needed to run a node.
#[derive(Clone)]
pub struct Config {
    /// Directory holding `kote.db`.
    pub data_dir: PathBuf,
    /// IRC listen address.
    pub bridge_addr: String,
    /// SAM bridge address.
    pub sam_addr: String,
    /// SAM session name; random when unset.
    pub session_name: Option<String>,
    /// Password IRC clients must send with PASS.
    pub bridge_password: Option<String>,
    /// Drop traffic from addresses with no contact record.
    pub ignore_unauthorized: bool,
    /// Retry timing.
    pub delivery: DeliverySettings,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("bridge_addr", &self.bridge_addr)
            .field("sam_addr", &self.sam_addr)
            .field("session_name", &self.session_name)
            .field("bridge_password", &self.bridge_password.as_ref().map(Redacted))
            .field("ignore_unauthorized", &self.ignore_unauthorized)
            .field("delivery", &self.delivery)
            .finish()
    }
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bridge_addr: DEFAULT_BRIDGE_ADDRESS.to_string(),
            sam_addr: DEFAULT_SAM_ADDRESS.to_string(),
            session_name: None,
            bridge_password: None,
            ignore_unauthorized: false,
            delivery: DeliverySettings::default(),
        }
    }

    /// Reject settings the daemon cannot work with.
    pub fn validate(&self) -> Result<()> {
        let delivery = &self.delivery;
        if delivery.initial_backoff_secs == 0 || delivery.ack_timeout_secs == 0 {
            return Err(Error::InvalidState(
                "backoff and ack timeout must be positive".into(),
            ));
        }
        if delivery.max_backoff_secs < delivery.initial_backoff_secs {
            return Err(Error::InvalidState(format!(
                "max backoff ({}s) is below the initial backoff ({}s)",
                delivery.max_backoff_secs, delivery.initial_backoff_secs
            )));
        }
        if self.bridge_password.as_deref() == Some("") {
            return Err(Error::InvalidState("IRC password must not be empty".into()));
        }
        Ok(())
    }

    /// Database location.
    pub fn database(&self) -> DatabaseConfig {
        DatabaseConfig::in_dir(&self.data_dir)
    }

    /// SAM settings.
    pub fn sam(&self) -> SamConfig {
        let mut sam = SamConfig::new(&self.sam_addr);
        if let Some(name) = &self.session_name {
            sam.session_name = name.clone();
        }
        sam
    }

    /// Daemon settings.
    pub fn daemon(&self) -> DaemonConfig {
        DaemonConfig {
            delivery: DeliveryConfig::from(&self.delivery),
            ignore_unauthorized: self.ignore_unauthorized,
            ..DaemonConfig::default()
        }
    }

    /// IRC bridge settings.
    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            listen_addr: self.bridge_addr.clone(),
            password: self.bridge_password.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("/tmp/kote");
        assert_eq!(config.bridge_addr, "127.0.0.1:17772");
        assert_eq!(config.sam_addr, "127.0.0.1:7656");
        assert_eq!(config.delivery.initial_backoff_secs, 30);
        assert_eq!(config.delivery.max_backoff_secs, 3600);
        assert_eq!(config.delivery.ack_timeout_secs, 60);
        assert_eq!(
            config.database().path,
            PathBuf::from("/tmp/kote").join("kote.db")
        );
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_session_name_override() {
        let mut config = Config::new("/tmp/kote");
        assert!(config.sam().session_name.starts_with("kote-"));
        config.session_name = Some("fixed".into());
        assert_eq!(config.sam().session_name, "fixed");
    }

    #[test]
    fn test_daemon_settings() {
        let mut config = Config::new("/tmp/kote");
        config.ignore_unauthorized = true;
        config.delivery.initial_backoff_secs = 5;
        let daemon = config.daemon();
        assert!(daemon.ignore_unauthorized);
        assert_eq!(daemon.delivery.initial_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_debug_hides_password() {
        let mut config = Config::new("/tmp/kote");
        config.bridge_password = Some("hunter2".into());
        let shown = format!("{:?}", config);
        assert!(!shown.contains("hunter2"));
        assert!(format!("{:?}", config.bridge()).contains("[REDACTED]"));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::new("/tmp/kote");
        config.delivery.max_backoff_secs = 10;
        assert!(config.validate().is_err());

        let mut config = Config::new("/tmp/kote");
        config.bridge_password = Some(String::new());
        assert!(config.validate().is_err());
    }
}
