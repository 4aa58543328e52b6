//! Outbound delivery queue.
//!
//! Every outbound message lives in a per-contact mailbox until the peer
//! acknowledges it. Failed attempts are retried with exponential backoff.
//!
//! ## Selection
//!
//! Per contact, at most one envelope is in flight. Authorization traffic goes
//! ahead of text; text waits until the contact is authorized; a contact
//! awaiting the verdict on our request may only receive that request.
//!
//! The queue is pure state: the caller supplies the current time (unix
//! milliseconds) and persists the envelopes it gets back.

mod queue;

pub use queue::{DeliveryQueue, Envelope, InFlight};

use std::time::Duration;

/// Initial retry delay in seconds.
pub const INITIAL_RETRY_DELAY_SECS: u64 = 30;

/// Maximum retry delay in seconds.
pub const MAX_RETRY_DELAY_SECS: u64 = 3600;

/// Time allowed for an acknowledgment, in seconds.
pub const ACK_TIMEOUT_SECS: u64 = 60;

/// Delivery tuning.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
    /// Time allowed between sending and the ack.
    pub ack_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            max_backoff: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            ack_timeout: Duration::from_secs(ACK_TIMEOUT_SECS),
        }
    }
}

impl DeliveryConfig {
    /// Retry delay after `attempts` failures: `initial * 2^(attempts - 1)`,
    /// capped at the maximum.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self
            .initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff);
        std::cmp::min(delay, self.max_backoff)
    }
}

/// Current time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = DeliveryConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(30));
        assert_eq!(config.backoff(2), Duration::from_secs(60));
        assert_eq!(config.backoff(3), Duration::from_secs(120));
        assert_eq!(config.backoff(8), Duration::from_secs(3600));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(3600));
    }
}
