//! Contact presence.
//!
//! A contact is online from the first verified traffic until nothing has
//! been heard from it for `max_idle`. Every `ping_interval` a round of pings
//! is scheduled, each after a random delay within the interval:
//!
//! - to every authorized contact while the node is young or nobody is online
//! - otherwise to the online contacts, and to everyone every
//!   [`FULL_ROUND_EVERY`]th round
//!
//! Times are unix milliseconds supplied by the caller.

use crate::identity::Address;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Time between ping rounds in seconds.
pub const PING_INTERVAL_SECS: u64 = 300;

/// Silence after which a contact counts as offline, in seconds.
pub const MAX_IDLE_SECS: u64 = 1800;

/// Uptime during which every round pings everyone, in seconds.
pub const PING_ALL_WINDOW_SECS: u64 = 1800;

/// Every this many rounds, offline contacts are pinged too.
pub const FULL_ROUND_EVERY: u32 = 6;

/// Presence tuning.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Time between ping rounds.
    pub ping_interval: Duration,
    /// Silence after which a contact goes offline.
    pub max_idle: Duration,
    /// Uptime during which every round pings everyone.
    pub ping_all_window: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            max_idle: Duration::from_secs(MAX_IDLE_SECS),
            ping_all_window: Duration::from_secs(PING_ALL_WINDOW_SECS),
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Last-seen times and the ping schedule.
#[derive(Debug)]
pub(crate) struct Presence {
    interval: i64,
    max_idle: i64,
    window: i64,
    started_at: i64,
    next_round: i64,
    rounds: u32,
    last_seen: HashMap<Address, i64>,
    due: HashMap<Address, i64>,
}

impl Presence {
    pub fn new(config: &PresenceConfig, now: i64) -> Self {
        Self {
            interval: millis(config.ping_interval).max(1),
            max_idle: millis(config.max_idle),
            window: millis(config.ping_all_window),
            started_at: now,
            next_round: now,
            rounds: 0,
            last_seen: HashMap::new(),
            due: HashMap::new(),
        }
    }

    pub fn is_online(&self, address: &Address) -> bool {
        self.last_seen.contains_key(address)
    }

    /// Record traffic from `address`. Returns true when it was offline.
    pub fn seen(&mut self, address: &Address, now: i64) -> bool {
        self.due.remove(address);
        self.last_seen.insert(address.clone(), now).is_none()
    }

    /// Stop tracking `address`.
    pub fn forget(&mut self, address: &Address) {
        self.due.remove(address);
        self.last_seen.remove(address);
    }

    /// Contacts silent for longer than the idle limit. They are offline
    /// afterwards.
    pub fn expire(&mut self, now: i64) -> Vec<Address> {
        let max_idle = self.max_idle;
        let expired: Vec<Address> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now - **seen > max_idle)
            .map(|(address, _)| address.clone())
            .collect();
        for address in &expired {
            self.last_seen.remove(address);
        }
        expired
    }

    pub fn round_due(&self, now: i64) -> bool {
        now >= self.next_round
    }

    /// Schedule a round of pings among `contacts`.
    pub fn round(&mut self, now: i64, contacts: &[Address]) {
        self.next_round = now + self.interval;

        let everyone = if now - self.started_at < self.window || self.last_seen.is_empty() {
            true
        } else {
            self.rounds += 1;
            self.rounds % FULL_ROUND_EVERY == 0
        };

        let mut rng = rand::thread_rng();
        for address in contacts {
            if !everyone && !self.is_online(address) {
                continue;
            }
            let at = now + rng.gen_range(0..self.interval);
            self.due
                .entry(address.clone())
                .and_modify(|due| *due = (*due).min(at))
                .or_insert(at);
        }
    }

    /// Contacts whose ping is due.
    pub fn take_due(&mut self, now: i64) -> Vec<Address> {
        let ready: Vec<Address> = self
            .due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(address, _)| address.clone())
            .collect();
        for address in &ready {
            self.due.remove(address);
        }
        ready
    }

    /// Next round, ping or expiry.
    pub fn deadline(&self) -> i64 {
        let expiry = self
            .last_seen
            .values()
            .map(|seen| seen.saturating_add(self.max_idle).saturating_add(1));
        self.due
            .values()
            .copied()
            .chain(expiry)
            .fold(self.next_round, i64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PresenceConfig {
        PresenceConfig {
            ping_interval: Duration::from_millis(100),
            max_idle: Duration::from_millis(1000),
            ping_all_window: Duration::from_millis(500),
        }
    }

    fn peer(name: &str) -> Address {
        Address::from_destination(name.as_bytes())
    }

    #[test]
    fn test_seen_and_expire() {
        let mut presence = Presence::new(&config(), 0);
        let bob = peer("bob");

        assert!(presence.seen(&bob, 10));
        assert!(!presence.seen(&bob, 500));
        assert!(presence.is_online(&bob));

        assert!(presence.expire(1500).is_empty());
        assert_eq!(presence.expire(1501), vec![bob.clone()]);
        assert!(!presence.is_online(&bob));
        assert!(presence.seen(&bob, 1600));
    }

    #[test]
    fn test_young_node_pings_everyone() {
        let mut presence = Presence::new(&config(), 0);
        let (bob, carol) = (peer("bob"), peer("carol"));
        presence.seen(&bob, 0);

        assert!(presence.round_due(0));
        presence.round(0, &[bob.clone(), carol.clone()]);
        assert!(!presence.round_due(99));
        assert!(presence.round_due(100));

        let mut due = presence.take_due(99);
        due.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let mut expected = vec![bob, carol];
        expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(due, expected);
        assert!(presence.take_due(1000).is_empty());
    }

    #[test]
    fn test_mature_node_pings_online_then_everyone() {
        let mut presence = Presence::new(&config(), 0);
        let (bob, carol) = (peer("bob"), peer("carol"));
        let contacts = [bob.clone(), carol.clone()];

        let mut now = 600;
        for round in 1..=FULL_ROUND_EVERY {
            presence.seen(&bob, now);
            presence.round(now, &contacts);
            let due = presence.take_due(now + 100);
            if round == FULL_ROUND_EVERY {
                assert_eq!(due.len(), 2, "round {}", round);
            } else {
                assert_eq!(due, vec![bob.clone()], "round {}", round);
            }
            now += 100;
        }
    }

    #[test]
    fn test_nobody_online_pings_everyone() {
        let mut presence = Presence::new(&config(), 0);
        presence.round(600, &[peer("bob"), peer("carol")]);
        assert_eq!(presence.take_due(700).len(), 2);
    }

    #[test]
    fn test_seen_cancels_ping_and_deadline() {
        let mut presence = Presence::new(&config(), 0);
        let bob = peer("bob");
        presence.round(0, &[bob.clone()]);
        assert!(presence.deadline() < 100);

        presence.seen(&bob, 5);
        assert!(presence.take_due(1000).is_empty());
        assert_eq!(presence.deadline(), 100);

        presence.round(100, &[]);
        assert_eq!(presence.deadline(), 200);
        for now in (200..=1000).step_by(100) {
            presence.round(now, &[]);
        }
        assert_eq!(presence.deadline(), 1006);

        presence.forget(&bob);
        assert!(!presence.is_online(&bob));
        assert_eq!(presence.deadline(), 1100);
    }
}
