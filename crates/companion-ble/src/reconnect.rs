//! Bounded reconnection after unexpected disconnects

use std::collections::HashMap;
use std::time::Duration;

use crate::peer::PeerAddress;

/// What to do after a client link dropped without being asked to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`; `attempt` is 1-based
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; the counter has been cleared
    GiveUp { attempts: u32 },
    /// Auto-reconnect is turned off
    Disabled,
}

/// Per-address attempt counters
#[derive(Debug)]
pub struct ReconnectSupervisor {
    enabled: bool,
    delay: Duration,
    max_attempts: u32,
    attempts: HashMap<PeerAddress, u32>,
}

impl ReconnectSupervisor {
    pub fn new(enabled: bool, delay: Duration, max_attempts: u32) -> Self {
        Self {
            enabled,
            delay,
            max_attempts,
            attempts: HashMap::new(),
        }
    }

    /// A link came up; start counting from zero next time
    pub fn on_connected(&mut self, address: &PeerAddress) {
        self.attempts.remove(address);
    }

    pub fn on_unexpected_disconnect(&mut self, address: &PeerAddress) -> ReconnectDecision {
        if !self.enabled {
            return ReconnectDecision::Disabled;
        }

        let attempts = self.attempts.entry(address.clone()).or_insert(0);
        if *attempts < self.max_attempts {
            *attempts += 1;
            ReconnectDecision::Retry {
                attempt: *attempts,
                delay: self.delay,
            }
        } else {
            let attempts = *attempts;
            self.attempts.remove(address);
            ReconnectDecision::GiveUp { attempts }
        }
    }

    /// Stop supervising a peer the caller disconnected on purpose
    pub fn forget(&mut self, address: &PeerAddress) {
        self.attempts.remove(address);
    }

    pub fn forget_all(&mut self) {
        self.attempts.clear();
    }

    /// Whether a reconnect sequence is in progress for `address`
    pub fn is_tracking(&self, address: &PeerAddress) -> bool {
        self.attempts.contains_key(address)
    }

    pub fn counters(&self) -> HashMap<PeerAddress, u32> {
        self.attempts.clone()
    }
}
