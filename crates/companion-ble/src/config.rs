//! BLE link configuration

use std::time::Duration;

use crate::error::{LinkError, LinkResult};
use crate::protocol::{DEFAULT_MTU, FIXED_CHUNK_SIZE, MAX_MTU};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE link
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Name announced in the scan response
    pub device_name: String,
    /// Scan duration before discovery auto-stops
    pub scan_timeout: Duration,
    /// Maximum time to wait for an outbound connection
    pub connection_timeout: Duration,
    /// ATT MTU requested after connecting
    pub requested_mtu: u16,
    /// MTU assumed until negotiation completes
    pub default_mtu: u16,
    /// Upper bound on chunk payload bytes
    pub max_chunk_size: usize,
    /// Pause between chunk writes
    pub chunk_delay: Duration,
    /// Whether to reconnect after unexpected disconnects
    pub auto_reconnect: bool,
    /// Delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Reconnect attempts per peer before giving up
    pub max_reconnect_attempts: u32,
    /// Time allowed for the other side to confirm a pairing code
    pub pairing_timeout: Duration,
    /// How long `Success` stays visible before returning to `Idle`
    pub pairing_settle_delay: Duration,
    /// Poll interval while auto-connect looks for the paired peer
    pub auto_connect_poll_interval: Duration,
    /// Poll attempts before auto-connect gives up
    pub auto_connect_poll_attempts: u32,
    /// Discovered peers not seen for this long are dropped
    pub peer_stale_after: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: "Companion".to_string(),
            scan_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
            requested_mtu: MAX_MTU,
            default_mtu: DEFAULT_MTU,
            max_chunk_size: FIXED_CHUNK_SIZE,
            chunk_delay: Duration::from_millis(20),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 3,
            pairing_timeout: Duration::from_secs(30),
            pairing_settle_delay: Duration::from_secs(2),
            auto_connect_poll_interval: Duration::from_secs(1),
            auto_connect_poll_attempts: 10,
            peer_stale_after: Duration::from_secs(30),
        }
    }
}

impl LinkConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised device name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the MTU requested after connecting
    pub fn with_requested_mtu(mut self, mtu: u16) -> Self {
        self.requested_mtu = mtu;
        self
    }

    /// Set the pause between chunk writes
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set reconnect delay and attempt bound
    pub fn with_reconnect_policy(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Set pairing confirmation timeout
    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }

    /// Check that the configuration is usable
    pub fn validate(&self) -> LinkResult<()> {
        if self.device_name.trim().is_empty() {
            return Err(LinkError::InvalidConfiguration(
                "device name must not be empty".to_string(),
            ));
        }
        if self.default_mtu < DEFAULT_MTU || self.requested_mtu < self.default_mtu {
            return Err(LinkError::InvalidConfiguration(format!(
                "MTU must be at least {} and requested MTU at least the default",
                DEFAULT_MTU
            )));
        }
        if self.requested_mtu > MAX_MTU {
            return Err(LinkError::InvalidConfiguration(format!(
                "requested MTU {} exceeds {}",
                self.requested_mtu, MAX_MTU
            )));
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > FIXED_CHUNK_SIZE {
            return Err(LinkError::InvalidConfiguration(format!(
                "chunk size must be between 1 and {}",
                FIXED_CHUNK_SIZE
            )));
        }
        if self.pairing_timeout.is_zero() {
            return Err(LinkError::InvalidConfiguration(
                "pairing timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
