//! Error types for the companion BLE link

use thiserror::Error;

use crate::protocol::Channel;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by the BLE link, its backends and the pairing store
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Bluetooth permission not granted: {0}")]
    PermissionDenied(String),

    #[error("BLE advertising is not supported on this platform")]
    AdvertisingUnsupported,

    #[error("Advertisement too large: {size} bytes (max: {max_size})")]
    AdvertisementTooLarge { size: usize, max_size: usize },

    #[error("Failed to start advertising: {0}")]
    AdvertisingFailed(String),

    #[error("Failed to start scanning: {0}")]
    ScanFailed(String),

    #[error("Failed to connect to peer: {0}")]
    ConnectionFailed(String),

    #[error("Peer not connected: {address}")]
    PeerNotConnected { address: String },

    #[error("Channels not ready for peer {address}")]
    ChannelsNotReady { address: String },

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {channel}")]
    CharacteristicNotFound { channel: Channel },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to read characteristic: {0}")]
    ReadFailed(String),

    #[error("A pairing session is already active")]
    PairingInProgress,

    #[error("No pairing request is waiting for confirmation")]
    NoPendingPairing,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Settings store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("BLE link has shut down")]
    Shutdown,
}

/// Result type for link operations
pub type LinkResult<T> = std::result::Result<T, LinkError>;

impl LinkError {
    pub(crate) fn not_connected(address: impl ToString) -> Self {
        LinkError::PeerNotConnected {
            address: address.to_string(),
        }
    }
}

impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => LinkError::PermissionDenied(err.to_string()),
            btleplug::Error::DeviceNotFound => LinkError::ConnectionFailed(err.to_string()),
            btleplug::Error::NotConnected => LinkError::ConnectionFailed(err.to_string()),
            btleplug::Error::NotSupported(reason) => LinkError::Platform(reason),
            btleplug::Error::TimedOut(duration) => {
                LinkError::ConnectionFailed(format!("timed out after {:?}", duration))
            }
            other => LinkError::Platform(other.to_string()),
        }
    }
}

#[cfg(target_os = "linux")]
impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotPermitted | bluer::ErrorKind::NotAuthorized => {
                LinkError::PermissionDenied(err.to_string())
            }
            bluer::ErrorKind::NotSupported => LinkError::AdvertisingUnsupported,
            _ => LinkError::Platform(err.to_string()),
        }
    }
}
