//! BLE peer identity, discovery records and connection state

use std::fmt;
use tokio::time::Instant;

use serde::{Deserialize, Serialize};

use crate::protocol::UNKNOWN_DEVICE_NAME;

// ----------------------------------------------------------------------------
// Peer Address
// ----------------------------------------------------------------------------

/// Platform address of a BLE peer (e.g. `AA:BB:CC:DD:EE:FF`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Which side of an asymmetric BLE link this device holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// We initiated the connection and hold the GATT client handle
    Client,
    /// The peer connected to our published service
    Server,
}

/// Connection lifecycle state, used per peer and for the overall link
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Attempt failure; treated like `Disconnected` for reconnection
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }
}

// ----------------------------------------------------------------------------
// Advertised Metadata
// ----------------------------------------------------------------------------

/// Kind of device announced in the advertisement service data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    #[default]
    Desktop,
    Laptop,
}

/// Optional metadata a peer embeds as JSON in its advertisement service data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvertisedMetadata {
    pub alias: Option<String>,
    pub version: String,
    pub device_model: Option<String>,
    pub device_type: DeviceType,
    pub port: Option<u16>,
    pub protocol: String,
}

impl Default for AdvertisedMetadata {
    fn default() -> Self {
        Self {
            alias: None,
            version: "1".to_string(),
            device_model: None,
            device_type: DeviceType::Desktop,
            port: None,
            protocol: "ws".to_string(),
        }
    }
}

impl AdvertisedMetadata {
    /// Parse service-data JSON, falling back to the generic desktop profile
    pub fn from_service_data(data: Option<&[u8]>) -> Self {
        match data {
            Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|e| {
                tracing::debug!("Ignoring unparseable advertisement metadata: {}", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }
}

/// JSON published on the info characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    #[serde(default)]
    pub metadata: AdvertisedMetadata,
}

/// What this device announces about itself when advertising
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfInfo {
    pub display_name: String,
    pub metadata: AdvertisedMetadata,
}

impl SelfInfo {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            metadata: AdvertisedMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: AdvertisedMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.display_name.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Discovered Peer
// ----------------------------------------------------------------------------

/// A nearby peer surfaced by the scanner
#[derive(Debug, Clone, PartialEq)]
pub struct PeerDevice {
    pub address: PeerAddress,
    pub name: String,
    pub rssi: i16,
    pub metadata: AdvertisedMetadata,
    pub last_seen: Instant,
}

/// Pick the display name for a scan match.
///
/// The platform's connection-level name wins over the scan-response local
/// name; a placeholder is used when neither is present.
pub fn resolve_display_name(platform_name: Option<&str>, local_name: Option<&str>) -> String {
    platform_name
        .filter(|name| !name.is_empty())
        .or(local_name.filter(|name| !name.is_empty()))
        .unwrap_or(UNKNOWN_DEVICE_NAME)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_resolution() {
        assert_eq!(resolve_display_name(Some("Pixel"), Some("adv")), "Pixel");
        assert_eq!(resolve_display_name(None, Some("adv")), "adv");
        assert_eq!(resolve_display_name(Some(""), Some("adv")), "adv");
        assert_eq!(resolve_display_name(None, None), UNKNOWN_DEVICE_NAME);
    }

    #[test]
    fn test_metadata_parsing() {
        let json = br#"{"alias":"Work PC","version":"2","deviceModel":"XPS","deviceType":"laptop","port":8765,"protocol":"wss"}"#;
        let metadata = AdvertisedMetadata::from_service_data(Some(json));
        assert_eq!(metadata.alias.as_deref(), Some("Work PC"));
        assert_eq!(metadata.device_type, DeviceType::Laptop);
        assert_eq!(metadata.port, Some(8765));
        assert_eq!(metadata.protocol, "wss");
    }

    #[test]
    fn test_metadata_falls_back_to_desktop_profile() {
        assert_eq!(
            AdvertisedMetadata::from_service_data(Some(b"\x01\x02garbage")),
            AdvertisedMetadata::default()
        );
        assert_eq!(
            AdvertisedMetadata::from_service_data(None).device_type,
            DeviceType::Desktop
        );

        // Partial JSON keeps defaults for missing fields
        let metadata = AdvertisedMetadata::from_service_data(Some(br#"{"deviceType":"phone"}"#));
        assert_eq!(metadata.device_type, DeviceType::Phone);
        assert_eq!(metadata.protocol, "ws");
    }

    #[test]
    fn test_connection_state_helpers() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(!ConnectionState::Error("x".into()).is_connected());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
