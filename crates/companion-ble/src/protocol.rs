//! BLE protocol constants shared with the mobile peer

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Companion link BLE service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x8A3C0001_5B1E_4C7A_9F2D_3E6B7C8D9E0F);

/// Read-only device information characteristic
pub const INFO_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x8A3C0002_5B1E_4C7A_9F2D_3E6B7C8D9E0F);

/// Bulk data characteristic (read, write, notify)
pub const DATA_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x8A3C0003_5B1E_4C7A_9F2D_3E6B7C8D9E0F);

/// Command characteristic (client to server writes)
pub const COMMAND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8A3C0004_5B1E_4C7A_9F2D_3E6B7C8D9E0F);

/// Notification characteristic (server to client notify/indicate)
pub const NOTIFICATION_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8A3C0005_5B1E_4C7A_9F2D_3E6B7C8D9E0F);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

// ----------------------------------------------------------------------------
// Link Constants
// ----------------------------------------------------------------------------

/// ATT MTU before any negotiation
pub const DEFAULT_MTU: u16 = 23;

/// Largest ATT MTU the link asks for
pub const MAX_MTU: u16 = 517;

/// ATT write/notify header overhead subtracted from the MTU
pub const ATT_OVERHEAD: usize = 3;

/// Upper bound on the payload bytes carried by one chunk frame
pub const FIXED_CHUNK_SIZE: usize = 512;

/// Chunk frame header: transfer id hash (u32 BE) + chunk index (u32 BE)
pub const CHUNK_HEADER_LEN: usize = 8;

/// Legacy advertising PDU payload limit
pub const MAX_ADVERTISEMENT_LEN: usize = 31;

/// Display name used when neither the platform nor the advertisement has one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

// ----------------------------------------------------------------------------
// Logical Channels
// ----------------------------------------------------------------------------

/// The four logical channels published under [`SERVICE_UUID`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Info,
    Data,
    Command,
    Notification,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Info,
        Channel::Data,
        Channel::Command,
        Channel::Notification,
    ];

    /// Characteristic UUID backing this channel
    pub fn uuid(self) -> Uuid {
        match self {
            Channel::Info => INFO_CHARACTERISTIC_UUID,
            Channel::Data => DATA_CHARACTERISTIC_UUID,
            Channel::Command => COMMAND_CHARACTERISTIC_UUID,
            Channel::Notification => NOTIFICATION_CHARACTERISTIC_UUID,
        }
    }

    /// Reverse lookup from a characteristic UUID
    pub fn from_uuid(uuid: Uuid) -> Option<Channel> {
        Channel::ALL.into_iter().find(|channel| channel.uuid() == uuid)
    }

    /// Next channel to subscribe to after `self` has been acknowledged.
    ///
    /// The client enables push delivery on data first, then command, then
    /// notification; each CCCD write waits for the previous acknowledgment.
    pub fn next_subscription(self) -> Option<Channel> {
        match self {
            Channel::Data => Some(Channel::Command),
            Channel::Command => Some(Channel::Notification),
            Channel::Notification | Channel::Info => None,
        }
    }

    /// First channel of the subscription chain
    pub const FIRST_SUBSCRIPTION: Channel = Channel::Data;
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Info => "info",
            Channel::Data => "data",
            Channel::Command => "command",
            Channel::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// Usable payload bytes per chunk for a negotiated MTU
pub fn chunk_size_for_mtu(mtu: u16) -> usize {
    FIXED_CHUNK_SIZE
        .min((mtu as usize).saturating_sub(ATT_OVERHEAD))
        .max(1)
}
