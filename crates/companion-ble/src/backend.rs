//! Platform seam between the link actor and a BLE stack
//!
//! A [`LinkBackend`] performs radio operations; everything the radio reports
//! comes back as a [`RadioEvent`] on the channel handed to the backend at
//! construction. The link actor is the only consumer of that channel.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::advertising::AdvertisementPlan;
use crate::error::LinkResult;
use crate::peer::{DeviceInfo, PeerAddress, Role};
use crate::protocol::Channel;

// ----------------------------------------------------------------------------
// Radio Events
// ----------------------------------------------------------------------------

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub address: PeerAddress,
    /// Name the platform already knows for the device
    pub platform_name: Option<String>,
    /// Local name from the scan response
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    /// Service data published under the companion service UUID
    pub service_data: Option<Vec<u8>>,
}

/// Everything a backend reports, delivered in order to the link actor
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// A link came up; `Client` for outbound, `Server` for inbound
    Connected {
        address: PeerAddress,
        role: Role,
        name: Option<String>,
    },
    Disconnected {
        address: PeerAddress,
    },
    MtuChanged {
        address: PeerAddress,
        mtu: u16,
    },
    /// Service discovery found all four channels
    ServicesReady {
        address: PeerAddress,
    },
    DataReceived {
        address: PeerAddress,
        bytes: Vec<u8>,
    },
    /// Command channel write (server side) or notification (client side)
    CommandReceived {
        address: PeerAddress,
        bytes: Vec<u8>,
    },
    /// CCCD write acknowledged for `channel`
    WriteAcked {
        address: PeerAddress,
        channel: Channel,
    },
    ScanResult(ScanRecord),
    ScanLost {
        address: PeerAddress,
    },
    /// Asynchronous platform failure outside any request
    PlatformError(String),
}

pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;
pub type RadioEventReceiver = mpsc::UnboundedReceiver<RadioEvent>;

/// Create the channel a backend reports through
pub fn radio_event_channel() -> (RadioEventSender, RadioEventReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Backend Trait
// ----------------------------------------------------------------------------

/// Radio operations the link actor drives.
///
/// Operations that complete asynchronously on the air (`connect`,
/// `request_mtu`, `discover_services`, `subscribe`) report their outcome as
/// a [`RadioEvent`]; an `Err` return means the request never reached the air.
#[async_trait]
pub trait LinkBackend: Send + Sync {
    /// Publish the GATT service and start advertising
    async fn start_advertising(&self, plan: &AdvertisementPlan, info: &DeviceInfo)
        -> LinkResult<()>;

    async fn stop_advertising(&self) -> LinkResult<()>;

    /// Start a scan filtered on the companion service UUID
    async fn start_scan(&self) -> LinkResult<()>;

    async fn stop_scan(&self) -> LinkResult<()>;

    /// Open a client-role connection; success arrives as `Connected`
    async fn connect(&self, address: &PeerAddress) -> LinkResult<()>;

    /// Tear down whichever link exists for `address`
    async fn disconnect(&self, address: &PeerAddress) -> LinkResult<()>;

    /// Ask for a larger ATT MTU; the result arrives as `MtuChanged`
    async fn request_mtu(&self, address: &PeerAddress, mtu: u16) -> LinkResult<()>;

    /// Discover the companion service; success arrives as `ServicesReady`
    async fn discover_services(&self, address: &PeerAddress) -> LinkResult<()>;

    /// Enable push delivery on `channel`; the CCCD ack arrives as `WriteAcked`
    async fn subscribe(&self, address: &PeerAddress, channel: Channel) -> LinkResult<()>;

    /// Client-role write with response
    async fn write(&self, address: &PeerAddress, channel: Channel, bytes: &[u8])
        -> LinkResult<()>;

    /// Server-role notification to a connected client
    async fn notify(&self, address: &PeerAddress, channel: Channel, bytes: &[u8])
        -> LinkResult<()>;

    /// Client-role read
    async fn read(&self, address: &PeerAddress, channel: Channel) -> LinkResult<Vec<u8>>;
}
