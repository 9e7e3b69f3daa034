//! Backend over the host Bluetooth stack
//!
//! Combines the btleplug central (scanning and client links) with the
//! platform peripheral (GATT service and advertising). Both halves report
//! through one [`RadioEvent`](crate::backend::RadioEvent) channel.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::advertising::{AdvertisementPlan, AdvertisingManager};
use crate::backend::{radio_event_channel, LinkBackend, RadioEventReceiver};
use crate::config::LinkConfig;
use crate::connection::BleConnection;
use crate::discovery::BleDiscovery;
use crate::error::{LinkError, LinkResult};
use crate::peer::{DeviceInfo, PeerAddress};
use crate::protocol::Channel;

// ----------------------------------------------------------------------------
// System Backend
// ----------------------------------------------------------------------------

pub struct SystemBackend {
    discovery: BleDiscovery,
    connection: BleConnection,
    advertising: Mutex<AdvertisingManager>,
}

impl SystemBackend {
    /// Open the default adapter; returns the backend and its event stream
    pub async fn new(config: &LinkConfig) -> LinkResult<(Self, RadioEventReceiver)> {
        let (events, receiver) = radio_event_channel();

        let discovery = BleDiscovery::initialize(events.clone()).await?;
        let connection = BleConnection::new(
            discovery.adapter().clone(),
            events.clone(),
            config.connection_timeout,
        )
        .await?;
        let advertising = Mutex::new(AdvertisingManager::new(events));

        info!("System BLE backend ready");
        Ok((
            Self {
                discovery,
                connection,
                advertising,
            },
            receiver,
        ))
    }
}

#[async_trait]
impl LinkBackend for SystemBackend {
    async fn start_advertising(&self, plan: &AdvertisementPlan, info: &DeviceInfo) -> LinkResult<()> {
        self.advertising.lock().await.start(plan, info).await
    }

    async fn stop_advertising(&self) -> LinkResult<()> {
        self.advertising.lock().await.stop().await
    }

    async fn start_scan(&self) -> LinkResult<()> {
        self.discovery.start_scanning().await
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        self.discovery.stop_scanning().await
    }

    async fn connect(&self, address: &PeerAddress) -> LinkResult<()> {
        self.connection.connect(address).await
    }

    async fn disconnect(&self, address: &PeerAddress) -> LinkResult<()> {
        if self.connection.holds(address).await {
            self.connection.disconnect(address).await
        } else {
            self.advertising.lock().await.disconnect(address).await
        }
    }

    async fn request_mtu(&self, address: &PeerAddress, mtu: u16) -> LinkResult<()> {
        self.connection.request_mtu(address, mtu).await
    }

    async fn discover_services(&self, address: &PeerAddress) -> LinkResult<()> {
        self.connection.discover_services(address).await
    }

    async fn subscribe(&self, address: &PeerAddress, channel: Channel) -> LinkResult<()> {
        self.connection.subscribe(address, channel).await
    }

    async fn write(&self, address: &PeerAddress, channel: Channel, bytes: &[u8]) -> LinkResult<()> {
        self.connection.write(address, channel, bytes).await
    }

    async fn notify(&self, address: &PeerAddress, channel: Channel, bytes: &[u8]) -> LinkResult<()> {
        if !matches!(channel, Channel::Data | Channel::Notification) {
            return Err(LinkError::WriteFailed(format!("{} does not notify", channel)));
        }
        self.advertising.lock().await.notify(address, channel, bytes).await
    }

    async fn read(&self, address: &PeerAddress, channel: Channel) -> LinkResult<Vec<u8>> {
        self.connection.read(address, channel).await
    }
}
