//! Client-role connections using btleplug

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::backend::{RadioEvent, RadioEventSender};
use crate::error::{LinkError, LinkResult};
use crate::peer::{PeerAddress, Role};
use crate::protocol::Channel;

// ----------------------------------------------------------------------------
// Connection Management
// ----------------------------------------------------------------------------

struct ClientLink {
    peripheral: Peripheral,
    notifications: Option<JoinHandle<()>>,
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        if let Some(pump) = self.notifications.take() {
            pump.abort();
        }
    }
}

/// Handles outbound GATT client links and their data transmission
pub struct BleConnection {
    adapter: Adapter,
    events: RadioEventSender,
    connection_timeout: Duration,
    links: Arc<RwLock<HashMap<PeerAddress, ClientLink>>>,
    watcher: JoinHandle<()>,
}

impl BleConnection {
    /// Create a new connection manager and start watching for link loss
    pub async fn new(
        adapter: Adapter,
        events: RadioEventSender,
        connection_timeout: Duration,
    ) -> LinkResult<Self> {
        let links: Arc<RwLock<HashMap<PeerAddress, ClientLink>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let mut central_events = adapter.events().await?;

        let watcher = {
            let links = links.clone();
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(event) = central_events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        let lost = {
                            let mut links = links.write().await;
                            let address = links
                                .iter()
                                .find(|(_, link)| link.peripheral.id() == id)
                                .map(|(address, _)| address.clone());
                            if let Some(address) = &address {
                                links.remove(address);
                            }
                            address
                        };
                        if let Some(address) = lost {
                            info!("Lost connection to {}", address);
                            let _ = events.send(RadioEvent::Disconnected { address });
                        }
                    }
                }
            })
        };

        Ok(Self {
            adapter,
            events,
            connection_timeout,
            links,
            watcher,
        })
    }

    async fn find_peripheral(&self, address: &PeerAddress) -> LinkResult<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string() == address.as_str() {
                return Ok(peripheral);
            }
        }
        Err(LinkError::ConnectionFailed(format!("{} not found", address)))
    }

    async fn peripheral(&self, address: &PeerAddress) -> LinkResult<Peripheral> {
        self.links
            .read()
            .await
            .get(address)
            .map(|link| link.peripheral.clone())
            .ok_or_else(|| LinkError::not_connected(address))
    }

    async fn characteristic(
        &self,
        address: &PeerAddress,
        channel: Channel,
    ) -> LinkResult<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(address).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == channel.uuid())
            .ok_or(LinkError::CharacteristicNotFound { channel })?;
        Ok((peripheral, characteristic))
    }

    /// Connect to a peer; success is reported as `Connected`
    pub async fn connect(&self, address: &PeerAddress) -> LinkResult<()> {
        if self.links.read().await.contains_key(address) {
            return Ok(());
        }

        let peripheral = self.find_peripheral(address).await?;
        match timeout(self.connection_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Failed to connect to peer {}: {}", address, e);
                return Err(LinkError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                error!("Connection to peer {} timed out", address);
                return Err(LinkError::ConnectionFailed("connection timeout".into()));
            }
        }

        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|properties| properties.local_name);

        self.links.write().await.insert(
            address.clone(),
            ClientLink {
                peripheral,
                notifications: None,
            },
        );

        info!("Connected to peer: {}", address);
        let _ = self.events.send(RadioEvent::Connected {
            address: address.clone(),
            role: Role::Client,
            name,
        });
        Ok(())
    }

    /// btleplug exposes no MTU exchange; the platform negotiates on connect.
    /// Reports the requested value once the link is known.
    pub async fn request_mtu(&self, address: &PeerAddress, mtu: u16) -> LinkResult<()> {
        self.peripheral(address).await?;
        let _ = self.events.send(RadioEvent::MtuChanged {
            address: address.clone(),
            mtu,
        });
        Ok(())
    }

    /// Discover the companion service and start the notification pump
    pub async fn discover_services(&self, address: &PeerAddress) -> LinkResult<()> {
        let peripheral = self.peripheral(address).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::ServiceDiscoveryFailed(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        for channel in Channel::ALL {
            if !characteristics.iter().any(|c| c.uuid == channel.uuid()) {
                return Err(LinkError::CharacteristicNotFound { channel });
            }
        }

        let mut notifications = peripheral.notifications().await?;
        let events = self.events.clone();
        let from = address.clone();
        let pump = tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                let event = match Channel::from_uuid(data.uuid) {
                    Some(Channel::Data) => RadioEvent::DataReceived {
                        address: from.clone(),
                        bytes: data.value,
                    },
                    Some(Channel::Command) | Some(Channel::Notification) => {
                        RadioEvent::CommandReceived {
                            address: from.clone(),
                            bytes: data.value,
                        }
                    }
                    _ => {
                        warn!("Notification on unexpected characteristic {}", data.uuid);
                        continue;
                    }
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!("Notification handler for peer {} ended", from);
        });

        if let Some(link) = self.links.write().await.get_mut(address) {
            link.notifications = Some(pump);
        }

        let _ = self.events.send(RadioEvent::ServicesReady {
            address: address.clone(),
        });
        Ok(())
    }

    /// Enable notifications; btleplug resolves once the CCCD write is acknowledged
    pub async fn subscribe(&self, address: &PeerAddress, channel: Channel) -> LinkResult<()> {
        let (peripheral, characteristic) = self.characteristic(address, channel).await?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| LinkError::SubscriptionFailed(format!("{}: {}", channel, e)))?;
        let _ = self.events.send(RadioEvent::WriteAcked {
            address: address.clone(),
            channel,
        });
        Ok(())
    }

    /// Write with response to a characteristic on a connected peer
    pub async fn write(&self, address: &PeerAddress, channel: Channel, bytes: &[u8]) -> LinkResult<()> {
        let (peripheral, characteristic) = self.characteristic(address, channel).await?;
        peripheral
            .write(&characteristic, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))?;
        debug!("Wrote {} bytes to {} on {}", bytes.len(), channel, address);
        Ok(())
    }

    pub async fn read(&self, address: &PeerAddress, channel: Channel) -> LinkResult<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(address, channel).await?;
        peripheral
            .read(&characteristic)
            .await
            .map_err(|e| LinkError::ReadFailed(e.to_string()))
    }

    /// Whether a client link exists for `address`
    pub async fn holds(&self, address: &PeerAddress) -> bool {
        self.links.read().await.contains_key(address)
    }

    /// Disconnect from a peer
    pub async fn disconnect(&self, address: &PeerAddress) -> LinkResult<()> {
        let Some(link) = self.links.write().await.remove(address) else {
            return Ok(());
        };
        if let Err(e) = link.peripheral.disconnect().await {
            error!("Failed to disconnect from peer {}: {}", address, e);
        }
        info!("Disconnected from peer: {}", address);
        let _ = self.events.send(RadioEvent::Disconnected {
            address: address.clone(),
        });
        Ok(())
    }
}

impl Drop for BleConnection {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
