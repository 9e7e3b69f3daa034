//! In-memory radios sharing one simulated air
//!
//! Every [`LoopbackRadio`] is a [`LinkBackend`]. Radios see each other's
//! advertisements, connect, negotiate MTU, subscribe and exchange writes and
//! notifications with the same event sequence a real stack produces. Tests
//! use [`LoopbackAir::sever`] and [`LoopbackAir::set_reachable`] to simulate
//! link loss.
//!
//! ```rust
//! use companion_ble::{CompanionLink, LinkConfig, LoopbackAir, PairingStore, SelfInfo};
//!
//! # tokio_test::block_on(async {
//! let air = LoopbackAir::new();
//! let (radio, events) = air.radio("C0:FF:EE:00:00:01", -50).await;
//! let link = CompanionLink::spawn(LinkConfig::new(), radio, events, PairingStore::in_memory()).unwrap();
//!
//! link.start_advertising(SelfInfo::new("Desk")).await.unwrap();
//! assert!(link.snapshot().await.unwrap().advertising);
//! link.shutdown().await.unwrap();
//! # });
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::advertising::AdvertisementPlan;
use crate::backend::{radio_event_channel, LinkBackend, RadioEvent, RadioEventReceiver, RadioEventSender, ScanRecord};
use crate::error::{LinkError, LinkResult};
use crate::peer::{DeviceInfo, PeerAddress, Role};
use crate::protocol::{Channel, DEFAULT_MTU, MAX_MTU, SERVICE_UUID};

#[derive(Debug, Clone)]
struct Advert {
    local_name: String,
    services: Vec<Uuid>,
    info: Option<Vec<u8>>,
    service_data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct RadioSlot {
    events: Option<RadioEventSender>,
    advert: Option<Advert>,
    scanning: bool,
    reachable: bool,
    rssi: i16,
    max_mtu: u16,
}

#[derive(Debug)]
struct AirLink {
    mtu: u16,
    subscriptions: HashSet<Channel>,
}

#[derive(Debug, Default)]
struct AirState {
    radios: HashMap<PeerAddress, RadioSlot>,
    /// Keyed by (client, server)
    links: HashMap<(PeerAddress, PeerAddress), AirLink>,
}

impl AirState {
    fn emit(&self, to: &PeerAddress, event: RadioEvent) {
        if let Some(events) = self.radios.get(to).and_then(|r| r.events.as_ref()) {
            let _ = events.send(event);
        }
    }

    fn scan_record(&self, address: &PeerAddress) -> Option<ScanRecord> {
        let radio = self.radios.get(address)?;
        let advert = radio.advert.as_ref()?;
        if !radio.reachable {
            return None;
        }
        Some(ScanRecord {
            address: address.clone(),
            platform_name: None,
            local_name: Some(advert.local_name.clone()),
            rssi: Some(radio.rssi),
            services: advert.services.clone(),
            service_data: advert.service_data.clone(),
        })
    }

    /// Deliver an advertisement to every scanning radio that filters for it
    fn broadcast_advert(&self, from: &PeerAddress) {
        let Some(record) = self.scan_record(from) else {
            return;
        };
        if !record.services.contains(&SERVICE_UUID) {
            return;
        }
        for (address, radio) in &self.radios {
            if address != from && radio.scanning && radio.reachable {
                self.emit(address, RadioEvent::ScanResult(record.clone()));
            }
        }
    }

    fn drop_links_of(&mut self, address: &PeerAddress) {
        let severed: Vec<_> = self
            .links
            .keys()
            .filter(|(client, server)| client == address || server == address)
            .cloned()
            .collect();
        for key in severed {
            self.links.remove(&key);
            self.emit(&key.0, RadioEvent::Disconnected { address: key.1.clone() });
            self.emit(&key.1, RadioEvent::Disconnected { address: key.0.clone() });
        }
    }
}

/// Shared medium all loopback radios live on
#[derive(Debug, Clone, Default)]
pub struct LoopbackAir {
    state: Arc<Mutex<AirState>>,
}

impl LoopbackAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a radio; returns the backend and its event stream
    pub async fn radio(&self, address: impl Into<PeerAddress>, rssi: i16) -> (LoopbackRadio, RadioEventReceiver) {
        let address = address.into();
        let (events, receiver) = radio_event_channel();
        self.state.lock().await.radios.insert(
            address.clone(),
            RadioSlot {
                events: Some(events),
                advert: None,
                scanning: false,
                reachable: true,
                rssi,
                max_mtu: MAX_MTU,
            },
        );
        (
            LoopbackRadio {
                air: self.clone(),
                address,
            },
            receiver,
        )
    }

    /// Add a non-connectable device advertising arbitrary services
    pub async fn add_beacon(&self, address: impl Into<PeerAddress>, name: &str, services: Vec<Uuid>, rssi: i16) {
        let address = address.into();
        let mut state = self.state.lock().await;
        state.radios.insert(
            address.clone(),
            RadioSlot {
                events: None,
                advert: Some(Advert {
                    local_name: name.to_string(),
                    services,
                    info: None,
                    service_data: None,
                }),
                scanning: false,
                reachable: true,
                rssi,
                max_mtu: DEFAULT_MTU,
            },
        );
        state.broadcast_advert(&address);
    }

    /// Attach JSON service data to a radio's advertisement
    pub async fn set_service_data(&self, address: &PeerAddress, data: Vec<u8>) {
        let mut state = self.state.lock().await;
        if let Some(advert) = state.radios.get_mut(address).and_then(|r| r.advert.as_mut()) {
            advert.service_data = Some(data);
        }
        state.broadcast_advert(address);
    }

    /// Largest MTU the radio accepts
    pub async fn set_max_mtu(&self, address: &PeerAddress, mtu: u16) {
        if let Some(radio) = self.state.lock().await.radios.get_mut(address) {
            radio.max_mtu = mtu;
        }
    }

    /// Drop the link between two radios as if it was lost on the air
    pub async fn sever(&self, a: &PeerAddress, b: &PeerAddress) -> bool {
        let mut state = self.state.lock().await;
        let key = if state.links.contains_key(&(a.clone(), b.clone())) {
            (a.clone(), b.clone())
        } else if state.links.contains_key(&(b.clone(), a.clone())) {
            (b.clone(), a.clone())
        } else {
            return false;
        };
        state.links.remove(&key);
        state.emit(&key.0, RadioEvent::Disconnected { address: key.1.clone() });
        state.emit(&key.1, RadioEvent::Disconnected { address: key.0.clone() });
        true
    }

    /// Take a radio out of range (dropping its links) or bring it back
    pub async fn set_reachable(&self, address: &PeerAddress, reachable: bool) {
        let mut state = self.state.lock().await;
        let Some(radio) = state.radios.get_mut(address) else {
            return;
        };
        radio.reachable = reachable;
        if reachable {
            state.broadcast_advert(address);
        } else {
            state.drop_links_of(address);
            let scanners: Vec<_> = state
                .radios
                .iter()
                .filter(|(other, r)| *other != address && r.scanning)
                .map(|(other, _)| other.clone())
                .collect();
            for scanner in scanners {
                state.emit(&scanner, RadioEvent::ScanLost { address: address.clone() });
            }
        }
    }

    /// Negotiated MTU of the link from `client` to `server`
    pub async fn link_mtu(&self, client: &PeerAddress, server: &PeerAddress) -> Option<u16> {
        let state = self.state.lock().await;
        state
            .links
            .get(&(client.clone(), server.clone()))
            .map(|link| link.mtu)
    }

    pub async fn is_linked(&self, a: &PeerAddress, b: &PeerAddress) -> bool {
        let state = self.state.lock().await;
        state.links.contains_key(&(a.clone(), b.clone()))
            || state.links.contains_key(&(b.clone(), a.clone()))
    }
}

/// One radio on a [`LoopbackAir`]
#[derive(Debug, Clone)]
pub struct LoopbackRadio {
    air: LoopbackAir,
    address: PeerAddress,
}

impl LoopbackRadio {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn link_key(&self, peer: &PeerAddress) -> (PeerAddress, PeerAddress) {
        (self.address.clone(), peer.clone())
    }
}

#[async_trait]
impl LinkBackend for LoopbackRadio {
    async fn start_advertising(&self, plan: &AdvertisementPlan, info: &DeviceInfo) -> LinkResult<()> {
        let info = serde_json::to_vec(info)?;
        let mut state = self.air.state.lock().await;
        let radio = state
            .radios
            .get_mut(&self.address)
            .ok_or(LinkError::AdapterNotAvailable)?;
        let service_data = radio.advert.as_ref().and_then(|a| a.service_data.clone());
        radio.advert = Some(Advert {
            local_name: plan.local_name.clone(),
            services: vec![plan.service_uuid],
            info: Some(info),
            service_data,
        });
        state.broadcast_advert(&self.address);
        Ok(())
    }

    async fn stop_advertising(&self) -> LinkResult<()> {
        if let Some(radio) = self.air.state.lock().await.radios.get_mut(&self.address) {
            radio.advert = None;
        }
        Ok(())
    }

    async fn start_scan(&self) -> LinkResult<()> {
        let mut state = self.air.state.lock().await;
        let radio = state
            .radios
            .get_mut(&self.address)
            .ok_or(LinkError::AdapterNotAvailable)?;
        radio.scanning = true;

        let visible: Vec<ScanRecord> = state
            .radios
            .keys()
            .filter(|address| **address != self.address)
            .filter_map(|address| state.scan_record(address))
            .filter(|record| record.services.contains(&SERVICE_UUID))
            .collect();
        for record in visible {
            state.emit(&self.address, RadioEvent::ScanResult(record));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        if let Some(radio) = self.air.state.lock().await.radios.get_mut(&self.address) {
            radio.scanning = false;
        }
        Ok(())
    }

    async fn connect(&self, address: &PeerAddress) -> LinkResult<()> {
        let mut state = self.air.state.lock().await;
        let key = self.link_key(address);
        if state.links.contains_key(&key) {
            return Ok(());
        }

        let self_reachable = state.radios.get(&self.address).is_some_and(|r| r.reachable);
        let target = state.radios.get(address);
        let connectable = target.is_some_and(|r| r.reachable && r.events.is_some() && r.advert.is_some());
        if !self_reachable || !connectable {
            return Err(LinkError::ConnectionFailed(format!("{} not reachable", address)));
        }
        let name = target.and_then(|r| r.advert.as_ref()).map(|a| a.local_name.clone());

        state.links.insert(
            key,
            AirLink {
                mtu: DEFAULT_MTU,
                subscriptions: HashSet::new(),
            },
        );
        debug!("Loopback link {} -> {}", self.address, address);
        state.emit(
            &self.address,
            RadioEvent::Connected {
                address: address.clone(),
                role: Role::Client,
                name,
            },
        );
        state.emit(
            address,
            RadioEvent::Connected {
                address: self.address.clone(),
                role: Role::Server,
                name: None,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, address: &PeerAddress) -> LinkResult<()> {
        self.air.sever(&self.address, address).await;
        Ok(())
    }

    async fn request_mtu(&self, address: &PeerAddress, mtu: u16) -> LinkResult<()> {
        let mut state = self.air.state.lock().await;
        let limit = |a: &PeerAddress| state.radios.get(a).map(|r| r.max_mtu).unwrap_or(DEFAULT_MTU);
        let negotiated = mtu.min(limit(&self.address)).min(limit(address)).max(DEFAULT_MTU);

        let link = state
            .links
            .get_mut(&self.link_key(address))
            .ok_or_else(|| LinkError::not_connected(address))?;
        link.mtu = negotiated;

        state.emit(&self.address, RadioEvent::MtuChanged { address: address.clone(), mtu: negotiated });
        state.emit(address, RadioEvent::MtuChanged { address: self.address.clone(), mtu: negotiated });
        Ok(())
    }

    async fn discover_services(&self, address: &PeerAddress) -> LinkResult<()> {
        let state = self.air.state.lock().await;
        if !state.links.contains_key(&self.link_key(address)) {
            return Err(LinkError::not_connected(address));
        }
        state.emit(&self.address, RadioEvent::ServicesReady { address: address.clone() });
        Ok(())
    }

    async fn subscribe(&self, address: &PeerAddress, channel: Channel) -> LinkResult<()> {
        if !matches!(channel, Channel::Data | Channel::Command | Channel::Notification) {
            return Err(LinkError::SubscriptionFailed(format!("{} cannot notify", channel)));
        }
        let mut state = self.air.state.lock().await;
        let link = state
            .links
            .get_mut(&self.link_key(address))
            .ok_or_else(|| LinkError::not_connected(address))?;
        link.subscriptions.insert(channel);
        state.emit(&self.address, RadioEvent::WriteAcked { address: address.clone(), channel });
        Ok(())
    }

    async fn write(&self, address: &PeerAddress, channel: Channel, bytes: &[u8]) -> LinkResult<()> {
        let state = self.air.state.lock().await;
        if !state.links.contains_key(&self.link_key(address)) {
            return Err(LinkError::not_connected(address));
        }

        let from = self.address.clone();
        let event = match channel {
            Channel::Data => RadioEvent::DataReceived { address: from, bytes: bytes.to_vec() },
            Channel::Command => RadioEvent::CommandReceived { address: from, bytes: bytes.to_vec() },
            other => return Err(LinkError::WriteFailed(format!("{} is not writable", other))),
        };
        state.emit(address, event);
        Ok(())
    }

    async fn notify(&self, address: &PeerAddress, channel: Channel, bytes: &[u8]) -> LinkResult<()> {
        let state = self.air.state.lock().await;
        let link = state
            .links
            .get(&(address.clone(), self.address.clone()))
            .ok_or_else(|| LinkError::not_connected(address))?;
        if !link.subscriptions.contains(&channel) {
            return Err(LinkError::SubscriptionFailed(format!("{} has not subscribed to {}", address, channel)));
        }

        let from = self.address.clone();
        let event = match channel {
            Channel::Data => RadioEvent::DataReceived { address: from, bytes: bytes.to_vec() },
            _ => RadioEvent::CommandReceived { address: from, bytes: bytes.to_vec() },
        };
        state.emit(address, event);
        Ok(())
    }

    async fn read(&self, address: &PeerAddress, channel: Channel) -> LinkResult<Vec<u8>> {
        let state = self.air.state.lock().await;
        if !state.links.contains_key(&self.link_key(address)) {
            return Err(LinkError::not_connected(address));
        }
        match channel {
            Channel::Info => state
                .radios
                .get(address)
                .and_then(|r| r.advert.as_ref())
                .and_then(|a| a.info.clone())
                .ok_or_else(|| LinkError::ReadFailed(format!("{} publishes no device info", address))),
            Channel::Data => Ok(Vec::new()),
            other => Err(LinkError::ReadFailed(format!("{} is not readable", other))),
        }
    }
}
