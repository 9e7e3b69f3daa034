//! Linux peripheral implementation using bluer (BlueZ)
//!
//! Publishes the companion service as a local GATT application and advertises
//! it. BlueZ has no connection callback for GATT servers, so an inbound peer is
//! registered on its first read or write and dropped by a polling monitor once
//! BlueZ reports it disconnected.
//!
//! Notifications cannot be addressed to one subscriber. Each channel has a
//! single outgoing queue shared by every notification session, so `notify`
//! only checks that the target is connected and the payload reaches whichever
//! subscriber drains the queue. With more than one inbound peer a payload
//! meant for one of them may be delivered to another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{RadioEvent, RadioEventSender};
use crate::error::{LinkError, LinkResult};
use crate::peer::{DeviceInfo, PeerAddress, Role};
use crate::protocol::Channel;

use super::{AdvertisementPlan, BleAdvertiser};

const NOTIFY_QUEUE_DEPTH: usize = 64;
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

type InboundPeers = Arc<Mutex<HashSet<PeerAddress>>>;
type NotifyQueue = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;

// ----------------------------------------------------------------------------
// Linux Implementation
// ----------------------------------------------------------------------------

pub struct LinuxAdvertiser {
    events: RadioEventSender,
    session: Option<bluer::Session>,
    adapter: Option<bluer::Adapter>,
    app_handle: Option<ApplicationHandle>,
    advertisement_handle: Option<AdvertisementHandle>,
    inbound: InboundPeers,
    notify_senders: HashMap<Channel, mpsc::Sender<Vec<u8>>>,
    monitor: Option<JoinHandle<()>>,
}

impl LinuxAdvertiser {
    pub fn new(events: RadioEventSender) -> Self {
        Self {
            events,
            session: None,
            adapter: None,
            app_handle: None,
            advertisement_handle: None,
            inbound: Arc::new(Mutex::new(HashSet::new())),
            notify_senders: HashMap::new(),
            monitor: None,
        }
    }

    async fn initialize(&mut self) -> LinkResult<bluer::Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let session = bluer::Session::new().await?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| LinkError::AdapterNotAvailable)?;

        // Enable adapter if needed
        if !adapter.is_powered().await.unwrap_or(false) {
            adapter.set_powered(true).await?;
        }

        info!("Linux BLE adapter {} initialized for advertising", adapter.name());
        self.session = Some(session);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    fn build_application(&mut self, info: &DeviceInfo) -> LinkResult<Application> {
        let info_json = serde_json::to_vec(info)?;

        let info_char = Characteristic {
            uuid: Channel::Info.uuid(),
            read: Some(read_method(self.register_peer(), move || info_json.clone())),
            ..Default::default()
        };

        let data_char = Characteristic {
            uuid: Channel::Data.uuid(),
            read: Some(read_method(self.register_peer(), Vec::new)),
            write: Some(write_method(Channel::Data, self.register_peer())),
            notify: Some(self.notify_method(Channel::Data, false)),
            ..Default::default()
        };

        let command_char = Characteristic {
            uuid: Channel::Command.uuid(),
            write: Some(write_method(Channel::Command, self.register_peer())),
            ..Default::default()
        };

        let notification_char = Characteristic {
            uuid: Channel::Notification.uuid(),
            notify: Some(self.notify_method(Channel::Notification, true)),
            ..Default::default()
        };

        let service = Service {
            uuid: crate::protocol::SERVICE_UUID,
            primary: true,
            characteristics: vec![info_char, data_char, command_char, notification_char],
            ..Default::default()
        };

        Ok(Application {
            services: vec![service],
            ..Default::default()
        })
    }

    fn register_peer(&self) -> PeerRegistry {
        PeerRegistry {
            inbound: self.inbound.clone(),
            events: self.events.clone(),
        }
    }

    fn notify_method(&mut self, channel: Channel, indicate: bool) -> CharacteristicNotify {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(NOTIFY_QUEUE_DEPTH);
        self.notify_senders.insert(channel, tx);
        let queue: NotifyQueue = Arc::new(Mutex::new(rx));

        CharacteristicNotify {
            notify: true,
            indicate,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let queue = queue.clone();
                Box::pin(async move { drain_notify_queue(channel, queue, notifier).await })
            })),
            ..Default::default()
        }
    }

    fn start_monitor(&mut self, adapter: bluer::Adapter) {
        let inbound = self.inbound.clone();
        let events = self.events.clone();

        self.monitor = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;

                let peers: Vec<PeerAddress> = inbound.lock().await.iter().cloned().collect();
                for peer in peers {
                    if is_still_connected(&adapter, &peer).await {
                        continue;
                    }
                    if inbound.lock().await.remove(&peer) {
                        info!("Inbound peer {} disconnected", peer);
                        let _ = events.send(RadioEvent::Disconnected { address: peer });
                    }
                }
            }
        }));
    }
}

impl Drop for LinuxAdvertiser {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

#[async_trait::async_trait]
impl BleAdvertiser for LinuxAdvertiser {
    async fn start_advertising(
        &mut self,
        plan: &AdvertisementPlan,
        info: &DeviceInfo,
    ) -> LinkResult<()> {
        let adapter = self.initialize().await?;

        let app = self.build_application(info)?;
        let app_handle = adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| LinkError::AdvertisingFailed(format!("GATT registration: {}", e)))?;

        // Name goes out in the scan response; the primary packet only carries the UUID
        let advertisement = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: vec![plan.service_uuid].into_iter().collect(),
            local_name: Some(plan.local_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };

        let advertisement_handle = match adapter.advertise(advertisement).await {
            Ok(handle) => handle,
            Err(e) => {
                drop(app_handle);
                return Err(match LinkError::from(e) {
                    LinkError::Platform(reason) => LinkError::AdvertisingFailed(reason),
                    other => other,
                });
            }
        };

        self.app_handle = Some(app_handle);
        self.advertisement_handle = Some(advertisement_handle);
        self.start_monitor(adapter);

        info!("Started BLE advertising as '{}'", plan.local_name);
        Ok(())
    }

    async fn stop_advertising(&mut self) -> LinkResult<()> {
        // Dropping the handles unregisters the advertisement and the service
        self.advertisement_handle.take();
        self.app_handle.take();
        self.notify_senders.clear();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        info!("Stopped BLE advertising");
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertisement_handle.is_some()
    }

    async fn notify(
        &mut self,
        address: &PeerAddress,
        channel: Channel,
        bytes: &[u8],
    ) -> LinkResult<()> {
        if !self.inbound.lock().await.contains(address) {
            return Err(LinkError::not_connected(address));
        }
        let sender = self
            .notify_senders
            .get(&channel)
            .ok_or(LinkError::CharacteristicNotFound { channel })?;
        sender
            .send(bytes.to_vec())
            .await
            .map_err(|_| LinkError::WriteFailed(format!("{} notify queue closed", channel)))
    }

    async fn disconnect(&mut self, address: &PeerAddress) -> LinkResult<()> {
        let was_inbound = self.inbound.lock().await.remove(address);
        if !was_inbound {
            return Ok(());
        }

        if let Some(adapter) = &self.adapter {
            let addr: bluer::Address = address
                .as_str()
                .parse()
                .map_err(|_| LinkError::Platform(format!("bad address {}", address)))?;
            adapter.device(addr)?.disconnect().await?;
        }
        let _ = self.events.send(RadioEvent::Disconnected {
            address: address.clone(),
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// GATT Handlers
// ----------------------------------------------------------------------------

/// Registers inbound peers the first time they touch the service
#[derive(Clone)]
struct PeerRegistry {
    inbound: InboundPeers,
    events: RadioEventSender,
}

impl PeerRegistry {
    async fn seen(&self, device: bluer::Address, mtu: u16) -> PeerAddress {
        let address = PeerAddress::new(device.to_string());
        if self.inbound.lock().await.insert(address.clone()) {
            info!("Inbound connection from {} (MTU {})", address, mtu);
            let _ = self.events.send(RadioEvent::Connected {
                address: address.clone(),
                role: Role::Server,
                name: None,
            });
            let _ = self.events.send(RadioEvent::MtuChanged {
                address: address.clone(),
                mtu,
            });
        }
        address
    }
}

fn read_method<F>(registry: PeerRegistry, value: F) -> CharacteristicRead
where
    F: Fn() -> Vec<u8> + Send + Sync + 'static,
{
    let value = Arc::new(value);
    CharacteristicRead {
        read: true,
        fun: Box::new(move |req: CharacteristicReadRequest| {
            let registry = registry.clone();
            let value = value.clone();
            Box::pin(async move {
                registry.seen(req.device_address, req.mtu).await;
                let bytes = value();
                Ok(bytes.get(usize::from(req.offset)..).unwrap_or_default().to_vec())
            })
        }),
        ..Default::default()
    }
}

fn write_method(channel: Channel, registry: PeerRegistry) -> CharacteristicWrite {
    CharacteristicWrite {
        write: true,
        write_without_response: true,
        method: CharacteristicWriteMethod::Fun(Box::new(
            move |bytes: Vec<u8>, req: CharacteristicWriteRequest| {
                let registry = registry.clone();
                Box::pin(async move {
                    let address = registry.seen(req.device_address, req.mtu).await;
                    debug!("{} write from {}: {} bytes", channel, address, bytes.len());
                    let event = match channel {
                        Channel::Data => RadioEvent::DataReceived { address, bytes },
                        Channel::Command => RadioEvent::CommandReceived { address, bytes },
                        _ => return Err(ReqError::NotSupported),
                    };
                    registry.events.send(event).map_err(|_| ReqError::Failed)
                })
            },
        )),
        ..Default::default()
    }
}

async fn drain_notify_queue(channel: Channel, queue: NotifyQueue, mut notifier: CharacteristicNotifier) {
    debug!("{} notification session started", channel);
    loop {
        let next = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(bytes) = next else {
            break;
        };
        if let Err(e) = notifier.notify(bytes).await {
            warn!("{} notification failed: {}", channel, e);
            break;
        }
    }
    debug!("{} notification session ended", channel);
}

async fn is_still_connected(adapter: &bluer::Adapter, peer: &PeerAddress) -> bool {
    let Ok(addr) = peer.as_str().parse::<bluer::Address>() else {
        return false;
    };
    match adapter.device(addr) {
        Ok(device) => device.is_connected().await.unwrap_or(false),
        Err(e) => {
            error!("BlueZ lookup for {} failed: {}", peer, e);
            false
        }
    }
}
