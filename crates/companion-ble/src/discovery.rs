//! Central-role discovery using btleplug
//!
//! Scans filtered on the companion service UUID and turns adapter events into
//! [`RadioEvent::ScanResult`] records. btleplug reports no "lost" event; the
//! link actor prunes stale peers instead.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{RadioEvent, RadioEventSender, ScanRecord};
use crate::error::{LinkError, LinkResult};
use crate::peer::PeerAddress;
use crate::protocol::SERVICE_UUID;

// ----------------------------------------------------------------------------
// Discovery Implementation
// ----------------------------------------------------------------------------

/// Handles BLE scanning for companion peers
pub struct BleDiscovery {
    adapter: Adapter,
    events: RadioEventSender,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BleDiscovery {
    /// Initialize the first BLE adapter
    pub async fn initialize(events: RadioEventSender) -> LinkResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(LinkError::AdapterNotAvailable)?;

        info!("BLE adapter initialized");
        Ok(Self {
            adapter,
            events,
            pump: Mutex::new(None),
        })
    }

    /// Get adapter reference
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Start scanning for companion peers
    pub async fn start_scanning(&self) -> LinkResult<()> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            debug!("Scan already running");
            return Ok(());
        }

        let mut central_events = self
            .adapter
            .events()
            .await
            .map_err(|e| LinkError::ScanFailed(e.to_string()))?;

        let scan_filter = ScanFilter {
            services: vec![SERVICE_UUID],
        };
        self.adapter
            .start_scan(scan_filter)
            .await
            .map_err(|e| match LinkError::from(e) {
                LinkError::PermissionDenied(reason) => LinkError::PermissionDenied(reason),
                other => LinkError::ScanFailed(other.to_string()),
            })?;

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        *pump = Some(tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if let Some(record) = scan_record(&adapter, &id).await {
                            if events.send(RadioEvent::ScanResult(record)).is_err() {
                                break;
                            }
                        }
                    }
                    CentralEvent::ServicesAdvertisement { id, services }
                        if services.contains(&SERVICE_UUID) =>
                    {
                        if let Some(record) = scan_record(&adapter, &id).await {
                            if events.send(RadioEvent::ScanResult(record)).is_err() {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
            debug!("Central event stream ended");
        }));

        info!("Started BLE scanning for companion peers");
        Ok(())
    }

    /// Stop scanning for peers
    pub async fn stop_scanning(&self) -> LinkResult<()> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
            self.adapter
                .stop_scan()
                .await
                .map_err(|e| LinkError::ScanFailed(e.to_string()))?;
            info!("Stopped BLE scanning");
        }
        Ok(())
    }
}

/// Build a scan record for a peripheral advertising the companion service
async fn scan_record(adapter: &Adapter, id: &PeripheralId) -> Option<ScanRecord> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read properties of {:?}: {}", id, e);
            return None;
        }
    };

    // Some platforms ignore the scan filter
    if !properties.services.contains(&SERVICE_UUID) {
        return None;
    }

    Some(ScanRecord {
        address: PeerAddress::new(properties.address.to_string()),
        platform_name: None,
        local_name: properties.local_name,
        rssi: properties.rssi,
        services: properties.services,
        service_data: properties.service_data.get(&SERVICE_UUID).cloned(),
    })
}
