//! High-level advertising manager

use tracing::{debug, info};

use crate::backend::RadioEventSender;
use crate::error::LinkResult;
use crate::peer::{DeviceInfo, PeerAddress};
use crate::protocol::Channel;

use super::{AdvertisementPlan, BleAdvertiser, PlatformAdvertiser};

// ----------------------------------------------------------------------------
// Advertising Manager
// ----------------------------------------------------------------------------

/// Wraps the platform advertiser with idempotent start/stop
pub struct AdvertisingManager {
    advertiser: PlatformAdvertiser,
    current_name: Option<String>,
}

impl AdvertisingManager {
    /// Create a new advertising manager
    pub fn new(events: RadioEventSender) -> Self {
        Self {
            advertiser: PlatformAdvertiser::new(events),
            current_name: None,
        }
    }

    /// Start advertising; a no-op while already advertising
    pub async fn start(&mut self, plan: &AdvertisementPlan, info: &DeviceInfo) -> LinkResult<()> {
        if self.advertiser.is_advertising() {
            debug!("Already advertising, ignoring start request");
            return Ok(());
        }
        self.advertiser.start_advertising(plan, info).await?;
        self.current_name = Some(plan.local_name.clone());
        info!("BLE advertising started as '{}'", plan.local_name);
        Ok(())
    }

    /// Stop advertising; a no-op when not advertising
    pub async fn stop(&mut self) -> LinkResult<()> {
        if !self.advertiser.is_advertising() {
            return Ok(());
        }
        self.advertiser.stop_advertising().await?;
        self.current_name = None;
        info!("BLE advertising stopped");
        Ok(())
    }

    /// Check if currently advertising
    pub fn is_advertising(&self) -> bool {
        self.advertiser.is_advertising()
    }

    /// Name currently in the scan response
    pub fn current_name(&self) -> Option<&str> {
        self.current_name.as_deref()
    }

    pub async fn notify(
        &mut self,
        address: &PeerAddress,
        channel: Channel,
        bytes: &[u8],
    ) -> LinkResult<()> {
        self.advertiser.notify(address, channel, bytes).await
    }

    pub async fn disconnect(&mut self, address: &PeerAddress) -> LinkResult<()> {
        self.advertiser.disconnect(address).await
    }
}
