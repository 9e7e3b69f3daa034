//! Peripheral role: advertising and the published GATT service

pub mod fallback;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod manager;

// Re-export manager types
pub use manager::AdvertisingManager;

use crate::backend::RadioEventSender;
use crate::error::{LinkError, LinkResult};
use crate::peer::{DeviceInfo, PeerAddress, SelfInfo};
use crate::protocol::{Channel, MAX_ADVERTISEMENT_LEN, SERVICE_UUID};

// ----------------------------------------------------------------------------
// Advertisement Layout
// ----------------------------------------------------------------------------

/// AD structure overhead: length byte + type byte
const AD_HEADER_LEN: usize = 2;
/// Flags AD structure: header + one flags byte
const FLAGS_AD_LEN: usize = AD_HEADER_LEN + 1;
/// Complete list of 128-bit service UUIDs holding one UUID
const SERVICE_UUID_AD_LEN: usize = AD_HEADER_LEN + 16;

/// Validated split of what goes into each advertising packet.
///
/// The primary packet carries only the flags and the service UUID; the
/// human-readable name goes into the scan response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementPlan {
    pub service_uuid: uuid::Uuid,
    pub local_name: String,
    pub primary_len: usize,
    pub scan_response_len: usize,
}

impl AdvertisementPlan {
    pub fn new(info: &SelfInfo) -> LinkResult<Self> {
        let primary_len = FLAGS_AD_LEN + SERVICE_UUID_AD_LEN;
        if primary_len > MAX_ADVERTISEMENT_LEN {
            return Err(LinkError::AdvertisementTooLarge {
                size: primary_len,
                max_size: MAX_ADVERTISEMENT_LEN,
            });
        }

        let local_name = info.display_name.trim().to_string();
        let scan_response_len = AD_HEADER_LEN + local_name.len();
        if scan_response_len > MAX_ADVERTISEMENT_LEN {
            return Err(LinkError::AdvertisementTooLarge {
                size: scan_response_len,
                max_size: MAX_ADVERTISEMENT_LEN,
            });
        }

        Ok(Self {
            service_uuid: SERVICE_UUID,
            local_name,
            primary_len,
            scan_response_len,
        })
    }
}

// ----------------------------------------------------------------------------
// Cross-platform Advertising Trait
// ----------------------------------------------------------------------------

/// Peripheral-side functionality across different platforms
#[async_trait::async_trait]
pub trait BleAdvertiser: Send + Sync {
    /// Publish the four channels and start advertising
    async fn start_advertising(
        &mut self,
        plan: &AdvertisementPlan,
        info: &DeviceInfo,
    ) -> LinkResult<()>;

    /// Stop advertising and withdraw the GATT service
    async fn stop_advertising(&mut self) -> LinkResult<()>;

    /// Check if currently advertising
    fn is_advertising(&self) -> bool;

    /// Push bytes to a client subscribed to `channel`
    async fn notify(&mut self, address: &PeerAddress, channel: Channel, bytes: &[u8])
        -> LinkResult<()>;

    /// Drop an inbound connection
    async fn disconnect(&mut self, address: &PeerAddress) -> LinkResult<()>;
}

// ----------------------------------------------------------------------------
// Platform Detection and Factory
// ----------------------------------------------------------------------------

/// Platform-specific advertiser enum
pub enum PlatformAdvertiser {
    #[cfg(target_os = "linux")]
    Linux(linux::LinuxAdvertiser),
    #[allow(dead_code)]
    Fallback(fallback::FallbackAdvertiser),
}

impl PlatformAdvertiser {
    /// Create the appropriate advertiser for the current platform
    pub fn new(events: RadioEventSender) -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Linux(linux::LinuxAdvertiser::new(events))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = events;
            Self::Fallback(fallback::FallbackAdvertiser::new())
        }
    }
}

#[async_trait::async_trait]
impl BleAdvertiser for PlatformAdvertiser {
    async fn start_advertising(
        &mut self,
        plan: &AdvertisementPlan,
        info: &DeviceInfo,
    ) -> LinkResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut advertiser) => advertiser.start_advertising(plan, info).await,
            Self::Fallback(ref mut advertiser) => advertiser.start_advertising(plan, info).await,
        }
    }

    async fn stop_advertising(&mut self) -> LinkResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut advertiser) => advertiser.stop_advertising().await,
            Self::Fallback(ref mut advertiser) => advertiser.stop_advertising().await,
        }
    }

    fn is_advertising(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref advertiser) => advertiser.is_advertising(),
            Self::Fallback(ref advertiser) => advertiser.is_advertising(),
        }
    }

    async fn notify(
        &mut self,
        address: &PeerAddress,
        channel: Channel,
        bytes: &[u8],
    ) -> LinkResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut advertiser) => advertiser.notify(address, channel, bytes).await,
            Self::Fallback(ref mut advertiser) => advertiser.notify(address, channel, bytes).await,
        }
    }

    async fn disconnect(&mut self, address: &PeerAddress) -> LinkResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut advertiser) => advertiser.disconnect(address).await,
            Self::Fallback(ref mut advertiser) => advertiser.disconnect(address).await,
        }
    }
}
