//! Fallback peripheral implementation for platforms without a GATT server

use tracing::warn;

use crate::error::{LinkError, LinkResult};
use crate::peer::{DeviceInfo, PeerAddress};
use crate::protocol::Channel;

use super::{AdvertisementPlan, BleAdvertiser};

// ----------------------------------------------------------------------------
// Fallback Implementation
// ----------------------------------------------------------------------------

/// Reports the peripheral role as unavailable
#[derive(Debug, Default)]
pub struct FallbackAdvertiser;

impl FallbackAdvertiser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl BleAdvertiser for FallbackAdvertiser {
    async fn start_advertising(
        &mut self,
        plan: &AdvertisementPlan,
        _info: &DeviceInfo,
    ) -> LinkResult<()> {
        warn!(
            "BLE advertising not supported on this platform; '{}' will not be discoverable",
            plan.local_name
        );
        Err(LinkError::AdvertisingUnsupported)
    }

    async fn stop_advertising(&mut self) -> LinkResult<()> {
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        false
    }

    async fn notify(
        &mut self,
        address: &PeerAddress,
        _channel: Channel,
        _bytes: &[u8],
    ) -> LinkResult<()> {
        Err(LinkError::not_connected(address))
    }

    async fn disconnect(&mut self, _address: &PeerAddress) -> LinkResult<()> {
        Ok(())
    }
}
