//! Bluetooth Low Energy link between a phone and its desktop companion
//!
//! Each device plays both BLE roles at once: it publishes the companion GATT
//! service and advertises it, and it scans for and connects to peers that do
//! the same. On top of the raw link the crate provides chunked transfers,
//! JSON commands, six-digit code pairing with a persisted trusted peer, and
//! bounded reconnection.
//!
//! ## Architecture
//!
//! - [`backend`] - The [`LinkBackend`] trait and the [`RadioEvent`] stream every radio reports through
//! - [`transport`] - [`SystemBackend`], the host Bluetooth stack (btleplug central + platform peripheral)
//! - [`loopback`] - In-process radios sharing one simulated air, for tests and demos
//! - [`framing`] - Transfer start/chunk/end frames, reassembly and command encoding
//! - [`pairing`] - Pairing codes, states and the pairing state machine
//! - [`store`] - Persisted trusted peer and auto-connect preference
//! - [`handle`] - [`CompanionLink`], the public handle to the link actor
//!
//! ## Usage
//!
//! ```rust,no_run
//! use companion_ble::{CompanionLink, LinkConfig, PairingStore, SelfInfo, SystemBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::new().with_device_name("Desk");
//! let (backend, events) = SystemBackend::new(&config).await?;
//! let link = CompanionLink::spawn(config, backend, events, PairingStore::in_memory())?;
//!
//! link.start_advertising(SelfInfo::new("Desk")).await?;
//! link.start_scan().await?;
//!
//! if let Some(peer) = link.discovered_peers().first() {
//!     let code = link.initiate_pairing(peer.address.clone()).await?;
//!     println!("Confirm code {} on {}", code, peer.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: scanning and client links via btleplug; GATT service and
//!   advertising via `bluer` and BlueZ
//! - **Other platforms**: scanning and client links only; advertising
//!   reports [`LinkError::AdvertisingUnsupported`]

pub mod advertising;
pub mod backend;
pub mod config;
mod connection;
mod discovery;
pub mod error;
pub mod framing;
mod handle;
mod links;
pub mod loopback;
pub mod pairing;
pub mod peer;
pub mod protocol;
mod reconnect;
mod scanner;
pub mod store;
mod task;
mod timer;
pub mod transport;

// Public API exports
pub use advertising::{AdvertisementPlan, AdvertisingManager, BleAdvertiser};
pub use backend::{radio_event_channel, LinkBackend, RadioEvent, RadioEventReceiver, RadioEventSender, ScanRecord};
pub use config::LinkConfig;
pub use error::{LinkError, LinkResult};
pub use handle::CompanionLink;
pub use links::ConnectionSummary;
pub use loopback::{LoopbackAir, LoopbackRadio};
pub use pairing::{PairingCode, PairingState};
pub use peer::{
    AdvertisedMetadata, ConnectionState, DeviceInfo, DeviceType, PeerAddress, PeerDevice, Role, SelfInfo,
};
pub use protocol::{Channel, SERVICE_UUID};
pub use reconnect::ReconnectDecision;
pub use store::{JsonFileSettings, MemorySettings, PairedDevice, PairingStore, SettingsStore};
pub use task::{LinkNotice, LinkSnapshot};
pub use transport::SystemBackend;
