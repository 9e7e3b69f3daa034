//! Public handle to the link actor

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::backend::{LinkBackend, RadioEventReceiver};
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::pairing::{PairingCode, PairingState};
use crate::peer::{ConnectionState, DeviceInfo, PeerAddress, PeerDevice, SelfInfo};
use crate::protocol::Channel;
use crate::store::{PairedDevice, PairingStore};
use crate::task::{LinkNotice, LinkSnapshot, LinkTask, Outputs, Reply, Request};

const REQUEST_QUEUE: usize = 64;
const NOTICE_QUEUE: usize = 256;

/// Cloneable handle to a running companion link.
///
/// Every clone talks to the same actor; the actor stops once [`shutdown`]
/// is called or the last handle is dropped.
///
/// [`shutdown`]: CompanionLink::shutdown
#[derive(Clone)]
pub struct CompanionLink {
    requests: mpsc::Sender<Request>,
    discovered: watch::Receiver<Vec<PeerDevice>>,
    link_state: watch::Receiver<ConnectionState>,
    pairing: watch::Receiver<PairingState>,
    paired: watch::Receiver<Option<PairedDevice>>,
    connected: watch::Receiver<BTreeSet<PeerAddress>>,
    notices: broadcast::Sender<LinkNotice>,
    store: PairingStore,
    config: LinkConfig,
}

impl CompanionLink {
    /// Start the link actor over `backend`, reading radio events from `events`
    pub fn spawn<B>(
        config: LinkConfig,
        backend: B,
        events: RadioEventReceiver,
        store: PairingStore,
    ) -> LinkResult<Self>
    where
        B: LinkBackend + 'static,
    {
        config.validate()?;
        let paired = store.load()?;
        if let Some(device) = &paired {
            info!("Paired with {} ({})", device.name, device.address);
        }

        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (discovered_tx, discovered) = watch::channel(Vec::new());
        let (link_state_tx, link_state) = watch::channel(ConnectionState::Disconnected);
        let (pairing_tx, pairing) = watch::channel(PairingState::Idle);
        let (paired_tx, paired) = watch::channel(paired);
        let (connected_tx, connected) = watch::channel(BTreeSet::new());
        let (notices, _) = broadcast::channel(NOTICE_QUEUE);

        let outputs = Outputs {
            discovered: discovered_tx,
            link_state: link_state_tx,
            pairing: pairing_tx,
            paired: paired_tx,
            connected: connected_tx,
            notices: notices.clone(),
        };
        let backend: Arc<dyn LinkBackend> = Arc::new(backend);
        let task = LinkTask::new(
            config.clone(),
            backend,
            events,
            store.clone(),
            request_rx,
            outputs,
        );
        tokio::spawn(task.run());

        Ok(Self {
            requests: request_tx,
            discovered,
            link_state,
            pairing,
            paired,
            connected,
            notices,
            store,
            config,
        })
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> LinkResult<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| LinkError::Shutdown)?;
        response.await.map_err(|_| LinkError::Shutdown)?
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Advertising and Discovery
    // ------------------------------------------------------------------------

    /// Publish the companion service under `info`; no-op while advertising
    pub async fn start_advertising(&self, info: SelfInfo) -> LinkResult<()> {
        self.call(|reply| Request::StartAdvertising { info, reply }).await
    }

    pub async fn stop_advertising(&self) -> LinkResult<()> {
        self.call(|reply| Request::StopAdvertising { reply }).await
    }

    /// Clear the discovered list and scan for the configured scan timeout
    pub async fn start_scan(&self) -> LinkResult<()> {
        self.start_scan_for(self.config.scan_timeout).await
    }

    pub async fn start_scan_for(&self, timeout: Duration) -> LinkResult<()> {
        self.call(|reply| Request::StartScan { timeout, reply }).await
    }

    pub async fn stop_scan(&self) -> LinkResult<()> {
        self.call(|reply| Request::StopScan { reply }).await
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Begin connecting; completion shows up in [`connected_peers`](Self::connected_peers)
    pub async fn connect(&self, address: PeerAddress) -> LinkResult<()> {
        self.call(|reply| Request::Connect { address, reply }).await
    }

    /// Tear down the link to `address`; does not trigger a reconnect
    pub async fn disconnect(&self, address: PeerAddress) -> LinkResult<()> {
        self.call(|reply| Request::Disconnect { address, reply }).await
    }

    pub async fn disconnect_all(&self) -> LinkResult<()> {
        self.call(|reply| Request::DisconnectAll { reply }).await
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Write one unframed value on `channel`
    pub async fn send_raw(&self, address: PeerAddress, channel: Channel, bytes: Vec<u8>) -> LinkResult<()> {
        self.call(|reply| Request::SendRaw {
            address,
            channel,
            bytes,
            reply,
        })
        .await
    }

    /// Send a chunked transfer; resolves once every frame has been written
    pub async fn send_data(
        &self,
        address: PeerAddress,
        transfer_id: impl Into<String>,
        bytes: Vec<u8>,
    ) -> LinkResult<()> {
        let transfer_id = transfer_id.into();
        self.call(|reply| Request::SendData {
            address,
            transfer_id,
            bytes,
            reply,
        })
        .await
    }

    /// Send a command to every connected peer; returns how many accepted it
    pub async fn send_command(&self, command: impl Into<String>, params: Value) -> LinkResult<usize> {
        let command = command.into();
        self.call(|reply| Request::SendCommand {
            command,
            params,
            reply,
        })
        .await
    }

    /// Send a command to one peer
    pub async fn send_message(
        &self,
        address: PeerAddress,
        command: impl Into<String>,
        params: Value,
    ) -> LinkResult<()> {
        let command = command.into();
        self.call(|reply| Request::SendMessage {
            address,
            command,
            params,
            reply,
        })
        .await
    }

    /// Read the peer's info characteristic (client links only)
    pub async fn read_device_info(&self, address: PeerAddress) -> LinkResult<DeviceInfo> {
        self.call(|reply| Request::ReadDeviceInfo { address, reply }).await
    }

    // ------------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------------

    /// Start pairing with `address`, connecting first if needed.
    ///
    /// Returns the code to show the user; the peer must confirm it before
    /// the pairing timeout.
    pub async fn initiate_pairing(&self, address: PeerAddress) -> LinkResult<PairingCode> {
        self.call(|reply| Request::InitiatePairing { address, reply }).await
    }

    /// Confirm the code shown for an incoming request
    pub async fn accept_pairing(&self) -> LinkResult<()> {
        self.call(|reply| Request::AcceptPairing { reply }).await
    }

    pub async fn reject_pairing(&self) -> LinkResult<()> {
        self.call(|reply| Request::RejectPairing { reply }).await
    }

    pub async fn cancel_pairing(&self) -> LinkResult<()> {
        self.call(|reply| Request::CancelPairing { reply }).await
    }

    pub async fn forget_paired_device(&self) -> LinkResult<()> {
        self.call(|reply| Request::ForgetPairedDevice { reply }).await
    }

    pub fn paired_device(&self) -> Option<PairedDevice> {
        self.paired.borrow().clone()
    }

    pub fn is_paired(&self) -> bool {
        self.paired.borrow().is_some()
    }

    pub fn auto_connect_enabled(&self) -> LinkResult<bool> {
        self.store.auto_connect()
    }

    pub async fn set_auto_connect(&self, enabled: bool) -> LinkResult<()> {
        self.call(|reply| Request::SetAutoConnect { enabled, reply }).await
    }

    /// Look for the paired peer and connect to it.
    ///
    /// Scans and polls the discovered list; returns `Ok(true)` once a
    /// connection attempt to the paired peer is under way (or it is already
    /// connected) and `Ok(false)` when nothing is paired, auto-connect is off,
    /// or the peer did not show up in time.
    pub async fn try_auto_connect(&self) -> LinkResult<bool> {
        let Some(device) = self.paired_device() else {
            return Ok(false);
        };
        if !self.store.auto_connect()? {
            debug!("Auto-connect disabled");
            return Ok(false);
        }
        if self.connected.borrow().contains(&device.address) {
            return Ok(true);
        }

        info!("Looking for paired device {} ({})", device.name, device.address);
        let poll = self.config.auto_connect_poll_interval;
        let attempts = self.config.auto_connect_poll_attempts;
        self.start_scan_for(poll * attempts.saturating_add(1)).await?;

        for _ in 0..attempts {
            tokio::time::sleep(poll).await;
            let found = self
                .discovered
                .borrow()
                .iter()
                .any(|peer| peer.address == device.address);
            if found {
                self.stop_scan().await?;
                self.connect(device.address).await?;
                return Ok(true);
            }
        }

        info!("Paired device {} not found", device.address);
        self.stop_scan().await?;
        Ok(false)
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn discovered_peers(&self) -> Vec<PeerDevice> {
        self.discovered.borrow().clone()
    }

    pub fn link_state(&self) -> ConnectionState {
        self.link_state.borrow().clone()
    }

    pub fn pairing_state(&self) -> PairingState {
        self.pairing.borrow().clone()
    }

    pub fn connected_peers(&self) -> BTreeSet<PeerAddress> {
        self.connected.borrow().clone()
    }

    pub fn watch_discovered(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.discovered.clone()
    }

    pub fn watch_link_state(&self) -> watch::Receiver<ConnectionState> {
        self.link_state.clone()
    }

    pub fn watch_pairing(&self) -> watch::Receiver<PairingState> {
        self.pairing.clone()
    }

    pub fn watch_paired(&self) -> watch::Receiver<Option<PairedDevice>> {
        self.paired.clone()
    }

    pub fn watch_connected(&self) -> watch::Receiver<BTreeSet<PeerAddress>> {
        self.connected.clone()
    }

    /// Payloads, commands, transfer failures and platform errors from now on
    pub fn notices(&self) -> broadcast::Receiver<LinkNotice> {
        self.notices.subscribe()
    }

    pub async fn snapshot(&self) -> LinkResult<LinkSnapshot> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Snapshot { reply })
            .await
            .map_err(|_| LinkError::Shutdown)?;
        response.await.map_err(|_| LinkError::Shutdown)
    }

    /// Disconnect everything, stop scanning and advertising, and stop the actor
    pub async fn shutdown(&self) -> LinkResult<()> {
        let (reply, response) = oneshot::channel();
        if self.requests.send(Request::Shutdown { reply }).await.is_err() {
            return Ok(());
        }
        let _ = response.await;
        Ok(())
    }
}

impl std::fmt::Debug for CompanionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionLink")
            .field("link_state", &*self.link_state.borrow())
            .field("pairing", &*self.pairing.borrow())
            .finish_non_exhaustive()
    }
}
