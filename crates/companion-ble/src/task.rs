//! The link actor
//!
//! One task owns every piece of link state: the connection table, discovered
//! peers, reassembly buffers, reconnect counters, the pairing machine and all
//! timers. Requests from [`CompanionLink`](crate::CompanionLink) handles,
//! radio events from the backend and messages from its own worker tasks are
//! handled one at a time in arrival order. Workers (radio steps, chunk loops,
//! timers) never touch that state; they post back instead.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::advertising::AdvertisementPlan;
use crate::backend::{LinkBackend, RadioEvent, RadioEventReceiver, ScanRecord};
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::framing::{CommandFrame, IncomingCommand, Reassembler, TransferPlan};
use crate::links::{ConnectionSummary, ConnectionTable};
use crate::pairing::{self, PairingCode, PairingMachine, PairingMessage, PairingSession, PairingState};
use crate::peer::{ConnectionState, DeviceInfo, PeerAddress, PeerDevice, Role, SelfInfo};
use crate::protocol::{Channel, UNKNOWN_DEVICE_NAME};
use crate::reconnect::{ReconnectDecision, ReconnectSupervisor};
use crate::scanner::DiscoveredPeers;
use crate::store::{now_millis, PairedDevice, PairingStore};
use crate::timer::TimerSet;

// ----------------------------------------------------------------------------
// Public Notices and Snapshots
// ----------------------------------------------------------------------------

/// Things that happened on the link that callers may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum LinkNotice {
    /// A chunked transfer ended; `complete` is false when bytes or chunks
    /// differ from what `transfer_start` declared
    PayloadReceived {
        from: PeerAddress,
        transfer_id: String,
        payload: Vec<u8>,
        complete: bool,
    },
    /// A non-pairing command from a peer
    CommandReceived {
        from: PeerAddress,
        command: String,
        params: Value,
    },
    TransferFailed {
        peer: PeerAddress,
        transfer_id: String,
        reason: String,
    },
    /// Platform or permission failure during an asynchronous step
    Error { message: String },
}

/// Point-in-time view of the link for status reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkSnapshot {
    pub link_state: ConnectionState,
    pub connections: Vec<ConnectionSummary>,
    pub reconnect_attempts: BTreeMap<PeerAddress, u32>,
    pub pairing: PairingState,
    pub paired: Option<PairedDevice>,
    pub advertising: bool,
    pub scanning: bool,
    pub discovered: usize,
    pub pending_transfers: usize,
}

// ----------------------------------------------------------------------------
// Actor Messages
// ----------------------------------------------------------------------------

pub(crate) type Reply<T> = oneshot::Sender<LinkResult<T>>;

pub(crate) enum Request {
    StartAdvertising { info: SelfInfo, reply: Reply<()> },
    StopAdvertising { reply: Reply<()> },
    StartScan { timeout: Duration, reply: Reply<()> },
    StopScan { reply: Reply<()> },
    Connect { address: PeerAddress, reply: Reply<()> },
    Disconnect { address: PeerAddress, reply: Reply<()> },
    DisconnectAll { reply: Reply<()> },
    SendRaw { address: PeerAddress, channel: Channel, bytes: Vec<u8>, reply: Reply<()> },
    SendData { address: PeerAddress, transfer_id: String, bytes: Vec<u8>, reply: Reply<()> },
    SendCommand { command: String, params: Value, reply: Reply<usize> },
    SendMessage { address: PeerAddress, command: String, params: Value, reply: Reply<()> },
    ReadDeviceInfo { address: PeerAddress, reply: Reply<DeviceInfo> },
    InitiatePairing { address: PeerAddress, reply: Reply<PairingCode> },
    AcceptPairing { reply: Reply<()> },
    RejectPairing { reply: Reply<()> },
    CancelPairing { reply: Reply<()> },
    ForgetPairedDevice { reply: Reply<()> },
    SetAutoConnect { enabled: bool, reply: Reply<()> },
    Snapshot { reply: oneshot::Sender<LinkSnapshot> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Radio steps run on worker tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Mtu,
    Discovery,
    Subscribe(Channel),
    Disconnect,
    Send,
}

/// Messages workers and timers post back to the actor
#[derive(Debug)]
enum Internal {
    ConnectFailed { address: PeerAddress, reason: String },
    StepFailed { address: PeerAddress, step: Step, reason: String },
    TransferFailed { address: PeerAddress, transfer_id: String, reason: String },
    ReconnectDue { address: PeerAddress, timer: u64 },
    PairingTimeout { session: u64, timer: u64 },
    PairingSettled { timer: u64 },
    ScanTimeout { timer: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Reconnect(PeerAddress),
    Pairing,
    PairingSettle,
    Scan,
}

/// Observable state published by the actor
pub(crate) struct Outputs {
    pub discovered: watch::Sender<Vec<PeerDevice>>,
    pub link_state: watch::Sender<ConnectionState>,
    pub pairing: watch::Sender<PairingState>,
    pub paired: watch::Sender<Option<PairedDevice>>,
    pub connected: watch::Sender<BTreeSet<PeerAddress>>,
    pub notices: broadcast::Sender<LinkNotice>,
}

fn publish<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

// ----------------------------------------------------------------------------
// Link Task
// ----------------------------------------------------------------------------

pub(crate) struct LinkTask {
    config: LinkConfig,
    backend: Arc<dyn LinkBackend>,
    store: PairingStore,
    display_name: String,

    table: ConnectionTable,
    discovered: DiscoveredPeers,
    reassembler: Reassembler,
    reconnect: ReconnectSupervisor,
    pairing: PairingMachine,
    /// `pairingRequest` waiting for the peer's channels
    pending_request: Option<(PeerAddress, Vec<u8>)>,
    timers: TimerSet<TimerKey>,
    advertising: bool,
    scanning: bool,
    last_error: Option<String>,

    requests: mpsc::Receiver<Request>,
    radio: RadioEventReceiver,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    outputs: Outputs,
}

impl LinkTask {
    pub(crate) fn new(
        config: LinkConfig,
        backend: Arc<dyn LinkBackend>,
        radio: RadioEventReceiver,
        store: PairingStore,
        requests: mpsc::Receiver<Request>,
        outputs: Outputs,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            display_name: config.device_name.clone(),
            table: ConnectionTable::new(config.default_mtu),
            discovered: DiscoveredPeers::new(config.peer_stale_after),
            reassembler: Reassembler::new(),
            reconnect: ReconnectSupervisor::new(
                config.auto_reconnect,
                config.reconnect_delay,
                config.max_reconnect_attempts,
            ),
            pairing: PairingMachine::new(),
            pending_request: None,
            timers: TimerSet::new(),
            advertising: false,
            scanning: false,
            last_error: None,
            config,
            backend,
            store,
            requests,
            radio,
            internal_tx,
            internal_rx,
            outputs,
        }
    }

    /// Main actor loop
    pub(crate) async fn run(mut self) {
        info!("Companion link task starting");

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        info!("All link handles dropped, shutting down");
                        self.shutdown().await;
                        break;
                    }
                },

                Some(event) = self.radio.recv() => self.handle_radio_event(event),

                Some(message) = self.internal_rx.recv() => self.handle_internal(message),
            }
        }

        info!("Companion link task stopped");
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::StartAdvertising { info, reply } => {
                let _ = reply.send(self.start_advertising(info).await);
            }
            Request::StopAdvertising { reply } => {
                let _ = reply.send(self.stop_advertising().await);
            }
            Request::StartScan { timeout, reply } => {
                let _ = reply.send(self.start_scan(timeout).await);
            }
            Request::StopScan { reply } => {
                let _ = reply.send(self.stop_scan().await);
            }
            Request::Connect { address, reply } => {
                self.start_connect(address);
                let _ = reply.send(Ok(()));
            }
            Request::Disconnect { address, reply } => {
                self.disconnect(&address);
                let _ = reply.send(Ok(()));
            }
            Request::DisconnectAll { reply } => {
                self.disconnect_all();
                let _ = reply.send(Ok(()));
            }
            Request::SendRaw {
                address,
                channel,
                bytes,
                reply,
            } => self.send_raw(address, channel, bytes, reply),
            Request::SendData {
                address,
                transfer_id,
                bytes,
                reply,
            } => self.send_data(address, transfer_id, bytes, reply),
            Request::SendCommand {
                command,
                params,
                reply,
            } => self.send_command(command, params, reply),
            Request::SendMessage {
                address,
                command,
                params,
                reply,
            } => self.send_message(address, command, params, reply),
            Request::ReadDeviceInfo { address, reply } => self.read_device_info(address, reply),
            Request::InitiatePairing { address, reply } => {
                let _ = reply.send(self.initiate_pairing(address));
            }
            Request::AcceptPairing { reply } => {
                let _ = reply.send(self.accept_pairing());
            }
            Request::RejectPairing { reply } | Request::CancelPairing { reply } => {
                self.end_pairing();
                let _ = reply.send(Ok(()));
            }
            Request::ForgetPairedDevice { reply } => {
                let result = self.store.forget();
                if result.is_ok() {
                    publish(&self.outputs.paired, None);
                }
                let _ = reply.send(result);
            }
            Request::SetAutoConnect { enabled, reply } => {
                let _ = reply.send(self.store.set_auto_connect(enabled));
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Request::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn start_advertising(&mut self, info: SelfInfo) -> LinkResult<()> {
        if self.advertising {
            debug!("Already advertising");
            return Ok(());
        }
        let plan = AdvertisementPlan::new(&info)?;
        if let Err(e) = self.backend.start_advertising(&plan, &info.device_info()).await {
            error!("Failed to start advertising: {}", e);
            return Err(e);
        }
        self.advertising = true;
        self.display_name = info.display_name;
        info!("Advertising as '{}'", self.display_name);
        Ok(())
    }

    async fn stop_advertising(&mut self) -> LinkResult<()> {
        if !self.advertising {
            return Ok(());
        }
        self.advertising = false;
        self.backend.stop_advertising().await
    }

    async fn start_scan(&mut self, timeout: Duration) -> LinkResult<()> {
        self.discovered.clear();
        publish(&self.outputs.discovered, Vec::new());

        // The list was just cleared, so a running scan restarts to report
        // peers that are already visible again
        if self.scanning {
            debug!("Restarting scan");
            if let Err(e) = self.backend.stop_scan().await {
                warn!("Failed to stop scan before restarting: {}", e);
            }
            self.scanning = false;
        }
        if let Err(e) = self.backend.start_scan().await {
            error!("Failed to start scanning: {}", e);
            self.timers.cancel(&TimerKey::Scan);
            return Err(e);
        }
        self.scanning = true;

        self.timers
            .schedule(TimerKey::Scan, timeout, &self.internal_tx, |timer| {
                Internal::ScanTimeout { timer }
            });
        info!("Scanning for companion peers for {:?}", timeout);
        Ok(())
    }

    async fn stop_scan(&mut self) -> LinkResult<()> {
        self.timers.cancel(&TimerKey::Scan);
        if !self.scanning {
            return Ok(());
        }
        self.scanning = false;
        info!("Scan stopped");
        self.backend.stop_scan().await
    }

    fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            link_state: self.outputs.link_state.borrow().clone(),
            connections: self.table.summaries(),
            reconnect_attempts: self.reconnect.counters().into_iter().collect(),
            pairing: self.pairing.state().clone(),
            paired: self.outputs.paired.borrow().clone(),
            advertising: self.advertising,
            scanning: self.scanning,
            discovered: self.discovered.len(),
            pending_transfers: self.reassembler.pending(),
        }
    }

    async fn shutdown(&mut self) {
        for address in self.table.addresses() {
            self.table.remove(&address);
            if let Err(e) = self.backend.disconnect(&address).await {
                warn!("Disconnect from {} during shutdown failed: {}", address, e);
            }
        }
        self.reconnect.forget_all();
        self.timers.cancel_all();
        if let Err(e) = self.stop_scan().await {
            warn!("Stopping scan during shutdown failed: {}", e);
        }
        if let Err(e) = self.stop_advertising().await {
            warn!("Stopping advertising during shutdown failed: {}", e);
        }
        self.publish_links();
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Open a client link unless one already exists
    fn start_connect(&mut self, address: PeerAddress) {
        if !self.table.begin_outbound(&address) {
            debug!("Already connected or connecting to {}", address);
            return;
        }
        if self.discovered.remove(&address) {
            publish(&self.outputs.discovered, self.discovered.list());
        }
        self.last_error = None;
        self.publish_links();
        info!("Connecting to {}", address);

        let backend = self.backend.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.connect(&address).await {
                let _ = internal.send(Internal::ConnectFailed {
                    address,
                    reason: e.to_string(),
                });
            }
        });
    }

    /// Manual teardown; never triggers a reconnect
    fn disconnect(&mut self, address: &PeerAddress) {
        self.reconnect.forget(address);
        self.timers.cancel(&TimerKey::Reconnect(address.clone()));

        if self.table.remove(address).is_some() {
            info!("Disconnecting from {}", address);
            self.reassembler.abandon(address);
            self.drop_pending_request(address);

            let backend = self.backend.clone();
            let target = address.clone();
            self.spawn_step(address.clone(), Step::Disconnect, async move {
                backend.disconnect(&target).await
            });
        }
        self.publish_links();
    }

    fn disconnect_all(&mut self) {
        for address in self.table.addresses() {
            self.disconnect(&address);
        }
        self.reconnect.forget_all();
        self.timers
            .cancel_where(|key| matches!(key, TimerKey::Reconnect(_)));
        self.publish_links();
    }

    /// A client link dropped without being asked to
    fn handle_unexpected_loss(&mut self, address: &PeerAddress) {
        match self.reconnect.on_unexpected_disconnect(address) {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(
                    "Reconnecting to {} in {:?} (attempt {}/{})",
                    address, delay, attempt, self.config.max_reconnect_attempts
                );
                let key = TimerKey::Reconnect(address.clone());
                let target = address.clone();
                self.timers.schedule(key, delay, &self.internal_tx, |timer| {
                    Internal::ReconnectDue {
                        address: target,
                        timer,
                    }
                });
            }
            ReconnectDecision::GiveUp { attempts } => {
                warn!("Giving up on {} after {} reconnect attempts", address, attempts);
                self.last_error = None;
            }
            ReconnectDecision::Disabled => {}
        }
        self.publish_links();
    }

    fn spawn_step<F>(&self, address: PeerAddress, step: Step, work: F)
    where
        F: Future<Output = LinkResult<()>> + Send + 'static,
    {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = work.await {
                let _ = internal.send(Internal::StepFailed {
                    address,
                    step,
                    reason: e.to_string(),
                });
            }
        });
    }

    fn request_mtu(&self, address: &PeerAddress) {
        let backend = self.backend.clone();
        let target = address.clone();
        let mtu = self.config.requested_mtu;
        self.spawn_step(address.clone(), Step::Mtu, async move {
            backend.request_mtu(&target, mtu).await
        });
    }

    fn discover_services(&mut self, address: &PeerAddress) {
        if !self.table.begin_discovery(address) {
            return;
        }
        let backend = self.backend.clone();
        let target = address.clone();
        self.spawn_step(address.clone(), Step::Discovery, async move {
            backend.discover_services(&target).await
        });
    }

    fn subscribe(&self, address: &PeerAddress, channel: Channel) {
        debug!("Subscribing to {} on {}", channel, address);
        let backend = self.backend.clone();
        let target = address.clone();
        self.spawn_step(address.clone(), Step::Subscribe(channel), async move {
            backend.subscribe(&target, channel).await
        });
    }

    fn publish_links(&mut self) {
        let state = match (&self.last_error, self.table.overall_state()) {
            (Some(reason), ConnectionState::Disconnected) => ConnectionState::Error(reason.clone()),
            (_, state) => state,
        };
        publish(&self.outputs.link_state, state);
        publish(&self.outputs.connected, self.table.connected());
    }

    fn notify_error(&self, message: String) {
        let _ = self.outputs.notices.send(LinkNotice::Error { message });
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Role and readiness of an established link
    fn route(&self, address: &PeerAddress) -> LinkResult<(Role, bool)> {
        match self.table.get(address) {
            Some(connection) if connection.state.is_connected() => {
                Ok((connection.role, connection.channels_ready))
            }
            _ => Err(LinkError::not_connected(address)),
        }
    }

    fn send_raw(&self, address: PeerAddress, channel: Channel, bytes: Vec<u8>, reply: Reply<()>) {
        let role = match self.table.get(&address) {
            Some(connection) => connection.role,
            None => {
                warn!("No link to {} for a raw {} write", address, channel);
                let _ = reply.send(Err(LinkError::not_connected(&address)));
                return;
            }
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let result = match role {
                Role::Client => backend.write(&address, channel, &bytes).await,
                Role::Server => backend.notify(&address, channel, &bytes).await,
            };
            let _ = reply.send(result);
        });
    }

    fn send_data(&self, address: PeerAddress, transfer_id: String, bytes: Vec<u8>, reply: Reply<()>) {
        let (role, ready) = match self.route(&address) {
            Ok(route) => route,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let Some(connection) = self.table.get(&address).filter(|_| ready) else {
            let _ = reply.send(Err(LinkError::ChannelsNotReady {
                address: address.to_string(),
            }));
            return;
        };

        let plan = match TransferPlan::new(&transfer_id, &bytes, connection.mtu, self.config.max_chunk_size) {
            Ok(plan) => plan,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        debug!(
            "Sending {} bytes to {} as transfer {} ({} chunks of {})",
            bytes.len(),
            address,
            transfer_id,
            plan.chunks.len(),
            plan.chunk_size
        );

        let backend = self.backend.clone();
        let active = connection.active_flag();
        let chunk_delay = self.config.chunk_delay;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = run_transfer(backend, &address, role, &plan, &active, chunk_delay).await;
            if let Err(e) = &result {
                let _ = internal.send(Internal::TransferFailed {
                    address,
                    transfer_id,
                    reason: e.to_string(),
                });
            }
            let _ = reply.send(result);
        });
    }

    fn send_command(&self, command: String, params: Value, reply: Reply<usize>) {
        let bytes = match CommandFrame::new(command, params).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let targets: Vec<(PeerAddress, Role)> = self
            .table
            .established()
            .map(|c| (c.address.clone(), c.role))
            .collect();

        let backend = self.backend.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut delivered = 0;
            for (address, role) in targets {
                match push_command(&*backend, &address, role, &bytes).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        let _ = internal.send(Internal::StepFailed {
                            address,
                            step: Step::Send,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            let _ = reply.send(Ok(delivered));
        });
    }

    fn send_message(&self, address: PeerAddress, command: String, params: Value, reply: Reply<()>) {
        let role = match self.route(&address) {
            Ok((role, _)) => role,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let bytes = match CommandFrame::new(command, params).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let _ = reply.send(push_command(&*backend, &address, role, &bytes).await);
        });
    }

    /// Fire-and-forget command to one peer; failures go to the notice stream
    fn send_command_bytes(&self, address: &PeerAddress, role: Role, bytes: Vec<u8>) {
        let backend = self.backend.clone();
        let target = address.clone();
        self.spawn_step(address.clone(), Step::Send, async move {
            push_command(&*backend, &target, role, &bytes).await
        });
    }

    fn read_device_info(&self, address: PeerAddress, reply: Reply<DeviceInfo>) {
        match self.route(&address) {
            Ok((Role::Client, _)) => {}
            Ok((Role::Server, _)) => {
                let _ = reply.send(Err(LinkError::ReadFailed(format!(
                    "{} connected to us; its info channel is not available",
                    address
                ))));
                return;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        }
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let result = match backend.read(&address, Channel::Info).await {
                Ok(bytes) => serde_json::from_slice::<DeviceInfo>(&bytes).map_err(LinkError::from),
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        });
    }

    // ------------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------------

    fn peer_name(&self, address: &PeerAddress) -> Option<String> {
        self.discovered
            .get(address)
            .map(|peer| peer.name.clone())
            .or_else(|| self.table.get(address).and_then(|c| c.name.clone()))
    }

    fn arm_pairing_timeout(&mut self, session: u64) {
        self.timers.schedule(
            TimerKey::Pairing,
            self.config.pairing_timeout,
            &self.internal_tx,
            |timer| Internal::PairingTimeout { session, timer },
        );
    }

    fn publish_pairing(&self) {
        publish(&self.outputs.pairing, self.pairing.state().clone());
    }

    fn initiate_pairing(&mut self, address: PeerAddress) -> LinkResult<PairingCode> {
        let code = PairingCode::generate();
        let request = pairing::request_command(&code, &self.display_name).encode()?;
        let peer_name = self.peer_name(&address);
        let session = self.pairing.initiate(address.clone(), peer_name, code.clone())?.id;
        self.timers.cancel(&TimerKey::PairingSettle);
        self.arm_pairing_timeout(session);
        self.publish_pairing();

        match self.route(&address) {
            Ok((role, true)) => self.send_command_bytes(&address, role, request),
            Ok((_, false)) => self.pending_request = Some((address, request)),
            Err(_) => {
                self.pending_request = Some((address.clone(), request));
                self.start_connect(address);
            }
        }
        Ok(code)
    }

    fn flush_pending_request(&mut self, address: &PeerAddress) {
        let matches = self
            .pending_request
            .as_ref()
            .is_some_and(|(target, _)| target == address);
        if !matches {
            return;
        }
        let Ok((role, true)) = self.route(address) else {
            return;
        };
        if let Some((target, request)) = self.pending_request.take() {
            debug!("Sending queued pairing request to {}", target);
            self.send_command_bytes(&target, role, request);
        }
    }

    fn drop_pending_request(&mut self, address: &PeerAddress) {
        if self
            .pending_request
            .as_ref()
            .is_some_and(|(target, _)| target == address)
        {
            self.pending_request = None;
        }
    }

    fn accept_pairing(&mut self) -> LinkResult<()> {
        let session = self.pairing.accept()?;
        self.complete_pairing(session, true);
        Ok(())
    }

    fn handle_pairing_message(&mut self, from: &PeerAddress, message: PairingMessage) {
        match message {
            PairingMessage::Request { code, name } => {
                let name = name.or_else(|| self.peer_name(from));
                let session = self
                    .pairing
                    .receive_request(from.clone(), name, code)
                    .map(|s| s.id);
                if let Some(session) = session {
                    self.timers.cancel(&TimerKey::PairingSettle);
                    self.arm_pairing_timeout(session);
                    self.publish_pairing();
                }
            }
            PairingMessage::Accepted => {
                if let Some(session) = self.pairing.receive_accepted(from) {
                    self.complete_pairing(session, false);
                }
            }
        }
    }

    fn complete_pairing(&mut self, session: PairingSession, announce: bool) {
        self.timers.cancel(&TimerKey::Pairing);
        self.pending_request = None;

        if announce {
            match pairing::accepted_command().encode() {
                Ok(bytes) => {
                    let targets: Vec<(PeerAddress, Role)> = self
                        .table
                        .established()
                        .map(|c| (c.address.clone(), c.role))
                        .collect();
                    for (address, role) in targets {
                        self.send_command_bytes(&address, role, bytes.clone());
                    }
                }
                Err(e) => self.notify_error(format!("Failed to encode pairingAccepted: {}", e)),
            }
        }

        let name = session
            .peer_name
            .clone()
            .or_else(|| self.peer_name(&session.peer))
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());
        let device = PairedDevice {
            address: session.peer.clone(),
            name,
            paired_at: now_millis(),
        };
        match self.store.save(&device) {
            Ok(()) => publish(&self.outputs.paired, Some(device)),
            Err(e) => {
                error!("Failed to persist paired device: {}", e);
                self.notify_error(format!("Failed to persist paired device: {}", e));
            }
        }

        self.publish_pairing();
        self.publish_links();
        self.timers.schedule(
            TimerKey::PairingSettle,
            self.config.pairing_settle_delay,
            &self.internal_tx,
            |timer| Internal::PairingSettled { timer },
        );
    }

    /// Reject or cancel: back to Idle and tear down every link
    fn end_pairing(&mut self) {
        if let Some(session) = self.pairing.cancel() {
            info!("Pairing with {} ended", session.peer);
        }
        self.timers.cancel(&TimerKey::Pairing);
        self.timers.cancel(&TimerKey::PairingSettle);
        self.pending_request = None;
        self.publish_pairing();
        self.disconnect_all();
    }

    // ------------------------------------------------------------------------
    // Radio Events
    // ------------------------------------------------------------------------

    fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Connected {
                address,
                role: Role::Client,
                name,
            } => {
                if !self.table.mark_connected(&address, name) {
                    // Attempt was abandoned while the platform was connecting
                    debug!("Releasing unrequested client link to {}", address);
                    let backend = self.backend.clone();
                    let target = address.clone();
                    self.spawn_step(address, Step::Disconnect, async move {
                        backend.disconnect(&target).await
                    });
                    return;
                }
                info!("Connected to {}", address);
                self.reconnect.on_connected(&address);
                self.timers.cancel(&TimerKey::Reconnect(address.clone()));
                self.last_error = None;
                self.publish_links();
                self.request_mtu(&address);
            }
            RadioEvent::Connected {
                address,
                role: Role::Server,
                name,
            } => {
                if self.table.accept_inbound(&address, name) {
                    info!("{} connected to us", address);
                    self.publish_links();
                    self.flush_pending_request(&address);
                }
            }
            RadioEvent::Disconnected { address } => self.handle_disconnected(&address),
            RadioEvent::MtuChanged { address, mtu } => {
                if self.table.set_mtu(&address, mtu) {
                    debug!("MTU for {} is {}", address, mtu);
                    self.discover_services(&address);
                }
            }
            RadioEvent::ServicesReady { address } => {
                if self.table.mark_services_discovered(&address) {
                    debug!("Services ready on {}", address);
                    self.subscribe(&address, Channel::FIRST_SUBSCRIPTION);
                }
            }
            RadioEvent::WriteAcked { address, channel } => {
                if !self.table.contains(&address) {
                    return;
                }
                match self.table.ack_subscription(&address, channel) {
                    Some(next) => self.subscribe(&address, next),
                    None => {
                        info!("Channels ready on {}", address);
                        self.publish_links();
                        self.flush_pending_request(&address);
                    }
                }
            }
            RadioEvent::DataReceived { address, bytes } => {
                if let Some(done) = self.reassembler.ingest(&address, &bytes) {
                    let complete = done.is_complete();
                    info!(
                        "Received transfer {} from {} ({} bytes)",
                        done.transfer_id,
                        address,
                        done.payload.len()
                    );
                    let _ = self.outputs.notices.send(LinkNotice::PayloadReceived {
                        from: done.from,
                        transfer_id: done.transfer_id,
                        payload: done.payload,
                        complete,
                    });
                }
            }
            RadioEvent::CommandReceived { address, bytes } => {
                self.handle_command(&address, &bytes)
            }
            RadioEvent::ScanResult(record) => self.handle_scan_result(record),
            RadioEvent::ScanLost { address } => {
                if self.discovered.remove(&address) {
                    publish(&self.outputs.discovered, self.discovered.list());
                }
            }
            RadioEvent::PlatformError(message) => {
                error!("Platform error: {}", message);
                self.notify_error(message);
            }
        }
    }

    fn handle_disconnected(&mut self, address: &PeerAddress) {
        let Some(connection) = self.table.remove(address) else {
            // Manual disconnects remove the entry first
            return;
        };
        info!("Link to {} lost", address);
        self.reassembler.abandon(address);
        self.drop_pending_request(address);
        self.publish_links();

        if connection.role == Role::Client {
            self.handle_unexpected_loss(address);
        }
    }

    fn handle_command(&mut self, from: &PeerAddress, bytes: &[u8]) {
        let command = match IncomingCommand::parse(bytes) {
            Ok(command) => command,
            Err(e) => {
                warn!("Dropping command from {}: {}", from, e);
                return;
            }
        };
        match PairingMessage::from_command(&command) {
            Some(message) => self.handle_pairing_message(from, message),
            None => {
                debug!("Command '{}' from {}", command.command, from);
                let _ = self.outputs.notices.send(LinkNotice::CommandReceived {
                    from: from.clone(),
                    command: command.command,
                    params: command.params,
                });
            }
        }
    }

    fn handle_scan_result(&mut self, record: ScanRecord) {
        if !self.scanning || self.table.contains(&record.address) {
            return;
        }
        let now = Instant::now();
        let mut changed = self.discovered.upsert(&record, now);
        changed |= !self.discovered.prune_stale(now).is_empty();
        if changed {
            publish(&self.outputs.discovered, self.discovered.list());
        }
    }

    // ------------------------------------------------------------------------
    // Worker Messages
    // ------------------------------------------------------------------------

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::ConnectFailed { address, reason } => {
                let pending = self
                    .table
                    .get(&address)
                    .is_some_and(|c| c.role == Role::Client && c.state.is_connecting());
                if !pending {
                    return;
                }
                self.table.remove(&address);
                self.drop_pending_request(&address);
                error!("Connection to {} failed: {}", address, reason);
                self.notify_error(format!("Connection to {} failed: {}", address, reason));
                self.last_error = Some(reason);

                if self.reconnect.is_tracking(&address) {
                    self.handle_unexpected_loss(&address);
                } else {
                    self.publish_links();
                }
            }
            Internal::StepFailed {
                address,
                step,
                reason,
            } => self.handle_step_failure(address, step, reason),
            Internal::TransferFailed {
                address,
                transfer_id,
                reason,
            } => {
                warn!("Transfer {} to {} failed: {}", transfer_id, address, reason);
                let _ = self.outputs.notices.send(LinkNotice::TransferFailed {
                    peer: address,
                    transfer_id,
                    reason,
                });
            }
            Internal::ReconnectDue { address, timer } => {
                if self.timers.fire(&TimerKey::Reconnect(address.clone()), timer) {
                    self.start_connect(address);
                }
            }
            Internal::PairingTimeout { session, timer } => {
                if !self.timers.fire(&TimerKey::Pairing, timer) {
                    return;
                }
                if self.pairing.timeout(session).is_some() {
                    self.pending_request = None;
                    self.publish_pairing();
                    self.disconnect_all();
                }
            }
            Internal::PairingSettled { timer } => {
                if self.timers.fire(&TimerKey::PairingSettle, timer) && self.pairing.settle() {
                    self.publish_pairing();
                }
            }
            Internal::ScanTimeout { timer } => {
                if self.timers.fire(&TimerKey::Scan, timer) && self.scanning {
                    info!("Scan timed out");
                    self.scanning = false;
                    let backend = self.backend.clone();
                    let notices = self.outputs.notices.clone();
                    tokio::spawn(async move {
                        if let Err(e) = backend.stop_scan().await {
                            warn!("Stopping scan after timeout failed: {}", e);
                            let _ = notices.send(LinkNotice::Error {
                                message: e.to_string(),
                            });
                        }
                    });
                }
            }
        }
    }

    fn handle_step_failure(&mut self, address: PeerAddress, step: Step, reason: String) {
        match step {
            Step::Mtu => {
                // Continue at the default MTU
                warn!("MTU request to {} failed: {}", address, reason);
                self.discover_services(&address);
            }
            Step::Discovery => {
                error!("Service discovery on {} failed: {}", address, reason);
                self.notify_error(format!("Service discovery on {} failed: {}", address, reason));
                self.disconnect(&address);
            }
            Step::Subscribe(channel) => {
                error!("Subscribing to {} on {} failed: {}", channel, address, reason);
                self.notify_error(format!("Subscribing to {} on {} failed: {}", channel, address, reason));
            }
            Step::Disconnect | Step::Send => {
                error!("{:?} for {} failed: {}", step, address, reason);
                self.notify_error(format!("{} failed: {}", address, reason));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Worker Helpers
// ----------------------------------------------------------------------------

/// Client links write the command channel; server links notify on the
/// notification channel
async fn push_command(
    backend: &dyn LinkBackend,
    address: &PeerAddress,
    role: Role,
    bytes: &[u8],
) -> LinkResult<()> {
    match role {
        Role::Client => backend.write(address, Channel::Command, bytes).await,
        Role::Server => backend.notify(address, Channel::Notification, bytes).await,
    }
}

/// Write every frame of a transfer, pausing between chunks.
///
/// Stops at the next frame boundary once the link's active flag is cleared.
async fn run_transfer(
    backend: Arc<dyn LinkBackend>,
    address: &PeerAddress,
    role: Role,
    plan: &TransferPlan,
    active: &AtomicBool,
    chunk_delay: Duration,
) -> LinkResult<()> {
    let last = plan.frame_count() - 1;
    for (index, frame) in plan.frames().enumerate() {
        if !active.load(Ordering::SeqCst) {
            return Err(LinkError::not_connected(address));
        }
        match role {
            Role::Client => backend.write(address, Channel::Data, frame).await?,
            Role::Server => backend.notify(address, Channel::Data, frame).await?,
        }
        if index > 0 && index < last && !chunk_delay.is_zero() {
            tokio::time::sleep(chunk_delay).await;
        }
    }
    debug!("Transfer {} to {} written", plan.transfer_id, address);
    Ok(())
}
