//! Per-peer connection table

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::peer::{ConnectionState, PeerAddress, Role};
use crate::protocol::Channel;

/// One live link to a peer, in either role
#[derive(Debug)]
pub struct Connection {
    pub address: PeerAddress,
    pub role: Role,
    pub state: ConnectionState,
    pub name: Option<String>,
    pub mtu: u16,
    discovery_started: bool,
    pub services_discovered: bool,
    pub subscribed: Vec<Channel>,
    pub channels_ready: bool,
    /// Cleared when the link goes away so in-flight chunk loops stop
    active: Arc<AtomicBool>,
}

impl Connection {
    fn new(address: PeerAddress, role: Role, state: ConnectionState, mtu: u16) -> Self {
        Self {
            address,
            role,
            state,
            name: None,
            mtu,
            discovery_started: false,
            services_discovered: false,
            subscribed: Vec::new(),
            channels_ready: false,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            address: self.address.clone(),
            role: self.role,
            state: self.state.clone(),
            mtu: self.mtu,
            channels_ready: self.channels_ready,
        }
    }
}

/// Snapshot of one connection for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub address: PeerAddress,
    pub role: Role,
    pub state: ConnectionState,
    pub mtu: u16,
    pub channels_ready: bool,
}

/// Address-keyed connections; at most one per peer
#[derive(Debug)]
pub struct ConnectionTable {
    connections: HashMap<PeerAddress, Connection>,
    default_mtu: u16,
}

impl ConnectionTable {
    pub fn new(default_mtu: u16) -> Self {
        Self {
            connections: HashMap::new(),
            default_mtu,
        }
    }

    /// Start an outbound attempt; false when the peer already has a connection
    pub fn begin_outbound(&mut self, address: &PeerAddress) -> bool {
        if self.connections.contains_key(address) {
            return false;
        }
        self.connections.insert(
            address.clone(),
            Connection::new(
                address.clone(),
                Role::Client,
                ConnectionState::Connecting,
                self.default_mtu,
            ),
        );
        true
    }

    /// Record an inbound link; false when a connection to that peer already exists
    pub fn accept_inbound(&mut self, address: &PeerAddress, name: Option<String>) -> bool {
        if self.connections.contains_key(address) {
            debug!("Ignoring inbound link from {}, already connected", address);
            return false;
        }
        let mut connection = Connection::new(
            address.clone(),
            Role::Server,
            ConnectionState::Connected,
            self.default_mtu,
        );
        // Server role pushes via notifications as soon as the link exists
        connection.channels_ready = true;
        connection.name = name;
        self.connections.insert(address.clone(), connection);
        true
    }

    /// Move an outbound attempt to Connected; false when no attempt is pending
    pub fn mark_connected(&mut self, address: &PeerAddress, name: Option<String>) -> bool {
        match self.connections.get_mut(address) {
            Some(connection) if connection.role == Role::Client => {
                connection.state = ConnectionState::Connected;
                if name.is_some() {
                    connection.name = name;
                }
                true
            }
            _ => false,
        }
    }

    pub fn set_mtu(&mut self, address: &PeerAddress, mtu: u16) -> bool {
        match self.connections.get_mut(address) {
            Some(connection) => {
                connection.mtu = mtu;
                true
            }
            None => false,
        }
    }

    /// Claim service discovery for a client link; true only the first time
    pub fn begin_discovery(&mut self, address: &PeerAddress) -> bool {
        match self.connections.get_mut(address) {
            Some(connection)
                if connection.role == Role::Client
                    && connection.state.is_connected()
                    && !connection.discovery_started =>
            {
                connection.discovery_started = true;
                true
            }
            _ => false,
        }
    }

    pub fn mark_services_discovered(&mut self, address: &PeerAddress) -> bool {
        match self.connections.get_mut(address) {
            Some(connection) => {
                connection.services_discovered = true;
                true
            }
            None => false,
        }
    }

    /// Record a subscription ack and return the next channel to subscribe.
    ///
    /// Channels become ready once the last subscription in the chain is acked.
    pub fn ack_subscription(&mut self, address: &PeerAddress, channel: Channel) -> Option<Channel> {
        let connection = self.connections.get_mut(address)?;
        if !connection.subscribed.contains(&channel) {
            connection.subscribed.push(channel);
        }
        let next = channel.next_subscription();
        if next.is_none() {
            connection.channels_ready = true;
        }
        next
    }

    /// Remove a connection and stop anything still sending on it
    pub fn remove(&mut self, address: &PeerAddress) -> Option<Connection> {
        let connection = self.connections.remove(address)?;
        connection.active.store(false, Ordering::SeqCst);
        Some(connection)
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&Connection> {
        self.connections.get(address)
    }

    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.connections.contains_key(address)
    }

    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.connections.keys().cloned().collect()
    }

    /// Addresses with an established connection
    pub fn connected(&self) -> BTreeSet<PeerAddress> {
        self.connections
            .values()
            .filter(|c| c.state.is_connected())
            .map(|c| c.address.clone())
            .collect()
    }

    pub fn established(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(|c| c.state.is_connected())
    }

    /// Aggregate state across all connections
    pub fn overall_state(&self) -> ConnectionState {
        if self.connections.values().any(|c| c.state.is_connected()) {
            ConnectionState::Connected
        } else if self.connections.values().any(|c| c.state.is_connecting()) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<_> = self.connections.values().map(Connection::summary).collect();
        summaries.sort_by(|a, b| a.address.cmp(&b.address));
        summaries
    }
}
