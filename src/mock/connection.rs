//! Connection records kept by the mock engine

use std::collections::{BTreeMap, HashSet};

use crate::device::{BleAddress, ClientDevice, ServerDevice};
use crate::gatt::event::RequestId;
use crate::gatt::{CharacteristicId, ConnectionState, DescriptorId, Phy};

/// Key of the connection table: one link per (client, server) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey {
    pub client: BleAddress,
    pub server: BleAddress,
}

impl ConnectionKey {
    pub fn new(client: &ClientDevice, server: &ServerDevice) -> Self {
        Self {
            client: client.address(),
            server: server.address(),
        }
    }
}

/// What a pending request is waiting to be answered for.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingRequest {
    CharacteristicRead(CharacteristicId),
    /// Only writes that need a response are ever pending.
    CharacteristicWrite {
        characteristic: CharacteristicId,
        value: Vec<u8>,
        prepared: bool,
    },
    DescriptorRead(DescriptorId),
    DescriptorWrite {
        descriptor: DescriptorId,
        value: Vec<u8>,
        prepared: bool,
    },
    ExecuteWrite,
}

impl PendingRequest {
    /// Whether this is a write queued in a reliable-write session.
    pub fn is_prepared_write(&self) -> bool {
        matches!(
            self,
            PendingRequest::CharacteristicWrite { prepared: true, .. }
                | PendingRequest::DescriptorWrite { prepared: true, .. }
        )
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub client: ClientDevice,
    pub server: ServerDevice,
    pub state: ConnectionState,
    pub mtu: usize,
    pub tx_phy: Phy,
    pub rx_phy: Phy,
    pub auto_connect: bool,
    /// Set between `begin_reliable_write` and `execute_reliable_write`.
    pub reliable_write: bool,
    pub pending: BTreeMap<RequestId, PendingRequest>,
    /// Characteristics with an indication not yet acknowledged.
    pub awaiting_ack: HashSet<CharacteristicId>,
}

impl Connection {
    pub fn new(client: ClientDevice, server: ServerDevice, mtu: usize, auto_connect: bool) -> Self {
        Self {
            client,
            server,
            state: ConnectionState::Disconnected,
            mtu,
            tx_phy: Phy::default(),
            rx_phy: Phy::default(),
            auto_connect,
            reliable_write: false,
            pending: BTreeMap::new(),
            awaiting_ack: HashSet::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn set_state(&mut self, next: ConnectionState) {
        log::debug!(
            "{} <-> {}: {:?} -> {:?}",
            self.client,
            self.server,
            self.state,
            next
        );
        self.state = next;
    }

    /// Largest notification payload the link carries.
    pub fn max_payload(&self) -> usize {
        self.mtu.saturating_sub(3)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            client: self.client.clone(),
            server: self.server.clone(),
            state: self.state,
            mtu: self.mtu,
            tx_phy: self.tx_phy,
            rx_phy: self.rx_phy,
            auto_connect: self.auto_connect,
            reliable_write: self.reliable_write,
            pending_requests: self.pending.len(),
            prepared_writes: self
                .pending
                .values()
                .filter(|p| p.is_prepared_write())
                .count(),
        }
    }
}

/// Snapshot of a connection, for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub client: ClientDevice,
    pub server: ServerDevice,
    pub state: ConnectionState,
    pub mtu: usize,
    pub tx_phy: Phy,
    pub rx_phy: Phy,
    pub auto_connect: bool,
    /// A reliable-write session is open.
    pub reliable_write: bool,
    pub pending_requests: usize,
    /// Pending requests that are prepared writes of the open session.
    pub prepared_writes: usize,
}
