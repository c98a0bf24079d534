//! The mock engine: an in-process broker between simulated GATT peers
//!
//! The engine owns every registered server's attribute database, the
//! connection table and the pending-request table. All of it lives in one
//! `EngineState` behind one lock, and events are pushed to the per-consumer
//! streams while that lock is held, so per-connection delivery order is the
//! order in which commands were accepted.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::config::{EngineConfig, MIN_MTU};
use crate::device::{BleAddress, ClientDevice, ServerDevice};
use crate::gatt::event::{GattStatus, RequestId};
use crate::gatt::{
    Advertisement, CharacteristicId, ClientEvent, ConnectionState, DescriptorId, GattError, Phy,
    PhyOption, ServerEvent, Services, WriteType,
};
use crate::stream::EventStream;

use super::connection::{Connection, ConnectionInfo, ConnectionKey, PendingRequest};

struct ServerEntry {
    device: ServerDevice,
    services: Services,
    events: EventStream<ServerEvent>,
}

impl ServerEntry {
    fn advertisement(&self) -> Advertisement {
        Advertisement::Advertising {
            server: self.device.clone(),
            services: self.services.iter().map(|s| s.uuid()).collect(),
        }
    }
}

struct ClientEntry {
    device: ClientDevice,
    events: EventStream<ClientEvent>,
}

/// Counters for failures that are never returned to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diagnostics {
    /// Responses that referenced no pending request.
    pub stale_responses: u64,
    /// Events lost by lagging subscribers of live streams.
    pub dropped_events: u64,
}

struct EngineState {
    config: EngineConfig,
    servers: HashMap<BleAddress, ServerEntry>,
    clients: HashMap<BleAddress, ClientEntry>,
    connections: HashMap<ConnectionKey, Connection>,
    /// Last request id issued per (client, server) pair. Survives reconnects
    /// so that a late response never matches a request of a newer link, and
    /// is forgotten once both peers have unregistered.
    request_ids: HashMap<ConnectionKey, RequestId>,
    stale_responses: u64,
}

/// Split borrow of a live connection and both of its endpoints.
struct Link<'a> {
    conn: &'a mut Connection,
    server: &'a mut ServerEntry,
    client: &'a ClientEntry,
    next_id: &'a mut RequestId,
}

impl Link<'_> {
    fn allocate_request_id(&mut self) -> RequestId {
        *self.next_id = self.next_id.wrapping_add(1).max(1);
        *self.next_id
    }
}

impl EngineState {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            servers: HashMap::new(),
            clients: HashMap::new(),
            connections: HashMap::new(),
            request_ids: HashMap::new(),
            stale_responses: 0,
        }
    }

    /// Resolve a connected link or fail with `NotConnected`.
    fn link(&mut self, client: &ClientDevice, server: &ServerDevice) -> Result<Link<'_>, GattError> {
        let key = ConnectionKey::new(client, server);
        let conn = self
            .connections
            .get_mut(&key)
            .filter(|c| c.is_connected())
            .ok_or_else(|| GattError::not_connected(client, server))?;
        let server_entry = self
            .servers
            .get_mut(&key.server)
            .ok_or_else(|| GattError::not_connected(client, server))?;
        let client_entry = self
            .clients
            .get(&key.client)
            .ok_or_else(|| GattError::not_connected(client, server))?;
        let next_id = self.request_ids.entry(key).or_insert(0);
        Ok(Link {
            conn,
            server: server_entry,
            client: client_entry,
            next_id,
        })
    }

    fn register_server(
        &mut self,
        device: ServerDevice,
        services: Services,
    ) -> Result<EventStream<ServerEvent>, GattError> {
        let address = device.address();
        if self.servers.contains_key(&address) {
            return Err(GattError::AlreadyRegistered(address));
        }
        let events = EventStream::new(
            format!("server {device}"),
            self.config.event_capacity,
            self.config.event_replay,
        );
        for service in services.iter() {
            events.emit(ServerEvent::ServiceAdded {
                service: service.uuid(),
                status: GattStatus::Success,
            });
        }
        log::info!("Registered server {} with {} services", device, services.len());
        self.servers.insert(
            address,
            ServerEntry {
                device,
                services,
                events: events.clone(),
            },
        );
        Ok(events)
    }

    fn unregister_server(&mut self, device: &ServerDevice) -> Result<(), GattError> {
        let address = device.address();
        if !self.servers.contains_key(&address) {
            return Err(GattError::NotFound(address));
        }
        let keys: Vec<ConnectionKey> = self
            .connections
            .keys()
            .filter(|k| k.server == address)
            .copied()
            .collect();
        for key in keys {
            self.tear_down(key, false, true);
        }
        if let Some(entry) = self.servers.remove(&address) {
            entry.events.close();
        }
        self.forget_request_ids();
        log::info!("Unregistered server {}", device);
        Ok(())
    }

    fn register_client(&mut self, device: ClientDevice) -> Result<EventStream<ClientEvent>, GattError> {
        let address = device.address();
        if self.clients.contains_key(&address) {
            return Err(GattError::AlreadyRegistered(address));
        }
        let events = EventStream::new(
            format!("client {device}"),
            self.config.event_capacity,
            self.config.event_replay,
        );
        log::info!("Registered client {}", device);
        self.clients.insert(
            address,
            ClientEntry {
                device,
                events: events.clone(),
            },
        );
        Ok(events)
    }

    fn unregister_client(&mut self, device: &ClientDevice) -> Result<(), GattError> {
        let address = device.address();
        if !self.clients.contains_key(&address) {
            return Err(GattError::NotFound(address));
        }
        let keys: Vec<ConnectionKey> = self
            .connections
            .keys()
            .filter(|k| k.client == address)
            .copied()
            .collect();
        for key in keys {
            self.tear_down(key, true, true);
        }
        if let Some(entry) = self.clients.remove(&address) {
            entry.events.close();
        }
        self.forget_request_ids();
        log::info!("Unregistered client {}", device);
        Ok(())
    }

    /// Drop the request-id counters of pairs whose endpoints are both gone.
    fn forget_request_ids(&mut self) {
        let (servers, clients) = (&self.servers, &self.clients);
        self.request_ids
            .retain(|key, _| servers.contains_key(&key.server) || clients.contains_key(&key.client));
    }

    fn connect(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        auto_connect: bool,
    ) -> Result<(), GattError> {
        let key = ConnectionKey::new(client, server);
        let server_entry = self
            .servers
            .get(&key.server)
            .ok_or(GattError::NotFound(key.server))?;
        let client_entry = self
            .clients
            .get(&key.client)
            .ok_or(GattError::NotFound(key.client))?;
        if self.connections.contains_key(&key) {
            log::debug!("{} already connected to {}", client, server);
            return Ok(());
        }

        let mut conn = Connection::new(
            client_entry.device.clone(),
            server_entry.device.clone(),
            self.config.default_mtu,
            auto_connect,
        );
        conn.set_state(ConnectionState::Connecting);
        conn.set_state(ConnectionState::Connected);

        server_entry.events.emit(ServerEvent::ConnectionStateChanged {
            client: conn.client.clone(),
            status: GattStatus::Success,
            state: ConnectionState::Connected,
        });
        client_entry.events.emit(ClientEvent::ConnectionStateChanged {
            server: conn.server.clone(),
            status: GattStatus::Success,
            state: ConnectionState::Connected,
        });
        log::info!("{} connected to {}", client, server);
        self.connections.insert(key, conn);
        Ok(())
    }

    fn disconnect(&mut self, client: &ClientDevice, server: &ServerDevice) -> Result<(), GattError> {
        let key = ConnectionKey::new(client, server);
        if !self.connections.contains_key(&key) {
            return Err(GattError::not_connected(client, server));
        }
        self.tear_down(key, true, true);
        Ok(())
    }

    /// Remove a connection, discarding its pending requests, and report the
    /// terminal state to the requested sides.
    fn tear_down(&mut self, key: ConnectionKey, notify_server: bool, notify_client: bool) {
        let Some(mut conn) = self.connections.remove(&key) else {
            return;
        };
        conn.set_state(ConnectionState::Disconnecting);
        if !conn.pending.is_empty() {
            log::debug!(
                "Discarding {} pending requests of {} <-> {}",
                conn.pending.len(),
                conn.client,
                conn.server
            );
        }
        conn.pending.clear();
        conn.awaiting_ack.clear();
        conn.set_state(ConnectionState::Disconnected);

        if notify_server {
            if let Some(entry) = self.servers.get(&key.server) {
                entry.events.emit(ServerEvent::ConnectionStateChanged {
                    client: conn.client.clone(),
                    status: GattStatus::Success,
                    state: ConnectionState::Disconnected,
                });
            }
        }
        if notify_client {
            if let Some(entry) = self.clients.get(&key.client) {
                entry.events.emit(ClientEvent::ConnectionStateChanged {
                    server: conn.server.clone(),
                    status: GattStatus::Success,
                    state: ConnectionState::Disconnected,
                });
            }
        }
        log::info!("{} disconnected from {}", conn.client, conn.server);
    }

    fn discover_services(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
    ) -> Result<Services, GattError> {
        let link = self.link(client, server)?;
        link.client.events.emit(ClientEvent::ServicesDiscovered {
            server: link.conn.server.clone(),
            status: GattStatus::Success,
        });
        Ok(link.server.services.clone())
    }

    fn read_characteristic(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<RequestId, GattError> {
        let mut link = self.link(client, server)?;
        link.server
            .services
            .resolve_characteristic(&characteristic)?
            .check_read(&characteristic)?;

        let request_id = link.allocate_request_id();
        link.conn
            .pending
            .insert(request_id, PendingRequest::CharacteristicRead(characteristic));
        log::debug!("{} -> {}: read {} (#{})", client, server, characteristic, request_id);
        link.server.events.emit(ServerEvent::CharacteristicReadRequest {
            client: link.conn.client.clone(),
            request_id,
            offset: 0,
            characteristic,
        });
        Ok(request_id)
    }

    fn write_characteristic(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<RequestId, GattError> {
        let mut link = self.link(client, server)?;
        link.server
            .services
            .resolve_characteristic(&characteristic)?
            .check_write(&characteristic, write_type)?;

        let request_id = link.allocate_request_id();
        let prepared = link.conn.reliable_write;
        let response_needed = write_type.response_needed();
        if response_needed {
            link.conn.pending.insert(
                request_id,
                PendingRequest::CharacteristicWrite {
                    characteristic,
                    value: value.clone(),
                    prepared,
                },
            );
        }
        log::debug!(
            "{} -> {}: write {} = {} ({:?}, #{})",
            client,
            server,
            characteristic,
            hex::encode(&value),
            write_type,
            request_id
        );
        link.server.events.emit(ServerEvent::CharacteristicWriteRequest {
            client: link.conn.client.clone(),
            request_id,
            characteristic,
            prepared_write: prepared,
            response_needed,
            offset: 0,
            value,
        });
        Ok(request_id)
    }

    fn read_descriptor(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        descriptor: DescriptorId,
    ) -> Result<RequestId, GattError> {
        let mut link = self.link(client, server)?;
        link.server
            .services
            .resolve_descriptor(&descriptor)?
            .check_read(&descriptor)?;

        let request_id = link.allocate_request_id();
        link.conn
            .pending
            .insert(request_id, PendingRequest::DescriptorRead(descriptor));
        log::debug!("{} -> {}: read {} (#{})", client, server, descriptor, request_id);
        link.server.events.emit(ServerEvent::DescriptorReadRequest {
            client: link.conn.client.clone(),
            request_id,
            offset: 0,
            descriptor,
        });
        Ok(request_id)
    }

    fn write_descriptor(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        descriptor: DescriptorId,
        value: Vec<u8>,
    ) -> Result<RequestId, GattError> {
        let mut link = self.link(client, server)?;
        link.server
            .services
            .resolve_descriptor(&descriptor)?
            .check_write(&descriptor)?;

        let request_id = link.allocate_request_id();
        let prepared = link.conn.reliable_write;
        link.conn.pending.insert(
            request_id,
            PendingRequest::DescriptorWrite {
                descriptor,
                value: value.clone(),
                prepared,
            },
        );
        log::debug!(
            "{} -> {}: write {} = {} (#{})",
            client,
            server,
            descriptor,
            hex::encode(&value),
            request_id
        );
        link.server.events.emit(ServerEvent::DescriptorWriteRequest {
            client: link.conn.client.clone(),
            request_id,
            descriptor,
            prepared_write: prepared,
            response_needed: true,
            offset: 0,
            value,
        });
        Ok(request_id)
    }

    fn begin_reliable_write(&mut self, client: &ClientDevice, server: &ServerDevice) -> Result<(), GattError> {
        let link = self.link(client, server)?;
        link.conn.reliable_write = true;
        Ok(())
    }

    fn execute_reliable_write(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        execute: bool,
    ) -> Result<RequestId, GattError> {
        let mut link = self.link(client, server)?;
        if !link.conn.reliable_write {
            return Err(GattError::OperationNotPermitted(
                "no reliable write in progress".into(),
            ));
        }
        link.conn.reliable_write = false;
        let request_id = link.allocate_request_id();
        link.conn.pending.insert(request_id, PendingRequest::ExecuteWrite);
        link.server.events.emit(ServerEvent::ExecuteWrite {
            client: link.conn.client.clone(),
            request_id,
            execute,
        });
        Ok(request_id)
    }

    fn send_response(
        &mut self,
        server: &ServerDevice,
        client: &ClientDevice,
        request_id: RequestId,
        status: GattStatus,
        offset: usize,
        value: Vec<u8>,
    ) {
        let key = ConnectionKey::new(client, server);
        let pending = self
            .connections
            .get_mut(&key)
            .and_then(|conn| conn.pending.remove(&request_id));
        let (Some(pending), Some(client_entry)) = (pending, self.clients.get(&key.client)) else {
            self.stale_responses += 1;
            log::warn!(
                "Dropping response from {} to {}: {}",
                server,
                client,
                GattError::StaleRequest(request_id)
            );
            return;
        };

        log::debug!(
            "{} -> {}: response #{} {:?} offset {} = {}",
            server,
            client,
            request_id,
            status,
            offset,
            hex::encode(&value)
        );
        let server = server.clone();
        let event = match pending {
            PendingRequest::CharacteristicRead(characteristic) => ClientEvent::CharacteristicRead {
                server,
                request_id,
                characteristic,
                value,
                status,
            },
            // Write responses echo what the client wrote; the server's
            // response value is not forwarded.
            PendingRequest::CharacteristicWrite {
                characteristic,
                value: written,
                ..
            } => ClientEvent::CharacteristicWrite {
                server,
                request_id,
                characteristic,
                value: written,
                status,
            },
            PendingRequest::DescriptorRead(descriptor) => ClientEvent::DescriptorRead {
                server,
                request_id,
                descriptor,
                value,
                status,
            },
            PendingRequest::DescriptorWrite {
                descriptor,
                value: written,
                ..
            } => ClientEvent::DescriptorWrite {
                server,
                request_id,
                descriptor,
                value: written,
                status,
            },
            PendingRequest::ExecuteWrite => ClientEvent::ReliableWriteCompleted {
                server,
                request_id,
                status,
            },
        };
        client_entry.events.emit(event);
    }

    fn notify_characteristic_changed(
        &mut self,
        server: &ServerDevice,
        client: &ClientDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        confirm: bool,
    ) -> Result<(), GattError> {
        let link = self.link(client, server)?;
        link.server
            .services
            .resolve_characteristic(&characteristic)?
            .check_notify(&characteristic, confirm)?;
        let max = link.conn.max_payload();
        if value.len() > max {
            return Err(GattError::MtuExceeded {
                size: value.len(),
                mtu: max,
            });
        }
        if confirm && !link.conn.awaiting_ack.insert(characteristic) {
            return Err(GattError::Busy(characteristic.to_string()));
        }

        log::debug!(
            "{} -> {}: {} {} = {}",
            server,
            client,
            if confirm { "indicate" } else { "notify" },
            characteristic,
            hex::encode(&value)
        );
        link.client.events.emit(ClientEvent::CharacteristicChanged {
            server: link.conn.server.clone(),
            characteristic,
            value,
            confirm,
        });
        if !confirm {
            link.server.events.emit(ServerEvent::NotificationSent {
                client: link.conn.client.clone(),
                status: GattStatus::Success,
            });
        }
        Ok(())
    }

    fn acknowledge_indication(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<(), GattError> {
        let link = self.link(client, server)?;
        if link.conn.awaiting_ack.remove(&characteristic) {
            link.server.events.emit(ServerEvent::NotificationSent {
                client: link.conn.client.clone(),
                status: GattStatus::Success,
            });
        } else {
            log::debug!("{}: no indication on {} to acknowledge", client, characteristic);
        }
        Ok(())
    }

    fn request_mtu(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        mtu: usize,
    ) -> Result<usize, GattError> {
        let max_mtu = self.config.max_mtu;
        let link = self.link(client, server)?;
        let negotiated = mtu.clamp(MIN_MTU, max_mtu);
        link.conn.mtu = negotiated;
        link.server.events.emit(ServerEvent::MtuChanged {
            client: link.conn.client.clone(),
            mtu: negotiated,
        });
        link.client.events.emit(ClientEvent::MtuChanged {
            server: link.conn.server.clone(),
            mtu: negotiated,
        });
        Ok(negotiated)
    }

    fn set_phy(
        &mut self,
        client: &ClientDevice,
        server: &ServerDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        option: PhyOption,
    ) -> Result<(), GattError> {
        let link = self.link(client, server)?;
        link.conn.tx_phy = tx_phy;
        link.conn.rx_phy = rx_phy;
        log::debug!("{} <-> {}: PHY {:?}/{:?} ({:?})", client, server, tx_phy, rx_phy, option);
        link.client.events.emit(ClientEvent::PhyUpdate {
            server: link.conn.server.clone(),
            tx_phy,
            rx_phy,
            status: GattStatus::Success,
        });
        link.server.events.emit(ServerEvent::PhyUpdate {
            client: link.conn.client.clone(),
            tx_phy,
            rx_phy,
            status: GattStatus::Success,
        });
        Ok(())
    }

    fn phy(&mut self, client: &ClientDevice, server: &ServerDevice) -> Result<(Phy, Phy), GattError> {
        let link = self.link(client, server)?;
        Ok((link.conn.tx_phy, link.conn.rx_phy))
    }
}

/// Process-wide broker between simulated GATT servers and clients.
pub struct MockEngine {
    state: Mutex<EngineState>,
    adv_tx: broadcast::Sender<Advertisement>,
}

impl MockEngine {
    /// Create an engine with the default configuration.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(EngineConfig::default()))
    }

    /// Create an engine with a validated configuration.
    pub fn with_config(config: EngineConfig) -> Result<Arc<Self>, GattError> {
        config.validate()?;
        Ok(Arc::new(Self::build(config)))
    }

    fn build(config: EngineConfig) -> Self {
        let (adv_tx, _) = broadcast::channel(config.event_capacity);
        Self {
            state: Mutex::new(EngineState::new(config)),
            adv_tx,
        }
    }

    /// Subscribe to servers appearing and leaving from now on.
    pub fn advertisements(&self) -> broadcast::Receiver<Advertisement> {
        self.adv_tx.subscribe()
    }

    /// Every server currently registered.
    pub async fn scan(&self) -> Vec<Advertisement> {
        let state = self.state.lock().await;
        state.servers.values().map(ServerEntry::advertisement).collect()
    }

    pub async fn config(&self) -> EngineConfig {
        self.state.lock().await.config.clone()
    }

    /// Register a server and its attribute database. Returns its event stream.
    pub async fn register_server(
        &self,
        server: ServerDevice,
        services: Services,
    ) -> Result<EventStream<ServerEvent>, GattError> {
        let mut state = self.state.lock().await;
        let address = server.address();
        let events = state.register_server(server, services)?;
        if let Some(entry) = state.servers.get(&address) {
            self.advertise(entry.advertisement());
        }
        Ok(events)
    }

    /// Drop a server, disconnecting every client attached to it.
    pub async fn unregister_server(&self, server: &ServerDevice) -> Result<(), GattError> {
        let mut state = self.state.lock().await;
        state.unregister_server(server)?;
        self.advertise(Advertisement::Stopped {
            server: server.clone(),
        });
        Ok(())
    }

    // Callers hold the state lock, which orders advertisements.
    fn advertise(&self, advertisement: Advertisement) {
        if self.adv_tx.send(advertisement).is_err() {
            log::trace!("No scanners listening");
        }
    }

    /// Register a client. Returns its event stream.
    pub async fn register_client(&self, client: ClientDevice) -> Result<EventStream<ClientEvent>, GattError> {
        self.state.lock().await.register_client(client)
    }

    /// Drop a client, disconnecting it from every server.
    pub async fn unregister_client(&self, client: &ClientDevice) -> Result<(), GattError> {
        self.state.lock().await.unregister_client(client)
    }

    pub async fn connect(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        auto_connect: bool,
    ) -> Result<(), GattError> {
        self.state.lock().await.connect(client, server, auto_connect)
    }

    pub async fn disconnect(&self, client: &ClientDevice, server: &ServerDevice) -> Result<(), GattError> {
        self.state.lock().await.disconnect(client, server)
    }

    /// Server-initiated disconnect.
    pub async fn cancel_connection(&self, server: &ServerDevice, client: &ClientDevice) -> Result<(), GattError> {
        self.state.lock().await.disconnect(client, server)
    }

    /// Snapshot of the server's attribute database as seen by `client`.
    pub async fn discover_services(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
    ) -> Result<Services, GattError> {
        self.state.lock().await.discover_services(client, server)
    }

    pub async fn read_characteristic(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<RequestId, GattError> {
        self.state
            .lock()
            .await
            .read_characteristic(client, server, characteristic)
    }

    pub async fn write_characteristic(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<RequestId, GattError> {
        self.state
            .lock()
            .await
            .write_characteristic(client, server, characteristic, value, write_type)
    }

    pub async fn read_descriptor(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        descriptor: DescriptorId,
    ) -> Result<RequestId, GattError> {
        self.state
            .lock()
            .await
            .read_descriptor(client, server, descriptor)
    }

    pub async fn write_descriptor(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        descriptor: DescriptorId,
        value: Vec<u8>,
    ) -> Result<RequestId, GattError> {
        self.state
            .lock()
            .await
            .write_descriptor(client, server, descriptor, value)
    }

    /// Start queueing writes as prepared writes.
    pub async fn begin_reliable_write(&self, client: &ClientDevice, server: &ServerDevice) -> Result<(), GattError> {
        self.state.lock().await.begin_reliable_write(client, server)
    }

    /// Commit (`execute == true`) or abort the prepared writes.
    pub async fn execute_reliable_write(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        execute: bool,
    ) -> Result<RequestId, GattError> {
        self.state
            .lock()
            .await
            .execute_reliable_write(client, server, execute)
    }

    /// Answer a pending request. Responses to requests that are no longer
    /// pending are dropped and counted, never delivered.
    pub async fn send_response(
        &self,
        server: &ServerDevice,
        client: &ClientDevice,
        request_id: RequestId,
        status: GattStatus,
        offset: usize,
        value: Vec<u8>,
    ) {
        self.state
            .lock()
            .await
            .send_response(server, client, request_id, status, offset, value)
    }

    pub async fn notify_characteristic_changed(
        &self,
        server: &ServerDevice,
        client: &ClientDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        confirm: bool,
    ) -> Result<(), GattError> {
        self.state
            .lock()
            .await
            .notify_characteristic_changed(server, client, characteristic, value, confirm)
    }

    pub async fn acknowledge_indication(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<(), GattError> {
        self.state
            .lock()
            .await
            .acknowledge_indication(client, server, characteristic)
    }

    /// Negotiate the MTU; returns the value both sides now use.
    pub async fn request_mtu(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        mtu: usize,
    ) -> Result<usize, GattError> {
        self.state.lock().await.request_mtu(client, server, mtu)
    }

    pub async fn request_phy(
        &self,
        client: &ClientDevice,
        server: &ServerDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        option: PhyOption,
    ) -> Result<(), GattError> {
        self.state
            .lock()
            .await
            .set_phy(client, server, tx_phy, rx_phy, option)
    }

    /// Read the PHY pair; the result is also delivered to the client.
    pub async fn read_phy(&self, client: &ClientDevice, server: &ServerDevice) -> Result<(Phy, Phy), GattError> {
        let mut state = self.state.lock().await;
        let (tx_phy, rx_phy) = state.phy(client, server)?;
        if let Some(entry) = state.clients.get(&client.address()) {
            entry.events.emit(ClientEvent::PhyRead {
                server: server.clone(),
                tx_phy,
                rx_phy,
                status: GattStatus::Success,
            });
        }
        Ok((tx_phy, rx_phy))
    }

    pub async fn server_request_phy(
        &self,
        server: &ServerDevice,
        client: &ClientDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        option: PhyOption,
    ) -> Result<(), GattError> {
        self.state
            .lock()
            .await
            .set_phy(client, server, tx_phy, rx_phy, option)
    }

    /// Read the PHY pair; the result is also delivered to the server.
    pub async fn server_read_phy(&self, server: &ServerDevice, client: &ClientDevice) -> Result<(Phy, Phy), GattError> {
        let mut state = self.state.lock().await;
        let (tx_phy, rx_phy) = state.phy(client, server)?;
        if let Some(entry) = state.servers.get(&server.address()) {
            entry.events.emit(ServerEvent::PhyRead {
                client: client.clone(),
                tx_phy,
                rx_phy,
                status: GattStatus::Success,
            });
        }
        Ok((tx_phy, rx_phy))
    }

    /// The server's own attribute database.
    pub async fn services(&self, server: &ServerDevice) -> Result<Services, GattError> {
        let state = self.state.lock().await;
        state
            .servers
            .get(&server.address())
            .map(|entry| entry.services.clone())
            .ok_or(GattError::NotFound(server.address()))
    }

    /// Update a value in the server's database. Emits nothing.
    pub async fn set_characteristic_value(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let mut state = self.state.lock().await;
        let entry = state
            .servers
            .get_mut(&server.address())
            .ok_or(GattError::NotFound(server.address()))?;
        entry
            .services
            .characteristic_mut(&characteristic)
            .ok_or_else(|| GattError::AttributeNotFound(characteristic.to_string()))?
            .set_value(value);
        Ok(())
    }

    pub async fn connection_state(&self, client: &ClientDevice, server: &ServerDevice) -> ConnectionState {
        let state = self.state.lock().await;
        state
            .connections
            .get(&ConnectionKey::new(client, server))
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn connection(&self, client: &ClientDevice, server: &ServerDevice) -> Option<ConnectionInfo> {
        let state = self.state.lock().await;
        state
            .connections
            .get(&ConnectionKey::new(client, server))
            .map(Connection::info)
    }

    /// Clients currently connected to `server`.
    pub async fn connected_clients(&self, server: &ServerDevice) -> Vec<ClientDevice> {
        let state = self.state.lock().await;
        state
            .connections
            .values()
            .filter(|c| c.server == *server && c.is_connected())
            .map(|c| c.client.clone())
            .collect()
    }

    pub async fn pending_request_count(&self, client: &ClientDevice, server: &ServerDevice) -> usize {
        let state = self.state.lock().await;
        state
            .connections
            .get(&ConnectionKey::new(client, server))
            .map_or(0, |c| c.pending.len())
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let state = self.state.lock().await;
        let dropped_events = state
            .servers
            .values()
            .map(|s| s.events.dropped_events())
            .chain(state.clients.values().map(|c| c.events.dropped_events()))
            .sum();
        Diagnostics {
            stale_responses: state.stale_responses,
            dropped_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::uuid::uuid16;
    use crate::gatt::{CharacteristicConfig, Permissions, Properties, ServiceConfig, ServiceType};

    fn level() -> CharacteristicId {
        CharacteristicId::new(uuid16(0x180A), uuid16(0x2A19))
    }

    fn control() -> CharacteristicId {
        CharacteristicId::new(uuid16(0x180A), uuid16(0x2A9F))
    }

    fn services() -> Services {
        Services::from_config(&[ServiceConfig::new(
            uuid16(0x180A),
            ServiceType::Primary,
            vec![
                CharacteristicConfig::new(
                    uuid16(0x2A19),
                    Properties::READ | Properties::NOTIFY | Properties::INDICATE,
                    Permissions::READ,
                ),
                CharacteristicConfig::new(
                    uuid16(0x2A9F),
                    Properties::WRITE,
                    Permissions::READ | Permissions::WRITE,
                ),
            ],
        )])
        .unwrap()
    }

    fn connected_state() -> (EngineState, ServerDevice, ClientDevice) {
        let mut state = EngineState::new(EngineConfig::default());
        let server = ServerDevice::new("server");
        let client = ClientDevice::new("client");
        state.register_server(server.clone(), services()).unwrap();
        state.register_client(client.clone()).unwrap();
        state.connect(&client, &server, false).unwrap();
        (state, server, client)
    }

    #[test]
    fn test_request_ids_are_monotonic_across_reconnects() {
        let (mut state, server, client) = connected_state();
        assert_eq!(state.read_characteristic(&client, &server, level()).unwrap(), 1);
        assert_eq!(state.read_characteristic(&client, &server, level()).unwrap(), 2);
        state.disconnect(&client, &server).unwrap();
        state.connect(&client, &server, false).unwrap();
        assert_eq!(state.read_characteristic(&client, &server, level()).unwrap(), 3);
    }

    #[test]
    fn test_failed_command_leaves_state_untouched() {
        let (mut state, server, client) = connected_state();
        let missing = CharacteristicId::new(uuid16(0x180A), uuid16(0x2A00));
        assert!(matches!(
            state.read_characteristic(&client, &server, missing),
            Err(GattError::AttributeNotFound(_))
        ));
        assert!(matches!(
            state.write_characteristic(&client, &server, level(), vec![1], WriteType::Default),
            Err(GattError::OperationNotPermitted(_))
        ));
        let key = ConnectionKey::new(&client, &server);
        assert!(state.connections[&key].pending.is_empty());
        assert_eq!(state.request_ids.get(&key).copied().unwrap_or(0), 0);
    }

    #[test]
    fn test_teardown_discards_pending_requests() {
        let (mut state, server, client) = connected_state();
        let id = state.read_characteristic(&client, &server, level()).unwrap();
        state
            .notify_characteristic_changed(&server, &client, level(), vec![1], true)
            .unwrap();
        state.disconnect(&client, &server).unwrap();
        state.send_response(&server, &client, id, GattStatus::Success, 0, vec![]);
        assert_eq!(state.stale_responses, 1);

        state.connect(&client, &server, false).unwrap();
        // The indication outstanding on the old link does not block the new one.
        state
            .notify_characteristic_changed(&server, &client, level(), vec![1], true)
            .unwrap();
    }

    #[test]
    fn test_mtu_is_clamped() {
        let (mut state, server, client) = connected_state();
        assert_eq!(state.request_mtu(&client, &server, 1000).unwrap(), 517);
        assert_eq!(state.request_mtu(&client, &server, 5).unwrap(), 23);
        assert_eq!(state.request_mtu(&client, &server, 247).unwrap(), 247);
    }

    #[test]
    fn test_notification_bounded_by_mtu() {
        let (mut state, server, client) = connected_state();
        let err = state
            .notify_characteristic_changed(&server, &client, level(), vec![0; 21], false)
            .unwrap_err();
        assert_eq!(err, GattError::MtuExceeded { size: 21, mtu: 20 });
        state.request_mtu(&client, &server, 64).unwrap();
        state
            .notify_characteristic_changed(&server, &client, level(), vec![0; 21], false)
            .unwrap();
    }

    #[test]
    fn test_reliable_write_requires_session() {
        let (mut state, server, client) = connected_state();
        assert!(matches!(
            state.execute_reliable_write(&client, &server, true),
            Err(GattError::OperationNotPermitted(_))
        ));
        state.begin_reliable_write(&client, &server).unwrap();
        assert_eq!(state.execute_reliable_write(&client, &server, true).unwrap(), 1);
        assert!(state.execute_reliable_write(&client, &server, true).is_err());
    }

    #[test]
    fn test_prepared_writes_reported_in_connection_info() {
        let (mut state, server, client) = connected_state();
        let key = ConnectionKey::new(&client, &server);
        state.begin_reliable_write(&client, &server).unwrap();
        state
            .write_characteristic(&client, &server, control(), vec![1], WriteType::Default)
            .unwrap();
        let info = state.connections[&key].info();
        assert!(info.reliable_write);
        assert_eq!((info.pending_requests, info.prepared_writes), (1, 1));

        state.execute_reliable_write(&client, &server, true).unwrap();
        state
            .write_characteristic(&client, &server, control(), vec![2], WriteType::Default)
            .unwrap();
        let info = state.connections[&key].info();
        assert!(!info.reliable_write);
        assert_eq!((info.pending_requests, info.prepared_writes), (3, 1));
    }

    #[test]
    fn test_write_response_carries_written_value() {
        let (mut state, server, client) = connected_state();
        let mut events = state.clients[&client.address()].events.subscribe_live();
        let id = state
            .write_characteristic(&client, &server, control(), vec![0x01, 0x02], WriteType::Default)
            .unwrap();
        state.send_response(&server, &client, id, GattStatus::Success, 0, vec![0xEE]);
        assert_eq!(
            events.try_recv(),
            Some(ClientEvent::CharacteristicWrite {
                server: server.clone(),
                request_id: id,
                characteristic: control(),
                value: vec![0x01, 0x02],
                status: GattStatus::Success,
            })
        );
    }

    #[test]
    fn test_request_ids_forgotten_once_both_peers_leave() {
        let (mut state, server, client) = connected_state();
        let key = ConnectionKey::new(&client, &server);
        state.read_characteristic(&client, &server, level()).unwrap();

        state.unregister_server(&server).unwrap();
        assert_eq!(state.request_ids.get(&key), Some(&1));
        state.unregister_client(&client).unwrap();
        assert!(state.request_ids.is_empty());
    }

    #[tokio::test]
    async fn test_scan_and_advertisements() {
        let engine = MockEngine::new();
        let mut advertisements = engine.advertisements();
        let server = ServerDevice::new("server");
        engine.register_server(server.clone(), services()).await.unwrap();

        assert_eq!(
            engine.scan().await,
            vec![Advertisement::Advertising {
                server: server.clone(),
                services: vec![uuid16(0x180A)],
            }]
        );
        assert!(advertisements.recv().await.unwrap().offers(&uuid16(0x180A)));

        engine.unregister_server(&server).await.unwrap();
        assert!(engine.scan().await.is_empty());
        assert_eq!(
            advertisements.recv().await.unwrap(),
            Advertisement::Stopped { server }
        );
    }
}
