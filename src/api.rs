//! Role contracts for GATT servers and clients
//!
//! Application code drives a peer through these traits and consumes its
//! event stream. The mock engine provides one implementation of each; a
//! platform-backed implementation would provide another.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::device::{ClientDevice, ServerDevice};
use crate::gatt::event::{GattStatus, RequestId};
use crate::gatt::{
    Advertisement, CharacteristicId, ClientEvent, DescriptorId, GattError, Phy, PhyOption,
    ServerEvent, Services, WriteType,
};
use crate::stream::{EventSubscription, NotificationStream};

/// GATT server role: answering requests and pushing values to clients.
#[async_trait]
pub trait GattServerApi: Send + Sync {
    /// This server's identity.
    fn device(&self) -> &ServerDevice;

    /// Subscribe to the server's events (recent events are replayed).
    fn events(&self) -> EventSubscription<ServerEvent>;

    /// Answer a pending request. A response to a request that is no longer
    /// pending is dropped.
    ///
    /// `value` is delivered for reads. Write responses report the value the
    /// client wrote, so `value` is ignored for them.
    async fn send_response(
        &self,
        client: &ClientDevice,
        request_id: RequestId,
        status: GattStatus,
        offset: usize,
        value: Vec<u8>,
    );

    /// Notify (`confirm == false`) or indicate a value to one client.
    async fn notify_characteristic_changed(
        &self,
        client: &ClientDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        confirm: bool,
    ) -> Result<(), GattError>;

    /// Connect to a client from the server side.
    async fn connect(&self, client: &ClientDevice, auto_connect: bool) -> Result<(), GattError>;

    /// Drop the connection to a client.
    async fn cancel_connection(&self, client: &ClientDevice) -> Result<(), GattError>;

    async fn read_phy(&self, client: &ClientDevice) -> Result<(Phy, Phy), GattError>;

    async fn request_phy(
        &self,
        client: &ClientDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        option: PhyOption,
    ) -> Result<(), GattError>;

    /// Stop serving; every connected client is disconnected.
    async fn close(&self) -> Result<(), GattError>;
}

/// GATT client role: connecting to servers and accessing their attributes.
#[async_trait]
pub trait GattClientApi: Send + Sync {
    /// This client's identity.
    fn device(&self) -> &ClientDevice;

    /// Subscribe to the client's events (recent events are replayed).
    fn events(&self) -> EventSubscription<ClientEvent>;

    /// Servers currently advertising.
    async fn scan(&self) -> Vec<Advertisement>;

    /// Subscribe to servers appearing and leaving from now on.
    fn advertisements(&self) -> broadcast::Receiver<Advertisement>;

    async fn connect(&self, server: &ServerDevice, auto_connect: bool) -> Result<(), GattError>;

    async fn disconnect(&self, server: &ServerDevice) -> Result<(), GattError>;

    /// Fetch a copy of the server's attribute database.
    async fn discover_services(&self, server: &ServerDevice) -> Result<Services, GattError>;

    /// Read a characteristic and wait for the server's answer.
    async fn read_characteristic(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, GattError>;

    /// Write a characteristic. Waits for the server's answer unless the
    /// write type needs none.
    async fn write_characteristic(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<(), GattError>;

    async fn read_descriptor(
        &self,
        server: &ServerDevice,
        descriptor: DescriptorId,
    ) -> Result<Vec<u8>, GattError>;

    async fn write_descriptor(
        &self,
        server: &ServerDevice,
        descriptor: DescriptorId,
        value: Vec<u8>,
    ) -> Result<(), GattError>;

    /// Request an MTU; returns the negotiated value.
    async fn request_mtu(&self, server: &ServerDevice, mtu: usize) -> Result<usize, GattError>;

    async fn read_phy(&self, server: &ServerDevice) -> Result<(Phy, Phy), GattError>;

    async fn request_phy(
        &self,
        server: &ServerDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        option: PhyOption,
    ) -> Result<(), GattError>;

    /// Enable notifications on a characteristic and listen for them.
    async fn enable_notifications(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<NotificationStream, GattError>;

    /// Leave the engine; every connection is dropped.
    async fn close(&self) -> Result<(), GattError>;
}
