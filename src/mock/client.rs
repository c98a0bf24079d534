//! Client-side facade over the mock engine
//!
//! Engine commands return as soon as the request is queued; the answer comes
//! back later on the client's event stream. The awaiting helpers here open a
//! live subscription before issuing the command and pick the response out by
//! request id, so nothing can slip past between the two.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::api::GattClientApi;
use crate::device::{ClientDevice, ServerDevice};
use crate::gatt::event::{GattStatus, RequestId};
use crate::gatt::uuid::{
    CLIENT_CHARACTERISTIC_CONFIGURATION, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE,
};
use crate::gatt::{
    Advertisement, CharacteristicId, ClientEvent, DescriptorId, GattError, Phy, PhyOption,
    Services, WriteType,
};
use crate::stream::{EventStream, EventSubscription, NotificationStream};

use super::engine::MockEngine;

fn check_status(status: GattStatus) -> Result<(), GattError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(GattError::OperationFailed(status))
    }
}

/// Wait for the response to `request_id` from `server`.
async fn await_response(
    mut events: EventSubscription<ClientEvent>,
    server: &ServerDevice,
    request_id: RequestId,
) -> Result<ClientEvent, GattError> {
    while let Some(event) = events.recv().await {
        if event.is_disconnect_from(server) {
            return Err(GattError::Disconnected);
        }
        if event.server() == server && event.request_id() == Some(request_id) {
            return Ok(event);
        }
    }
    Err(GattError::Disconnected)
}

/// A simulated GATT client registered with a [`MockEngine`].
pub struct MockClientApi {
    engine: Arc<MockEngine>,
    device: ClientDevice,
    events: EventStream<ClientEvent>,
}

impl MockClientApi {
    pub async fn register(engine: Arc<MockEngine>, device: ClientDevice) -> Result<Self, GattError> {
        let events = engine.register_client(device.clone()).await?;
        Ok(Self {
            engine,
            device,
            events,
        })
    }

    /// Queue prepared writes until [`execute_reliable_write`](Self::execute_reliable_write).
    pub async fn begin_reliable_write(&self, server: &ServerDevice) -> Result<(), GattError> {
        self.engine.begin_reliable_write(&self.device, server).await
    }

    /// Commit or abort the prepared writes and wait for the server's answer.
    pub async fn execute_reliable_write(
        &self,
        server: &ServerDevice,
        execute: bool,
    ) -> Result<(), GattError> {
        let events = self.events.subscribe_live();
        let request_id = self
            .engine
            .execute_reliable_write(&self.device, server, execute)
            .await?;
        match await_response(events, server, request_id).await? {
            ClientEvent::ReliableWriteCompleted { status, .. } => check_status(status),
            _ => Err(GattError::OperationFailed(GattStatus::Failure)),
        }
    }

    /// Confirm receipt of an indication so the server may send the next.
    pub async fn acknowledge_indication(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<(), GattError> {
        self.engine
            .acknowledge_indication(&self.device, server, characteristic)
            .await
    }

    /// Enable indications on a characteristic and listen for them.
    pub async fn enable_indications(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<NotificationStream, GattError> {
        self.subscribe_to(server, characteristic, ENABLE_INDICATION_VALUE)
            .await
    }

    /// Write the disable value to the characteristic's CCCD.
    pub async fn disable_notifications(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<(), GattError> {
        self.engine
            .write_descriptor(
                &self.device,
                server,
                characteristic.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION),
                DISABLE_NOTIFICATION_VALUE.to_vec(),
            )
            .await
            .map(|_| ())
    }

    /// Events lost by lagging subscribers of this client's stream.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped_events()
    }

    async fn subscribe_to(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
        cccd_value: [u8; 2],
    ) -> Result<NotificationStream, GattError> {
        let stream = NotificationStream::new(
            server.clone(),
            characteristic,
            self.events.subscribe_live(),
        );
        self.engine
            .write_descriptor(
                &self.device,
                server,
                characteristic.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION),
                cccd_value.to_vec(),
            )
            .await?;
        Ok(stream)
    }
}

#[async_trait]
impl GattClientApi for MockClientApi {
    fn device(&self) -> &ClientDevice {
        &self.device
    }

    fn events(&self) -> EventSubscription<ClientEvent> {
        self.events.subscribe()
    }

    async fn scan(&self) -> Vec<Advertisement> {
        self.engine.scan().await
    }

    fn advertisements(&self) -> broadcast::Receiver<Advertisement> {
        self.engine.advertisements()
    }

    async fn connect(&self, server: &ServerDevice, auto_connect: bool) -> Result<(), GattError> {
        self.engine.connect(&self.device, server, auto_connect).await
    }

    async fn disconnect(&self, server: &ServerDevice) -> Result<(), GattError> {
        self.engine.disconnect(&self.device, server).await
    }

    async fn discover_services(&self, server: &ServerDevice) -> Result<Services, GattError> {
        self.engine.discover_services(&self.device, server).await
    }

    async fn read_characteristic(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<Vec<u8>, GattError> {
        let events = self.events.subscribe_live();
        let request_id = self
            .engine
            .read_characteristic(&self.device, server, characteristic)
            .await?;
        match await_response(events, server, request_id).await? {
            ClientEvent::CharacteristicRead { value, status, .. } => {
                check_status(status).map(|()| value)
            }
            _ => Err(GattError::OperationFailed(GattStatus::Failure)),
        }
    }

    async fn write_characteristic(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<(), GattError> {
        let events = self.events.subscribe_live();
        let request_id = self
            .engine
            .write_characteristic(&self.device, server, characteristic, value, write_type)
            .await?;
        if !write_type.response_needed() {
            return Ok(());
        }
        match await_response(events, server, request_id).await? {
            ClientEvent::CharacteristicWrite { status, .. } => check_status(status),
            _ => Err(GattError::OperationFailed(GattStatus::Failure)),
        }
    }

    async fn read_descriptor(
        &self,
        server: &ServerDevice,
        descriptor: DescriptorId,
    ) -> Result<Vec<u8>, GattError> {
        let events = self.events.subscribe_live();
        let request_id = self
            .engine
            .read_descriptor(&self.device, server, descriptor)
            .await?;
        match await_response(events, server, request_id).await? {
            ClientEvent::DescriptorRead { value, status, .. } => {
                check_status(status).map(|()| value)
            }
            _ => Err(GattError::OperationFailed(GattStatus::Failure)),
        }
    }

    async fn write_descriptor(
        &self,
        server: &ServerDevice,
        descriptor: DescriptorId,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let events = self.events.subscribe_live();
        let request_id = self
            .engine
            .write_descriptor(&self.device, server, descriptor, value)
            .await?;
        match await_response(events, server, request_id).await? {
            ClientEvent::DescriptorWrite { status, .. } => check_status(status),
            _ => Err(GattError::OperationFailed(GattStatus::Failure)),
        }
    }

    async fn request_mtu(&self, server: &ServerDevice, mtu: usize) -> Result<usize, GattError> {
        self.engine.request_mtu(&self.device, server, mtu).await
    }

    async fn read_phy(&self, server: &ServerDevice) -> Result<(Phy, Phy), GattError> {
        self.engine.read_phy(&self.device, server).await
    }

    async fn request_phy(
        &self,
        server: &ServerDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        option: PhyOption,
    ) -> Result<(), GattError> {
        self.engine
            .request_phy(&self.device, server, tx_phy, rx_phy, option)
            .await
    }

    async fn enable_notifications(
        &self,
        server: &ServerDevice,
        characteristic: CharacteristicId,
    ) -> Result<NotificationStream, GattError> {
        self.subscribe_to(server, characteristic, ENABLE_NOTIFICATION_VALUE)
            .await
    }

    async fn close(&self) -> Result<(), GattError> {
        self.engine.unregister_client(&self.device).await
    }
}
