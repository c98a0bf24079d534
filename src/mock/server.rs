//! Server-side facade over the mock engine

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::GattServerApi;
use crate::device::{ClientDevice, ServerDevice};
use crate::gatt::event::{GattStatus, RequestId};
use crate::gatt::{
    CharacteristicId, GattError, Phy, PhyOption, ServerEvent, ServiceConfig, Services,
};
use crate::stream::{EventStream, EventSubscription};

use super::engine::MockEngine;

/// A simulated GATT server registered with a [`MockEngine`].
pub struct MockServerApi {
    engine: Arc<MockEngine>,
    device: ServerDevice,
    events: EventStream<ServerEvent>,
}

impl MockServerApi {
    /// Register `device` serving `services`.
    pub async fn register(
        engine: Arc<MockEngine>,
        device: ServerDevice,
        services: Services,
    ) -> Result<Self, GattError> {
        let events = engine.register_server(device.clone(), services).await?;
        Ok(Self {
            engine,
            device,
            events,
        })
    }

    /// Register `device` with services built from declarative configuration.
    pub async fn from_config(
        engine: Arc<MockEngine>,
        device: ServerDevice,
        config: &[ServiceConfig],
    ) -> Result<Self, GattError> {
        let services = Services::from_config(config)?;
        Self::register(engine, device, services).await
    }

    /// Current copy of this server's attribute database.
    pub async fn services(&self) -> Result<Services, GattError> {
        self.engine.services(&self.device).await
    }

    /// Update a stored value without notifying anyone.
    pub async fn set_characteristic_value(
        &self,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        self.engine
            .set_characteristic_value(&self.device, characteristic, value)
            .await
    }

    pub async fn connected_clients(&self) -> Vec<ClientDevice> {
        self.engine.connected_clients(&self.device).await
    }

    /// Events lost by lagging subscribers of this server's stream.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped_events()
    }
}

#[async_trait]
impl GattServerApi for MockServerApi {
    fn device(&self) -> &ServerDevice {
        &self.device
    }

    fn events(&self) -> EventSubscription<ServerEvent> {
        self.events.subscribe()
    }

    async fn send_response(
        &self,
        client: &ClientDevice,
        request_id: RequestId,
        status: GattStatus,
        offset: usize,
        value: Vec<u8>,
    ) {
        self.engine
            .send_response(&self.device, client, request_id, status, offset, value)
            .await
    }

    async fn notify_characteristic_changed(
        &self,
        client: &ClientDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        confirm: bool,
    ) -> Result<(), GattError> {
        self.engine
            .notify_characteristic_changed(&self.device, client, characteristic, value, confirm)
            .await
    }

    async fn connect(&self, client: &ClientDevice, auto_connect: bool) -> Result<(), GattError> {
        self.engine.connect(client, &self.device, auto_connect).await
    }

    async fn cancel_connection(&self, client: &ClientDevice) -> Result<(), GattError> {
        self.engine.cancel_connection(&self.device, client).await
    }

    async fn read_phy(&self, client: &ClientDevice) -> Result<(Phy, Phy), GattError> {
        self.engine.server_read_phy(&self.device, client).await
    }

    async fn request_phy(
        &self,
        client: &ClientDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        option: PhyOption,
    ) -> Result<(), GattError> {
        self.engine
            .server_request_phy(&self.device, client, tx_phy, rx_phy, option)
            .await
    }

    async fn close(&self) -> Result<(), GattError> {
        self.engine.unregister_server(&self.device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::uuid::uuid16;
    use crate::gatt::{CharacteristicConfig, Permissions, Properties, ServiceType};

    fn config() -> Vec<ServiceConfig> {
        vec![ServiceConfig::new(
            uuid16(0x1523),
            ServiceType::Primary,
            vec![CharacteristicConfig::new(
                uuid16(0x1525),
                Properties::READ | Properties::WRITE,
                Permissions::READ | Permissions::WRITE,
            )],
        )]
    }

    #[tokio::test]
    async fn test_service_added_events() {
        let engine = MockEngine::new();
        let server = MockServerApi::from_config(engine, ServerDevice::new("blinky"), &config())
            .await
            .unwrap();
        let mut events = server.events();
        assert_eq!(
            events.recv().await,
            Some(ServerEvent::ServiceAdded {
                service: uuid16(0x1523),
                status: GattStatus::Success,
            })
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let engine = MockEngine::new();
        let device = ServerDevice::new("blinky");
        let _server = MockServerApi::from_config(Arc::clone(&engine), device.clone(), &config())
            .await
            .unwrap();
        let err = MockServerApi::from_config(engine, device.clone(), &config())
            .await
            .err();
        assert_eq!(err, Some(GattError::AlreadyRegistered(device.address())));
    }

    #[tokio::test]
    async fn test_set_value_emits_nothing() {
        let engine = MockEngine::new();
        let server = MockServerApi::from_config(engine, ServerDevice::new("blinky"), &config())
            .await
            .unwrap();
        let mut events = server.events();
        events.drain();

        let led = CharacteristicId::new(uuid16(0x1523), uuid16(0x1525));
        server.set_characteristic_value(led, vec![0x01]).await.unwrap();
        let services = server.services().await.unwrap();
        assert_eq!(services.characteristic(&led).unwrap().value(), &[0x01]);
        assert!(events.try_recv().is_none());

        let missing = CharacteristicId::new(uuid16(0x1523), uuid16(0x1524));
        assert!(matches!(
            server.set_characteristic_value(missing, vec![]).await,
            Err(GattError::AttributeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_closes_stream() {
        let engine = MockEngine::new();
        let server = MockServerApi::from_config(Arc::clone(&engine), ServerDevice::new("blinky"), &config())
            .await
            .unwrap();
        let mut events = server.events();
        server.close().await.unwrap();
        assert!(matches!(events.recv().await, Some(ServerEvent::ServiceAdded { .. })));
        assert_eq!(events.recv().await, None);
        assert_eq!(
            server.close().await,
            Err(GattError::NotFound(server.device().address()))
        );
    }
}
