//! GATT data model: attributes, events and the error type shared by the
//! engine and its facades.

pub mod attribute;
pub mod event;
pub mod uuid;

use thiserror::Error;

use crate::device::{BleAddress, ClientDevice, ServerDevice};
use self::event::GattStatus;

pub use self::attribute::{
    Characteristic, CharacteristicConfig, CharacteristicId, Descriptor, DescriptorConfig,
    DescriptorId, Permissions, Properties, Service, ServiceConfig, ServiceType, Services,
};
pub use self::event::{
    Advertisement, ClientEvent, ConnectionState, Phy, PhyOption, ServerEvent, WriteType,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Already registered: {0}")]
    AlreadyRegistered(BleAddress),

    #[error("Not found: {0}")]
    NotFound(BleAddress),

    #[error("No connection between client {client} and server {server}")]
    NotConnected {
        client: BleAddress,
        server: BleAddress,
    },

    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Operation not permitted: {0}")]
    OperationNotPermitted(String),

    #[error("Indication on {0} still awaiting acknowledgement")]
    Busy(String),

    #[error("Request {0} is no longer pending")]
    StaleRequest(u32),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Remote replied with status {0:?}")]
    OperationFailed(GattStatus),

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Invalid attribute configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GattError {
    pub(crate) fn not_connected(client: &ClientDevice, server: &ServerDevice) -> Self {
        GattError::NotConnected {
            client: client.address(),
            server: server.address(),
        }
    }
}
