//! Events exchanged between simulated GATT peers
//!
//! `ServerEvent` is what a server application observes, `ClientEvent` what a
//! client application observes. Both are immutable values.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{ClientDevice, ServerDevice};

use super::attribute::{CharacteristicId, DescriptorId};

/// Identifier correlating a request with its response on one connection.
pub type RequestId = u32;

/// Outcome of a GATT operation, as reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InvalidAttributeLength,
    InsufficientEncryption,
    ConnectionCongested,
    Failure,
}

impl GattStatus {
    /// The ATT/host status code.
    pub fn code(self) -> u16 {
        match self {
            GattStatus::Success => 0x00,
            GattStatus::ReadNotPermitted => 0x02,
            GattStatus::WriteNotPermitted => 0x03,
            GattStatus::InsufficientAuthentication => 0x05,
            GattStatus::RequestNotSupported => 0x06,
            GattStatus::InvalidOffset => 0x07,
            GattStatus::InvalidAttributeLength => 0x0D,
            GattStatus::InsufficientEncryption => 0x0F,
            GattStatus::ConnectionCongested => 0x8F,
            GattStatus::Failure => 0x101,
        }
    }

    /// Map a status code back; unknown codes collapse to `Failure`.
    pub fn from_code(code: u16) -> Self {
        match code {
            0x00 => GattStatus::Success,
            0x02 => GattStatus::ReadNotPermitted,
            0x03 => GattStatus::WriteNotPermitted,
            0x05 => GattStatus::InsufficientAuthentication,
            0x06 => GattStatus::RequestNotSupported,
            0x07 => GattStatus::InvalidOffset,
            0x0D => GattStatus::InvalidAttributeLength,
            0x0F => GattStatus::InsufficientEncryption,
            0x8F => GattStatus::ConnectionCongested,
            _ => GattStatus::Failure,
        }
    }

    pub fn is_success(self) -> bool {
        self == GattStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Physical-layer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phy {
    #[default]
    Le1M,
    Le2M,
    LeCoded,
}

/// Preferred coding on the LE Coded PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PhyOption {
    #[default]
    NoPreferred,
    S2,
    S8,
}

/// How a characteristic write is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WriteType {
    /// Write request; the server must respond.
    #[default]
    Default,
    /// Write command; no response.
    NoResponse,
    /// Authenticated write command; no response.
    Signed,
}

impl WriteType {
    pub fn response_needed(self) -> bool {
        matches!(self, WriteType::Default)
    }
}

/// Events delivered to a server application.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ConnectionStateChanged {
        client: ClientDevice,
        status: GattStatus,
        state: ConnectionState,
    },
    CharacteristicReadRequest {
        client: ClientDevice,
        request_id: RequestId,
        offset: usize,
        characteristic: CharacteristicId,
    },
    CharacteristicWriteRequest {
        client: ClientDevice,
        request_id: RequestId,
        characteristic: CharacteristicId,
        prepared_write: bool,
        response_needed: bool,
        offset: usize,
        value: Vec<u8>,
    },
    DescriptorReadRequest {
        client: ClientDevice,
        request_id: RequestId,
        offset: usize,
        descriptor: DescriptorId,
    },
    DescriptorWriteRequest {
        client: ClientDevice,
        request_id: RequestId,
        descriptor: DescriptorId,
        prepared_write: bool,
        response_needed: bool,
        offset: usize,
        value: Vec<u8>,
    },
    ExecuteWrite {
        client: ClientDevice,
        request_id: RequestId,
        execute: bool,
    },
    NotificationSent {
        client: ClientDevice,
        status: GattStatus,
    },
    MtuChanged {
        client: ClientDevice,
        mtu: usize,
    },
    PhyRead {
        client: ClientDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        status: GattStatus,
    },
    PhyUpdate {
        client: ClientDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        status: GattStatus,
    },
    ServiceAdded {
        service: Uuid,
        status: GattStatus,
    },
}

impl ServerEvent {
    /// The client this event concerns; `None` for server-local events.
    pub fn client(&self) -> Option<&ClientDevice> {
        match self {
            ServerEvent::ConnectionStateChanged { client, .. }
            | ServerEvent::CharacteristicReadRequest { client, .. }
            | ServerEvent::CharacteristicWriteRequest { client, .. }
            | ServerEvent::DescriptorReadRequest { client, .. }
            | ServerEvent::DescriptorWriteRequest { client, .. }
            | ServerEvent::ExecuteWrite { client, .. }
            | ServerEvent::NotificationSent { client, .. }
            | ServerEvent::MtuChanged { client, .. }
            | ServerEvent::PhyRead { client, .. }
            | ServerEvent::PhyUpdate { client, .. } => Some(client),
            ServerEvent::ServiceAdded { .. } => None,
        }
    }

    /// The request id, for events that expect a response.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerEvent::CharacteristicReadRequest { request_id, .. }
            | ServerEvent::CharacteristicWriteRequest { request_id, .. }
            | ServerEvent::DescriptorReadRequest { request_id, .. }
            | ServerEvent::DescriptorWriteRequest { request_id, .. }
            | ServerEvent::ExecuteWrite { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

/// Events delivered to a client application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionStateChanged {
        server: ServerDevice,
        status: GattStatus,
        state: ConnectionState,
    },
    ServicesDiscovered {
        server: ServerDevice,
        status: GattStatus,
    },
    CharacteristicRead {
        server: ServerDevice,
        request_id: RequestId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Response to a write; `value` is the payload the client wrote, not
    /// the value the server responded with.
    CharacteristicWrite {
        server: ServerDevice,
        request_id: RequestId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorRead {
        server: ServerDevice,
        request_id: RequestId,
        descriptor: DescriptorId,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWrite {
        server: ServerDevice,
        request_id: RequestId,
        descriptor: DescriptorId,
        value: Vec<u8>,
        status: GattStatus,
    },
    ReliableWriteCompleted {
        server: ServerDevice,
        request_id: RequestId,
        status: GattStatus,
    },
    /// A notification (`confirm == false`) or indication.
    CharacteristicChanged {
        server: ServerDevice,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        confirm: bool,
    },
    MtuChanged {
        server: ServerDevice,
        mtu: usize,
    },
    PhyRead {
        server: ServerDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        status: GattStatus,
    },
    PhyUpdate {
        server: ServerDevice,
        tx_phy: Phy,
        rx_phy: Phy,
        status: GattStatus,
    },
}

impl ClientEvent {
    pub fn server(&self) -> &ServerDevice {
        match self {
            ClientEvent::ConnectionStateChanged { server, .. }
            | ClientEvent::ServicesDiscovered { server, .. }
            | ClientEvent::CharacteristicRead { server, .. }
            | ClientEvent::CharacteristicWrite { server, .. }
            | ClientEvent::DescriptorRead { server, .. }
            | ClientEvent::DescriptorWrite { server, .. }
            | ClientEvent::ReliableWriteCompleted { server, .. }
            | ClientEvent::CharacteristicChanged { server, .. }
            | ClientEvent::MtuChanged { server, .. }
            | ClientEvent::PhyRead { server, .. }
            | ClientEvent::PhyUpdate { server, .. } => server,
        }
    }

    /// The request id of a response event.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientEvent::CharacteristicRead { request_id, .. }
            | ClientEvent::CharacteristicWrite { request_id, .. }
            | ClientEvent::DescriptorRead { request_id, .. }
            | ClientEvent::DescriptorWrite { request_id, .. }
            | ClientEvent::ReliableWriteCompleted { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Whether this event reports `server` dropping the connection.
    pub fn is_disconnect_from(&self, server: &ServerDevice) -> bool {
        matches!(
            self,
            ClientEvent::ConnectionStateChanged {
                server: s,
                state: ConnectionState::Disconnected,
                ..
            } if s == server
        )
    }
}

/// A server appearing on or leaving the simulated air.
#[derive(Debug, Clone, PartialEq)]
pub enum Advertisement {
    /// The server is registered and accepts connections.
    Advertising {
        server: ServerDevice,
        services: Vec<Uuid>,
    },
    /// The server unregistered.
    Stopped { server: ServerDevice },
}

impl Advertisement {
    pub fn server(&self) -> &ServerDevice {
        match self {
            Advertisement::Advertising { server, .. } | Advertisement::Stopped { server } => server,
        }
    }

    /// Whether an advertising server offers `service`.
    pub fn offers(&self, service: &Uuid) -> bool {
        match self {
            Advertisement::Advertising { services, .. } => services.contains(service),
            Advertisement::Stopped { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            GattStatus::Success,
            GattStatus::ReadNotPermitted,
            GattStatus::InvalidOffset,
            GattStatus::Failure,
        ] {
            assert_eq!(GattStatus::from_code(status.code()), status);
        }
        assert_eq!(GattStatus::from_code(0x7F), GattStatus::Failure);
    }

    #[test]
    fn test_write_type_response() {
        assert!(WriteType::Default.response_needed());
        assert!(!WriteType::NoResponse.response_needed());
        assert!(!WriteType::Signed.response_needed());
    }

    #[test]
    fn test_client_event_accessors() {
        let server = ServerDevice::new("blinky");
        let other = ServerDevice::new("other");
        let event = ClientEvent::ConnectionStateChanged {
            server: server.clone(),
            status: GattStatus::Success,
            state: ConnectionState::Disconnected,
        };
        assert!(event.is_disconnect_from(&server));
        assert!(!event.is_disconnect_from(&other));
        assert_eq!(event.request_id(), None);
        assert_eq!(event.server(), &server);
    }

    #[test]
    fn test_advertisement_offers() {
        let server = ServerDevice::new("blinky");
        let battery = crate::gatt::uuid::uuid16(0x180F);
        let advertising = Advertisement::Advertising {
            server: server.clone(),
            services: vec![battery],
        };
        assert!(advertising.offers(&battery));
        assert!(!advertising.offers(&crate::gatt::uuid::uuid16(0x180A)));

        let stopped = Advertisement::Stopped {
            server: server.clone(),
        };
        assert!(!stopped.offers(&battery));
        assert_eq!(stopped.server(), &server);
    }
}
