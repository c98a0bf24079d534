// gatt-mock - In-process simulation of Bluetooth LE GATT servers and clients

pub mod api;
pub mod config;
pub mod device;
pub mod gatt;
pub mod mock;
pub mod stream;

pub use crate::api::{GattClientApi, GattServerApi};
pub use crate::config::EngineConfig;
pub use crate::device::{BleAddress, ClientDevice, ServerDevice};
pub use crate::gatt::event::{GattStatus, RequestId};
pub use crate::gatt::{Advertisement, GattError};
pub use crate::mock::{ConnectionInfo, Diagnostics, MockClientApi, MockEngine, MockServerApi};
pub use crate::stream::{EventStream, EventSubscription, Notification, NotificationStream};
