//! In-process simulation of GATT servers and clients

pub mod client;
pub mod connection;
pub mod engine;
pub mod server;

pub use self::client::MockClientApi;
pub use self::connection::ConnectionInfo;
pub use self::engine::{Diagnostics, MockEngine};
pub use self::server::MockServerApi;
