//! Device link host: tokio stream connections, the dispatcher boundary,
//! configuration and logging around `devlink-core`.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod telemetry;
pub mod transport;

pub use connection::{
    spawn_connection, ConnectionHandle, ConnectionId, ConnectionSettings, ConnectionState, Link,
    Senders, SharedDiscovery, TransportError,
};
pub use dispatch::{DeviceHandle, DeviceHost, Dispatcher, LoggingDeviceHost};
