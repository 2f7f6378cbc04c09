// valkyrie-api: Async Rust client for the Xena-style chassis CLI line
// protocol (ASCII over TCP, default port 22611).

pub mod address;
pub mod connection;
pub mod error;
pub mod transport;

pub use address::ResourceAddress;
pub use connection::{ChassisConnection, ConnectionStats, SharedConnection};
pub use error::Error;
pub use transport::{TcpTransport, TransportConfig, DEFAULT_PORT, READ_ATTEMPTS};
