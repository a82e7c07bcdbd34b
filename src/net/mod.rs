//! Transport layer
//!
//! Provides everything below the peer-to-peer logic:
//! - Network addresses, zones and IPv4 subnets
//! - Levin connections with request/response matching
//! - Per-connection context
//! - Bandwidth throttling, SOCKS5 proxying and IGD port mapping

pub mod address;
pub mod connection;
pub mod context;
pub mod igd;
pub mod socks;
pub mod throttle;

pub use address::{AddressError, Ipv4Subnet, NetworkAddress, Zone};
pub use connection::{
    CommandHandler, Connection, ConnectionConfig, HandlerError, InvokeError, SendError,
    TrafficStats, P2P_IDLE_CONNECTION_KILL_INTERVAL, WRITE_QUEUE_CAPACITY,
};
pub use context::{ConnectionContext, ConnectionState};
pub use igd::{IgdError, MappingStatus, PortMapper};
pub use socks::SocksError;
pub use throttle::Throttle;
