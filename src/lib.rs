//! levin-p2p: peer-to-peer networking and block synchronisation for a
//! CryptoNote-style node
//!
//! This crate provides:
//! - Levin framing: 40-byte headers, a streaming codec and typed payloads
//! - Connections with request/response matching, throttling and idle timeouts
//! - White, gray and anchor peer lists with host and subnet bans
//! - A node server handling handshakes, timed syncs, pings and peer gossip
//! - A chain-sync protocol handler with a span-based block download queue
//!
//! The chain itself is behind the `core::Core` trait; `core::MemoryCore`
//! is a small in-memory implementation.
//!
//! # Example
//!
//! ```rust,no_run
//! use levin_p2p::core::MemoryCore;
//! use levin_p2p::p2p::{NodeConfig, NodeServer};
//! use levin_p2p::protocol::{ProtocolConfig, ProtocolHandler};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let core = Arc::new(MemoryCore::new());
//! let handler = Arc::new(ProtocolHandler::new(core, ProtocolConfig::default()));
//! let node = NodeServer::new(NodeConfig::default(), handler)?;
//! node.init().await?;
//! node.run();
//!
//! tokio::signal::ctrl_c().await?;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod crypto;
pub mod levin;
pub mod net;
pub mod p2p;
pub mod protocol;

// Re-export commonly used types
pub use crate::core::{Core, MemoryCore};
pub use crypto::Hash;
pub use levin::{Frame, Header, LevinCodec, LevinCommand};
pub use net::{Connection, NetworkAddress, Zone};
pub use p2p::{NodeConfig, NodeError, NodeServer, NodeStatus, PeerListManager};
pub use protocol::{BlockQueue, ProtocolConfig, ProtocolHandler};
