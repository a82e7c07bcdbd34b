//! Peer-to-peer layer
//!
//! Peer lists, bans and their persistence, the peer-level commands and the
//! node server that listens, dials and keeps the connections alive.

pub mod bans;
pub mod config;
pub mod messages;
pub mod node;
pub mod peerlist;
pub mod storage;

pub use bans::{BanList, BanRecord, BanState, FailOutcome};
pub use config::{NodeConfig, ZoneConfig, MAINNET_NETWORK_ID, P2P_DEFAULT_PORT};
pub use node::{ConnectionInfo, NodeError, NodeServer, NodeStatus, ZoneStatus};
pub use peerlist::{AnchorPeerlistEntry, PeerListEntry, PeerListManager, PeerListState, Pool};
pub use storage::{BanEntry, NetState, PeerStore, StorageError, ZoneState};
