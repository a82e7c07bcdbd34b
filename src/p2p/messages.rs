//! Peer-discovery and liveness commands

use super::peerlist::PeerListEntry;
use crate::levin::LevinCommand;
use crate::protocol::messages::CoreSyncData;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Base of the p2p command range
pub const P2P_COMMANDS_POOL_BASE: u32 = 1000;

pub const COMMAND_HANDSHAKE: u32 = P2P_COMMANDS_POOL_BASE + 1;
pub const COMMAND_TIMED_SYNC: u32 = P2P_COMMANDS_POOL_BASE + 2;
pub const COMMAND_PING: u32 = P2P_COMMANDS_POOL_BASE + 3;
pub const COMMAND_REQUEST_SUPPORT_FLAGS: u32 = P2P_COMMANDS_POOL_BASE + 7;

/// Answer to a successful ping
pub const PING_OK_RESPONSE_STATUS_TEXT: &str = "OK";

/// Peer understands fluffy blocks
pub const P2P_SUPPORT_FLAG_FLUFFY_BLOCKS: u32 = 0x01;
pub const P2P_SUPPORT_FLAGS: u32 = P2P_SUPPORT_FLAG_FLUFFY_BLOCKS;

/// Identity of the sending node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicNodeData {
    pub network_id: Uuid,
    /// Listening port, 0 when hidden
    pub my_port: u32,
    pub peer_id: u64,
    pub support_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub node_data: BasicNodeData,
    pub payload_data: CoreSyncData,
    /// Gossip from the initiator, at most `P2P_DEFAULT_PEERS_IN_HANDSHAKE`
    pub local_peerlist_new: Vec<PeerListEntry>,
}

impl LevinCommand for HandshakeRequest {
    const ID: u32 = COMMAND_HANDSHAKE;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub node_data: BasicNodeData,
    pub payload_data: CoreSyncData,
    pub local_peerlist_new: Vec<PeerListEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedSyncRequest {
    pub payload_data: CoreSyncData,
}

impl LevinCommand for TimedSyncRequest {
    const ID: u32 = COMMAND_TIMED_SYNC;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedSyncResponse {
    pub payload_data: CoreSyncData,
    pub local_peerlist_new: Vec<PeerListEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingRequest;

impl LevinCommand for PingRequest {
    const ID: u32 = COMMAND_PING;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    pub peer_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SupportFlagsRequest;

impl LevinCommand for SupportFlagsRequest {
    const ID: u32 = COMMAND_REQUEST_SUPPORT_FLAGS;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportFlagsResponse {
    pub support_flags: u32,
}
