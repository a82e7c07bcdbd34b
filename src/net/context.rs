//! Per-connection state
//!
//! A `ConnectionContext` belongs to exactly one connection. It is mutated
//! only from that connection's handler or through `for_connection`, always
//! for the length of an in-memory update.

use super::address::NetworkAddress;
use crate::crypto::Hash;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Where a connection is in the handshake and sync state machine.
///
/// Variants are ordered; everything from `Synchronizing` on has completed
/// the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ConnectionState {
    /// Socket open, no handshake yet
    HandshakePending,
    /// Downloading blocks from this peer
    Synchronizing,
    /// Waiting for the block queue to drain
    Standby,
    Normal,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::HandshakePending => "before_handshake",
            ConnectionState::Synchronizing => "synchronizing",
            ConnectionState::Standby => "standby",
            ConnectionState::Normal => "normal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: Uuid,
    pub remote_address: NetworkAddress,
    pub is_incoming: bool,
    /// Set once the handshake succeeds
    pub peer_id: Option<u64>,
    pub support_flags: u32,
    /// Port the peer says it listens on, 0 when hidden
    pub remote_port: u32,
    pub state: ConnectionState,
    pub remote_blockchain_height: u64,
    pub remote_top_version: u8,
    /// Height of the last id the peer sent in a chain entry
    pub last_response_height: u64,
    /// First height of the blocks we wait for
    pub expected_height: Option<u64>,
    /// Command id of the response we wait for, 0 when none
    pub expect_response: u32,
    pub last_request_time: Option<Instant>,
    /// Ids from the last chain entry not yet requested
    pub needed_objects: Vec<Hash>,
    pub requested_objects: HashSet<Hash>,
    pub num_requested: u64,
    pub last_known_hash: Hash,
    pub score: i64,
    pub pruning_seed: u32,
    pub anchor: bool,
    pub idle_peer_notification: bool,
    /// Gossiped addresses already sent on this connection
    pub sent_addresses: HashSet<NetworkAddress>,
    pub started: Instant,
}

impl ConnectionContext {
    pub fn new(connection_id: Uuid, remote_address: NetworkAddress, is_incoming: bool) -> Self {
        Self {
            connection_id,
            remote_address,
            is_incoming,
            peer_id: None,
            support_flags: 0,
            remote_port: 0,
            state: ConnectionState::HandshakePending,
            remote_blockchain_height: 0,
            remote_top_version: 0,
            last_response_height: 0,
            expected_height: None,
            expect_response: 0,
            last_request_time: None,
            needed_objects: Vec::new(),
            requested_objects: HashSet::new(),
            num_requested: 0,
            last_known_hash: Hash::NULL,
            score: 0,
            pruning_seed: 0,
            anchor: false,
            idle_peer_notification: false,
            sent_addresses: HashSet::new(),
            started: Instant::now(),
        }
    }

    pub fn is_handshaked(&self) -> bool {
        self.peer_id.is_some()
    }

    /// Stripe the peer keeps, 0 when it is not pruned
    pub fn pruning_stripe(&self) -> u32 {
        crate::protocol::pruning::get_pruning_stripe(self.pruning_seed)
    }

    /// Forgets everything about an outstanding block request
    pub fn clear_requests(&mut self) {
        self.expect_response = 0;
        self.expected_height = None;
        self.requested_objects.clear();
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {}]",
            self.remote_address,
            if self.is_incoming { "INC" } else { "OUT" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context() {
        let addr: NetworkAddress = "1.2.3.4:18080".parse().unwrap();
        let mut ctx = ConnectionContext::new(Uuid::new_v4(), addr, true);
        assert_eq!(ctx.state, ConnectionState::HandshakePending);
        assert!(!ctx.is_handshaked());
        assert_eq!(ctx.to_string(), "[1.2.3.4:18080 INC]");

        ctx.expect_response = 2004;
        ctx.expected_height = Some(5);
        ctx.requested_objects.insert(Hash::digest(b"x"));
        ctx.clear_requests();
        assert_eq!(ctx.expect_response, 0);
        assert!(ctx.expected_height.is_none());
        assert!(ctx.requested_objects.is_empty());
    }

    #[test]
    fn test_state_order() {
        let states = [
            ConnectionState::HandshakePending,
            ConnectionState::Synchronizing,
            ConnectionState::Standby,
            ConnectionState::Normal,
        ];
        assert!(states.windows(2).all(|w| w[0] < w[1]));
        let names: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        assert_eq!(names, ["before_handshake", "synchronizing", "standby", "normal"]);
    }
}
