//! Chain-sync protocol
//!
//! The commands exchanged between nodes once the handshake is done, the
//! block download queue and the handler driving the sync state machine.

pub mod block_queue;
pub mod handler;
pub mod messages;
pub mod pruning;

pub use block_queue::{BlockQueue, NextSpan, Span};
pub use handler::{
    P2pEndpoint, ProtocolConfig, ProtocolError, ProtocolHandler, BLOCKS_IDS_SYNCHRONIZING_MAX_COUNT,
    CURRENCY_PROTOCOL_MAX_OBJECT_REQUEST_COUNT,
};
pub use messages::CoreSyncData;
