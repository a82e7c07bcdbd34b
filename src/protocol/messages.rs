//! Chain-sync and relay commands

use crate::core::BlockCompleteEntry;
use crate::crypto::Hash;
use crate::levin::LevinCommand;
use serde::{Deserialize, Serialize};

/// Base of the chain-sync command range
pub const BC_COMMANDS_POOL_BASE: u32 = 2000;

pub const NOTIFY_NEW_BLOCK: u32 = BC_COMMANDS_POOL_BASE + 1;
pub const NOTIFY_NEW_TRANSACTIONS: u32 = BC_COMMANDS_POOL_BASE + 2;
pub const NOTIFY_REQUEST_GET_OBJECTS: u32 = BC_COMMANDS_POOL_BASE + 3;
pub const NOTIFY_RESPONSE_GET_OBJECTS: u32 = BC_COMMANDS_POOL_BASE + 4;
pub const NOTIFY_REQUEST_CHAIN: u32 = BC_COMMANDS_POOL_BASE + 6;
pub const NOTIFY_RESPONSE_CHAIN_ENTRY: u32 = BC_COMMANDS_POOL_BASE + 7;
pub const NOTIFY_NEW_FLUFFY_BLOCK: u32 = BC_COMMANDS_POOL_BASE + 8;
pub const NOTIFY_REQUEST_FLUFFY_MISSING_TX: u32 = BC_COMMANDS_POOL_BASE + 9;
pub const NOTIFY_GET_TXPOOL_COMPLEMENT: u32 = BC_COMMANDS_POOL_BASE + 10;

/// Chain state exchanged in handshakes and timed syncs
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoreSyncData {
    pub current_height: u64,
    pub cumulative_difficulty: u128,
    pub top_id: Hash,
    pub top_version: u8,
    pub pruning_seed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyNewBlock {
    pub block: BlockCompleteEntry,
    pub current_blockchain_height: u64,
}

impl LevinCommand for NotifyNewBlock {
    const ID: u32 = NOTIFY_NEW_BLOCK;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyNewTransactions {
    pub txs: Vec<Vec<u8>>,
    /// False while in the stem phase
    pub dandelionpp_fluff: bool,
}

impl LevinCommand for NotifyNewTransactions {
    const ID: u32 = NOTIFY_NEW_TRANSACTIONS;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestGetObjects {
    pub blocks: Vec<Hash>,
    pub prune: bool,
}

impl LevinCommand for RequestGetObjects {
    const ID: u32 = NOTIFY_REQUEST_GET_OBJECTS;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseGetObjects {
    pub blocks: Vec<BlockCompleteEntry>,
    pub missed_ids: Vec<Hash>,
    pub current_blockchain_height: u64,
}

impl LevinCommand for ResponseGetObjects {
    const ID: u32 = NOTIFY_RESPONSE_GET_OBJECTS;
}

/// Short chain history: dense ids near the top, then exponentially
/// spaced, always ending with genesis
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestChain {
    pub block_ids: Vec<Hash>,
    pub prune: bool,
}

impl LevinCommand for RequestChain {
    const ID: u32 = NOTIFY_REQUEST_CHAIN;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseChainEntry {
    pub start_height: u64,
    pub total_height: u64,
    pub cumulative_difficulty: u128,
    pub block_ids: Vec<Hash>,
}

impl LevinCommand for ResponseChainEntry {
    const ID: u32 = NOTIFY_RESPONSE_CHAIN_ENTRY;
}

/// Block with only the transactions the sender expects us to lack
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyNewFluffyBlock {
    pub block: BlockCompleteEntry,
    pub current_blockchain_height: u64,
}

impl LevinCommand for NotifyNewFluffyBlock {
    const ID: u32 = NOTIFY_NEW_FLUFFY_BLOCK;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestFluffyMissingTx {
    pub block_hash: Hash,
    pub current_blockchain_height: u64,
    pub missing_tx_indices: Vec<u64>,
}

impl LevinCommand for RequestFluffyMissingTx {
    const ID: u32 = NOTIFY_REQUEST_FLUFFY_MISSING_TX;
}

/// Pool hashes the sender already has
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetTxPoolComplement {
    pub hashes: Vec<Hash>,
}

impl LevinCommand for GetTxPoolComplement {
    const ID: u32 = NOTIFY_GET_TXPOOL_COMPLEMENT;
}
