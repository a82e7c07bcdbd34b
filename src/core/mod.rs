//! Core collaborator boundary
//!
//! The networking layer never touches blocks or transactions directly: it
//! talks to a `Core`, the storage and validation engine of the node. This
//! module defines that contract plus the small value types that cross it.
//! `MemoryCore` is an in-memory implementation used by tests and the daemon.

pub mod memory;

use crate::crypto::Hash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryCore, TestBlock, GENESIS_DIFFICULTY};

/// Errors reported by the core collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Failed to parse block: {0}")]
    ParseBlock(String),
    #[error("Failed to parse transaction: {0}")]
    ParseTransaction(String),
    #[error("Block {0} does not extend the current top")]
    NotOnTop(Hash),
    #[error("Cannot pop the genesis block")]
    PopGenesis,
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result of handing a block or transaction to the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Added to the main chain (blocks) or the pool (transactions)
    Accepted,
    /// Stored on an alternative chain
    AltChain,
    AlreadyExists,
    Failed,
    /// Parent unknown
    Orphaned,
}

impl VerificationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, VerificationOutcome::Failed)
    }
}

/// How a transaction reached us, and therefore how it may be relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMethod {
    /// Do not relay
    None,
    /// Submitted locally
    Local,
    /// Dandelion++ stem phase: forward to a single peer
    Stem,
    /// Dandelion++ fluff phase: broadcast
    Fluff,
    /// Included in a block
    Block,
}

/// A block blob with the blobs of its transactions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockCompleteEntry {
    pub block: Vec<u8>,
    pub txs: Vec<Vec<u8>>,
}

impl BlockCompleteEntry {
    pub fn size(&self) -> usize {
        self.block.len() + self.txs.iter().map(Vec::len).sum::<usize>()
    }
}

/// What the networking layer needs to know about a block blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub id: Hash,
    pub prev_id: Hash,
    pub height: u64,
    pub major_version: u8,
    pub tx_hashes: Vec<Hash>,
}

/// Answer to a chain request: the ids following the first common block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSupplement {
    pub start_height: u64,
    pub total_height: u64,
    pub cumulative_difficulty: u128,
    pub block_ids: Vec<Hash>,
}

/// Storage and validation engine consumed by the protocol handler.
///
/// Calls are synchronous; implementations may block on disk but must not
/// call back into the networking layer.
pub trait Core: Send + Sync {
    /// Number of blocks in the main chain (top height + 1)
    fn height(&self) -> u64;

    fn top_block_hash(&self) -> Hash;

    fn top_version(&self) -> u8;

    fn cumulative_difficulty(&self) -> u128;

    /// Pruning seed of the local chain, 0 when unpruned
    fn pruning_seed(&self) -> u32 {
        0
    }

    fn get_block_hash_from_height(&self, height: u64) -> Option<Hash>;

    fn get_block_cumulative_difficulty(&self, height: u64) -> Option<u128>;

    /// True if the block is known, on the main chain or an alternative one
    fn have_block(&self, id: &Hash) -> bool;

    fn parse_block(&self, blob: &[u8]) -> Result<BlockSummary, CoreError>;

    fn tx_hash(&self, blob: &[u8]) -> Result<Hash, CoreError>;

    /// Block ids from the top going back with growing gaps, ending at genesis
    fn get_short_chain_history(&self) -> Vec<Hash>;

    /// Finds the first of `ids` on our main chain and returns up to
    /// `max_count` ids starting at it. `None` when nothing is shared.
    fn find_blockchain_supplement(&self, ids: &[Hash], max_count: usize)
        -> Option<ChainSupplement>;

    /// Returns the found blocks in request order plus the ids we do not have
    fn get_blocks_by_hashes(&self, ids: &[Hash]) -> (Vec<BlockCompleteEntry>, Vec<Hash>);

    fn get_block_by_hash(&self, id: &Hash) -> Option<BlockCompleteEntry>;

    /// Looks a transaction up in the pool, then in the chain
    fn get_transaction(&self, id: &Hash) -> Option<Vec<u8>>;

    fn get_pool_transaction_hashes(&self) -> Vec<Hash>;

    /// Pool transactions whose ids are not in `known`
    fn get_pool_complement(&self, known: &[Hash]) -> Vec<Vec<u8>>;

    fn handle_incoming_tx(&self, blob: &[u8], relay: RelayMethod) -> VerificationOutcome;

    fn handle_incoming_block(
        &self,
        block: &[u8],
        txs: &[Vec<u8>],
    ) -> Result<VerificationOutcome, CoreError>;

    /// Appends a block that extends the current top
    fn add_block(
        &self,
        block: &[u8],
        weight: u64,
        difficulty: u128,
        generated_coins: u64,
        txs: &[Vec<u8>],
    ) -> Result<(), CoreError>;

    /// Removes the top block, returning its blob and transactions
    fn pop_block(&self) -> Result<BlockCompleteEntry, CoreError>;

    /// Called before a run of `add_block`s; returns false if a batch is already open
    fn batch_start(&self, block_count: u64) -> bool;

    fn batch_stop(&self);
}
