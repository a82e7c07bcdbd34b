//! In-memory core
//!
//! A small but complete `Core`: a main chain indexed by height, alternative
//! branches with reorganisation by cumulative difficulty, and a transaction
//! pool. Blocks are bincode-encoded `TestBlock` headers whose id is the
//! SHA-256 of the blob. There is no proof of work; the `difficulty` field is
//! taken at face value.

use super::{
    BlockCompleteEntry, BlockSummary, ChainSupplement, Core, CoreError, RelayMethod,
    VerificationOutcome,
};
use crate::crypto::Hash;
use bincode::Options;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// =============================================================================
// Constants
// =============================================================================

/// Difficulty of the genesis block
pub const GENESIS_DIFFICULTY: u64 = 1;

/// Upper bound for a block blob
pub const MAX_BLOCK_BLOB_SIZE: u64 = 1024 * 1024;

/// Upper bound for a transaction blob
pub const MAX_TX_BLOB_SIZE: usize = 1024 * 1024;

/// Transactions whose first byte is this never verify
pub const INVALID_TX_MARKER: u8 = 0xff;

/// Recent blocks listed one by one in a short chain history
const SHORT_HISTORY_DENSE_COUNT: usize = 10;

fn block_codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_BLOCK_BLOB_SIZE)
}

// =============================================================================
// Block Format
// =============================================================================

/// Block header as stored in a block blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBlock {
    pub major_version: u8,
    pub prev_id: Hash,
    pub height: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub difficulty: u64,
    pub tx_hashes: Vec<Hash>,
}

impl TestBlock {
    /// The genesis block shared by every node
    pub fn genesis() -> Self {
        Self {
            major_version: 1,
            prev_id: Hash::NULL,
            height: 0,
            timestamp: 0,
            nonce: 0,
            difficulty: GENESIS_DIFFICULTY,
            tx_hashes: Vec::new(),
        }
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, CoreError> {
        block_codec()
            .serialize(self)
            .map_err(|e| CoreError::ParseBlock(e.to_string()))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, CoreError> {
        block_codec()
            .deserialize(blob)
            .map_err(|e| CoreError::ParseBlock(e.to_string()))
    }

    /// Builds the block entry for this header and its transactions
    pub fn into_entry(mut self, txs: Vec<Vec<u8>>) -> Result<BlockCompleteEntry, CoreError> {
        self.tx_hashes = txs.iter().map(|tx| Hash::digest(tx)).collect();
        Ok(BlockCompleteEntry {
            block: self.to_blob()?,
            txs,
        })
    }
}

// =============================================================================
// Chain State
// =============================================================================

#[derive(Debug, Clone)]
struct StoredBlock {
    id: Hash,
    header: TestBlock,
    entry: BlockCompleteEntry,
    cumulative_difficulty: u128,
}

#[derive(Debug, Default)]
struct ChainState {
    main: Vec<StoredBlock>,
    main_index: HashMap<Hash, u64>,
    alt: HashMap<Hash, StoredBlock>,
    chain_txs: HashMap<Hash, Vec<u8>>,
    pool: HashMap<Hash, Vec<u8>>,
    batch_open: bool,
    batches: u64,
}

impl ChainState {
    fn top(&self) -> Option<&StoredBlock> {
        self.main.last()
    }

    fn top_id(&self) -> Hash {
        self.top().map(|b| b.id).unwrap_or(Hash::NULL)
    }

    fn top_cumulative_difficulty(&self) -> u128 {
        self.top().map(|b| b.cumulative_difficulty).unwrap_or(0)
    }

    fn push_main(&mut self, block: StoredBlock) {
        for (hash, tx) in block.header.tx_hashes.iter().zip(block.entry.txs.iter()) {
            self.pool.remove(hash);
            self.chain_txs.insert(*hash, tx.clone());
        }
        self.main_index.insert(block.id, block.header.height);
        self.main.push(block);
    }

    fn pop_main(&mut self) -> Option<StoredBlock> {
        if self.main.len() <= 1 {
            return None;
        }
        let block = self.main.pop()?;
        self.main_index.remove(&block.id);
        for (hash, tx) in block.header.tx_hashes.iter().zip(block.entry.txs.iter()) {
            self.chain_txs.remove(hash);
            self.pool.insert(*hash, tx.clone());
        }
        Some(block)
    }

    /// (cumulative difficulty, height) of a known block
    fn lookup(&self, id: &Hash) -> Option<(u128, u64)> {
        if let Some(&height) = self.main_index.get(id) {
            let block = &self.main[height as usize];
            return Some((block.cumulative_difficulty, height));
        }
        self.alt
            .get(id)
            .map(|b| (b.cumulative_difficulty, b.header.height))
    }

    /// Switches the main chain to the branch ending at `tip`
    fn reorganize(&mut self, tip: Hash) -> Result<(), CoreError> {
        let mut branch = Vec::new();
        let mut cursor = tip;
        while let Some(block) = self.alt.get(&cursor) {
            branch.push(cursor);
            cursor = block.header.prev_id;
        }
        let fork_height = *self
            .main_index
            .get(&cursor)
            .ok_or_else(|| CoreError::Storage(format!("branch of {} has no fork point", tip)))?;

        let mut disconnected = 0;
        while self.main.len() as u64 > fork_height + 1 {
            if let Some(block) = self.pop_main() {
                self.alt.insert(block.id, block);
                disconnected += 1;
            }
        }
        for id in branch.iter().rev() {
            if let Some(block) = self.alt.remove(id) {
                self.push_main(block);
            }
        }
        log::info!(
            "Reorganized at height {}: {} blocks disconnected, {} connected, new top {}",
            fork_height,
            disconnected,
            branch.len(),
            tip
        );
        Ok(())
    }
}

// =============================================================================
// Memory Core
// =============================================================================

/// In-memory chain and pool implementing `Core`
pub struct MemoryCore {
    state: RwLock<ChainState>,
}

impl MemoryCore {
    /// Create a core holding only the genesis block
    pub fn new() -> Self {
        let mut state = ChainState::default();
        let header = TestBlock::genesis();
        let blob = header.to_blob().unwrap_or_default();
        state.push_main(StoredBlock {
            id: Hash::digest(&blob),
            header,
            entry: BlockCompleteEntry {
                block: blob,
                txs: Vec::new(),
            },
            cumulative_difficulty: GENESIS_DIFFICULTY as u128,
        });
        Self {
            state: RwLock::new(state),
        }
    }

    /// Id of the genesis block
    pub fn genesis_hash() -> Hash {
        TestBlock::genesis()
            .to_blob()
            .map(|blob| Hash::digest(&blob))
            .unwrap_or(Hash::NULL)
    }

    /// Builds (without adding) a block on top of the current main chain
    pub fn build_block(
        &self,
        difficulty: u64,
        nonce: u64,
        txs: Vec<Vec<u8>>,
    ) -> Result<BlockCompleteEntry, CoreError> {
        let (prev_id, height) = {
            let state = self.state.read();
            (state.top_id(), state.main.len() as u64)
        };
        Self::build_block_on(prev_id, height, difficulty, nonce, txs)
    }

    /// Builds a block at `height` on top of `prev_id`
    pub fn build_block_on(
        prev_id: Hash,
        height: u64,
        difficulty: u64,
        nonce: u64,
        txs: Vec<Vec<u8>>,
    ) -> Result<BlockCompleteEntry, CoreError> {
        TestBlock {
            major_version: 1,
            prev_id,
            height,
            timestamp: chrono::Utc::now().timestamp(),
            nonce,
            difficulty,
            tx_hashes: Vec::new(),
        }
        .into_entry(txs)
    }

    /// Mines `count` blocks on top, the first one taking the whole pool
    pub fn mine_blocks(&self, count: u64, difficulty: u64) -> Result<Vec<Hash>, CoreError> {
        let mut ids = Vec::with_capacity(count as usize);
        for i in 0..count {
            let txs: Vec<Vec<u8>> = if i == 0 {
                self.state.read().pool.values().cloned().collect()
            } else {
                Vec::new()
            };
            let entry = self.build_block(difficulty, i, txs)?;
            match self.handle_incoming_block(&entry.block, &entry.txs)? {
                VerificationOutcome::Accepted => ids.push(Hash::digest(&entry.block)),
                other => {
                    return Err(CoreError::Storage(format!(
                        "mined block was not accepted: {:?}",
                        other
                    )))
                }
            }
        }
        Ok(ids)
    }

    pub fn pool_size(&self) -> usize {
        self.state.read().pool.len()
    }

    /// Number of batches opened so far
    pub fn batch_count(&self) -> u64 {
        self.state.read().batches
    }

    pub fn is_batch_open(&self) -> bool {
        self.state.read().batch_open
    }

    pub fn alt_block_count(&self) -> usize {
        self.state.read().alt.len()
    }
}

impl Default for MemoryCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Core for MemoryCore {
    fn height(&self) -> u64 {
        self.state.read().main.len() as u64
    }

    fn top_block_hash(&self) -> Hash {
        self.state.read().top_id()
    }

    fn top_version(&self) -> u8 {
        self.state
            .read()
            .top()
            .map(|b| b.header.major_version)
            .unwrap_or(1)
    }

    fn cumulative_difficulty(&self) -> u128 {
        self.state.read().top_cumulative_difficulty()
    }

    fn get_block_hash_from_height(&self, height: u64) -> Option<Hash> {
        self.state.read().main.get(height as usize).map(|b| b.id)
    }

    fn get_block_cumulative_difficulty(&self, height: u64) -> Option<u128> {
        self.state
            .read()
            .main
            .get(height as usize)
            .map(|b| b.cumulative_difficulty)
    }

    fn have_block(&self, id: &Hash) -> bool {
        let state = self.state.read();
        state.main_index.contains_key(id) || state.alt.contains_key(id)
    }

    fn parse_block(&self, blob: &[u8]) -> Result<BlockSummary, CoreError> {
        let header = TestBlock::from_blob(blob)?;
        Ok(BlockSummary {
            id: Hash::digest(blob),
            prev_id: header.prev_id,
            height: header.height,
            major_version: header.major_version,
            tx_hashes: header.tx_hashes,
        })
    }

    fn tx_hash(&self, blob: &[u8]) -> Result<Hash, CoreError> {
        if blob.is_empty() {
            return Err(CoreError::ParseTransaction("empty blob".to_string()));
        }
        Ok(Hash::digest(blob))
    }

    fn get_short_chain_history(&self) -> Vec<Hash> {
        let state = self.state.read();
        let size = state.main.len();
        let mut ids = Vec::new();
        let mut back_offset = 1usize;
        let mut multiplier = 1usize;
        let mut genesis_included = false;
        let mut i = 0;
        while back_offset < size {
            let height = size - back_offset;
            ids.push(state.main[height].id);
            if height == 0 {
                genesis_included = true;
            }
            if i < SHORT_HISTORY_DENSE_COUNT {
                back_offset += 1;
            } else {
                multiplier *= 2;
                back_offset += multiplier;
            }
            i += 1;
        }
        if !genesis_included {
            if let Some(genesis) = state.main.first() {
                ids.push(genesis.id);
            }
        }
        ids
    }

    fn find_blockchain_supplement(
        &self,
        ids: &[Hash],
        max_count: usize,
    ) -> Option<ChainSupplement> {
        let state = self.state.read();
        let genesis = state.main.first()?.id;
        if ids.last() != Some(&genesis) {
            return None;
        }
        let split_height = ids
            .iter()
            .find_map(|id| state.main_index.get(id).copied())?;
        let start = split_height as usize;
        let end = state.main.len().min(start.saturating_add(max_count));
        Some(ChainSupplement {
            start_height: split_height,
            total_height: state.main.len() as u64,
            cumulative_difficulty: state.top_cumulative_difficulty(),
            block_ids: state.main[start..end].iter().map(|b| b.id).collect(),
        })
    }

    fn get_blocks_by_hashes(&self, ids: &[Hash]) -> (Vec<BlockCompleteEntry>, Vec<Hash>) {
        let state = self.state.read();
        let mut blocks = Vec::new();
        let mut missed = Vec::new();
        for id in ids {
            match state.main_index.get(id) {
                Some(&height) => blocks.push(state.main[height as usize].entry.clone()),
                None => missed.push(*id),
            }
        }
        (blocks, missed)
    }

    fn get_block_by_hash(&self, id: &Hash) -> Option<BlockCompleteEntry> {
        let state = self.state.read();
        if let Some(&height) = state.main_index.get(id) {
            return Some(state.main[height as usize].entry.clone());
        }
        state.alt.get(id).map(|b| b.entry.clone())
    }

    fn get_transaction(&self, id: &Hash) -> Option<Vec<u8>> {
        let state = self.state.read();
        state
            .pool
            .get(id)
            .or_else(|| state.chain_txs.get(id))
            .cloned()
    }

    fn get_pool_transaction_hashes(&self) -> Vec<Hash> {
        self.state.read().pool.keys().copied().collect()
    }

    fn get_pool_complement(&self, known: &[Hash]) -> Vec<Vec<u8>> {
        let known: HashSet<&Hash> = known.iter().collect();
        self.state
            .read()
            .pool
            .iter()
            .filter(|(hash, _)| !known.contains(hash))
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    fn handle_incoming_tx(&self, blob: &[u8], relay: RelayMethod) -> VerificationOutcome {
        let id = match self.tx_hash(blob) {
            Ok(id) => id,
            Err(e) => {
                log::debug!("Rejected transaction: {}", e);
                return VerificationOutcome::Failed;
            }
        };
        if blob.len() > MAX_TX_BLOB_SIZE || blob[0] == INVALID_TX_MARKER {
            log::debug!("Transaction {} failed verification", id);
            return VerificationOutcome::Failed;
        }
        let mut state = self.state.write();
        if state.pool.contains_key(&id) || state.chain_txs.contains_key(&id) {
            return VerificationOutcome::AlreadyExists;
        }
        log::trace!("Transaction {} added to pool ({:?})", id, relay);
        state.pool.insert(id, blob.to_vec());
        VerificationOutcome::Accepted
    }

    fn handle_incoming_block(
        &self,
        block: &[u8],
        txs: &[Vec<u8>],
    ) -> Result<VerificationOutcome, CoreError> {
        let header = TestBlock::from_blob(block)?;
        let id = Hash::digest(block);
        let mut state = self.state.write();

        if state.main_index.contains_key(&id) || state.alt.contains_key(&id) {
            return Ok(VerificationOutcome::AlreadyExists);
        }
        if header.difficulty == 0 || txs.len() != header.tx_hashes.len() {
            return Ok(VerificationOutcome::Failed);
        }
        if txs
            .iter()
            .zip(header.tx_hashes.iter())
            .any(|(tx, hash)| Hash::digest(tx) != *hash)
        {
            return Ok(VerificationOutcome::Failed);
        }

        let Some((parent_cd, parent_height)) = state.lookup(&header.prev_id) else {
            return Ok(VerificationOutcome::Orphaned);
        };
        if header.height != parent_height + 1 {
            return Ok(VerificationOutcome::Failed);
        }

        let stored = StoredBlock {
            id,
            cumulative_difficulty: parent_cd + header.difficulty as u128,
            header: header.clone(),
            entry: BlockCompleteEntry {
                block: block.to_vec(),
                txs: txs.to_vec(),
            },
        };

        if header.prev_id == state.top_id() {
            state.push_main(stored);
            return Ok(VerificationOutcome::Accepted);
        }

        let cumulative_difficulty = stored.cumulative_difficulty;
        state.alt.insert(id, stored);
        if cumulative_difficulty > state.top_cumulative_difficulty() {
            state.reorganize(id)?;
            Ok(VerificationOutcome::Accepted)
        } else {
            Ok(VerificationOutcome::AltChain)
        }
    }

    fn add_block(
        &self,
        block: &[u8],
        weight: u64,
        difficulty: u128,
        generated_coins: u64,
        txs: &[Vec<u8>],
    ) -> Result<(), CoreError> {
        let header = TestBlock::from_blob(block)?;
        let id = Hash::digest(block);
        let mut state = self.state.write();
        if header.prev_id != state.top_id() || header.height != state.main.len() as u64 {
            return Err(CoreError::NotOnTop(id));
        }
        log::trace!(
            "Adding block {} at {} (weight {}, coins {})",
            id,
            header.height,
            weight,
            generated_coins
        );
        let cumulative_difficulty = state.top_cumulative_difficulty() + difficulty;
        state.push_main(StoredBlock {
            id,
            header,
            entry: BlockCompleteEntry {
                block: block.to_vec(),
                txs: txs.to_vec(),
            },
            cumulative_difficulty,
        });
        Ok(())
    }

    fn pop_block(&self) -> Result<BlockCompleteEntry, CoreError> {
        self.state
            .write()
            .pop_main()
            .map(|b| b.entry)
            .ok_or(CoreError::PopGenesis)
    }

    fn batch_start(&self, block_count: u64) -> bool {
        let mut state = self.state.write();
        if state.batch_open {
            return false;
        }
        log::trace!("Batch of {} blocks started", block_count);
        state.batch_open = true;
        state.batches += 1;
        true
    }

    fn batch_stop(&self) {
        self.state.write().batch_open = false;
    }
}

// =============================================================================
// Tests
// =============================================================================
