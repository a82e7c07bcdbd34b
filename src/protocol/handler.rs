//! Chain synchronization and relay
//!
//! `ProtocolHandler` reacts to the chain-sync commands of every connection.
//! It runs on the connection tasks with the connection's context locked,
//! so anything that looks at other connections only peeks at contexts that
//! are free (`Connection::try_context`) and never blocks on them.
//! Operations that reach across connections go through a `P2pEndpoint`,
//! implemented by the node server.

use super::block_queue::BlockQueue;
use super::messages::*;
use super::pruning::{
    get_pruning_stripe, get_pruning_stripe_for_height, has_unpruned_block, is_valid_peer_seed,
    CRYPTONOTE_PRUNING_LOG_STRIPES,
};
use crate::core::{BlockCompleteEntry, Core, CoreError, RelayMethod, VerificationOutcome};
use crate::crypto::{Hash, HASH_SIZE};
use crate::levin::{decode_payload, encode_payload, LevinCommand, PayloadError};
use crate::net::{Connection, ConnectionContext, ConnectionState, HandlerError, NetworkAddress, Zone};
use crate::p2p::messages::P2P_SUPPORT_FLAG_FLUFFY_BLOCKS;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// =============================================================================
// Constants
// =============================================================================

/// Most ids a single get-objects request may ask for
pub const CURRENCY_PROTOCOL_MAX_OBJECT_REQUEST_COUNT: usize = 100;
/// Most ids a chain entry may carry
pub const BLOCKS_IDS_SYNCHRONIZING_MAX_COUNT: usize = 25_000;
pub const BLOCKS_SYNCHRONIZING_DEFAULT_COUNT: u64 = 20;
pub const CRYPTONOTE_MAX_BLOCK_NUMBER: u64 = 500_000_000;

const IDLE_PEER_KICK_INTERVAL: Duration = Duration::from_secs(8);
const STANDBY_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const SYNC_SEARCH_INTERVAL: Duration = Duration::from_secs(101);

// =============================================================================
// Configuration
// =============================================================================

/// Tunables of the sync state machine
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Connections whose score falls to this value are dropped
    pub drop_peers_on_score: i64,
    pub idle_peer_kick_time: Duration,
    pub non_responsive_peer_kick_time: Duration,
    /// Outgoing peers are dropped when no block was added for this long
    pub drop_on_sync_wedge_threshold: Duration,
    pub last_activity_stall_threshold: Duration,
    pub block_queue_nspans_threshold: usize,
    pub block_queue_size_threshold: usize,
    pub force_download_near_blocks: u64,
    pub request_next_scheduled_span_threshold: Duration,
    pub request_next_scheduled_span_threshold_standby: Duration,
    pub block_download_max_count: u64,
    pub sync_search_connections_count: usize,
    /// Never download blocks, only serve them
    pub no_sync: bool,
    pub relay_fluffy_blocks: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            drop_peers_on_score: -2,
            idle_peer_kick_time: Duration::from_secs(240),
            non_responsive_peer_kick_time: Duration::from_secs(20),
            drop_on_sync_wedge_threshold: Duration::from_secs(30),
            last_activity_stall_threshold: Duration::from_secs(2),
            block_queue_nspans_threshold: 10,
            block_queue_size_threshold: 100 * 1024 * 1024,
            force_download_near_blocks: 1000,
            request_next_scheduled_span_threshold: Duration::from_secs(30),
            request_next_scheduled_span_threshold_standby: Duration::from_secs(5),
            block_download_max_count: BLOCKS_SYNCHRONIZING_DEFAULT_COUNT,
            sync_search_connections_count: 2,
            no_sync: false,
            relay_fluffy_blocks: true,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Why a peer's message was rejected. Every variant drops the connection;
/// the score is what the peer's host gets charged in the ban list.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("Protocol violation: {0}")]
    Violation(String),
    #[error("{0}")]
    Dropped(String),
    #[error("{reason}")]
    Misbehaving { reason: String, score: u64 },
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl ProtocolError {
    pub fn fail_score(&self) -> u64 {
        match self {
            ProtocolError::Payload(_) | ProtocolError::Violation(_) | ProtocolError::Core(_) => 1,
            ProtocolError::Dropped(_) => 0,
            ProtocolError::Misbehaving { score, .. } => *score,
        }
    }
}

fn dropped(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Dropped(reason.into())
}

fn violation(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Violation(reason.into())
}

fn misbehaving(reason: impl Into<String>, score: u64) -> ProtocolError {
    ProtocolError::Misbehaving {
        reason: reason.into(),
        score,
    }
}

// =============================================================================
// Node boundary
// =============================================================================

/// What the protocol handler needs from the node server
pub trait P2pEndpoint: Send + Sync {
    /// Visits live connections until `f` returns false. Implementations
    /// must not hold their own locks while calling `f`.
    fn for_each_connection(&self, f: &mut dyn FnMut(&Connection) -> bool);

    /// Runs `f` on the connection with `id`; false if there is none
    fn for_connection(&self, id: Uuid, f: &mut dyn FnMut(&Connection)) -> bool;

    fn relay_notify_to_list(&self, command: u32, payload: Bytes, targets: &[Uuid]) -> bool;

    /// Relays transactions according to `relay`, skipping `source`
    fn send_txs(&self, txs: Vec<Vec<u8>>, zone: Zone, source: Uuid, relay: RelayMethod) -> bool;

    /// Closes the connection without touching its context
    fn drop_connection(&self, conn: &Connection);

    fn add_host_fail(&self, address: &NetworkAddress, score: u64);

    fn max_out_peers(&self, zone: Zone) -> usize;
}

// =============================================================================
// Handler
// =============================================================================

enum QueueCheck {
    Proceed,
    ForceNextSpan,
    Done(bool),
}

enum AddStep {
    Request { force_next_span: bool },
    Stop,
}

/// Keeps a core batch open for one span; closed on drop
struct CoreBatch<'a> {
    core: &'a dyn Core,
    open: bool,
}

impl<'a> CoreBatch<'a> {
    fn start(core: &'a dyn Core, block_count: u64) -> Self {
        let open = core.batch_start(block_count);
        if !open {
            log::warn!("Core batch already open, adding {} blocks unbatched", block_count);
        }
        Self { core, open }
    }
}

impl Drop for CoreBatch<'_> {
    fn drop(&mut self) {
        if self.open {
            self.core.batch_stop();
        }
    }
}

pub struct ProtocolHandler {
    core: Arc<dyn Core>,
    config: ProtocolConfig,
    block_queue: BlockQueue,
    p2p: OnceLock<Weak<dyn P2pEndpoint>>,
    /// Held by whoever is adding blocks from the queue
    sync_lock: Mutex<()>,
    synchronized: AtomicBool,
    target_height: AtomicU64,
    ask_for_txpool_complement: AtomicBool,
    stopping: AtomicBool,
    last_add_end: Mutex<Option<Instant>>,
    sync_start: Mutex<Option<(Instant, u64)>>,
}

impl ProtocolHandler {
    pub fn new(core: Arc<dyn Core>, config: ProtocolConfig) -> Self {
        Self {
            core,
            config,
            block_queue: BlockQueue::new(),
            p2p: OnceLock::new(),
            sync_lock: Mutex::new(()),
            synchronized: AtomicBool::new(false),
            target_height: AtomicU64::new(0),
            ask_for_txpool_complement: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            last_add_end: Mutex::new(None),
            sync_start: Mutex::new(None),
        }
    }

    /// Connects the handler to the node; only the first call has effect
    pub fn set_p2p(&self, p2p: Weak<dyn P2pEndpoint>) {
        if self.p2p.set(p2p).is_err() {
            log::warn!("P2P endpoint already set");
        }
    }

    fn p2p(&self) -> Option<Arc<dyn P2pEndpoint>> {
        self.p2p.get().and_then(Weak::upgrade)
    }

    pub fn core(&self) -> &Arc<dyn Core> {
        &self.core
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn block_queue(&self) -> &BlockQueue {
        &self.block_queue
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }

    /// Highest chain height any peer claimed, 0 when unknown
    pub fn target_height(&self) -> u64 {
        self.target_height.load(Ordering::SeqCst)
    }

    fn raise_target(&self, height: u64) {
        self.target_height.fetch_max(height, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Sync data
    // -------------------------------------------------------------------------

    pub fn get_payload_sync_data(&self) -> CoreSyncData {
        CoreSyncData {
            current_height: self.core.height(),
            cumulative_difficulty: self.core.cumulative_difficulty(),
            top_id: self.core.top_block_hash(),
            top_version: self.core.top_version(),
            pruning_seed: self.core.pruning_seed(),
        }
    }

    /// Digests the chain state a peer sent in a handshake or timed sync.
    ///
    /// The caller must not hold the connection's context.
    pub fn process_payload_sync_data(
        &self,
        conn: &Connection,
        data: &CoreSyncData,
        is_initial: bool,
    ) -> Result<(), ProtocolError> {
        let mut ctx = conn.context();
        if ctx.state == ConnectionState::HandshakePending && !is_initial {
            return Ok(());
        }
        if ctx.state == ConnectionState::Synchronizing {
            return Ok(());
        }

        if data.pruning_seed != 0 && !is_valid_peer_seed(data.pruning_seed) {
            return Err(violation(format!("invalid pruning seed {:#x}", data.pruning_seed)));
        }

        if data.current_height < ctx.remote_blockchain_height {
            log::info!(
                "{} Claims {}, claimed {} before",
                conn,
                data.current_height,
                ctx.remote_blockchain_height
            );
            if self.hit_score(conn, &mut ctx, 1) {
                return Ok(());
            }
        }

        ctx.remote_blockchain_height = data.current_height;
        ctx.pruning_seed = data.pruning_seed;
        ctx.remote_top_version = data.top_version;

        let our_height = self.core.height();
        if self.target_height() == 0 {
            self.raise_target(our_height);
        }

        if self.core.have_block(&data.top_id)
            || data.cumulative_difficulty <= self.core.cumulative_difficulty()
        {
            ctx.state = ConnectionState::Normal;
            if is_initial
                && data.current_height >= self.target_height()
                && self.target_height() <= our_height
            {
                self.on_connection_synchronized(Some((conn, &*ctx)));
            }
            return Ok(());
        }

        // blocks are only synced over the public zone
        if conn.remote_address().zone() != Zone::Public {
            ctx.state = ConnectionState::Normal;
            return Ok(());
        }

        let target = self.target_height();
        if data.current_height > target {
            let diff = data.current_height as i64 - our_height as i64;
            log::info!(
                "{} Sync data returned a new top block candidate: {} -> {} [Your node is {} blocks ({:.1} days) {}]\nSYNCHRONIZATION started",
                conn,
                our_height,
                data.current_height,
                diff.unsigned_abs(),
                diff.unsigned_abs() as f64 * 120.0 / 86_400.0,
                if diff >= 0 { "behind" } else { "ahead" }
            );
            self.target_height.store(data.current_height, Ordering::SeqCst);
            self.sync_start.lock().get_or_insert((Instant::now(), our_height));
        }

        if self.config.no_sync {
            ctx.state = ConnectionState::Normal;
            log::debug!("{} Sync disabled, not downloading from peer", conn);
            return Ok(());
        }

        log::info!("{} Remote blockchain height: {}, id: {}", conn, data.current_height, data.top_id);
        ctx.state = ConnectionState::Synchronizing;
        ctx.num_requested = 0;
        drop(ctx);
        if let Err(e) = conn.request_callback() {
            log::debug!("{} failed to queue callback: {}", conn, e);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Handles a chain-sync notification.
    ///
    /// Rejected messages drop the connection here; only unknown commands are
    /// reported back to the connection.
    pub fn handle_notify(&self, conn: &Connection, command: u32, payload: &[u8]) -> Result<(), HandlerError> {
        let result = match command {
            NOTIFY_NEW_BLOCK => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_notify_new_block(conn, arg)),
            NOTIFY_NEW_FLUFFY_BLOCK => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_notify_new_fluffy_block(conn, arg)),
            NOTIFY_REQUEST_FLUFFY_MISSING_TX => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_request_fluffy_missing_tx(conn, arg)),
            NOTIFY_GET_TXPOOL_COMPLEMENT => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_notify_get_txpool_complement(conn, arg)),
            NOTIFY_NEW_TRANSACTIONS => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_notify_new_transactions(conn, arg)),
            NOTIFY_REQUEST_GET_OBJECTS => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_request_get_objects(conn, arg)),
            NOTIFY_RESPONSE_GET_OBJECTS => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_response_get_objects(conn, arg)),
            NOTIFY_REQUEST_CHAIN => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_request_chain(conn, arg)),
            NOTIFY_RESPONSE_CHAIN_ENTRY => decode_payload(payload)
                .map_err(ProtocolError::from)
                .and_then(|arg| self.handle_response_chain_entry(conn, arg)),
            other => return Err(HandlerError::NotHandled(other)),
        };

        if let Err(e) = result {
            log::info!("{} dropping connection: {}", conn, e);
            self.drop_connection_with_score(conn, e.fail_score(), false);
        }
        Ok(())
    }

    fn post_notify<T: LevinCommand>(&self, conn: &Connection, message: &T) -> bool {
        match conn.notify_command(message) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("{} failed to send command {}: {}", conn, T::ID, e);
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Block and transaction notifications
    // -------------------------------------------------------------------------

    fn handle_notify_new_block(&self, conn: &Connection, arg: NotifyNewBlock) -> Result<(), ProtocolError> {
        log::debug!("{} Received NOTIFY_NEW_BLOCK ({} txes)", conn, arg.block.txs.len());
        self.handle_notify_new_fluffy_block(
            conn,
            NotifyNewFluffyBlock {
                block: arg.block,
                current_blockchain_height: arg.current_blockchain_height,
            },
        )
    }

    fn handle_notify_new_fluffy_block(
        &self,
        conn: &Connection,
        arg: NotifyNewFluffyBlock,
    ) -> Result<(), ProtocolError> {
        let mut ctx = conn.context();
        if ctx.state != ConnectionState::Normal {
            return Ok(());
        }
        if !self.is_synchronized() {
            log::debug!("{} Received new block while syncing, ignored", conn);
            return Ok(());
        }

        let summary = self
            .core
            .parse_block(&arg.block.block)
            .map_err(|e| dropped(format!("sent wrong block: {}", e)))?;
        log::debug!(
            "{} Received NOTIFY_NEW_FLUFFY_BLOCK {} (height {}, {} txes)",
            conn,
            summary.id,
            summary.height,
            arg.block.txs.len()
        );

        // a non-empty request set means this answers our missing-tx request
        if !ctx.requested_objects.is_empty() && ctx.requested_objects.len() != arg.block.txs.len() {
            return Err(dropped(format!(
                "NOTIFY_NEW_FLUFFY_BLOCK -> request/response mismatch, block = {}, requested = {}, received = {}",
                summary.id,
                ctx.requested_objects.len(),
                arg.block.txs.len()
            )));
        }

        for tx in &arg.block.txs {
            let tx_hash = self
                .core
                .tx_hash(tx)
                .map_err(|e| dropped(format!("sent wrong tx: {}", e)))?;
            if !ctx.requested_objects.is_empty() && !ctx.requested_objects.remove(&tx_hash) {
                return Err(dropped(format!(
                    "Peer sent wrong transaction (NOTIFY_NEW_FLUFFY_BLOCK): transaction with id = {} wasn't requested",
                    tx_hash
                )));
            }
            if self.core.handle_incoming_tx(tx, RelayMethod::Block).is_failure() {
                return Err(dropped(format!(
                    "Block verification failed: transaction verification failed, tx_id = {}",
                    tx_hash
                )));
            }
        }

        if !ctx.requested_objects.is_empty() {
            return Err(dropped(
                "Peer sent the number of transaction requested, but not the actual transactions requested",
            ));
        }

        let mut txs = Vec::with_capacity(summary.tx_hashes.len());
        let mut missing = Vec::new();
        for (index, tx_hash) in summary.tx_hashes.iter().enumerate() {
            match self.core.get_transaction(tx_hash) {
                Some(blob) => txs.push(blob),
                None => missing.push(index as u64),
            }
        }

        if !missing.is_empty() {
            log::debug!("{} We are missing {} txes for this fluffy block", conn, missing.len());
            self.post_notify(
                conn,
                &RequestFluffyMissingTx {
                    block_hash: summary.id,
                    current_blockchain_height: arg.current_blockchain_height,
                    missing_tx_indices: missing,
                },
            );
            return Ok(());
        }

        let entry = BlockCompleteEntry {
            block: arg.block.block,
            txs,
        };
        match self.core.handle_incoming_block(&entry.block, &entry.txs) {
            Ok(VerificationOutcome::Accepted) => {
                drop(ctx);
                self.relay_block(
                    NotifyNewBlock {
                        block: entry,
                        current_blockchain_height: arg.current_blockchain_height,
                    },
                    conn.id(),
                );
                Ok(())
            }
            Ok(VerificationOutcome::Orphaned) => {
                log::info!("{} Received orphan block {}, requesting chain", conn, summary.id);
                ctx.needed_objects.clear();
                ctx.state = ConnectionState::Synchronizing;
                self.request_chain(conn, &mut ctx, false);
                Ok(())
            }
            Ok(VerificationOutcome::Failed) => Err(misbehaving("Block verification failed", 1)),
            Ok(_) => Ok(()),
            Err(e) => Err(misbehaving(format!("Block verification failed: {}", e), 1)),
        }
    }

    fn handle_request_fluffy_missing_tx(
        &self,
        conn: &Connection,
        arg: RequestFluffyMissingTx,
    ) -> Result<(), ProtocolError> {
        if conn.context().state == ConnectionState::HandshakePending {
            return Err(dropped("Requested fluffy tx before handshake"));
        }
        log::debug!(
            "{} Received NOTIFY_REQUEST_FLUFFY_MISSING_TX ({} txes), block hash {}",
            conn,
            arg.missing_tx_indices.len(),
            arg.block_hash
        );

        let entry = self
            .core
            .get_block_by_hash(&arg.block_hash)
            .ok_or_else(|| dropped(format!("failed to find block: {}", arg.block_hash)))?;
        let summary = self.core.parse_block(&entry.block)?;

        let tx_count = summary.tx_hashes.len();
        let mut seen = vec![false; tx_count];
        let mut txs = Vec::with_capacity(arg.missing_tx_indices.len());
        for &index in &arg.missing_tx_indices {
            let i = usize::try_from(index)
                .ok()
                .filter(|i| *i < tx_count)
                .ok_or_else(|| {
                    dropped(format!(
                        "Failed to handle request NOTIFY_REQUEST_FLUFFY_MISSING_TX, request is asking for a tx whose index is out of bounds, tx index = {}, block tx count {}",
                        index, tx_count
                    ))
                })?;
            if seen[i] {
                return Err(violation(format!(
                    "Failed to handle request NOTIFY_REQUEST_FLUFFY_MISSING_TX, request is asking for duplicate tx, tx index = {}",
                    index
                )));
            }
            seen[i] = true;
            let blob = self.core.get_transaction(&summary.tx_hashes[i]).ok_or_else(|| {
                dropped(format!(
                    "Failed to handle request NOTIFY_REQUEST_FLUFFY_MISSING_TX, transaction {} not found",
                    summary.tx_hashes[i]
                ))
            })?;
            txs.push(blob);
        }

        log::debug!("{} -->>NOTIFY_RESPONSE_FLUFFY_MISSING_TX: txs.size()={}", conn, txs.len());
        self.post_notify(
            conn,
            &NotifyNewFluffyBlock {
                block: BlockCompleteEntry {
                    block: entry.block,
                    txs,
                },
                current_blockchain_height: arg.current_blockchain_height,
            },
        );
        Ok(())
    }

    fn handle_notify_get_txpool_complement(
        &self,
        conn: &Connection,
        arg: GetTxPoolComplement,
    ) -> Result<(), ProtocolError> {
        if conn.context().state != ConnectionState::Normal {
            return Ok(());
        }
        let txs = self.core.get_pool_complement(&arg.hashes);
        log::debug!("{} Sending {} pool txes the peer does not have", conn, txs.len());
        self.post_notify(
            conn,
            &NotifyNewTransactions {
                txs,
                dandelionpp_fluff: false,
            },
        );
        Ok(())
    }

    fn handle_notify_new_transactions(
        &self,
        conn: &Connection,
        arg: NotifyNewTransactions,
    ) -> Result<(), ProtocolError> {
        let mut seen = HashSet::with_capacity(arg.txs.len());
        if !arg.txs.iter().all(|tx| seen.insert(tx.as_slice())) {
            return Err(dropped("Duplicate transaction in notification"));
        }

        if conn.context().state != ConnectionState::Normal {
            return Ok(());
        }
        if !self.is_synchronized() {
            log::debug!("{} Received new tx while syncing, ignored", conn);
            return Ok(());
        }

        let zone = conn.remote_address().zone();
        let relay = if arg.dandelionpp_fluff || zone != Zone::Public {
            RelayMethod::Fluff
        } else {
            RelayMethod::Stem
        };

        let mut accepted = Vec::new();
        for tx in arg.txs {
            match self.core.handle_incoming_tx(&tx, relay) {
                VerificationOutcome::Failed => {
                    return Err(dropped("Tx verification failed"));
                }
                VerificationOutcome::Accepted => accepted.push(tx),
                _ => {}
            }
        }

        if !accepted.is_empty() {
            self.relay_transactions(accepted, conn.id(), zone, relay);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Block download
    // -------------------------------------------------------------------------

    fn handle_request_get_objects(&self, conn: &Connection, arg: RequestGetObjects) -> Result<(), ProtocolError> {
        let mut ctx = conn.context();
        if ctx.state == ConnectionState::HandshakePending {
            return Err(dropped("Requested objects before handshake"));
        }
        if arg.blocks.len() > CURRENCY_PROTOCOL_MAX_OBJECT_REQUEST_COUNT {
            return Err(dropped(format!(
                "Requested objects count is too big ({}) expected not more then {}",
                arg.blocks.len(),
                CURRENCY_PROTOCOL_MAX_OBJECT_REQUEST_COUNT
            )));
        }
        log::debug!("{} Received NOTIFY_REQUEST_GET_OBJECTS ({} blocks)", conn, arg.blocks.len());

        let (blocks, missed_ids) = self.core.get_blocks_by_hashes(&arg.blocks);
        ctx.last_request_time = Some(Instant::now());
        drop(ctx);

        log::debug!(
            "{} -->>NOTIFY_RESPONSE_GET_OBJECTS: blocks.size()={}, missed={}",
            conn,
            blocks.len(),
            missed_ids.len()
        );
        self.post_notify(
            conn,
            &ResponseGetObjects {
                blocks,
                missed_ids,
                current_blockchain_height: self.core.height(),
            },
        );
        Ok(())
    }

    fn handle_response_get_objects(&self, conn: &Connection, arg: ResponseGetObjects) -> Result<(), ProtocolError> {
        let mut ctx = conn.context();
        let request_time = ctx.last_request_time.take();
        if ctx.expect_response != NOTIFY_RESPONSE_GET_OBJECTS {
            return Err(violation("Got NOTIFY_RESPONSE_GET_OBJECTS out of the blue"));
        }
        ctx.expect_response = 0;

        let blocks_size: usize = arg.blocks.iter().map(BlockCompleteEntry::size).sum();
        let size = blocks_size + arg.missed_ids.len() * HASH_SIZE + 8;
        log::debug!(
            "{} Received NOTIFY_RESPONSE_GET_OBJECTS ({} blocks, {} bytes)",
            conn,
            arg.blocks.len(),
            size
        );

        if arg.blocks.is_empty() {
            return Err(violation("sent wrong NOTIFY_HAVE_OBJECTS: no blocks"));
        }
        if ctx.last_response_height > arg.current_blockchain_height {
            return Err(dropped(format!(
                "sent wrong NOTIFY_HAVE_OBJECTS: arg.m_current_blockchain_height={} < m_last_response_height={}",
                arg.current_blockchain_height, ctx.last_response_height
            )));
        }
        if arg.current_blockchain_height < ctx.remote_blockchain_height {
            log::info!(
                "{} Claims {}, claimed {} before",
                conn,
                arg.current_blockchain_height,
                ctx.remote_blockchain_height
            );
            if self.hit_score(conn, &mut ctx, 1) {
                return Ok(());
            }
        }
        ctx.remote_blockchain_height = arg.current_blockchain_height;
        self.raise_target(ctx.remote_blockchain_height);

        let expected_height = ctx.expected_height.unwrap_or(u64::MAX);
        let mut start_height = None;
        let mut last_id = Hash::NULL;
        for entry in &arg.blocks {
            if self.is_stopping() {
                return Ok(());
            }
            let summary = self.core.parse_block(&entry.block).map_err(|e| {
                dropped(format!("sent wrong block: failed to parse and validate block: {}", e))
            })?;
            if start_height.is_none() {
                if summary.height > expected_height {
                    return Err(dropped(format!(
                        "sent block ahead of expected height {} (got {})",
                        expected_height, summary.height
                    )));
                }
                start_height = Some(summary.height);
            }
            if !ctx.requested_objects.remove(&summary.id) {
                return Err(dropped(format!(
                    "sent wrong NOTIFY_RESPONSE_GET_OBJECTS: block with id={} wasn't requested",
                    summary.id
                )));
            }
            if summary.tx_hashes.len() != entry.txs.len() {
                return Err(dropped(format!(
                    "sent wrong NOTIFY_RESPONSE_GET_OBJECTS: block with id={} has {} txes, expected {}",
                    summary.id,
                    entry.txs.len(),
                    summary.tx_hashes.len()
                )));
            }
            last_id = summary.id;
        }

        if !ctx.requested_objects.is_empty() {
            return Err(dropped(format!(
                "returned not all requested objects (context.m_requested_objects.size()={})",
                ctx.requested_objects.len()
            )));
        }
        let Some(start_height) = start_height else {
            return Ok(());
        };

        let elapsed = request_time.map(|t| t.elapsed()).unwrap_or_default();
        let rate = size as f32 * 1e6 / (elapsed.as_micros() as f32 + 1.0);
        log::debug!(
            "{} adding span: {} at height {}, {:.3} seconds, {:.1} kB/s, size now {:.2} MB",
            conn,
            arg.blocks.len(),
            start_height,
            elapsed.as_secs_f32(),
            rate / 1024.0,
            (self.block_queue.get_data_size() + blocks_size) as f32 / 1_048_576.0
        );
        self.block_queue.add_blocks(
            start_height,
            arg.blocks,
            conn.id(),
            conn.remote_address().clone(),
            rate,
            blocks_size,
        );
        ctx.last_known_hash = last_id;

        self.try_add_next_blocks(conn, &mut ctx);
        Ok(())
    }

    fn handle_request_chain(&self, conn: &Connection, arg: RequestChain) -> Result<(), ProtocolError> {
        if conn.context().state == ConnectionState::HandshakePending {
            return Err(dropped("Requested chain before handshake"));
        }
        log::debug!("{} Received NOTIFY_REQUEST_CHAIN ({} blocks)", conn, arg.block_ids.len());

        let supplement = self
            .core
            .find_blockchain_supplement(&arg.block_ids, BLOCKS_IDS_SYNCHRONIZING_MAX_COUNT)
            .ok_or_else(|| dropped("Failed to handle NOTIFY_REQUEST_CHAIN."))?;

        log::debug!(
            "{} -->>NOTIFY_RESPONSE_CHAIN_ENTRY: m_start_height={}, m_total_height={}, m_block_ids.size()={}",
            conn,
            supplement.start_height,
            supplement.total_height,
            supplement.block_ids.len()
        );
        self.post_notify(
            conn,
            &ResponseChainEntry {
                start_height: supplement.start_height,
                total_height: supplement.total_height,
                cumulative_difficulty: supplement.cumulative_difficulty,
                block_ids: supplement.block_ids,
            },
        );
        Ok(())
    }

    fn handle_response_chain_entry(&self, conn: &Connection, arg: ResponseChainEntry) -> Result<(), ProtocolError> {
        let mut ctx = conn.context();
        log::debug!(
            "{} Received NOTIFY_RESPONSE_CHAIN_ENTRY: m_block_ids.size()={}, m_start_height={}, m_total_height={}",
            conn,
            arg.block_ids.len(),
            arg.start_height,
            arg.total_height
        );

        if ctx.expect_response != NOTIFY_RESPONSE_CHAIN_ENTRY {
            return Err(violation("Got NOTIFY_RESPONSE_CHAIN_ENTRY out of the blue"));
        }
        ctx.expect_response = 0;
        if arg.start_height >= ctx.expected_height.unwrap_or(u64::MAX) {
            return Err(violation("Got NOTIFY_RESPONSE_CHAIN_ENTRY past expected height"));
        }
        ctx.last_request_time = None;

        if arg.block_ids.is_empty() {
            return Err(violation("sent empty m_block_ids"));
        }
        let count = arg.block_ids.len() as u64;
        if arg.total_height < count || arg.start_height > arg.total_height - count {
            return Err(violation("sent invalid start/nblocks/height"));
        }
        if arg.total_height >= CRYPTONOTE_MAX_BLOCK_NUMBER
            || arg.block_ids.len() > BLOCKS_IDS_SYNCHRONIZING_MAX_COUNT
        {
            return Err(dropped(format!(
                "sent wrong NOTIFY_RESPONSE_CHAIN_ENTRY, with total_height={} and block_ids={}",
                arg.total_height,
                arg.block_ids.len()
            )));
        }

        if arg.total_height < ctx.remote_blockchain_height {
            log::info!(
                "{} Claims {}, claimed {} before",
                conn,
                arg.total_height,
                ctx.remote_blockchain_height
            );
            if self.hit_score(conn, &mut ctx, 1) {
                return Ok(());
            }
        }
        ctx.remote_blockchain_height = arg.total_height;
        ctx.last_response_height = arg.start_height + count - 1;
        if ctx.last_response_height > ctx.remote_blockchain_height {
            return Err(dropped(format!(
                "sent wrong NOTIFY_RESPONSE_CHAIN_ENTRY, with m_total_height={}, m_start_height={}, m_block_ids.size()={}",
                arg.total_height,
                arg.start_height,
                arg.block_ids.len()
            )));
        }

        ctx.needed_objects.clear();
        let mut seen = HashSet::with_capacity(arg.block_ids.len());
        let mut expect_unknown = false;
        let mut have_block = false;
        for (i, id) in arg.block_ids.iter().enumerate() {
            if !seen.insert(*id) {
                return Err(misbehaving("Duplicate blocks in chain entry response", 5));
            }
            have_block = self.core.have_block(id);
            if i == 0 {
                if !have_block && !self.block_queue.requested(id) && !self.block_queue.have(id) {
                    return Err(misbehaving("First block hash is unknown, dropping connection", 5));
                }
                expect_unknown = !have_block;
            } else if have_block {
                if expect_unknown {
                    return Err(misbehaving(
                        "Block is known after an unknown block in chain entry",
                        5,
                    ));
                }
            } else {
                expect_unknown = true;
            }
            ctx.needed_objects.push(*id);
        }

        if have_block && arg.total_height == arg.start_height + count {
            if ctx.expected_height.is_some_and(|h| arg.start_height < h) {
                return Err(misbehaving(
                    "We have the last block, and the new chain grafts in the past",
                    5,
                ));
            }
            log::debug!("{} We have the last block, switching to normal", conn);
            ctx.state = ConnectionState::Normal;
            self.hit_score(conn, &mut ctx, 1);
            return Ok(());
        }

        if !self.request_missing_objects(conn, &mut ctx, false) {
            return Err(dropped("Failed to request missing objects, dropping connection"));
        }
        self.raise_target(arg.total_height);
        ctx.num_requested = 0;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    fn request_chain(&self, conn: &Connection, ctx: &mut ConnectionContext, from_last_known: bool) {
        let mut block_ids = self.core.get_short_chain_history();
        ctx.expected_height = Some(self.core.height());
        if from_last_known
            && !ctx.last_known_hash.is_null()
            && block_ids.first() != Some(&ctx.last_known_hash)
        {
            ctx.expected_height = Some(u64::MAX);
            block_ids.insert(0, ctx.last_known_hash);
        }
        ctx.last_request_time = Some(Instant::now());
        ctx.expect_response = NOTIFY_RESPONSE_CHAIN_ENTRY;
        log::debug!("{} -->>NOTIFY_REQUEST_CHAIN: m_block_ids.size()={}", conn, block_ids.len());
        self.post_notify(
            conn,
            &RequestChain {
                block_ids,
                prune: false,
            },
        );
    }

    fn request_txpool_complement(&self, conn: &Connection) {
        let hashes = self.core.get_pool_transaction_hashes();
        log::debug!("{} Requesting txpool complement ({} known)", conn, hashes.len());
        self.post_notify(conn, &GetTxPoolComplement { hashes });
    }

    /// Drops leading needed ids that are already on chain or queued.
    /// Returns how many were skipped.
    fn skip_unneeded_hashes(&self, ctx: &mut ConnectionContext, check_block_queue: bool) -> usize {
        let skip = ctx
            .needed_objects
            .iter()
            .take_while(|id| {
                self.core.have_block(id) || (check_block_queue && self.block_queue.have(id))
            })
            .count();
        if skip > 0 {
            log::debug!("skipping {}/{} blocks", skip, ctx.needed_objects.len());
            ctx.needed_objects.drain(..skip);
        }
        skip
    }

    fn nothing_to_request(&self, conn: &Connection, ctx: &mut ConnectionContext) -> bool {
        let height = self.core.height();
        if ctx.remote_blockchain_height > self.block_queue.get_next_needed_height(height) {
            log::error!(
                "{} Nothing we can request from this peer, and we did not request anything previously",
                conn
            );
            return false;
        }
        log::debug!("{} Nothing to get from this peer, and it's not ahead of us, all done", conn);
        ctx.state = ConnectionState::Normal;
        if height >= self.target_height() {
            self.on_connection_synchronized(Some((conn, &*ctx)));
        }
        true
    }

    /// Asks the peer for the next batch of blocks or, when it has nothing
    /// more for us, for a new chain entry. Returns false when the
    /// connection should be dropped.
    fn request_missing_objects(
        &self,
        conn: &Connection,
        ctx: &mut ConnectionContext,
        mut force_next_span: bool,
    ) -> bool {
        let live = self.live_connection_ids();
        self.block_queue.flush_stale_spans(&live);

        if !force_next_span {
            match self.check_block_queue(conn, ctx) {
                QueueCheck::Proceed => {}
                QueueCheck::ForceNextSpan => force_next_span = true,
                QueueCheck::Done(keep) => return keep,
            }
            ctx.state = ConnectionState::Synchronizing;
        }

        if !ctx.needed_objects.is_empty() || force_next_span {
            if let Some(keep) = self.request_next_span(conn, ctx, force_next_span) {
                return keep;
            }
        }

        self.request_chain_or_finish(conn, ctx)
    }

    /// Decides whether the block queue has room for more downloads from
    /// this peer, and parks the connection in standby when it does not
    fn check_block_queue(&self, conn: &Connection, ctx: &mut ConnectionContext) -> QueueCheck {
        let nspans = self.block_queue.get_num_filled_spans();
        let size = self.block_queue.get_data_size();
        let bc_height = self.core.height();
        let add_stripe = get_pruning_stripe_for_height(
            bc_height,
            ctx.remote_blockchain_height,
            CRYPTONOTE_PRUNING_LOG_STRIPES,
        );
        let peer_stripe = get_pruning_stripe(ctx.pruning_seed);
        let queue_proceed = nspans < self.config.block_queue_nspans_threshold
            || size < self.config.block_queue_size_threshold;

        if self.skip_unneeded_hashes(ctx, true) > 0 && ctx.needed_objects.is_empty() && ctx.num_requested == 0 {
            return QueueCheck::Done(self.nothing_to_request(conn, ctx));
        }

        let next_needed_height = self.block_queue.get_next_needed_height(bc_height);
        let next_block_height = if ctx.needed_objects.is_empty() {
            next_needed_height
        } else {
            (ctx.last_response_height + 1).saturating_sub(ctx.needed_objects.len() as u64)
        };
        let near = self.config.force_download_near_blocks;
        let stripe_proceed_main = (add_stripe == 0 || peer_stripe == 0 || add_stripe == peer_stripe)
            && (next_block_height < bc_height + near || next_needed_height < bc_height + near);
        let stripe_proceed_secondary =
            has_unpruned_block(next_block_height, ctx.remote_blockchain_height, ctx.pruning_seed);
        let proceed = stripe_proceed_main || (queue_proceed && stripe_proceed_secondary);

        if !stripe_proceed_main && !stripe_proceed_secondary {
            let next_stripe = get_pruning_stripe_for_height(
                next_block_height,
                ctx.remote_blockchain_height,
                CRYPTONOTE_PRUNING_LOG_STRIPES,
            );
            if self.should_drop_connection(conn, ctx, next_stripe) {
                return QueueCheck::Done(false);
            }
        }

        if stripe_proceed_main && self.should_download_next_span(ctx, true) {
            log::debug!("{} we should try for that next span too, we think we could get it faster", conn);
            return QueueCheck::ForceNextSpan;
        }

        if proceed {
            if ctx.state != ConnectionState::Standby {
                log::debug!("{} Block queue is {} and {}, resuming", conn, nspans, size);
            }
            return QueueCheck::Proceed;
        }

        if let Some(_guard) = self.sync_lock.try_lock() {
            let next_ready = self
                .block_queue
                .has_next_span_at(self.core.height())
                .is_some_and(|span| span.filled);
            if next_ready {
                log::debug!("{} No other thread is adding blocks, and next span needed is ready, resuming", conn);
                ctx.state = ConnectionState::Standby;
                let _ = conn.request_callback();
                return QueueCheck::Done(true);
            }

            if !ctx.is_incoming {
                let wedged = self
                    .last_add_end
                    .lock()
                    .is_some_and(|end| end.elapsed() >= self.config.drop_on_sync_wedge_threshold);
                if wedged {
                    log::debug!("{} Block addition seems to have wedged, dropping connection", conn);
                    return QueueCheck::Done(false);
                }
            }
        }

        if ctx.state != ConnectionState::Standby {
            if !queue_proceed {
                log::debug!("{} Block queue is {} and {}, pausing", conn, nspans, size);
            } else {
                log::debug!(
                    "{} We do not have the stripe required to download another block, pausing",
                    conn
                );
            }
            ctx.state = ConnectionState::Standby;
        }
        QueueCheck::Done(true)
    }

    /// Picks a span to request and sends the request. `None` means the
    /// needed ids were inconsistent and a new chain entry is required.
    fn request_next_span(
        &self,
        conn: &Connection,
        ctx: &mut ConnectionContext,
        force_next_span: bool,
    ) -> Option<bool> {
        let mut blocks: Vec<Hash> = Vec::new();
        let mut span = None;
        let mut is_next = false;

        if force_next_span {
            if let Some(next) = self.block_queue.get_next_span_if_scheduled() {
                log::debug!(
                    "{} Resuming download of next span {} ({} blocks)",
                    conn,
                    next.start_height,
                    next.nblocks
                );
                is_next = true;
                for hash in &next.hashes {
                    blocks.push(*hash);
                    ctx.requested_objects.insert(*hash);
                }
                self.block_queue.reset_next_span_time(Instant::now());
                span = Some((next.start_height, next.nblocks));
            }
        }

        if span.is_none() {
            if ctx.last_response_height + 1 < ctx.needed_objects.len() as u64 {
                log::error!(
                    "{} Inconsistent context: lrh {}, nos {}",
                    conn,
                    ctx.last_response_height,
                    ctx.needed_objects.len()
                );
                ctx.needed_objects.clear();
                ctx.last_response_height = 0;
                return None;
            }
            if self.skip_unneeded_hashes(ctx, false) > 0 && ctx.needed_objects.is_empty() && ctx.num_requested == 0 {
                return Some(self.nothing_to_request(conn, ctx));
            }

            let first_block_height = ctx.last_response_height + 1 - ctx.needed_objects.len() as u64;
            span = self.block_queue.reserve_span(
                first_block_height,
                ctx.last_response_height,
                self.config.block_download_max_count,
                conn.id(),
                ctx.remote_address.clone(),
                ctx.pruning_seed,
                ctx.remote_blockchain_height,
                &ctx.needed_objects,
                Instant::now(),
            );
        }

        if span.is_none() && !force_next_span {
            let next = self
                .block_queue
                .get_next_span_if_scheduled()
                .filter(|n| has_unpruned_block(n.start_height, ctx.remote_blockchain_height, ctx.pruning_seed));
            if let Some(next) = next {
                log::debug!("{} No span reserved, trying the scheduled head span instead", conn);
                is_next = true;
                for hash in &next.hashes {
                    blocks.push(*hash);
                    ctx.requested_objects.insert(*hash);
                    if let Some(pos) = ctx.needed_objects.iter().position(|n| n == hash) {
                        ctx.needed_objects.remove(pos);
                    }
                }
                span = Some((next.start_height, next.nblocks));
            }
        }

        let Some((start, nblocks)) = span else {
            let height = self.core.height();
            if height.max(self.block_queue.get_next_needed_height(height)) >= self.target_height() {
                log::debug!("{} No more spans to request, switching to normal", conn);
                ctx.state = ConnectionState::Normal;
                return Some(true);
            }
            log::debug!("{} Failed to reserve a span", conn);
            return Some(false);
        };

        if !is_next {
            let first_context_block_height = ctx.last_response_height + 1 - ctx.needed_objects.len() as u64;
            let Some(skip) = start
                .checked_sub(first_context_block_height)
                .map(|s| s as usize)
                .filter(|s| *s <= ctx.needed_objects.len())
            else {
                log::error!("{} Reserved span {} outside of the needed ids", conn, start);
                return Some(false);
            };
            ctx.needed_objects.drain(..skip);
            if (ctx.needed_objects.len() as u64) < nblocks {
                log::error!(
                    "{} Internal error: span size {} is larger than needed {}",
                    conn,
                    nblocks,
                    ctx.needed_objects.len()
                );
                return Some(false);
            }
            for hash in ctx.needed_objects.drain(..nblocks as usize) {
                blocks.push(hash);
                ctx.requested_objects.insert(hash);
            }
        }

        if ctx.pruning_seed != 0 {
            let peer_stripe = get_pruning_stripe(ctx.pruning_seed);
            let first_stripe = get_pruning_stripe_for_height(
                start,
                ctx.remote_blockchain_height,
                CRYPTONOTE_PRUNING_LOG_STRIPES,
            );
            let last_stripe = get_pruning_stripe_for_height(
                start + nblocks - 1,
                ctx.remote_blockchain_height,
                CRYPTONOTE_PRUNING_LOG_STRIPES,
            );
            if (first_stripe != 0 && peer_stripe != first_stripe) || (last_stripe != 0 && peer_stripe != last_stripe) {
                log::debug!("{} We need full data, but the peer does not have it, dropping peer", conn);
                return Some(false);
            }
        }

        ctx.last_request_time = Some(Instant::now());
        ctx.expected_height = Some(start);
        ctx.expect_response = NOTIFY_RESPONSE_GET_OBJECTS;
        ctx.num_requested += blocks.len() as u64;
        log::debug!(
            "{} -->>NOTIFY_REQUEST_GET_OBJECTS: blocks.size()={}, from {}",
            conn,
            blocks.len(),
            start
        );
        self.post_notify(conn, &RequestGetObjects { blocks, prune: false });
        Some(true)
    }

    fn request_chain_or_finish(&self, conn: &Connection, ctx: &mut ConnectionContext) -> bool {
        ctx.needed_objects.clear();

        if self.core.height() < self.target_height() {
            if let Some(_guard) = self.sync_lock.try_lock() {
                if self.block_queue.get_next_span(true).is_some() {
                    log::debug!("{} No other thread is adding blocks, resuming", conn);
                    ctx.state = ConnectionState::Standby;
                    let _ = conn.request_callback();
                    return true;
                }
            }
        }

        if ctx.last_response_height + 1 < ctx.remote_blockchain_height {
            self.request_chain(conn, ctx, true);
            return true;
        }

        ctx.state = ConnectionState::Normal;
        if ctx.remote_blockchain_height >= self.target_height() {
            if self.core.height() >= self.target_height() {
                self.on_connection_synchronized(Some((conn, &*ctx)));
            }
        } else {
            log::info!("{} we've reached this peer's blockchain height", conn);
        }
        true
    }

    // -------------------------------------------------------------------------
    // Adding downloaded blocks
    // -------------------------------------------------------------------------

    fn try_add_next_blocks(&self, conn: &Connection, ctx: &mut ConnectionContext) {
        let force_next_span = match self.add_queued_blocks(conn, ctx) {
            AddStep::Stop => return,
            AddStep::Request { force_next_span } => force_next_span,
        };
        if !self.request_missing_objects(conn, ctx, force_next_span) {
            log::error!("{} Failed to request missing objects, dropping connection", conn);
            self.drop_connection_with_score(conn, 0, false);
        }
    }

    /// Feeds filled spans to the core while holding the sync lock
    fn add_queued_blocks(&self, conn: &Connection, ctx: &mut ConnectionContext) -> AddStep {
        let Some(_guard) = self.sync_lock.try_lock() else {
            log::debug!("{} Failed to lock the sync lock, going back to download", conn);
            return AddStep::Request { force_next_span: false };
        };

        let mut added_any = false;
        loop {
            let previous_height = self.core.height();
            let Some(span) = self.block_queue.get_next_span(true) else {
                break;
            };
            let start_height = span.start_block_height;
            let span_conn = span.connection_id;

            let (Some(first), Some(last)) = (span.blocks.first(), span.blocks.last()) else {
                self.block_queue.remove_spans(span_conn, start_height);
                continue;
            };
            let (first_summary, last_summary) = match (self.core.parse_block(&first.block), self.core.parse_block(&last.block)) {
                (Ok(f), Ok(l)) => (f, l),
                _ => {
                    log::error!("{} Failed to parse queued block at height {}", conn, start_height);
                    self.block_queue.remove_spans(span_conn, start_height);
                    continue;
                }
            };

            if self.core.have_block(&last_summary.id) {
                log::debug!("{} These are old blocks, ignoring: blocks {} - {}", conn, start_height, last_summary.height);
                self.block_queue.remove_spans(span_conn, start_height);
                continue;
            }

            if !self.core.have_block(&first_summary.prev_id) {
                if !self.block_queue.requested(&first_summary.prev_id) {
                    if start_height > previous_height {
                        if self.should_drop_connection(conn, ctx, self.next_needed_pruning_stripe()) {
                            self.drop_connection_with_score(conn, 0, true);
                            return AddStep::Stop;
                        }
                        log::debug!("{} Got block at height {} with a gap, waiting", conn, start_height);
                        return AddStep::Request { force_next_span: false };
                    }
                    log::error!("{} Got block with unknown parent which was not requested, querying block hashes", conn);
                    self.block_queue.remove_spans(span_conn, start_height);
                    ctx.needed_objects.clear();
                    ctx.last_response_height = 0;
                    return AddStep::Request { force_next_span: false };
                }
                log::debug!("{} Got block with unknown parent which was requested, we'll get back to it", conn);
                break;
            }

            log::debug!("{} Adding {} blocks from height {}", conn, span.blocks.len(), start_height);
            added_any = true;
            let _batch = CoreBatch::start(self.core.as_ref(), span.blocks.len() as u64);
            for entry in &span.blocks {
                if self.is_stopping() {
                    return AddStep::Stop;
                }
                for tx in &entry.txs {
                    if self.core.handle_incoming_tx(tx, RelayMethod::Block).is_failure() {
                        log::error!("{} transaction verification failed on NOTIFY_RESPONSE_GET_OBJECTS, dropping connection", conn);
                        self.drop_connections(&span.origin);
                        self.drop_span_connection(span_conn, 0);
                        self.block_queue.remove_spans(span_conn, start_height);
                        return AddStep::Stop;
                    }
                }

                match self.core.handle_incoming_block(&entry.block, &entry.txs) {
                    Ok(VerificationOutcome::Accepted)
                    | Ok(VerificationOutcome::AltChain)
                    | Ok(VerificationOutcome::AlreadyExists) => {}
                    Ok(VerificationOutcome::Orphaned) => {
                        log::error!("{} Block received at sync phase was marked as orphaned, dropping connection", conn);
                        self.drop_connections(&span.origin);
                        self.drop_span_connection(span_conn, 1);
                        self.block_queue.remove_spans(span_conn, start_height);
                        return AddStep::Stop;
                    }
                    Ok(VerificationOutcome::Failed) | Err(_) => {
                        log::error!("{} Block verification failed, dropping connection", conn);
                        self.drop_connections(&span.origin);
                        self.drop_span_connection(span_conn, 1);
                        self.block_queue.remove_spans(span_conn, start_height);
                        return AddStep::Stop;
                    }
                }
            }
            self.block_queue.remove_spans(span_conn, start_height);

            let height = self.core.height();
            if height > previous_height {
                let target = self.target_height().max(height);
                let progress = if target > 0 { height as f64 * 100.0 / target as f64 } else { 100.0 };
                log::info!(
                    "{} Synced {}/{} ({:.1}%, {} left)",
                    conn,
                    height,
                    target,
                    progress,
                    target - height
                );
            }
        }

        if added_any {
            *self.last_add_end.lock() = Some(Instant::now());
        }

        if self.should_download_next_span(ctx, false) {
            return AddStep::Request { force_next_span: true };
        }
        if self.should_drop_connection(conn, ctx, self.next_needed_pruning_stripe()) {
            if !ctx.is_incoming {
                log::debug!("{} Dropping outgoing peer whose stripe is not needed", conn);
                self.drop_connection_with_score(conn, 0, false);
            }
            return AddStep::Stop;
        }
        AddStep::Request { force_next_span: false }
    }

    /// Whether this peer should take over the head span from its owner
    fn should_download_next_span(&self, ctx: &ConnectionContext, standby: bool) -> bool {
        let height = self.core.height();
        if ctx.remote_blockchain_height <= height {
            return false;
        }
        if !has_unpruned_block(height, ctx.remote_blockchain_height, ctx.pruning_seed) {
            return false;
        }
        let Some(next) = self.block_queue.has_next_span_at(height) else {
            log::debug!("{} we should download it as no peer reserved it", ctx.remote_address);
            return true;
        };
        if next.filled {
            return false;
        }

        let elapsed = next.time.elapsed();
        if elapsed >= self.config.request_next_scheduled_span_threshold {
            log::debug!("{} we should download it as it's not been received yet after {:?}", ctx.remote_address, elapsed);
            return true;
        }
        if standby && elapsed >= self.config.request_next_scheduled_span_threshold_standby {
            let Some(owner) = self.find_connection(next.connection_id) else {
                log::warn!("{} Peer downloading the next span is unexpectedly unknown", ctx.remote_address);
                return true;
            };
            let last_activity = owner.idle_time().min(elapsed);
            if last_activity > self.config.last_activity_stall_threshold {
                log::debug!(
                    "{} we should download it as the downloading peer is stalling for {:?}",
                    ctx.remote_address,
                    last_activity
                );
                return true;
            }
        }
        false
    }

    /// Whether a pruned peer is of no use for the stripe we need next
    fn should_drop_connection(&self, conn: &Connection, ctx: &ConnectionContext, next_stripe: u32) -> bool {
        if ctx.anchor || ctx.pruning_seed == 0 {
            return false;
        }
        let peer_stripe = get_pruning_stripe(ctx.pruning_seed);
        if next_stripe == peer_stripe {
            return false;
        }
        if !ctx.needed_objects.is_empty() {
            let next_available = (ctx.last_response_height + 1).saturating_sub(ctx.needed_objects.len() as u64);
            if has_unpruned_block(next_available, ctx.remote_blockchain_height, ctx.pruning_seed) {
                return false;
            }
        }
        if next_stripe == 0 {
            return false;
        }

        let mut n_out = usize::from(!ctx.is_incoming);
        let mut n_next = 0usize;
        self.peek_contexts(Some(conn.id()), |other| {
            if !other.is_incoming {
                n_out += 1;
            }
            if other.state >= ConnectionState::Synchronizing && other.pruning_stripe() == next_stripe {
                n_next += 1;
            }
        });

        let max_out = self.p2p().map_or(0, |p2p| p2p.max_out_peers(Zone::Public));
        let stripes = 1u32 << CRYPTONOTE_PRUNING_LOG_STRIPES;
        let distance = (peer_stripe + stripes - next_stripe) % stripes;
        if (n_out >= max_out && n_next == 0) || (distance > 1 && n_next <= 2) || distance > 2 {
            log::debug!(
                "{} we need stripe {}, peer has {}, {} out peers, {} with the next stripe",
                conn,
                next_stripe,
                peer_stripe,
                n_out,
                n_next
            );
            return true;
        }
        false
    }

    fn next_needed_pruning_stripe(&self) -> u32 {
        let height = self.core.height();
        let want = height.max(self.block_queue.get_next_needed_height(height));
        let chain_height = match self.target_height() {
            0 => CRYPTONOTE_MAX_BLOCK_NUMBER,
            h => h,
        };
        get_pruning_stripe_for_height(want, chain_height, CRYPTONOTE_PRUNING_LOG_STRIPES)
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Runs on the connection's writer task after `request_callback`
    pub fn on_callback(&self, conn: &Connection) {
        let mut ctx = conn.context();

        if std::mem::take(&mut ctx.idle_peer_notification) && ctx.state == ConnectionState::Synchronizing {
            if let Some(elapsed) = ctx.last_request_time.map(|t| t.elapsed()) {
                let idle = elapsed > self.config.idle_peer_kick_time
                    || (ctx.expect_response != 0 && elapsed > self.config.non_responsive_peer_kick_time);
                if idle {
                    let score = ctx.score;
                    ctx.score -= 1;
                    if score >= 0 {
                        log::info!(
                            "{} kicking idle peer, last update {:.1} seconds ago, expecting {}",
                            conn,
                            elapsed.as_secs_f32(),
                            ctx.expect_response
                        );
                        ctx.last_request_time = None;
                        ctx.clear_requests();
                        ctx.state = ConnectionState::Standby;
                    } else {
                        log::info!("{} dropping idle peer with negative score", conn);
                        let fail = if ctx.expect_response == 0 { 1 } else { 5 };
                        drop(ctx);
                        self.drop_connection_with_score(conn, fail, false);
                        return;
                    }
                }
            }
        }

        if ctx.state == ConnectionState::Synchronizing && ctx.last_request_time.is_none() {
            ctx.needed_objects.clear();
            self.request_chain(conn, &mut ctx, false);
        } else if ctx.state == ConnectionState::Standby {
            ctx.state = ConnectionState::Synchronizing;
            self.try_add_next_blocks(conn, &mut ctx);
        }
    }

    /// Recomputes the target height without the closed connection and
    /// releases its scheduled spans
    pub fn on_connection_close(&self, conn: &Connection) {
        let state = conn.context().state;

        let mut target = 0;
        if let Some(p2p) = self.p2p() {
            p2p.for_each_connection(&mut |other| {
                if other.id() != conn.id() {
                    let ctx = other.context();
                    if ctx.state >= ConnectionState::Synchronizing {
                        target = target.max(ctx.remote_blockchain_height);
                    }
                }
                true
            });
        }

        let previous = self.target_height();
        if target < previous {
            log::info!("Target height decreasing from {} to {}", previous, target);
            self.target_height.store(target, Ordering::SeqCst);
            if target == 0 && state > ConnectionState::HandshakePending && !self.is_stopping() {
                log::warn!("We are now disconnected from the network");
                self.ask_for_txpool_complement.store(true, Ordering::SeqCst);
            }
        }

        self.block_queue.flush_spans(conn.id(), false);
    }

    /// `current` is the connection whose context the caller holds, if any
    fn on_connection_synchronized(&self, current: Option<(&Connection, &ConnectionContext)>) {
        if self
            .synchronized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let height = self.core.height();
            match self.sync_start.lock().take() {
                Some((start, start_height)) => log::info!(
                    "SYNCHRONIZED OK: synced {} blocks in {:.1} seconds, height {}",
                    height.saturating_sub(start_height),
                    start.elapsed().as_secs_f32(),
                    height
                ),
                None => log::info!("SYNCHRONIZED OK: height {}", height),
            }
        }

        if self
            .ask_for_txpool_complement
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Some((conn, ctx)) = current {
            if ctx.state >= ConnectionState::Synchronizing {
                self.request_txpool_complement(conn);
                return;
            }
        }
        let skip = current.map(|(conn, _)| conn.id());
        let mut candidate = None;
        if let Some(p2p) = self.p2p() {
            p2p.for_each_connection(&mut |other| {
                if Some(other.id()) == skip {
                    return true;
                }
                match other.try_context() {
                    Some(ctx) if ctx.state >= ConnectionState::Synchronizing => {
                        candidate = Some(other.clone());
                        false
                    }
                    _ => true,
                }
            });
        }
        if let Some(conn) = candidate {
            self.request_txpool_complement(&conn);
        }
    }

    // -------------------------------------------------------------------------
    // Periodic work
    // -------------------------------------------------------------------------

    /// Drives the idle-peer kick, standby wakeups and sync search until
    /// `cancel` fires
    pub async fn run_idle_tasks(self: Arc<Self>, cancel: CancellationToken) {
        let mut kick = tokio::time::interval(IDLE_PEER_KICK_INTERVAL);
        let mut standby = tokio::time::interval(STANDBY_CHECK_INTERVAL);
        let mut search = tokio::time::interval(SYNC_SEARCH_INTERVAL);
        for timer in [&mut kick, &mut standby, &mut search] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = kick.tick() => self.kick_idle_peers(),
                _ = standby.tick() => self.check_standby_peers(),
                _ = search.tick() => self.update_sync_search(),
            }
        }
        log::debug!("Protocol idle tasks stopped");
    }

    /// Flags syncing peers that have not answered in time; the flag is
    /// acted upon in `on_callback`
    pub fn kick_idle_peers(&self) {
        let Some(p2p) = self.p2p() else { return };
        p2p.for_each_connection(&mut |conn| {
            let flagged = {
                let mut ctx = conn.context();
                let stale = ctx.state == ConnectionState::Synchronizing
                    && ctx.last_request_time.is_some_and(|t| {
                        let elapsed = t.elapsed();
                        elapsed > self.config.idle_peer_kick_time
                            || (ctx.expect_response != 0 && elapsed > self.config.non_responsive_peer_kick_time)
                    });
                if stale {
                    ctx.idle_peer_notification = true;
                }
                stale
            };
            if flagged {
                let _ = conn.request_callback();
            }
            true
        });
    }

    pub fn check_standby_peers(&self) {
        let Some(p2p) = self.p2p() else { return };
        p2p.for_each_connection(&mut |conn| {
            if conn.context().state == ConnectionState::Standby {
                let _ = conn.request_callback();
            }
            true
        });
    }

    /// Drops one outgoing peer we are in sync with when every outgoing slot
    /// is taken by such peers, so that new peers can be tried
    pub fn update_sync_search(&self) {
        if !self.is_synchronized() {
            return;
        }
        let Some(p2p) = self.p2p() else { return };
        let target = self.target_height();

        let mut outgoing: HashMap<Zone, usize> = HashMap::new();
        let mut synced: HashMap<Zone, Vec<Connection>> = HashMap::new();
        p2p.for_each_connection(&mut |conn| {
            let ctx = conn.context();
            if !ctx.is_handshaked() || ctx.is_incoming || ctx.anchor {
                return true;
            }
            let zone = conn.remote_address().zone();
            *outgoing.entry(zone).or_default() += 1;
            if ctx.remote_blockchain_height >= target && ctx.state == ConnectionState::Normal {
                synced.entry(zone).or_default().push(conn.clone());
            }
            true
        });

        for (zone, count) in outgoing {
            let max_out = p2p.max_out_peers(zone);
            let synced = synced.remove(&zone).unwrap_or_default();
            if count < max_out || synced.len() < self.config.sync_search_connections_count {
                continue;
            }
            if synced.len() == count {
                let index = rand::random::<usize>() % synced.len();
                log::info!("{} dropping synced peer to search for new ones", synced[index]);
                self.drop_connection_with_score(&synced[index], 0, false);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Relay
    // -------------------------------------------------------------------------

    /// Sends a freshly accepted block to every handshaked public peer but
    /// `source`: compact to fluffy-capable peers, complete to the others
    pub fn relay_block(&self, arg: NotifyNewBlock, source: Uuid) -> bool {
        let Some(p2p) = self.p2p() else { return false };

        let mut fluffy = Vec::new();
        let mut full = Vec::new();
        p2p.for_each_connection(&mut |conn| {
            if conn.id() == source || conn.remote_address().zone() != Zone::Public {
                return true;
            }
            let (handshaked, flags) = {
                let ctx = conn.context();
                (ctx.state > ConnectionState::HandshakePending, ctx.support_flags)
            };
            if handshaked {
                if self.config.relay_fluffy_blocks && flags & P2P_SUPPORT_FLAG_FLUFFY_BLOCKS != 0 {
                    fluffy.push(conn.id());
                } else {
                    full.push(conn.id());
                }
            }
            true
        });

        let mut relayed = false;
        if !fluffy.is_empty() {
            let compact = NotifyNewFluffyBlock {
                block: BlockCompleteEntry {
                    block: arg.block.block.clone(),
                    txs: Vec::new(),
                },
                current_blockchain_height: arg.current_blockchain_height,
            };
            match encode_payload(&compact) {
                Ok(payload) => {
                    relayed |= p2p.relay_notify_to_list(NOTIFY_NEW_FLUFFY_BLOCK, payload, &fluffy)
                }
                Err(e) => log::error!("Failed to encode fluffy block: {}", e),
            }
        }
        if !full.is_empty() {
            match encode_payload(&arg) {
                Ok(payload) => relayed |= p2p.relay_notify_to_list(NOTIFY_NEW_BLOCK, payload, &full),
                Err(e) => log::error!("Failed to encode block: {}", e),
            }
        }
        log::debug!("Relayed block to {} fluffy and {} full peers", fluffy.len(), full.len());
        relayed
    }

    pub fn relay_transactions(&self, txs: Vec<Vec<u8>>, source: Uuid, zone: Zone, relay: RelayMethod) -> bool {
        match self.p2p() {
            Some(p2p) => p2p.send_txs(txs, zone, source, relay),
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Scoring and dropping
    // -------------------------------------------------------------------------

    /// Charges the peer; returns true when it was dropped for it
    pub fn hit_score(&self, conn: &Connection, ctx: &mut ConnectionContext, score: i64) -> bool {
        if score <= 0 {
            log::error!("{} Negative score hit", conn);
            return false;
        }
        ctx.score -= score;
        if ctx.score <= self.config.drop_peers_on_score {
            log::info!("{} Score {} reached the drop threshold", conn, ctx.score);
            self.drop_connection_with_score(conn, 5, false);
            return true;
        }
        false
    }

    /// Closes the connection, charging its host `score` and releasing its
    /// spans. Never locks a connection context.
    pub fn drop_connection_with_score(&self, conn: &Connection, score: u64, flush_all_spans: bool) {
        log::debug!(
            "{} dropping connection id {} (score {}), flush_all_spans {}",
            conn,
            conn.id(),
            score,
            flush_all_spans
        );
        if let Some(p2p) = self.p2p() {
            if score > 0 {
                p2p.add_host_fail(conn.remote_address(), score);
            }
            p2p.drop_connection(conn);
        } else {
            conn.close();
        }
        self.block_queue.flush_spans(conn.id(), flush_all_spans);
    }

    /// Drops every connection to the host at `address`
    fn drop_connections(&self, address: &NetworkAddress) {
        let Some(p2p) = self.p2p() else { return };
        p2p.add_host_fail(address, 5);
        let mut targets = Vec::new();
        p2p.for_each_connection(&mut |conn| {
            if conn.remote_address().is_same_host(address) {
                targets.push(conn.clone());
            }
            true
        });
        for conn in targets {
            self.drop_connection_with_score(&conn, 1, true);
        }
    }

    fn drop_span_connection(&self, id: Uuid, score: u64) {
        let Some(p2p) = self.p2p() else { return };
        let found = p2p.for_connection(id, &mut |conn| self.drop_connection_with_score(conn, score, true));
        if !found {
            self.block_queue.flush_spans(id, true);
        }
    }

    fn find_connection(&self, id: Uuid) -> Option<Connection> {
        let p2p = self.p2p()?;
        let mut found = None;
        p2p.for_connection(id, &mut |conn| found = Some(conn.clone()));
        found
    }

    fn live_connection_ids(&self) -> HashSet<Uuid> {
        let mut ids = HashSet::new();
        if let Some(p2p) = self.p2p() {
            p2p.for_each_connection(&mut |conn| {
                ids.insert(conn.id());
                true
            });
        }
        ids
    }

    /// Visits the contexts that are not locked elsewhere, except `skip`
    fn peek_contexts(&self, skip: Option<Uuid>, mut f: impl FnMut(&ConnectionContext)) {
        let Some(p2p) = self.p2p() else { return };
        p2p.for_each_connection(&mut |conn| {
            if Some(conn.id()) != skip {
                if let Some(ctx) = conn.try_context() {
                    f(&ctx);
                }
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryCore;
    use crate::levin::LEVIN_DEFAULT_MAX_PACKET_SIZE;
    use crate::net::{CommandHandler, ConnectionConfig};
    use tokio::io::duplex;

    /// Routes a connection's traffic into a protocol handler
    struct Wire(Arc<ProtocolHandler>);

    impl CommandHandler for Wire {
        fn on_invoke(&self, _: &Connection, command: u32, _: &[u8]) -> Result<Bytes, HandlerError> {
            Err(HandlerError::NotHandled(command))
        }

        fn on_notify(&self, conn: &Connection, command: u32, payload: &[u8]) -> Result<(), HandlerError> {
            self.0.handle_notify(conn, command, payload)
        }

        fn on_callback(&self, conn: &Connection) {
            self.0.on_callback(conn);
        }

        fn on_close(&self, conn: &Connection) {
            self.0.on_connection_close(conn);
        }
    }

    /// Remembers every notification it receives
    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(u32, Vec<u8>)>>,
    }

    impl Recorder {
        fn commands(&self) -> Vec<u32> {
            self.received.lock().iter().map(|(c, _)| *c).collect()
        }

        fn last<T: serde::de::DeserializeOwned>(&self, command: u32) -> Option<T> {
            let received = self.received.lock();
            let (_, payload) = received.iter().rev().find(|(c, _)| *c == command)?;
            decode_payload(payload).ok()
        }
    }

    impl CommandHandler for Recorder {
        fn on_invoke(&self, _: &Connection, command: u32, _: &[u8]) -> Result<Bytes, HandlerError> {
            Err(HandlerError::NotHandled(command))
        }

        fn on_notify(&self, _: &Connection, command: u32, payload: &[u8]) -> Result<(), HandlerError> {
            self.received.lock().push((command, payload.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockP2p {
        conns: Mutex<Vec<Connection>>,
        dropped: Mutex<Vec<Uuid>>,
        fails: Mutex<Vec<(String, u64)>>,
        relayed: Mutex<Vec<(u32, Vec<Uuid>)>>,
        sent_txs: Mutex<Vec<(usize, Uuid, RelayMethod)>>,
    }

    impl P2pEndpoint for MockP2p {
        fn for_each_connection(&self, f: &mut dyn FnMut(&Connection) -> bool) {
            let conns = self.conns.lock().clone();
            for conn in &conns {
                if !f(conn) {
                    break;
                }
            }
        }

        fn for_connection(&self, id: Uuid, f: &mut dyn FnMut(&Connection)) -> bool {
            let conn = self.conns.lock().iter().find(|c| c.id() == id).cloned();
            match conn {
                Some(conn) => {
                    f(&conn);
                    true
                }
                None => false,
            }
        }

        fn relay_notify_to_list(&self, command: u32, payload: Bytes, targets: &[Uuid]) -> bool {
            self.relayed.lock().push((command, targets.to_vec()));
            let conns = self.conns.lock().clone();
            for conn in conns.iter().filter(|c| targets.contains(&c.id())) {
                let _ = conn.notify(command, payload.clone());
            }
            true
        }

        fn send_txs(&self, txs: Vec<Vec<u8>>, _zone: Zone, source: Uuid, relay: RelayMethod) -> bool {
            self.sent_txs.lock().push((txs.len(), source, relay));
            true
        }

        fn drop_connection(&self, conn: &Connection) {
            self.dropped.lock().push(conn.id());
            self.conns.lock().retain(|c| c.id() != conn.id());
            conn.close();
        }

        fn add_host_fail(&self, address: &NetworkAddress, score: u64) {
            self.fails.lock().push((address.host_str(), score));
        }

        fn max_out_peers(&self, _zone: Zone) -> usize {
            8
        }
    }

    struct Node {
        core: Arc<MemoryCore>,
        handler: Arc<ProtocolHandler>,
        p2p: Arc<MockP2p>,
    }

    fn node(core: MemoryCore) -> Node {
        let core = Arc::new(core);
        let handler = Arc::new(ProtocolHandler::new(core.clone(), ProtocolConfig::default()));
        let p2p = Arc::new(MockP2p::default());
        let endpoint: Arc<dyn P2pEndpoint> = p2p.clone();
        handler.set_p2p(Arc::downgrade(&endpoint));
        Node { core, handler, p2p }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            max_packet_size: LEVIN_DEFAULT_MAX_PACKET_SIZE,
            ..ConnectionConfig::default()
        }
    }

    /// Connects `node` to a recording peer; returns (node side, peer side)
    fn connect_recorder(node: &Node, recorder: Arc<Recorder>) -> (Connection, Connection) {
        let (left, right) = duplex(1 << 20);
        let local = Connection::spawn(
            left,
            "8.8.4.4:18080".parse().unwrap(),
            false,
            Arc::new(Wire(node.handler.clone())),
            config(),
        );
        let remote = Connection::spawn(right, "8.8.8.8:5555".parse().unwrap(), true, recorder, config());
        local.context().peer_id = Some(1);
        node.p2p.conns.lock().push(local.clone());
        (local, remote)
    }

    fn connect_nodes(a: &Node, b: &Node) -> (Connection, Connection) {
        let (left, right) = duplex(1 << 22);
        let on_a = Connection::spawn(
            left,
            "9.9.9.2:18080".parse().unwrap(),
            true,
            Arc::new(Wire(a.handler.clone())),
            config(),
        );
        let on_b = Connection::spawn(
            right,
            "9.9.9.1:18080".parse().unwrap(),
            false,
            Arc::new(Wire(b.handler.clone())),
            config(),
        );
        on_a.context().peer_id = Some(2);
        on_b.context().peer_id = Some(1);
        a.p2p.conns.lock().push(on_a.clone());
        b.p2p.conns.lock().push(on_b.clone());
        (on_a, on_b)
    }

    fn set_normal(handler: &ProtocolHandler, conn: &Connection) {
        conn.context().state = ConnectionState::Normal;
        handler.synchronized.store(true, Ordering::SeqCst);
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_payload_sync_data_matches_core() {
        let node = node(MemoryCore::new());
        node.core.mine_blocks(3, 10).unwrap();
        let data = node.handler.get_payload_sync_data();
        assert_eq!(data.current_height, 4);
        assert_eq!(data.top_id, node.core.top_block_hash());
        assert_eq!(data.cumulative_difficulty, node.core.cumulative_difficulty());
        assert_eq!(data.pruning_seed, 0);
    }

    #[test]
    fn test_fail_scores() {
        assert_eq!(dropped("x").fail_score(), 0);
        assert_eq!(violation("x").fail_score(), 1);
        assert_eq!(misbehaving("x", 5).fail_score(), 5);
    }

    #[tokio::test]
    async fn test_known_top_switches_to_normal() {
        let node = node(MemoryCore::new());
        let recorder = Arc::new(Recorder::default());
        let (local, _remote) = connect_recorder(&node, recorder);

        let data = node.handler.get_payload_sync_data();
        node.handler.process_payload_sync_data(&local, &data, true).unwrap();
        assert_eq!(local.context().state, ConnectionState::Normal);
        assert!(node.handler.is_synchronized());
        assert_eq!(node.handler.target_height(), 1);
    }

    #[tokio::test]
    async fn test_unknown_heavier_top_starts_sync() {
        let node = node(MemoryCore::new());
        let recorder = Arc::new(Recorder::default());
        let (local, _remote) = connect_recorder(&node, recorder.clone());

        let data = CoreSyncData {
            current_height: 50,
            cumulative_difficulty: 1_000,
            top_id: Hash::digest(b"elsewhere"),
            top_version: 1,
            pruning_seed: 0,
        };
        node.handler.process_payload_sync_data(&local, &data, true).unwrap();
        assert_eq!(node.handler.target_height(), 50);
        assert!(!node.handler.is_synchronized());

        // the callback asks for a chain entry
        eventually(|| recorder.commands().contains(&NOTIFY_REQUEST_CHAIN)).await;
        let request: RequestChain = recorder.last(NOTIFY_REQUEST_CHAIN).unwrap();
        assert_eq!(request.block_ids.last(), Some(&MemoryCore::genesis_hash()));
        let ctx = local.context();
        assert_eq!(ctx.state, ConnectionState::Synchronizing);
        assert_eq!(ctx.expect_response, NOTIFY_RESPONSE_CHAIN_ENTRY);
        assert_eq!(ctx.remote_blockchain_height, 50);
    }

    #[tokio::test]
    async fn test_invalid_pruning_seed_rejected() {
        let node = node(MemoryCore::new());
        let (local, _remote) = connect_recorder(&node, Arc::new(Recorder::default()));
        let data = CoreSyncData {
            pruning_seed: 0xdead_beef,
            ..node.handler.get_payload_sync_data()
        };
        let err = node.handler.process_payload_sync_data(&local, &data, true).unwrap_err();
        assert!(matches!(err, ProtocolError::Violation(_)));
    }

    #[tokio::test]
    async fn test_too_many_objects_requested_drops() {
        let node = node(MemoryCore::new());
        let (local, remote) = connect_recorder(&node, Arc::new(Recorder::default()));
        set_normal(&node.handler, &local);

        let request = RequestGetObjects {
            blocks: vec![Hash::NULL; CURRENCY_PROTOCOL_MAX_OBJECT_REQUEST_COUNT + 1],
            prune: false,
        };
        remote.notify_command(&request).unwrap();
        eventually(|| node.p2p.dropped.lock().contains(&local.id())).await;
        assert!(node.p2p.fails.lock().is_empty());
    }

    #[tokio::test]
    async fn test_get_objects_served() {
        let node = node(MemoryCore::new());
        let ids = node.core.mine_blocks(2, 10).unwrap();
        let recorder = Arc::new(Recorder::default());
        let (local, remote) = connect_recorder(&node, recorder.clone());
        set_normal(&node.handler, &local);

        let unknown = Hash::digest(b"unknown");
        remote
            .notify_command(&RequestGetObjects {
                blocks: vec![ids[0], unknown, ids[1]],
                prune: false,
            })
            .unwrap();
        eventually(|| recorder.commands().contains(&NOTIFY_RESPONSE_GET_OBJECTS)).await;
        let response: ResponseGetObjects = recorder.last(NOTIFY_RESPONSE_GET_OBJECTS).unwrap();
        assert_eq!(response.blocks.len(), 2);
        assert_eq!(response.missed_ids, vec![unknown]);
        assert_eq!(response.current_blockchain_height, 3);
    }

    #[tokio::test]
    async fn test_unexpected_chain_entry_drops() {
        let node = node(MemoryCore::new());
        let (local, remote) = connect_recorder(&node, Arc::new(Recorder::default()));
        set_normal(&node.handler, &local);

        remote
            .notify_command(&ResponseChainEntry {
                start_height: 0,
                total_height: 1,
                cumulative_difficulty: 1,
                block_ids: vec![MemoryCore::genesis_hash()],
            })
            .unwrap();
        eventually(|| node.p2p.dropped.lock().contains(&local.id())).await;
        assert_eq!(node.p2p.fails.lock().as_slice(), &[("8.8.4.4".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_duplicate_transactions_drop() {
        let node = node(MemoryCore::new());
        let (local, remote) = connect_recorder(&node, Arc::new(Recorder::default()));
        set_normal(&node.handler, &local);

        remote
            .notify_command(&NotifyNewTransactions {
                txs: vec![b"tx".to_vec(), b"tx".to_vec()],
                dandelionpp_fluff: true,
            })
            .unwrap();
        eventually(|| node.p2p.dropped.lock().contains(&local.id())).await;
        assert_eq!(node.core.pool_size(), 0);
    }

    #[tokio::test]
    async fn test_new_transactions_relayed_as_stem() {
        let node = node(MemoryCore::new());
        let (local, remote) = connect_recorder(&node, Arc::new(Recorder::default()));
        set_normal(&node.handler, &local);

        remote
            .notify_command(&NotifyNewTransactions {
                txs: vec![b"tx-1".to_vec(), b"tx-2".to_vec()],
                dandelionpp_fluff: false,
            })
            .unwrap();
        eventually(|| !node.p2p.sent_txs.lock().is_empty()).await;
        assert_eq!(node.p2p.sent_txs.lock()[0], (2, local.id(), RelayMethod::Stem));
        assert_eq!(node.core.pool_size(), 2);
    }

    #[tokio::test]
    async fn test_transactions_ignored_while_syncing() {
        let node = node(MemoryCore::new());
        let (local, remote) = connect_recorder(&node, Arc::new(Recorder::default()));
        local.context().state = ConnectionState::Normal;

        remote
            .notify_command(&NotifyNewTransactions {
                txs: vec![b"tx-1".to_vec()],
                dandelionpp_fluff: true,
            })
            .unwrap();
        eventually(|| local.stats().frames_in >= 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.core.pool_size(), 0);
        assert!(node.p2p.sent_txs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fluffy_block_requests_missing_txs() {
        let node = node(MemoryCore::new());
        let recorder = Arc::new(Recorder::default());
        let (local, remote) = connect_recorder(&node, recorder.clone());
        set_normal(&node.handler, &local);

        let tx = b"fluffy-tx".to_vec();
        let entry = MemoryCore::build_block_on(MemoryCore::genesis_hash(), 1, 5, 0, vec![tx.clone()]).unwrap();
        remote
            .notify_command(&NotifyNewFluffyBlock {
                block: BlockCompleteEntry {
                    block: entry.block.clone(),
                    txs: Vec::new(),
                },
                current_blockchain_height: 2,
            })
            .unwrap();

        eventually(|| recorder.commands().contains(&NOTIFY_REQUEST_FLUFFY_MISSING_TX)).await;
        let request: RequestFluffyMissingTx = recorder.last(NOTIFY_REQUEST_FLUFFY_MISSING_TX).unwrap();
        assert_eq!(request.missing_tx_indices, vec![0]);
        assert_eq!(request.block_hash, Hash::digest(&entry.block));
        assert_eq!(node.core.height(), 1);

        remote
            .notify_command(&NotifyNewFluffyBlock {
                block: entry.clone(),
                current_blockchain_height: 2,
            })
            .unwrap();
        eventually(|| node.core.height() == 2).await;
        assert_eq!(node.core.top_block_hash(), Hash::digest(&entry.block));
    }

    #[tokio::test]
    async fn test_fluffy_missing_tx_out_of_bounds_drops() {
        let node = node(MemoryCore::new());
        node.core.handle_incoming_tx(b"pool-tx", RelayMethod::Local);
        let ids = node.core.mine_blocks(1, 10).unwrap();
        let (local, remote) = connect_recorder(&node, Arc::new(Recorder::default()));
        set_normal(&node.handler, &local);

        remote
            .notify_command(&RequestFluffyMissingTx {
                block_hash: ids[0],
                current_blockchain_height: 2,
                missing_tx_indices: vec![3],
            })
            .unwrap();
        eventually(|| node.p2p.dropped.lock().contains(&local.id())).await;
    }

    #[tokio::test]
    async fn test_hit_score_drops_at_threshold() {
        let node = node(MemoryCore::new());
        let (local, _remote) = connect_recorder(&node, Arc::new(Recorder::default()));

        let mut ctx = local.context();
        assert!(!node.handler.hit_score(&local, &mut ctx, 1));
        assert!(node.handler.hit_score(&local, &mut ctx, 1));
        drop(ctx);
        assert_eq!(node.p2p.dropped.lock().as_slice(), &[local.id()]);
        assert_eq!(node.p2p.fails.lock()[0].1, 5);
    }

    #[tokio::test]
    async fn test_connection_close_lowers_target() {
        let node = node(MemoryCore::new());
        let (local, _remote) = connect_recorder(&node, Arc::new(Recorder::default()));
        {
            let mut ctx = local.context();
            ctx.state = ConnectionState::Normal;
            ctx.remote_blockchain_height = 40;
        }
        node.handler.raise_target(40);
        node.handler.ask_for_txpool_complement.store(false, Ordering::SeqCst);

        node.handler.on_connection_close(&local);
        assert_eq!(node.handler.target_height(), 0);
        assert!(node.handler.ask_for_txpool_complement.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_relay_block_splits_fluffy_and_full() {
        let node = node(MemoryCore::new());
        let fluffy_peer = Arc::new(Recorder::default());
        let full_peer = Arc::new(Recorder::default());
        let (fluffy_conn, _r1) = connect_recorder(&node, fluffy_peer.clone());
        let (full_conn, _r2) = connect_recorder(&node, full_peer.clone());
        let (source, _r3) = connect_recorder(&node, Arc::new(Recorder::default()));
        for conn in [&fluffy_conn, &full_conn, &source] {
            conn.context().state = ConnectionState::Normal;
        }
        fluffy_conn.context().support_flags = P2P_SUPPORT_FLAG_FLUFFY_BLOCKS;

        let entry = node.core.build_block(5, 1, vec![b"tx".to_vec()]).unwrap();
        let relayed = node.handler.relay_block(
            NotifyNewBlock {
                block: entry,
                current_blockchain_height: 2,
            },
            source.id(),
        );
        assert!(relayed);

        eventually(|| fluffy_peer.commands() == vec![NOTIFY_NEW_FLUFFY_BLOCK]).await;
        eventually(|| full_peer.commands() == vec![NOTIFY_NEW_BLOCK]).await;
        let compact: NotifyNewFluffyBlock = fluffy_peer.last(NOTIFY_NEW_FLUFFY_BLOCK).unwrap();
        assert!(compact.block.txs.is_empty());
        let full: NotifyNewBlock = full_peer.last(NOTIFY_NEW_BLOCK).unwrap();
        assert_eq!(full.block.txs.len(), 1);
    }

    #[tokio::test]
    async fn test_two_nodes_synchronize() {
        let a = node(MemoryCore::new());
        a.core.mine_blocks(9, 10).unwrap();
        let b = node(MemoryCore::new());
        let (on_a, on_b) = connect_nodes(&a, &b);

        a.handler
            .process_payload_sync_data(&on_a, &b.handler.get_payload_sync_data(), true)
            .unwrap();
        b.handler
            .process_payload_sync_data(&on_b, &a.handler.get_payload_sync_data(), true)
            .unwrap();
        assert_eq!(on_a.context().state, ConnectionState::Normal);
        assert_eq!(b.handler.target_height(), 10);

        eventually(|| b.core.height() == 10).await;
        assert_eq!(b.core.top_block_hash(), a.core.top_block_hash());
        eventually(|| b.handler.is_synchronized()).await;
        eventually(|| on_b.context().state == ConnectionState::Normal).await;
        assert!(b.handler.block_queue().is_empty());
        assert!(b.p2p.dropped.lock().is_empty());
        assert!(b.core.batch_count() >= 1);
        assert!(!b.core.is_batch_open());
    }

    #[tokio::test]
    async fn test_spans_arriving_out_of_order_are_added_in_height_order() {
        let a = node(MemoryCore::new());
        let hashes = a.core.mine_blocks(9, 10).unwrap();
        let (blocks, missed) = a.core.get_blocks_by_hashes(&hashes);
        assert!(missed.is_empty());

        let b = node(MemoryCore::new());
        let (local, _remote) = connect_recorder(&b, Arc::new(Recorder::default()));
        let origin = local.remote_address().clone();
        let queue = b.handler.block_queue();

        // the upper span waits for its parent
        queue.add_blocks(5, blocks[4..].to_vec(), local.id(), origin.clone(), 0.0, 0);
        {
            let mut ctx = local.context();
            b.handler.add_queued_blocks(&local, &mut ctx);
        }
        assert_eq!(b.core.height(), 1);
        assert_eq!(queue.get_num_filled_spans(), 1);
        assert_eq!(b.core.batch_count(), 0);

        queue.add_blocks(1, blocks[..4].to_vec(), local.id(), origin, 0.0, 0);
        {
            let mut ctx = local.context();
            b.handler.add_queued_blocks(&local, &mut ctx);
        }
        assert_eq!(b.core.height(), 10);
        assert_eq!(b.core.top_block_hash(), a.core.top_block_hash());
        assert_eq!(b.core.alt_block_count(), 0);
        assert!(queue.is_empty());
        // one batch per span, so neither span went to the core twice
        assert_eq!(b.core.batch_count(), 2);
        assert!(!b.core.is_batch_open());
        assert!(b.p2p.dropped.lock().is_empty());
    }

    #[tokio::test]
    async fn test_span_of_closed_connection_is_reserved_again() {
        let a = node(MemoryCore::new());
        let hashes = a.core.mine_blocks(6, 10).unwrap();

        let b = node(MemoryCore::new());
        let (first, _first_remote) = connect_recorder(&b, Arc::new(Recorder::default()));
        let (second, _second_remote) = connect_recorder(&b, Arc::new(Recorder::default()));
        let queue = b.handler.block_queue();
        let reserve = |conn: &Connection| {
            queue.reserve_span(1, 6, 4, conn.id(), conn.remote_address().clone(), 0, 1, &hashes, Instant::now())
        };

        assert_eq!(reserve(&first), Some((1, 4)));
        assert_eq!(reserve(&second), Some((5, 2)));

        b.handler.on_connection_close(&first);
        assert!(!queue.has_spans(first.id()));
        assert_eq!(reserve(&second), Some((1, 4)));
        assert_eq!(queue.get_num_spans(), 2);
    }
}
