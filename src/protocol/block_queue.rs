//! Block queue
//!
//! Spans of consecutive heights, either scheduled (requested from one
//! connection, no data yet) or filled (downloaded, waiting to be added to
//! the chain). Spans are kept sorted by start height; the first span is the
//! next one the chain needs.

use super::pruning::{get_next_unpruned_block_height, has_unpruned_block, CRYPTONOTE_PRUNING_STRIPE_SIZE};
use crate::core::BlockCompleteEntry;
use crate::crypto::Hash;
use crate::net::NetworkAddress;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

/// A run of heights owned by one connection
#[derive(Debug, Clone)]
pub struct Span {
    pub start_block_height: u64,
    pub nblocks: u64,
    pub blocks: Vec<BlockCompleteEntry>,
    pub hashes: Vec<Hash>,
    pub connection_id: Uuid,
    pub origin: NetworkAddress,
    /// Bytes per second at which the data arrived
    pub rate: f32,
    pub size: usize,
    pub time: Instant,
}

impl Span {
    pub fn is_filled(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn last_height(&self) -> u64 {
        self.start_block_height + self.nblocks - 1
    }
}

/// The head span as seen by `get_next_span_if_scheduled` / `has_next_span`
#[derive(Debug, Clone)]
pub struct NextSpan {
    pub start_height: u64,
    pub nblocks: u64,
    pub filled: bool,
    pub connection_id: Uuid,
    pub hashes: Vec<Hash>,
    pub time: Instant,
}

#[derive(Debug, Default)]
struct Queue {
    spans: Vec<Span>,
    requested_hashes: HashSet<Hash>,
    have_blocks: HashMap<Hash, u64>,
}

impl Queue {
    fn insert(&mut self, span: Span) {
        let pos = self
            .spans
            .partition_point(|s| s.start_block_height <= span.start_block_height);
        self.spans.insert(pos, span);
    }

    fn erase(&mut self, index: usize) -> Span {
        let span = self.spans.remove(index);
        for hash in &span.hashes {
            self.requested_hashes.remove(hash);
            self.have_blocks.remove(hash);
        }
        span
    }

    fn erase_where(&mut self, mut f: impl FnMut(&Span) -> bool) {
        let mut i = 0;
        while i < self.spans.len() {
            if f(&self.spans[i]) {
                self.erase(i);
            } else {
                i += 1;
            }
        }
    }

    fn remove_span(&mut self, start_height: u64) -> Option<Vec<Hash>> {
        let index = self
            .spans
            .iter()
            .position(|s| s.start_block_height == start_height)?;
        Some(self.erase(index).hashes)
    }

    fn set_span_hashes(&mut self, start_height: u64, connection_id: Uuid, hashes: Vec<Hash>) {
        let Some(index) = self
            .spans
            .iter()
            .position(|s| s.start_block_height == start_height && s.connection_id == connection_id)
        else {
            return;
        };
        let mut span = self.erase(index);
        for hash in &hashes {
            self.requested_hashes.insert(*hash);
        }
        span.hashes = hashes;
        self.insert(span);
    }
}

/// Shared download queue of the sync state machine
#[derive(Debug, Default)]
pub struct BlockQueue {
    inner: Mutex<Queue>,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores downloaded blocks, replacing the scheduled span at `height`
    pub fn add_blocks(
        &self,
        height: u64,
        blocks: Vec<BlockCompleteEntry>,
        connection_id: Uuid,
        origin: NetworkAddress,
        rate: f32,
        size: usize,
    ) {
        let mut queue = self.inner.lock();
        let hashes = queue.remove_span(height);
        queue.insert(Span {
            start_block_height: height,
            nblocks: blocks.len() as u64,
            blocks,
            hashes: Vec::new(),
            connection_id,
            origin,
            rate,
            size,
            time: Instant::now(),
        });
        if let Some(hashes) = hashes {
            for (i, hash) in hashes.iter().enumerate() {
                queue.requested_hashes.insert(*hash);
                queue.have_blocks.insert(*hash, height + i as u64);
            }
            queue.set_span_hashes(height, connection_id, hashes);
        }
    }

    /// Adds an empty span scheduled on `connection_id`
    pub fn schedule(&self, height: u64, nblocks: u64, connection_id: Uuid, origin: NetworkAddress, time: Instant) {
        if nblocks == 0 {
            return;
        }
        self.inner.lock().insert(Span {
            start_block_height: height,
            nblocks,
            blocks: Vec::new(),
            hashes: Vec::new(),
            connection_id,
            origin,
            rate: 0.0,
            size: 0,
            time,
        });
    }

    /// Drops the connection's scheduled spans, or all of its spans
    pub fn flush_spans(&self, connection_id: Uuid, all: bool) {
        self.inner
            .lock()
            .erase_where(|s| s.connection_id == connection_id && (all || !s.is_filled()));
    }

    /// Drops scheduled spans owned by connections that are gone
    pub fn flush_stale_spans(&self, live_connections: &HashSet<Uuid>) {
        self.inner
            .lock()
            .erase_where(|s| !s.is_filled() && !live_connections.contains(&s.connection_id));
    }

    pub fn remove_span(&self, start_height: u64) -> bool {
        self.inner.lock().remove_span(start_height).is_some()
    }

    /// Drops the connection's spans starting at or below `start_height`
    pub fn remove_spans(&self, connection_id: Uuid, start_height: u64) {
        self.inner
            .lock()
            .erase_where(|s| s.connection_id == connection_id && s.start_block_height <= start_height);
    }

    pub fn get_max_block_height(&self) -> u64 {
        self.inner
            .lock()
            .spans
            .iter()
            .map(Span::last_height)
            .max()
            .unwrap_or(0)
    }

    /// First height above the chain that is neither scheduled nor downloaded
    /// as part of an unbroken run
    pub fn get_next_needed_height(&self, blockchain_height: u64) -> u64 {
        let queue = self.inner.lock();
        let mut last_needed = blockchain_height;
        let mut first = true;
        for span in &queue.spans {
            if span.last_height() < blockchain_height {
                continue;
            }
            if span.start_block_height != last_needed || (first && !span.is_filled()) {
                return last_needed;
            }
            last_needed = span.start_block_height + span.nblocks;
            first = false;
        }
        last_needed
    }

    /// One character per span: `.` scheduled, `o` filled, `m` filled and
    /// next to apply, `<` already below the chain, `_` for gaps
    pub fn get_overview(&self, blockchain_height: u64) -> String {
        let queue = self.inner.lock();
        if queue.spans.is_empty() {
            return "[]".to_string();
        }
        let mut s = String::from("[");
        let mut expected = blockchain_height;
        for span in &queue.spans {
            if expected > span.start_block_height {
                s.push('<');
                continue;
            }
            if expected < span.start_block_height {
                let gap = ((span.start_block_height - expected) / span.nblocks.max(1)).max(1);
                s.extend(std::iter::repeat('_').take(gap as usize));
            }
            s.push(if !span.is_filled() {
                '.'
            } else if span.start_block_height == blockchain_height {
                'm'
            } else {
                'o'
            });
            expected = span.start_block_height + span.nblocks;
        }
        s.push(']');
        s
    }

    pub fn requested(&self, hash: &Hash) -> bool {
        self.inner.lock().requested_hashes.contains(hash)
    }

    pub fn have(&self, hash: &Hash) -> bool {
        self.inner.lock().have_blocks.contains_key(hash)
    }

    pub fn have_height(&self, hash: &Hash) -> Option<u64> {
        self.inner.lock().have_blocks.get(hash).copied()
    }

    /// Schedules the next span of `block_hashes` not yet requested, which
    /// ends at `last_block_height`. Returns `(start, count)` of the span.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve_span(
        &self,
        first_block_height: u64,
        last_block_height: u64,
        max_blocks: u64,
        connection_id: Uuid,
        origin: NetworkAddress,
        pruning_seed: u32,
        blockchain_height: u64,
        block_hashes: &[Hash],
        time: Instant,
    ) -> Option<(u64, u64)> {
        let mut queue = self.inner.lock();
        log::debug!(
            "reserve_span: first {}, last {}, max {}, peer seed {:#x}, chain height {}, {} hashes",
            first_block_height,
            last_block_height,
            max_blocks,
            pruning_seed,
            blockchain_height,
            block_hashes.len()
        );
        if last_block_height < first_block_height || max_blocks == 0 {
            return None;
        }
        if block_hashes.len() as u64 > last_block_height + 1 {
            log::debug!("reserve_span: more hashes than heights");
            return None;
        }

        let hashes_start_height = last_block_height + 1 - block_hashes.len() as u64;
        let mut index = block_hashes
            .iter()
            .take_while(|h| queue.requested_hashes.contains(*h))
            .count();
        let mut span_start = hashes_start_height + index as u64;

        // the peer may be pruned here while its own stripe follows shortly
        let next_unpruned = get_next_unpruned_block_height(span_start, blockchain_height, pruning_seed);
        if next_unpruned > span_start && next_unpruned < span_start + CRYPTONOTE_PRUNING_STRIPE_SIZE {
            log::debug!(
                "Skipping to next unpruned height {} (+{})",
                next_unpruned,
                next_unpruned - span_start
            );
            span_start = next_unpruned;
        }
        if span_start >= hashes_start_height + block_hashes.len() as u64 {
            log::debug!("Out of hashes, cannot reserve");
            return None;
        }

        index = (span_start - hashes_start_height) as usize;
        while index < block_hashes.len() && queue.requested_hashes.contains(&block_hashes[index]) {
            index += 1;
            span_start += 1;
        }

        let mut hashes = Vec::new();
        while index < block_hashes.len()
            && (hashes.len() as u64) < max_blocks
            && has_unpruned_block(span_start + hashes.len() as u64, blockchain_height, pruning_seed)
        {
            hashes.push(block_hashes[index]);
            index += 1;
        }
        if hashes.is_empty() {
            log::debug!("span_length 0, cannot reserve");
            return None;
        }

        let nblocks = hashes.len() as u64;
        log::debug!(
            "Reserving span {} - {} for {}",
            span_start,
            span_start + nblocks - 1,
            connection_id
        );
        queue.insert(Span {
            start_block_height: span_start,
            nblocks,
            blocks: Vec::new(),
            hashes: Vec::new(),
            connection_id,
            origin,
            rate: 0.0,
            size: 0,
            time,
        });
        queue.set_span_hashes(span_start, connection_id, hashes);
        Some((span_start, nblocks))
    }

    /// The head span, if it is still waiting for data
    pub fn get_next_span_if_scheduled(&self) -> Option<NextSpan> {
        let queue = self.inner.lock();
        let span = queue.spans.first().filter(|s| !s.is_filled())?;
        Some(NextSpan {
            start_height: span.start_block_height,
            nblocks: span.nblocks,
            filled: false,
            connection_id: span.connection_id,
            hashes: span.hashes.clone(),
            time: span.time,
        })
    }

    /// Restarts the timer of the scheduled head span
    pub fn reset_next_span_time(&self, time: Instant) -> bool {
        let mut queue = self.inner.lock();
        match queue.spans.first_mut() {
            Some(span) if !span.is_filled() => {
                span.time = time;
                true
            }
            _ => false,
        }
    }

    pub fn set_span_hashes(&self, start_height: u64, connection_id: Uuid, hashes: Vec<Hash>) {
        self.inner.lock().set_span_hashes(start_height, connection_id, hashes);
    }

    /// Lowest span, or lowest filled span when `filled`
    pub fn get_next_span(&self, filled: bool) -> Option<Span> {
        self.inner
            .lock()
            .spans
            .iter()
            .find(|s| !filled || s.is_filled())
            .cloned()
    }

    /// The head span when it belongs to `connection_id`
    pub fn has_next_span(&self, connection_id: Uuid) -> Option<NextSpan> {
        let queue = self.inner.lock();
        let span = queue.spans.first().filter(|s| s.connection_id == connection_id)?;
        Some(NextSpan {
            start_height: span.start_block_height,
            nblocks: span.nblocks,
            filled: span.is_filled(),
            connection_id: span.connection_id,
            hashes: Vec::new(),
            time: span.time,
        })
    }

    /// The head span when it starts at or below `height`
    pub fn has_next_span_at(&self, height: u64) -> Option<NextSpan> {
        let queue = self.inner.lock();
        let span = queue.spans.first().filter(|s| s.start_block_height <= height)?;
        Some(NextSpan {
            start_height: span.start_block_height,
            nblocks: span.nblocks,
            filled: span.is_filled(),
            connection_id: span.connection_id,
            hashes: Vec::new(),
            time: span.time,
        })
    }

    /// Bytes held in filled spans
    pub fn get_data_size(&self) -> usize {
        self.inner.lock().spans.iter().map(|s| s.size).sum()
    }

    pub fn get_num_spans(&self) -> usize {
        self.inner.lock().spans.len()
    }

    pub fn get_num_filled_spans(&self) -> usize {
        self.inner.lock().spans.iter().filter(|s| s.is_filled()).count()
    }

    /// Filled spans at the head of the queue
    pub fn get_num_filled_spans_prefix(&self) -> usize {
        self.inner
            .lock()
            .spans
            .iter()
            .take_while(|s| s.is_filled())
            .count()
    }

    /// Last hash of the highest fully-hashed span of the connection
    pub fn get_last_known_hash(&self, connection_id: Uuid) -> Hash {
        let queue = self.inner.lock();
        let mut hash = Hash::NULL;
        let mut highest = 0;
        for span in queue.spans.iter().filter(|s| s.connection_id == connection_id) {
            let h = span.last_height();
            if h > highest && span.hashes.len() as u64 == span.nblocks {
                if let Some(last) = span.hashes.last() {
                    hash = *last;
                    highest = h;
                }
            }
        }
        hash
    }

    pub fn has_spans(&self, connection_id: Uuid) -> bool {
        self.inner
            .lock()
            .spans
            .iter()
            .any(|s| s.connection_id == connection_id)
    }

    fn rates(queue: &Queue) -> HashMap<Uuid, f32> {
        // running pseudo-average, weighted towards recent spans
        let mut speeds: HashMap<Uuid, f32> = HashMap::new();
        for span in queue.spans.iter().filter(|s| s.is_filled()) {
            speeds
                .entry(span.connection_id)
                .and_modify(|r| *r = (*r + span.rate) / 2.0)
                .or_insert(span.rate);
        }
        speeds
    }

    /// Download rate of the connection relative to the fastest one, 1.0
    /// when unknown
    pub fn get_speed(&self, connection_id: Uuid) -> f32 {
        let speeds = Self::rates(&self.inner.lock());
        let conn_rate = speeds.get(&connection_id).copied().unwrap_or(-1.0);
        let best_rate = speeds.values().copied().fold(0.0f32, f32::max);
        if conn_rate <= 0.0 || best_rate == 0.0 {
            return 1.0;
        }
        let speed = conn_rate / best_rate;
        log::trace!("Relative speed for {}: {} ({}/{})", connection_id, speed, conn_rate, best_rate);
        speed
    }

    /// Bytes per second, 0 when nothing was downloaded from it
    pub fn get_download_rate(&self, connection_id: Uuid) -> f32 {
        Self::rates(&self.inner.lock())
            .get(&connection_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Visits spans in height order until `f` returns false
    pub fn foreach<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&Span) -> bool,
    {
        self.inner.lock().spans.iter().all(|s| f(s))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> NetworkAddress {
        "8.8.8.8:18080".parse().unwrap()
    }

    fn blocks(n: usize) -> Vec<BlockCompleteEntry> {
        (0..n)
            .map(|i| BlockCompleteEntry {
                block: vec![i as u8; 8],
                txs: Vec::new(),
            })
            .collect()
    }

    fn hashes(range: std::ops::Range<u64>) -> Vec<Hash> {
        range.map(|h| Hash::digest(&h.to_le_bytes())).collect()
    }

    #[test]
    fn test_empty_queue() {
        let q = BlockQueue::new();
        assert_eq!(q.get_max_block_height(), 0);
        assert_eq!(q.get_next_needed_height(10), 10);
        assert_eq!(q.get_overview(10), "[]");
        assert!(q.get_next_span(false).is_none());
        assert!(q.get_next_span_if_scheduled().is_none());
        assert!(!q.reset_next_span_time(Instant::now()));
    }

    #[test]
    fn test_spans_kept_in_height_order() {
        let q = BlockQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.add_blocks(30, blocks(10), b, addr(), 100.0, 80);
        q.add_blocks(10, blocks(10), a, addr(), 100.0, 80);
        q.schedule(20, 10, a, addr(), Instant::now());

        let mut starts = Vec::new();
        q.foreach(|s| {
            starts.push(s.start_block_height);
            true
        });
        assert_eq!(starts, vec![10, 20, 30]);
        assert_eq!(q.get_max_block_height(), 39);
        assert_eq!(q.get_num_filled_spans(), 2);
        assert_eq!(q.get_num_filled_spans_prefix(), 1);
        assert_eq!(q.get_data_size(), 160);
        assert_eq!(q.get_next_span(true).unwrap().start_block_height, 10);
    }

    #[test]
    fn test_next_needed_height() {
        let q = BlockQueue::new();
        let c = Uuid::new_v4();
        q.add_blocks(10, blocks(5), c, addr(), 1.0, 1);
        q.add_blocks(15, blocks(5), c, addr(), 1.0, 1);
        q.add_blocks(25, blocks(5), c, addr(), 1.0, 1);
        assert_eq!(q.get_next_needed_height(10), 20);
        // spans below the chain are skipped
        assert_eq!(q.get_next_needed_height(15), 20);
        // a gap at the chain height
        assert_eq!(q.get_next_needed_height(5), 5);

        let scheduled = BlockQueue::new();
        scheduled.schedule(10, 5, c, addr(), Instant::now());
        assert_eq!(scheduled.get_next_needed_height(10), 10);
    }

    #[test]
    fn test_reserve_span_skips_requested_hashes() {
        let q = BlockQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ids = hashes(1..41);
        let now = Instant::now();

        assert_eq!(q.reserve_span(1, 40, 20, a, addr(), 0, 41, &ids, now), Some((1, 20)));
        assert!(q.requested(&ids[0]));
        assert!(q.requested(&ids[19]));
        assert!(!q.requested(&ids[20]));

        // a second peer gets the following heights
        assert_eq!(q.reserve_span(1, 40, 20, b, addr(), 0, 41, &ids, now), Some((21, 20)));
        assert_eq!(q.reserve_span(1, 40, 20, b, addr(), 0, 41, &ids, now), None);

        assert_eq!(q.get_last_known_hash(a), ids[19]);
        assert_eq!(q.get_last_known_hash(b), ids[39]);
        assert!(q.has_spans(a));
    }

    #[test]
    fn test_reserve_span_rejects_bad_input() {
        let q = BlockQueue::new();
        let c = Uuid::new_v4();
        let ids = hashes(0..5);
        let now = Instant::now();
        assert_eq!(q.reserve_span(10, 5, 20, c, addr(), 0, 20, &ids, now), None);
        assert_eq!(q.reserve_span(1, 5, 0, c, addr(), 0, 20, &ids, now), None);
        assert_eq!(q.reserve_span(0, 3, 20, c, addr(), 0, 20, &ids, now), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_filled_span_keeps_hashes() {
        let q = BlockQueue::new();
        let c = Uuid::new_v4();
        let ids = hashes(5..10);
        q.reserve_span(5, 9, 5, c, addr(), 0, 10, &ids, Instant::now()).unwrap();
        assert!(!q.have(&ids[0]));

        q.add_blocks(5, blocks(5), c, addr(), 10.0, 40);
        assert!(q.have(&ids[2]));
        assert_eq!(q.have_height(&ids[2]), Some(7));
        assert!(q.requested(&ids[4]));
        assert_eq!(q.get_num_spans(), 1);

        assert!(q.remove_span(5));
        assert!(!q.have(&ids[2]));
        assert!(!q.requested(&ids[2]));
    }

    #[test]
    fn test_flush_spans() {
        let q = BlockQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let now = Instant::now();
        q.schedule(1, 5, a, addr(), now);
        q.add_blocks(6, blocks(5), a, addr(), 1.0, 1);
        q.schedule(11, 5, b, addr(), now);

        q.flush_spans(a, false);
        assert_eq!(q.get_num_spans(), 2);
        assert!(q.get_next_span_if_scheduled().is_none());

        let live: HashSet<Uuid> = [a].into_iter().collect();
        q.flush_stale_spans(&live);
        assert_eq!(q.get_num_spans(), 1);

        q.flush_spans(a, true);
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_spans_up_to_height() {
        let q = BlockQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.add_blocks(1, blocks(5), a, addr(), 1.0, 1);
        q.add_blocks(6, blocks(5), b, addr(), 1.0, 1);
        q.add_blocks(11, blocks(5), a, addr(), 1.0, 1);
        q.remove_spans(a, 6);
        let starts: Vec<u64> = {
            let mut v = Vec::new();
            q.foreach(|s| {
                v.push(s.start_block_height);
                true
            });
            v
        };
        assert_eq!(starts, vec![6, 11]);
    }

    #[test]
    fn test_next_span_ownership() {
        let q = BlockQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let then = Instant::now();
        q.schedule(10, 5, a, addr(), then);
        q.schedule(15, 5, b, addr(), then);

        let head = q.get_next_span_if_scheduled().unwrap();
        assert_eq!((head.start_height, head.connection_id), (10, a));
        assert!(q.has_next_span(a).is_some());
        assert!(q.has_next_span(b).is_none());
        assert!(q.has_next_span_at(10).is_some());
        assert!(q.has_next_span_at(9).is_none());

        let later = then + std::time::Duration::from_secs(5);
        assert!(q.reset_next_span_time(later));
        assert_eq!(q.get_next_span_if_scheduled().unwrap().time, later);
    }

    #[test]
    fn test_speed() {
        let q = BlockQueue::new();
        let fast = Uuid::new_v4();
        let slow = Uuid::new_v4();
        q.add_blocks(1, blocks(1), fast, addr(), 1000.0, 1);
        q.add_blocks(2, blocks(1), slow, addr(), 250.0, 1);
        q.add_blocks(3, blocks(1), slow, addr(), 250.0, 1);

        assert_eq!(q.get_speed(fast), 1.0);
        assert_eq!(q.get_speed(slow), 0.25);
        assert_eq!(q.get_speed(Uuid::new_v4()), 1.0);
        assert_eq!(q.get_download_rate(slow), 250.0);
        assert_eq!(q.get_download_rate(Uuid::new_v4()), 0.0);
    }

    #[test]
    fn test_overview() {
        let q = BlockQueue::new();
        let c = Uuid::new_v4();
        q.add_blocks(10, blocks(5), c, addr(), 1.0, 1);
        q.schedule(15, 5, c, addr(), Instant::now());
        q.add_blocks(25, blocks(5), c, addr(), 1.0, 1);
        assert_eq!(q.get_overview(10), "[m._o]");
        assert_eq!(q.get_overview(12), "[<_._o]");
    }
}
