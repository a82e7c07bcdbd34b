//! Peer list manager
//!
//! Keeps the addresses known for one zone in three pools:
//! - White: peers we connected to and completed a handshake with
//! - Gray: peers we only heard about through gossip
//! - Anchor: outbound peers we were connected to at the last shutdown
//!
//! White and gray are bounded; when full, the least recently seen entry is
//! dropped. An address is never in white and gray at the same time.

use crate::net::{NetworkAddress, Zone};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// =============================================================================
// Constants
// =============================================================================

pub const P2P_LOCAL_WHITE_PEERLIST_LIMIT: usize = 1000;
pub const P2P_LOCAL_GRAY_PEERLIST_LIMIT: usize = 5000;

/// Peers sent in a handshake or timed sync response
pub const P2P_DEFAULT_PEERS_IN_HANDSHAKE: usize = 250;

/// Share of outbound connections made to white peers
pub const P2P_DEFAULT_WHITELIST_CONNECTIONS_PERCENT: usize = 70;

/// Unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerListEntry {
    pub address: NetworkAddress,
    pub id: u64,
    /// Unix seconds; 0 in anonymised gossip
    pub last_seen: i64,
    pub pruning_seed: u32,
}

impl PeerListEntry {
    pub fn new(address: NetworkAddress, id: u64, last_seen: i64, pruning_seed: u32) -> Self {
        Self {
            address,
            id,
            last_seen,
            pruning_seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPeerlistEntry {
    pub address: NetworkAddress,
    pub id: u64,
    pub first_seen: i64,
}

/// Which bounded pool an entry goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    White,
    Gray,
}

// =============================================================================
// Pool storage
// =============================================================================

/// Entries indexed by address and ordered by `last_seen`
#[derive(Debug, Default, Clone)]
struct PeerPool {
    by_addr: HashMap<NetworkAddress, PeerListEntry>,
    by_time: BTreeSet<(i64, NetworkAddress)>,
}

impl PeerPool {
    fn len(&self) -> usize {
        self.by_addr.len()
    }

    fn get(&self, address: &NetworkAddress) -> Option<&PeerListEntry> {
        self.by_addr.get(address)
    }

    fn contains(&self, address: &NetworkAddress) -> bool {
        self.by_addr.contains_key(address)
    }

    /// Inserts or replaces the entry for its address
    fn put(&mut self, entry: PeerListEntry) {
        if let Some(old) = self.by_addr.remove(&entry.address) {
            self.by_time.remove(&(old.last_seen, old.address));
        }
        self.by_time.insert((entry.last_seen, entry.address.clone()));
        self.by_addr.insert(entry.address.clone(), entry);
    }

    fn remove(&mut self, address: &NetworkAddress) -> Option<PeerListEntry> {
        let old = self.by_addr.remove(address)?;
        self.by_time.remove(&(old.last_seen, old.address.clone()));
        Some(old)
    }

    fn trim(&mut self, limit: usize) {
        while self.by_addr.len() > limit {
            let Some((_, address)) = self.by_time.iter().next().cloned() else {
                break;
            };
            self.remove(&address);
        }
    }

    /// The `n`-th most recently seen entry
    fn nth_latest(&self, n: usize) -> Option<&PeerListEntry> {
        self.by_time
            .iter()
            .rev()
            .nth(n)
            .and_then(|(_, address)| self.by_addr.get(address))
    }

    fn latest_first(&self) -> impl Iterator<Item = &PeerListEntry> {
        self.by_time
            .iter()
            .rev()
            .filter_map(|(_, address)| self.by_addr.get(address))
    }

    fn retain(&mut self, mut keep: impl FnMut(&PeerListEntry) -> bool) -> usize {
        let dropped: Vec<NetworkAddress> = self
            .by_addr
            .values()
            .filter(|e| !keep(e))
            .map(|e| e.address.clone())
            .collect();
        for address in &dropped {
            self.remove(address);
        }
        dropped.len()
    }
}

#[derive(Debug, Default)]
struct Pools {
    white: PeerPool,
    gray: PeerPool,
    anchor: HashMap<NetworkAddress, AnchorPeerlistEntry>,
}

impl Pools {
    fn pool(&self, pool: Pool) -> &PeerPool {
        match pool {
            Pool::White => &self.white,
            Pool::Gray => &self.gray,
        }
    }

    fn pool_mut(&mut self, pool: Pool) -> &mut PeerPool {
        match pool {
            Pool::White => &mut self.white,
            Pool::Gray => &mut self.gray,
        }
    }
}

/// Serializable content of a peer list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListState {
    pub white: Vec<PeerListEntry>,
    pub gray: Vec<PeerListEntry>,
    pub anchor: Vec<AnchorPeerlistEntry>,
}

// =============================================================================
// Manager
// =============================================================================

/// Thread-safe peer list of one zone
#[derive(Debug)]
pub struct PeerListManager {
    zone: Zone,
    allow_local_ip: bool,
    white_limit: usize,
    gray_limit: usize,
    pools: Mutex<Pools>,
}

impl PeerListManager {
    pub fn new(zone: Zone, allow_local_ip: bool) -> Self {
        Self::with_limits(
            zone,
            allow_local_ip,
            P2P_LOCAL_WHITE_PEERLIST_LIMIT,
            P2P_LOCAL_GRAY_PEERLIST_LIMIT,
        )
    }

    pub fn with_limits(zone: Zone, allow_local_ip: bool, white_limit: usize, gray_limit: usize) -> Self {
        Self {
            zone,
            allow_local_ip,
            white_limit,
            gray_limit,
            pools: Mutex::new(Pools::default()),
        }
    }

    /// Loads persisted entries; foreign-zone and disallowed entries are skipped
    pub fn init(&self, state: PeerListState) {
        let zone = self.zone;
        for entry in state.white.into_iter().filter(|e| e.address.zone() == zone) {
            self.append_with_peer_white(entry, true);
        }
        for entry in state.gray.into_iter().filter(|e| e.address.zone() == zone) {
            self.append_with_peer_gray(entry);
        }
        for anchor in state.anchor.into_iter().filter(|e| e.address.zone() == zone) {
            self.append_with_peer_anchor(anchor);
        }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn get_white_peers_count(&self) -> usize {
        self.pools.lock().white.len()
    }

    pub fn get_gray_peers_count(&self) -> usize {
        self.pools.lock().gray.len()
    }

    pub fn get_anchor_peers_count(&self) -> usize {
        self.pools.lock().anchor.len()
    }

    /// Loopback and private ranges only when local addresses are allowed
    pub fn is_host_allowed(&self, address: &NetworkAddress) -> bool {
        self.allow_local_ip || !(address.is_loopback() || address.is_local())
    }

    pub fn contains(&self, address: &NetworkAddress) -> Option<Pool> {
        let pools = self.pools.lock();
        if pools.white.contains(address) {
            Some(Pool::White)
        } else if pools.gray.contains(address) {
            Some(Pool::Gray)
        } else {
            None
        }
    }

    pub fn get_entry(&self, address: &NetworkAddress) -> Option<PeerListEntry> {
        let pools = self.pools.lock();
        pools
            .white
            .get(address)
            .or_else(|| pools.gray.get(address))
            .cloned()
    }

    /// Adds or refreshes a white entry and removes the address from gray.
    /// A new entry replaces every other entry of the same host, so one host
    /// holds at most one white slot.
    ///
    /// An existing entry keeps its `last_seen` unless `trust_last_seen`, and
    /// keeps its pruning seed when the new one is 0.
    pub fn append_with_peer_white(&self, entry: PeerListEntry, trust_last_seen: bool) -> bool {
        if !self.is_host_allowed(&entry.address) {
            return false;
        }
        let mut pools = self.pools.lock();
        match pools.white.get(&entry.address).cloned() {
            None => {
                let host = entry.address.clone();
                pools.white.retain(|e| !e.address.is_same_host(&host));
                pools.gray.retain(|e| !e.address.is_same_host(&host));
                pools.white.put(entry.clone());
                pools.white.trim(self.white_limit);
            }
            Some(old) => {
                let mut updated = entry.clone();
                if old.pruning_seed != 0 && entry.pruning_seed == 0 {
                    updated.pruning_seed = old.pruning_seed;
                }
                if !trust_last_seen {
                    updated.last_seen = old.last_seen;
                }
                pools.white.put(updated);
            }
        }
        pools.gray.remove(&entry.address);
        true
    }

    /// Adds or refreshes a gray entry; addresses already white are ignored.
    /// Gossiped `last_seen` values never overwrite ours.
    pub fn append_with_peer_gray(&self, entry: PeerListEntry) -> bool {
        if !self.is_host_allowed(&entry.address) {
            return false;
        }
        let mut pools = self.pools.lock();
        if pools.white.contains(&entry.address) {
            return true;
        }
        match pools.gray.get(&entry.address).cloned() {
            None => {
                pools.gray.put(entry);
                pools.gray.trim(self.gray_limit);
            }
            Some(old) => {
                let mut updated = entry;
                if old.pruning_seed != 0 && updated.pruning_seed == 0 {
                    updated.pruning_seed = old.pruning_seed;
                }
                updated.last_seen = old.last_seen;
                pools.gray.put(updated);
            }
        }
        true
    }

    pub fn append_with_peer_anchor(&self, entry: AnchorPeerlistEntry) {
        self.pools
            .lock()
            .anchor
            .entry(entry.address.clone())
            .or_insert(entry);
    }

    /// Inserts into the given pool with a trusted `last_seen`
    pub fn merge_peer(&self, entry: PeerListEntry, pool: Pool) -> bool {
        match pool {
            Pool::White => self.append_with_peer_white(entry, true),
            Pool::Gray => self.append_with_peer_gray(entry),
        }
    }

    /// Merges gossip into the gray list; entries failing `filter` are skipped
    pub fn merge_peerlist<F>(&self, entries: &[PeerListEntry], filter: F)
    where
        F: Fn(&PeerListEntry) -> bool,
    {
        for entry in entries.iter().filter(|e| filter(e)) {
            self.append_with_peer_gray(entry.clone());
        }
        self.pools.lock().gray.trim(self.gray_limit);
    }

    /// Records a successful contact with a peer
    pub fn set_peer_just_seen(&self, id: u64, address: &NetworkAddress, pruning_seed: u32) -> bool {
        self.append_with_peer_white(
            PeerListEntry::new(address.clone(), id, unix_now(), pruning_seed),
            true,
        )
    }

    /// Moves an address from gray to white
    pub fn promote(&self, address: &NetworkAddress) -> bool {
        let entry = self.pools.lock().gray.get(address).cloned();
        match entry {
            Some(mut entry) => {
                entry.last_seen = unix_now();
                self.append_with_peer_white(entry, true)
            }
            None => false,
        }
    }

    /// Moves an address from white back to gray
    pub fn demote_to_gray(&self, address: &NetworkAddress) -> bool {
        let mut pools = self.pools.lock();
        match pools.white.remove(address) {
            Some(entry) => {
                pools.gray.put(entry);
                pools.gray.trim(self.gray_limit);
                true
            }
            None => false,
        }
    }

    /// Most recently seen white peers. When anonymising, the pick is taken
    /// from the whole list, shuffled, and `last_seen` is cleared.
    pub fn get_peerlist_head(&self, anonymize: bool, depth: usize) -> Vec<PeerListEntry> {
        let pools = self.pools.lock();
        let pick = if anonymize { pools.white.len() } else { depth };
        let mut head: Vec<PeerListEntry> = pools.white.latest_first().take(pick).cloned().collect();
        drop(pools);

        if anonymize {
            head.shuffle(&mut rand::thread_rng());
            head.truncate(depth);
            for entry in &mut head {
                entry.last_seen = 0;
            }
        }
        head
    }

    /// Both pools, most recent first
    pub fn get_peerlist(&self) -> (Vec<PeerListEntry>, Vec<PeerListEntry>) {
        let pools = self.pools.lock();
        (
            pools.white.latest_first().cloned().collect(),
            pools.gray.latest_first().cloned().collect(),
        )
    }

    pub fn get_white_peer_by_index(&self, index: usize) -> Option<PeerListEntry> {
        self.pools.lock().white.nth_latest(index).cloned()
    }

    pub fn get_gray_peer_by_index(&self, index: usize) -> Option<PeerListEntry> {
        self.pools.lock().gray.nth_latest(index).cloned()
    }

    pub fn get_random_gray_peer(&self) -> Option<PeerListEntry> {
        let pools = self.pools.lock();
        if pools.gray.len() == 0 {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..pools.gray.len());
        pools.gray.nth_latest(index).cloned()
    }

    /// Visits a pool most recent first until `f` returns false
    pub fn foreach<F>(&self, pool: Pool, mut f: F) -> bool
    where
        F: FnMut(&PeerListEntry) -> bool,
    {
        let pools = self.pools.lock();
        let completed = pools.pool(pool).latest_first().all(|e| f(e));
        completed
    }

    /// Drops the entries of a pool for which `f` returns true
    pub fn filter<F>(&self, pool: Pool, f: F) -> usize
    where
        F: Fn(&PeerListEntry) -> bool,
    {
        self.pools.lock().pool_mut(pool).retain(|e| !f(e))
    }

    pub fn remove_from_peer_white(&self, address: &NetworkAddress) -> bool {
        self.pools.lock().white.remove(address).is_some()
    }

    pub fn remove_from_peer_gray(&self, address: &NetworkAddress) -> bool {
        self.pools.lock().gray.remove(address).is_some()
    }

    pub fn remove_from_peer_anchor(&self, address: &NetworkAddress) -> bool {
        self.pools.lock().anchor.remove(address).is_some()
    }

    /// Removes every entry of the host, whatever its port, from all pools
    pub fn evict_host_from_peerlist(&self, address: &NetworkAddress) -> usize {
        let mut pools = self.pools.lock();
        let same = |e: &PeerListEntry| !e.address.is_same_host(address);
        let removed = pools.white.retain(same) + pools.gray.retain(same);
        pools.anchor.retain(|a, _| !a.is_same_host(address));
        removed
    }

    /// Anchors ordered by first contact; the anchor pool is left empty
    pub fn get_and_empty_anchor_peerlist(&self) -> Vec<AnchorPeerlistEntry> {
        let mut anchors: Vec<AnchorPeerlistEntry> =
            self.pools.lock().anchor.drain().map(|(_, a)| a).collect();
        anchors.sort_by_key(|a| a.first_seen);
        anchors
    }

    /// Random candidates to connect to, about 70 % white. Addresses for
    /// which `skip` returns true are never returned.
    pub fn get_peers_for_connect<F>(&self, count: usize, skip: F) -> Vec<NetworkAddress>
    where
        F: Fn(&NetworkAddress) -> bool,
    {
        let (mut white, mut gray): (Vec<NetworkAddress>, Vec<NetworkAddress>) = {
            let pools = self.pools.lock();
            (
                pools.white.by_addr.keys().filter(|a| !skip(a)).cloned().collect(),
                pools.gray.by_addr.keys().filter(|a| !skip(a)).cloned().collect(),
            )
        };
        let mut rng = rand::thread_rng();
        white.shuffle(&mut rng);
        gray.shuffle(&mut rng);

        let white_target = (count * P2P_DEFAULT_WHITELIST_CONNECTIONS_PERCENT + 99) / 100;
        let mut picked: Vec<NetworkAddress> = Vec::with_capacity(count);
        let take_white = white_target.min(white.len());
        picked.extend(white.drain(..take_white));
        let take_gray = (count - picked.len()).min(gray.len());
        picked.extend(gray.drain(..take_gray));
        let take_rest = (count - picked.len()).min(white.len());
        picked.extend(white.drain(..take_rest));
        picked
    }

    pub fn snapshot(&self) -> PeerListState {
        let pools = self.pools.lock();
        let mut anchor: Vec<AnchorPeerlistEntry> = pools.anchor.values().cloned().collect();
        anchor.sort_by_key(|a| a.first_seen);
        PeerListState {
            white: pools.white.latest_first().cloned().collect(),
            gray: pools.gray.latest_first().cloned().collect(),
            anchor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: &str, last_seen: i64) -> PeerListEntry {
        PeerListEntry::new(addr.parse().unwrap(), last_seen as u64, last_seen, 0)
    }

    fn manager() -> PeerListManager {
        PeerListManager::with_limits(Zone::Public, false, 3, 4)
    }

    #[test]
    fn test_merge_is_idempotent() {
        let pl = manager();
        let e = entry("8.8.8.8:18080", 100);
        assert!(pl.merge_peer(e.clone(), Pool::White));
        assert!(pl.merge_peer(PeerListEntry { last_seen: 200, ..e.clone() }, Pool::White));
        assert_eq!(pl.get_white_peers_count(), 1);
        assert_eq!(pl.get_white_peer_by_index(0).unwrap().last_seen, 200);

        pl.append_with_peer_gray(entry("9.9.9.9:18080", 50));
        pl.append_with_peer_gray(entry("9.9.9.9:18080", 60));
        assert_eq!(pl.get_gray_peers_count(), 1);
        // gossip does not move our own last_seen
        assert_eq!(pl.get_gray_peer_by_index(0).unwrap().last_seen, 50);
    }

    #[test]
    fn test_lru_eviction() {
        let pl = manager();
        pl.merge_peer(entry("1.1.1.1:1", 30), Pool::White);
        pl.merge_peer(entry("1.1.1.2:1", 10), Pool::White);
        pl.merge_peer(entry("1.1.1.3:1", 20), Pool::White);
        pl.merge_peer(entry("1.1.1.4:1", 40), Pool::White);

        assert_eq!(pl.get_white_peers_count(), 3);
        assert!(pl.contains(&"1.1.1.2:1".parse().unwrap()).is_none());
        for kept in ["1.1.1.1:1", "1.1.1.3:1", "1.1.1.4:1"] {
            assert_eq!(pl.contains(&kept.parse().unwrap()), Some(Pool::White));
        }

        // the newcomer is the oldest, so it is the one that goes
        pl.merge_peer(entry("1.1.1.5:1", 5), Pool::White);
        assert!(pl.contains(&"1.1.1.5:1".parse().unwrap()).is_none());
        assert_eq!(pl.get_white_peers_count(), 3);
    }

    #[test]
    fn test_address_in_one_pool_only() {
        let pl = manager();
        let addr: NetworkAddress = "8.8.4.4:18080".parse().unwrap();
        pl.append_with_peer_gray(entry("8.8.4.4:18080", 1));
        assert_eq!(pl.contains(&addr), Some(Pool::Gray));

        assert!(pl.promote(&addr));
        assert_eq!(pl.contains(&addr), Some(Pool::White));
        assert_eq!(pl.get_gray_peers_count(), 0);

        // gray gossip about a white peer is ignored
        pl.append_with_peer_gray(entry("8.8.4.4:18080", 1));
        assert_eq!(pl.get_gray_peers_count(), 0);

        assert!(pl.demote_to_gray(&addr));
        assert_eq!(pl.contains(&addr), Some(Pool::Gray));
        assert_eq!(pl.get_white_peers_count(), 0);
    }

    #[test]
    fn test_pruning_seed_not_lost() {
        let pl = manager();
        let addr: NetworkAddress = "8.8.8.8:18080".parse().unwrap();
        pl.append_with_peer_white(PeerListEntry::new(addr.clone(), 1, 10, 0x181), true);
        pl.append_with_peer_white(PeerListEntry::new(addr.clone(), 1, 20, 0), false);
        let stored = pl.get_entry(&addr).unwrap();
        assert_eq!(stored.pruning_seed, 0x181);
        assert_eq!(stored.last_seen, 10);
    }

    #[test]
    fn test_host_restrictions() {
        let pl = manager();
        assert!(!pl.append_with_peer_white(entry("127.0.0.1:1", 1), true));
        assert!(!pl.append_with_peer_gray(entry("192.168.1.1:1", 1)));
        assert_eq!(pl.get_white_peers_count() + pl.get_gray_peers_count(), 0);

        let local = PeerListManager::new(Zone::Public, true);
        assert!(local.append_with_peer_gray(entry("192.168.1.1:1", 1)));
        assert!(local.append_with_peer_gray(entry("127.0.0.1:1", 1)));
    }

    #[test]
    fn test_one_white_slot_per_host() {
        let pl = manager();
        pl.append_with_peer_gray(entry("8.8.8.8:3000", 1));
        assert!(pl.append_with_peer_white(entry("8.8.8.8:1000", 1), true));
        assert!(pl.append_with_peer_white(entry("8.8.8.8:2000", 2), true));

        assert_eq!(pl.get_white_peers_count(), 1);
        assert_eq!(pl.get_gray_peers_count(), 0);
        assert_eq!(pl.contains(&"8.8.8.8:2000".parse().unwrap()), Some(Pool::White));
        assert!(pl.contains(&"8.8.8.8:1000".parse().unwrap()).is_none());

        // refreshing the same address keeps it
        assert!(pl.append_with_peer_white(entry("8.8.8.8:2000", 3), true));
        assert_eq!(pl.get_white_peers_count(), 1);
    }

    #[test]
    fn test_foreach_stops_early() {
        let pl = manager();
        for i in 1..=3 {
            pl.merge_peer(entry(&format!("5.5.5.{}:1", i), i), Pool::White);
        }
        let mut visited = Vec::new();
        let completed = pl.foreach(Pool::White, |e| {
            visited.push(e.last_seen);
            visited.len() < 2
        });
        assert!(!completed);
        assert_eq!(visited, vec![3, 2]);
        assert!(pl.foreach(Pool::Gray, |_| false));
    }

    #[test]
    fn test_peerlist_head() {
        let pl = PeerListManager::new(Zone::Public, false);
        for i in 1..=20 {
            pl.merge_peer(entry(&format!("5.5.5.{}:1", i), i), Pool::White);
        }
        let head = pl.get_peerlist_head(false, 5);
        let seen: Vec<i64> = head.iter().map(|e| e.last_seen).collect();
        assert_eq!(seen, vec![20, 19, 18, 17, 16]);

        let anon = pl.get_peerlist_head(true, 5);
        assert_eq!(anon.len(), 5);
        assert!(anon.iter().all(|e| e.last_seen == 0));
    }

    #[test]
    fn test_merge_peerlist_filters_and_trims() {
        let pl = manager();
        let gossip: Vec<PeerListEntry> = (1..=6).map(|i| entry(&format!("6.6.6.{}:1", i), i)).collect();
        pl.merge_peerlist(&gossip, |e| e.address.port() == 1);
        assert_eq!(pl.get_gray_peers_count(), 4);

        let none = manager();
        none.merge_peerlist(&gossip, |_| false);
        assert_eq!(none.get_gray_peers_count(), 0);
    }

    #[test]
    fn test_evict_host_ignores_port() {
        let pl = PeerListManager::new(Zone::Public, false);
        pl.merge_peer(entry("7.7.7.7:1", 1), Pool::White);
        pl.merge_peer(entry("7.7.7.7:2", 2), Pool::Gray);
        pl.merge_peer(entry("7.7.7.8:1", 3), Pool::Gray);
        pl.append_with_peer_anchor(AnchorPeerlistEntry {
            address: "7.7.7.7:1".parse().unwrap(),
            id: 1,
            first_seen: 1,
        });
        assert_eq!(pl.evict_host_from_peerlist(&"7.7.7.7:9".parse().unwrap()), 2);
        assert_eq!(pl.get_white_peers_count(), 0);
        assert_eq!(pl.get_gray_peers_count(), 1);
        assert_eq!(pl.get_anchor_peers_count(), 0);
    }

    #[test]
    fn test_anchor_list_drains() {
        let pl = manager();
        for (i, addr) in ["3.3.3.3:1", "3.3.3.4:1"].iter().enumerate() {
            pl.append_with_peer_anchor(AnchorPeerlistEntry {
                address: addr.parse().unwrap(),
                id: i as u64,
                first_seen: 10 - i as i64,
            });
        }
        let anchors = pl.get_and_empty_anchor_peerlist();
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].first_seen, 9);
        assert!(pl.get_and_empty_anchor_peerlist().is_empty());
    }

    #[test]
    fn test_peers_for_connect() {
        let pl = PeerListManager::new(Zone::Public, false);
        for i in 1..=10 {
            pl.merge_peer(entry(&format!("4.4.4.{}:1", i), i), Pool::White);
            pl.merge_peer(entry(&format!("4.4.5.{}:1", i), i), Pool::Gray);
        }
        let banned: NetworkAddress = "4.4.4.1:1".parse().unwrap();
        let picked = pl.get_peers_for_connect(10, |a| *a == banned);
        assert_eq!(picked.len(), 10);
        assert!(!picked.contains(&banned));
        let white = picked.iter().filter(|a| a.to_string().starts_with("4.4.4.")).count();
        assert_eq!(white, 7);

        // thin white list falls back to gray
        let thin = PeerListManager::new(Zone::Public, false);
        thin.merge_peer(entry("4.4.4.1:1", 1), Pool::White);
        for i in 1..=5 {
            thin.merge_peer(entry(&format!("4.4.5.{}:1", i), i), Pool::Gray);
        }
        assert_eq!(thin.get_peers_for_connect(4, |_| false).len(), 4);
    }

    #[test]
    fn test_snapshot_and_init() {
        let pl = manager();
        pl.merge_peer(entry("2.2.2.2:1", 5), Pool::White);
        pl.merge_peer(entry("2.2.2.3:1", 6), Pool::Gray);
        let state = pl.snapshot();

        let restored = manager();
        restored.init(state.clone());
        assert_eq!(restored.snapshot(), state);

        let tor = PeerListManager::new(Zone::Tor, false);
        tor.init(state);
        assert_eq!(tor.get_white_peers_count() + tor.get_gray_peers_count(), 0);
    }
}
