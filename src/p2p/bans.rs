//! Host and subnet bans
//!
//! Bans are keyed by host, so every port of a banned host is refused.
//! Expired records are purged lazily on lookup.

use crate::net::{Ipv4Subnet, NetworkAddress};
use crate::p2p::peerlist::unix_now;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Ban duration once a host has failed too often
pub const P2P_IP_BLOCKTIME: Duration = Duration::from_secs(60 * 60 * 24);

/// Accumulated fail score that triggers a ban
pub const P2P_IP_FAILS_BEFORE_BLOCK: u64 = 10;

/// Duration used for ban-list file entries
pub const BAN_FOREVER: Duration = Duration::from_secs(i64::MAX as u64);

/// One active ban, as shown to operators and written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord<K> {
    pub target: K,
    /// Unix seconds
    pub expiry: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanState {
    pub hosts: Vec<BanRecord<String>>,
    pub subnets: Vec<BanRecord<Ipv4Subnet>>,
}

#[derive(Debug, Default)]
struct Bans {
    hosts: HashMap<String, i64>,
    subnets: HashMap<Ipv4Subnet, i64>,
    fails: HashMap<String, u64>,
}

impl Bans {
    fn purge(&mut self, now: i64) {
        self.hosts.retain(|_, expiry| *expiry > now);
        self.subnets.retain(|_, expiry| *expiry > now);
    }
}

/// What a fail report led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Counted(u64),
    Blocked,
}

#[derive(Debug)]
pub struct BanList {
    fail_threshold: u64,
    fail_block_time: Duration,
    inner: Mutex<Bans>,
}

impl Default for BanList {
    fn default() -> Self {
        Self::new(P2P_IP_FAILS_BEFORE_BLOCK, P2P_IP_BLOCKTIME)
    }
}

fn expiry_after(now: i64, duration: Duration) -> i64 {
    let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
    now.saturating_add(secs)
}

impl BanList {
    pub fn new(fail_threshold: u64, fail_block_time: Duration) -> Self {
        Self {
            fail_threshold,
            fail_block_time,
            inner: Mutex::new(Bans::default()),
        }
    }

    /// Bans every port of the host. With `add_only`, an existing longer ban
    /// is left alone. Returns false for addresses that cannot be banned.
    pub fn block_host(&self, address: &NetworkAddress, duration: Duration, add_only: bool) -> bool {
        self.block_host_at(address, duration, add_only, unix_now())
    }

    pub fn block_host_at(
        &self,
        address: &NetworkAddress,
        duration: Duration,
        add_only: bool,
        now: i64,
    ) -> bool {
        if !address.is_blockable() {
            return false;
        }
        let limit = expiry_after(now, duration);
        let host = address.host_str();
        let mut bans = self.inner.lock();
        match bans.hosts.get_mut(&host) {
            Some(expiry) => {
                if *expiry < limit || !add_only {
                    *expiry = limit;
                    log::info!("Host {} block time updated", host);
                }
            }
            None => {
                bans.hosts.insert(host.clone(), limit);
                log::info!("Host {} blocked", host);
            }
        }
        true
    }

    pub fn unblock_host(&self, address: &NetworkAddress) -> bool {
        let host = address.host_str();
        let mut bans = self.inner.lock();
        bans.fails.remove(&host);
        let removed = bans.hosts.remove(&host).is_some();
        if removed {
            log::info!("Host {} unblocked", host);
        }
        removed
    }

    /// Bans a subnet; a re-ban never shortens an active one
    pub fn block_subnet(&self, subnet: Ipv4Subnet, duration: Duration) -> bool {
        self.block_subnet_at(subnet, duration, unix_now())
    }

    pub fn block_subnet_at(&self, subnet: Ipv4Subnet, duration: Duration, now: i64) -> bool {
        let limit = expiry_after(now, duration);
        let mut bans = self.inner.lock();
        let expiry = bans.subnets.entry(subnet).or_insert(limit);
        *expiry = (*expiry).max(limit);
        log::info!("Subnet {} blocked", subnet);
        true
    }

    pub fn unblock_subnet(&self, subnet: &Ipv4Subnet) -> bool {
        let removed = self.inner.lock().subnets.remove(subnet).is_some();
        if removed {
            log::info!("Subnet {} unblocked", subnet);
        }
        removed
    }

    pub fn is_allowed(&self, address: &NetworkAddress) -> bool {
        self.is_allowed_at(address, unix_now())
    }

    pub fn is_allowed_at(&self, address: &NetworkAddress, now: i64) -> bool {
        let mut bans = self.inner.lock();
        bans.purge(now);
        if bans.hosts.contains_key(&address.host_str()) {
            return false;
        }
        !bans.subnets.keys().any(|subnet| subnet.contains(address))
    }

    /// Remaining ban time of a host, if banned
    pub fn host_ban_remaining(&self, address: &NetworkAddress) -> Option<Duration> {
        let now = unix_now();
        let bans = self.inner.lock();
        bans.hosts
            .get(&address.host_str())
            .filter(|expiry| **expiry > now)
            .map(|expiry| Duration::from_secs((*expiry - now) as u64))
    }

    /// Adds to the host's fail score, banning it once past the threshold.
    /// A ban halves the score so a released host is banned again sooner.
    pub fn add_host_fail(&self, address: &NetworkAddress, score: u64) -> FailOutcome {
        if !address.is_blockable() {
            return FailOutcome::Counted(0);
        }
        let host = address.host_str();
        let fails = {
            let mut bans = self.inner.lock();
            let fails = bans.fails.entry(host.clone()).or_insert(0);
            *fails = fails.saturating_add(score);
            if *fails > self.fail_threshold {
                *fails = self.fail_threshold / 2;
                None
            } else {
                Some(*fails)
            }
        };
        match fails {
            Some(count) => {
                log::debug!("Host {} fail score={}", host, count);
                FailOutcome::Counted(count)
            }
            None => {
                self.block_host(address, self.fail_block_time, false);
                FailOutcome::Blocked
            }
        }
    }

    pub fn host_fail_score(&self, address: &NetworkAddress) -> u64 {
        self.inner
            .lock()
            .fails
            .get(&address.host_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn blocked_hosts(&self) -> Vec<BanRecord<String>> {
        self.snapshot().hosts
    }

    pub fn blocked_subnets(&self) -> Vec<BanRecord<Ipv4Subnet>> {
        self.snapshot().subnets
    }

    /// Active bans, sorted
    pub fn snapshot(&self) -> BanState {
        let now = unix_now();
        let mut bans = self.inner.lock();
        bans.purge(now);
        let mut hosts: Vec<BanRecord<String>> = bans
            .hosts
            .iter()
            .map(|(target, expiry)| BanRecord {
                target: target.clone(),
                expiry: *expiry,
            })
            .collect();
        hosts.sort_by(|a, b| a.target.cmp(&b.target));
        let mut subnets: Vec<BanRecord<Ipv4Subnet>> = bans
            .subnets
            .iter()
            .map(|(target, expiry)| BanRecord {
                target: *target,
                expiry: *expiry,
            })
            .collect();
        subnets.sort_by_key(|r| r.target);
        BanState { hosts, subnets }
    }

    /// Restores persisted bans; expired ones are dropped
    pub fn restore(&self, state: BanState) {
        let now = unix_now();
        let mut bans = self.inner.lock();
        for record in state.hosts.into_iter().filter(|r| r.expiry > now) {
            let expiry = bans.hosts.entry(record.target).or_insert(record.expiry);
            *expiry = (*expiry).max(record.expiry);
        }
        for record in state.subnets.into_iter().filter(|r| r.expiry > now) {
            let expiry = bans.subnets.entry(record.target).or_insert(record.expiry);
            *expiry = (*expiry).max(record.expiry);
        }
    }
}
