//! Peer list persistence
//!
//! The state of every zone and the ban table is written as JSON to a temp
//! file that is then renamed over the previous one.

use super::bans::{BanState, BAN_FOREVER};
use super::peerlist::PeerListState;
use crate::net::{Ipv4Subnet, NetworkAddress, Zone};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const P2P_NET_DATA_FILENAME: &str = "p2pstate.json";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid ban list entry on line {line}: {entry}")]
    InvalidBanEntry { line: usize, entry: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneState {
    pub zone: Zone,
    #[serde(flatten)]
    pub peers: PeerListState,
}

/// Everything written to the state file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetState {
    pub zones: Vec<ZoneState>,
    #[serde(default)]
    pub bans: BanState,
}

impl NetState {
    pub fn zone(&self, zone: Zone) -> Option<&PeerListState> {
        self.zones.iter().find(|z| z.zone == zone).map(|z| &z.peers)
    }

    pub fn take_zone(&mut self, zone: Zone) -> PeerListState {
        match self.zones.iter().position(|z| z.zone == zone) {
            Some(index) => self.zones.swap_remove(index).peers,
            None => PeerListState::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerStore {
    path: PathBuf,
}

impl PeerStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(P2P_NET_DATA_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save(&self, state: &NetState) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let file = fs::File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, state)?;
            writer.flush()?;
        }

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<NetState, StorageError> {
        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Loads the state, treating a missing or unreadable file as empty
    pub fn load_or_default(&self) -> NetState {
        if !self.exists() {
            log::info!("No peer state at {}, starting fresh", self.path.display());
            return NetState::default();
        }
        match self.load() {
            Ok(state) => {
                log::info!("Loaded peer state from {}", self.path.display());
                state
            }
            Err(e) => {
                log::warn!(
                    "Failed to load peer state from {}: {}; starting fresh",
                    self.path.display(),
                    e
                );
                NetState::default()
            }
        }
    }
}

/// One parsed ban-list line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanEntry {
    Host(NetworkAddress),
    Subnet(Ipv4Subnet),
}

impl BanEntry {
    /// Ban-list entries do not expire
    pub fn duration(&self) -> Duration {
        BAN_FOREVER
    }
}

/// Parses a ban list: one host or `a.b.c.d/n` subnet per line, `#` starts
/// a comment
pub fn parse_ban_list(text: &str) -> Result<Vec<BanEntry>, StorageError> {
    let mut entries = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let invalid = || StorageError::InvalidBanEntry {
            line: index + 1,
            entry: line.to_string(),
        };
        let entry = if line.contains('/') {
            BanEntry::Subnet(line.parse().map_err(|_| invalid())?)
        } else {
            BanEntry::Host(NetworkAddress::parse_with_default_port(line, 0).map_err(|_| invalid())?)
        };
        entries.push(entry);
    }
    Ok(entries)
}

pub fn load_ban_list(path: &Path) -> Result<Vec<BanEntry>, StorageError> {
    let text = fs::read_to_string(path)?;
    parse_ban_list(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::bans::BanRecord;
    use crate::p2p::peerlist::PeerListEntry;
    use tempfile::TempDir;

    fn sample() -> NetState {
        let entry = PeerListEntry::new("8.8.8.8:18080".parse().unwrap(), 7, 1_700_000_000, 0);
        NetState {
            zones: vec![ZoneState {
                zone: Zone::Public,
                peers: PeerListState {
                    white: vec![entry],
                    gray: vec![],
                    anchor: vec![],
                },
            }],
            bans: BanState {
                hosts: vec![BanRecord {
                    target: "1.2.3.4".to_string(),
                    expiry: i64::MAX,
                }],
                subnets: vec![],
            },
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = PeerStore::new(dir.path());
        assert!(!store.exists());

        let state = sample();
        store.save(&state).unwrap();
        assert!(store.exists());
        assert!(!store.path().with_extension("tmp").exists());
        assert_eq!(store.load().unwrap(), state);

        let mut loaded = store.load_or_default();
        assert_eq!(loaded.zone(Zone::Public).unwrap().white.len(), 1);
        assert_eq!(loaded.take_zone(Zone::Tor), PeerListState::default());
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = PeerStore::new(dir.path());
        fs::write(store.path(), b"{\"zones\": [ {\"zone\": ").unwrap();

        assert!(matches!(store.load(), Err(StorageError::SerializationError(_))));
        assert_eq!(store.load_or_default(), NetState::default());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = PeerStore::new(dir.path().join("nested"));
        assert_eq!(store.load_or_default(), NetState::default());
        store.save(&NetState::default()).unwrap();
        assert!(store.exists());
    }

    #[test]
    fn test_parse_ban_list() {
        let text = "# bad actors\n1.2.3.4\n\n10.0.0.0/8  # whole range\n5.6.7.8:18080\n";
        let entries = parse_ban_list(text).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1], BanEntry::Subnet("10.0.0.0/8".parse().unwrap()));
        match &entries[0] {
            BanEntry::Host(addr) => assert_eq!(addr.host_str(), "1.2.3.4"),
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(entries[0].duration(), BAN_FOREVER);
    }

    #[test]
    fn test_parse_ban_list_rejects_garbage() {
        let err = parse_ban_list("1.2.3.4\nnot-an-address\n").unwrap_err();
        match err {
            StorageError::InvalidBanEntry { line, entry } => {
                assert_eq!(line, 2);
                assert_eq!(entry, "not-an-address");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(parse_ban_list("1.2.3.4/40").is_err());
    }
}
