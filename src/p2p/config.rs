//! Node server configuration

use crate::net::{NetworkAddress, Zone};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Constants
// =============================================================================

pub const P2P_DEFAULT_PORT: u16 = 18080;
pub const P2P_DEFAULT_CONNECTIONS_COUNT: usize = 12;
pub const P2P_DEFAULT_ANCHOR_CONNECTIONS_COUNT: usize = 2;
pub const P2P_DEFAULT_HANDSHAKE_INTERVAL: Duration = Duration::from_secs(60);
pub const P2P_DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const P2P_DEFAULT_PING_CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);
pub const P2P_DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const P2P_DEFAULT_HANDSHAKE_INVOKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const P2P_FAILED_ADDR_FORGET_SECONDS: i64 = 60 * 60;
pub const P2P_PEERLIST_STORE_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const P2P_GRAY_PEERLIST_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
pub const P2P_CONNECTION_MAKER_INTERVAL: Duration = Duration::from_secs(1);

/// Inbound connections allowed per public host
pub const P2P_DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 1;
/// Inbound connections allowed per local host, so test setups can share one
pub const P2P_LOCAL_MAX_CONNECTIONS_PER_IP: usize = 4;

pub const MAINNET_NETWORK_ID: Uuid = Uuid::from_bytes([
    0x12, 0x30, 0xF1, 0x71, 0x61, 0x04, 0x41, 0x61, 0x17, 0x31, 0x00, 0x82, 0x16, 0xA1, 0xA1, 0x10,
]);

pub const MAINNET_SEED_NODES: &[&str] = &[
    "176.9.0.187:18080",
    "88.198.163.90:18080",
    "66.85.74.134:18080",
    "51.79.173.165:18080",
    "192.99.8.110:18080",
    "37.187.74.171:18080",
    "77.172.183.193:18080",
];

// =============================================================================
// Config
// =============================================================================

/// One network zone
#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub zone: Zone,
    /// Listening address; anonymity zones have none
    pub bind: Option<SocketAddr>,
    /// SOCKS5 proxy used for every outbound connection of the zone
    pub proxy: Option<SocketAddr>,
    pub max_out_peers: usize,
    /// `None` means unlimited
    pub max_in_peers: Option<usize>,
}

impl ZoneConfig {
    pub fn public(bind: SocketAddr) -> Self {
        Self {
            zone: Zone::Public,
            bind: Some(bind),
            proxy: None,
            max_out_peers: P2P_DEFAULT_CONNECTIONS_COUNT,
            max_in_peers: None,
        }
    }

    /// A zone reached only through `proxy`
    pub fn proxied(zone: Zone, proxy: SocketAddr) -> Self {
        Self {
            zone,
            bind: None,
            proxy: Some(proxy),
            max_out_peers: P2P_DEFAULT_CONNECTIONS_COUNT,
            max_in_peers: Some(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network_id: Uuid,
    /// Where the peer state file lives
    pub data_dir: PathBuf,
    pub zones: Vec<ZoneConfig>,
    /// Announce port 0 and skip port mapping
    pub hide_my_port: bool,
    /// Neither listen nor connect
    pub offline: bool,
    pub allow_local_ip: bool,
    pub igd: bool,
    /// Added to the white list at startup
    pub add_peers: Vec<NetworkAddress>,
    /// Kept connected at all times
    pub priority_nodes: Vec<NetworkAddress>,
    /// When set, the only peers ever connected to
    pub exclusive_nodes: Vec<NetworkAddress>,
    /// Replaces the built-in seed list when not empty
    pub seed_nodes: Vec<NetworkAddress>,
    pub use_builtin_seeds: bool,
    pub anchor_connections: usize,
    /// Inbound cap per host; `None` picks the default for the address class
    pub max_connections_per_ip: Option<usize>,
    /// kB/s, 0 for unlimited
    pub limit_rate_up: u64,
    pub limit_rate_down: u64,
    pub ban_list: Option<PathBuf>,
    pub connection_timeout: Duration,
    pub ping_timeout: Duration,
    pub handshake_timeout: Duration,
    pub invoke_timeout: Duration,
    pub handshake_interval: Duration,
    pub store_interval: Duration,
    /// Write the peer state file at shutdown and periodically
    pub persist: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network_id: MAINNET_NETWORK_ID,
            data_dir: PathBuf::from(".levin_p2p"),
            zones: vec![ZoneConfig::public(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                P2P_DEFAULT_PORT,
            ))],
            hide_my_port: false,
            offline: false,
            allow_local_ip: false,
            igd: true,
            add_peers: Vec::new(),
            priority_nodes: Vec::new(),
            exclusive_nodes: Vec::new(),
            seed_nodes: Vec::new(),
            use_builtin_seeds: true,
            anchor_connections: P2P_DEFAULT_ANCHOR_CONNECTIONS_COUNT,
            max_connections_per_ip: None,
            limit_rate_up: 0,
            limit_rate_down: 0,
            ban_list: None,
            connection_timeout: P2P_DEFAULT_CONNECTION_TIMEOUT,
            ping_timeout: P2P_DEFAULT_PING_CONNECTION_TIMEOUT,
            handshake_timeout: P2P_DEFAULT_HANDSHAKE_INVOKE_TIMEOUT,
            invoke_timeout: P2P_DEFAULT_INVOKE_TIMEOUT,
            handshake_interval: P2P_DEFAULT_HANDSHAKE_INTERVAL,
            store_interval: P2P_PEERLIST_STORE_INTERVAL,
            persist: true,
        }
    }
}

impl NodeConfig {
    /// A node listening on `bind` with no seeds and no port mapping,
    /// for local networks and tests
    pub fn local(bind: SocketAddr, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            zones: vec![ZoneConfig::public(bind)],
            allow_local_ip: true,
            igd: false,
            use_builtin_seeds: false,
            ..Self::default()
        }
    }

    pub fn zone(&self, zone: Zone) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| z.zone == zone)
    }

    /// Seeds for the public zone
    pub fn seeds(&self) -> Vec<NetworkAddress> {
        if !self.seed_nodes.is_empty() {
            return self.seed_nodes.clone();
        }
        if !self.use_builtin_seeds {
            return Vec::new();
        }
        MAINNET_SEED_NODES
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Inbound connections allowed from one host
    pub fn max_connections_per_ip(&self, address: &NetworkAddress) -> usize {
        match self.max_connections_per_ip {
            Some(max) => max,
            None if address.is_local() || address.is_loopback() => P2P_LOCAL_MAX_CONNECTIONS_PER_IP,
            None => P2P_DEFAULT_MAX_CONNECTIONS_PER_IP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_seeds() {
        let config = NodeConfig::default();
        assert_eq!(config.seeds().len(), MAINNET_SEED_NODES.len());
        assert_eq!(config.zone(Zone::Public).and_then(|z| z.bind).map(|b| b.port()), Some(P2P_DEFAULT_PORT));

        let custom = NodeConfig {
            seed_nodes: vec!["1.2.3.4:18080".parse().unwrap()],
            ..NodeConfig::default()
        };
        assert_eq!(custom.seeds().len(), 1);

        let local = NodeConfig::local("127.0.0.1:0".parse().unwrap(), "/tmp/x");
        assert!(local.seeds().is_empty());
        assert!(local.zone(Zone::Tor).is_none());
    }

    #[test]
    fn test_per_ip_limit_depends_on_address_class() {
        let config = NodeConfig::default();
        assert_eq!(config.max_connections_per_ip(&"8.8.8.8:1".parse().unwrap()), 1);
        assert_eq!(config.max_connections_per_ip(&"192.168.1.2:1".parse().unwrap()), 4);
        assert_eq!(config.max_connections_per_ip(&"127.0.0.1:1".parse().unwrap()), 4);

        let fixed = NodeConfig {
            max_connections_per_ip: Some(3),
            ..NodeConfig::default()
        };
        assert_eq!(fixed.max_connections_per_ip(&"8.8.8.8:1".parse().unwrap()), 3);
    }
}
