//! Peer addresses and network zones
//!
//! A `NetworkAddress` is the key for peer-list membership and bans. Clearnet
//! addresses live in the public zone; onion and garlic hosts live in their
//! own anonymity zones and are only reachable through a proxy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;
use thiserror::Error;

/// Address parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Missing port in {0}")]
    MissingPort(String),
    #[error("Invalid subnet prefix /{0}")]
    InvalidPrefix(u32),
}

// =============================================================================
// Zone
// =============================================================================

/// Logical network a peer lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Zone {
    Public,
    Tor,
    I2p,
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Public => write!(f, "public"),
            Zone::Tor => write!(f, "tor"),
            Zone::I2p => write!(f, "i2p"),
        }
    }
}

impl FromStr for Zone {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" | "clearnet" => Ok(Zone::Public),
            "tor" => Ok(Zone::Tor),
            "i2p" => Ok(Zone::I2p),
            other => Err(AddressError::InvalidAddress(format!("unknown zone {}", other))),
        }
    }
}

// =============================================================================
// Network Address
// =============================================================================

/// Address of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NetworkAddress {
    Ipv4(SocketAddrV4),
    Ipv6(SocketAddrV6),
    Tor { host: String, port: u16 },
    I2p { host: String, port: u16 },
}

impl NetworkAddress {
    pub fn zone(&self) -> Zone {
        match self {
            NetworkAddress::Ipv4(_) | NetworkAddress::Ipv6(_) => Zone::Public,
            NetworkAddress::Tor { .. } => Zone::Tor,
            NetworkAddress::I2p { .. } => Zone::I2p,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            NetworkAddress::Ipv4(addr) => addr.port(),
            NetworkAddress::Ipv6(addr) => addr.port(),
            NetworkAddress::Tor { port, .. } | NetworkAddress::I2p { port, .. } => *port,
        }
    }

    /// Same host on another port
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            NetworkAddress::Ipv4(addr) => NetworkAddress::Ipv4(SocketAddrV4::new(*addr.ip(), port)),
            NetworkAddress::Ipv6(addr) => {
                NetworkAddress::Ipv6(SocketAddrV6::new(*addr.ip(), port, 0, 0))
            }
            NetworkAddress::Tor { host, .. } => NetworkAddress::Tor {
                host: host.clone(),
                port,
            },
            NetworkAddress::I2p { host, .. } => NetworkAddress::I2p {
                host: host.clone(),
                port,
            },
        }
    }

    /// Host part without the port; bans are keyed on this
    pub fn host_str(&self) -> String {
        match self {
            NetworkAddress::Ipv4(addr) => addr.ip().to_string(),
            NetworkAddress::Ipv6(addr) => addr.ip().to_string(),
            NetworkAddress::Tor { host, .. } | NetworkAddress::I2p { host, .. } => host.clone(),
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            NetworkAddress::Ipv4(addr) => Some(*addr.ip()),
            _ => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            NetworkAddress::Ipv4(addr) => Some(SocketAddr::V4(*addr)),
            NetworkAddress::Ipv6(addr) => Some(SocketAddr::V6(*addr)),
            _ => None,
        }
    }

    pub fn is_loopback(&self) -> bool {
        match self {
            NetworkAddress::Ipv4(addr) => addr.ip().is_loopback(),
            NetworkAddress::Ipv6(addr) => addr.ip().is_loopback(),
            _ => false,
        }
    }

    /// Private, link-local and unique-local ranges
    pub fn is_local(&self) -> bool {
        match self {
            NetworkAddress::Ipv4(addr) => {
                let ip = addr.ip();
                ip.is_private() || ip.is_link_local()
            }
            NetworkAddress::Ipv6(addr) => {
                let first = addr.ip().segments()[0];
                (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
            }
            _ => false,
        }
    }

    /// Anonymity-network addresses cannot be banned meaningfully
    pub fn is_blockable(&self) -> bool {
        matches!(self, NetworkAddress::Ipv4(_) | NetworkAddress::Ipv6(_))
    }

    pub fn is_same_host(&self, other: &NetworkAddress) -> bool {
        self.zone() == other.zone() && self.host_str() == other.host_str()
    }

    /// Parses `host[:port]`, using `default_port` when the port is absent
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Result<Self, AddressError> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<NetworkAddress>() {
            return Ok(addr);
        }
        if let Ok(ip) = s.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(NetworkAddress::from(SocketAddr::new(ip, default_port)));
        }
        if let Some(addr) = anonymous_address(s, default_port) {
            return Ok(addr);
        }
        Err(AddressError::InvalidAddress(s.to_string()))
    }
}

fn anonymous_address(host: &str, port: u16) -> Option<NetworkAddress> {
    let lower = host.to_ascii_lowercase();
    if lower.ends_with(".onion") && lower.len() > ".onion".len() {
        Some(NetworkAddress::Tor { host: lower, port })
    } else if lower.ends_with(".i2p") && lower.len() > ".i2p".len() {
        Some(NetworkAddress::I2p { host: lower, port })
    } else {
        None
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => NetworkAddress::Ipv4(v4),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => NetworkAddress::Ipv4(SocketAddrV4::new(v4, v6.port())),
                None => NetworkAddress::Ipv6(SocketAddrV6::new(*v6.ip(), v6.port(), 0, 0)),
            },
        }
    }
}

impl From<SocketAddrV4> for NetworkAddress {
    fn from(addr: SocketAddrV4) -> Self {
        NetworkAddress::Ipv4(addr)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkAddress::Ipv4(addr) => write!(f, "{}", addr),
            NetworkAddress::Ipv6(addr) => write!(f, "{}", addr),
            NetworkAddress::Tor { host, port } | NetworkAddress::I2p { host, port } => {
                write!(f, "{}:{}", host, port)
            }
        }
    }
}

impl FromStr for NetworkAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(NetworkAddress::from(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidAddress(s.to_string()))?;
        anonymous_address(host, port).ok_or_else(|| AddressError::InvalidAddress(s.to_string()))
    }
}

// =============================================================================
// IPv4 Subnet
// =============================================================================

/// An IPv4 network, stored with the host bits cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ipv4Subnet {
    ip: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    pub fn new(ip: Ipv4Addr, prefix: u32) -> Result<Self, AddressError> {
        if prefix > 32 {
            return Err(AddressError::InvalidPrefix(prefix));
        }
        let mask = Self::mask_for(prefix as u8);
        Ok(Self {
            ip: Ipv4Addr::from(u32::from(ip) & mask),
            prefix: prefix as u8,
        })
    }

    fn mask_for(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix as u32)
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn matches(&self, ip: &Ipv4Addr) -> bool {
        u32::from(*ip) & Self::mask_for(self.prefix) == u32::from(self.ip)
    }

    pub fn contains(&self, address: &NetworkAddress) -> bool {
        address.ipv4().map(|ip| self.matches(&ip)).unwrap_or(false)
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, prefix) = s
            .split_once('/')
            .ok_or_else(|| AddressError::InvalidAddress(s.to_string()))?;
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| AddressError::InvalidAddress(s.to_string()))?;
        let prefix: u32 = prefix
            .parse()
            .map_err(|_| AddressError::InvalidAddress(s.to_string()))?;
        Self::new(ip, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn addr(s: &str) -> NetworkAddress {
        s.parse().unwrap()
    }

    fn ipv6(ip: Ipv6Addr, port: u16) -> NetworkAddress {
        NetworkAddress::from(SocketAddr::new(IpAddr::V6(ip), port))
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(addr("1.2.3.4:18080").to_string(), "1.2.3.4:18080");
        assert_eq!(addr("[2001:db8::1]:18080").to_string(), "[2001:db8::1]:18080");
        let onion = addr("abcdefghij.onion:18083");
        assert_eq!(onion.zone(), Zone::Tor);
        assert_eq!(onion.to_string(), "abcdefghij.onion:18083");
        assert_eq!(addr("peer.b32.i2p:0").zone(), Zone::I2p);

        assert!(matches!(
            "1.2.3.4".parse::<NetworkAddress>(),
            Err(AddressError::MissingPort(_))
        ));
        assert!("example.com:80".parse::<NetworkAddress>().is_err());
    }

    #[test]
    fn test_default_port() {
        assert_eq!(
            NetworkAddress::parse_with_default_port("1.2.3.4", 18080).unwrap(),
            addr("1.2.3.4:18080")
        );
        assert_eq!(
            NetworkAddress::parse_with_default_port("1.2.3.4:5", 18080).unwrap(),
            addr("1.2.3.4:5")
        );
        assert_eq!(
            NetworkAddress::parse_with_default_port("xyz.onion", 18083)
                .unwrap()
                .port(),
            18083
        );
    }

    #[test]
    fn test_mapped_ipv6_becomes_ipv4() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:1234".parse().unwrap();
        assert_eq!(NetworkAddress::from(mapped), addr("10.0.0.1:1234"));
    }

    #[test]
    fn test_classification() {
        assert!(addr("127.0.0.1:1").is_loopback());
        assert!(addr("[::1]:1").is_loopback());
        assert!(addr("10.1.2.3:1").is_local());
        assert!(addr("192.168.0.1:1").is_local());
        assert!(addr("172.16.5.5:1").is_local());
        assert!(addr("169.254.1.1:1").is_local());
        assert!(ipv6("fd00::1".parse().unwrap(), 1).is_local());
        assert!(ipv6("fe80::1".parse().unwrap(), 1).is_local());
        assert!(!addr("8.8.8.8:1").is_local());
        assert!(addr("8.8.8.8:1").is_blockable());
        assert!(!addr("x.onion:1").is_blockable());
    }

    #[test]
    fn test_same_host_ignores_port() {
        assert!(addr("1.2.3.4:5").is_same_host(&addr("1.2.3.4:6")));
        assert!(!addr("1.2.3.4:5").is_same_host(&addr("1.2.3.5:5")));
        assert_eq!(addr("1.2.3.4:5").with_port(9), addr("1.2.3.4:9"));
    }

    #[test]
    fn test_subnet_matching() {
        let subnet: Ipv4Subnet = "1.2.3.4/24".parse().unwrap();
        assert_eq!(subnet.to_string(), "1.2.3.0/24");
        assert!(subnet.matches(&"1.2.3.255".parse().unwrap()));
        assert!(subnet.matches(&"1.2.3.0".parse().unwrap()));
        assert!(!subnet.matches(&"1.2.4.0".parse().unwrap()));
        assert!(!subnet.matches(&"1.2.2.0".parse().unwrap()));
        assert_eq!(subnet, "1.2.3.8/24".parse().unwrap());
        assert!(subnet.contains(&addr("1.2.3.9:18080")));
        assert!(!subnet.contains(&addr("x.onion:1")));

        let everything: Ipv4Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(everything.matches(&"200.1.1.1".parse().unwrap()));
        assert!(matches!(
            "1.2.3.4/33".parse::<Ipv4Subnet>(),
            Err(AddressError::InvalidPrefix(33))
        ));
    }
}
