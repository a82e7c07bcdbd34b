//! IGD (UPnP) port mapping for the public listener
//!
//! Mapping failures are logged and otherwise ignored: a node without a
//! mapped port still makes outbound connections.

use parking_lot::RwLock;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Lease requested from the gateway
const PORT_MAPPING_LEASE: u32 = 3600;

/// Renew well before the lease runs out
const RENEWAL_INTERVAL: Duration = Duration::from_secs(50 * 60);

const MAPPING_DESCRIPTION: &str = "levin-p2p";

#[derive(Error, Debug)]
pub enum IgdError {
    #[error("IGD gateway not found: {0}")]
    GatewayNotFound(String),
    #[error("Failed to get external IP: {0}")]
    ExternalIp(String),
    #[error("Failed to add port mapping: {0}")]
    PortMapping(String),
    #[error("Port mapping disabled")]
    Disabled,
    #[error("No routable local IPv4 address")]
    NoLocalAddress,
    #[error("Mapping task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MappingStatus {
    pub enabled: bool,
    pub external_ip: Option<Ipv4Addr>,
    pub mapped_port: Option<u16>,
}

#[derive(Debug, Default)]
struct Mapping {
    local_ip: Option<Ipv4Addr>,
    external_ip: Option<Ipv4Addr>,
    port: Option<u16>,
}

/// Maps the p2p port on the local gateway and keeps the lease fresh
#[derive(Debug, Clone)]
pub struct PortMapper {
    enabled: bool,
    mapping: Arc<RwLock<Mapping>>,
}

impl PortMapper {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            mapping: Arc::new(RwLock::new(Mapping::default())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn status(&self) -> MappingStatus {
        let mapping = self.mapping.read();
        MappingStatus {
            enabled: self.enabled,
            external_ip: mapping.external_ip,
            mapped_port: mapping.port,
        }
    }

    /// Adds a TCP mapping for `port` and returns the external address
    pub async fn map_port(&self, port: u16) -> Result<Ipv4Addr, IgdError> {
        if !self.enabled {
            return Err(IgdError::Disabled);
        }
        let local_ip = get_local_ip().ok_or(IgdError::NoLocalAddress)?;
        log::info!("Searching for IGD gateway...");
        let external = tokio::task::spawn_blocking(move || add_mapping(local_ip, port))
            .await
            .map_err(|e| IgdError::Task(e.to_string()))??;

        let mut mapping = self.mapping.write();
        mapping.local_ip = Some(local_ip);
        mapping.external_ip = Some(external);
        mapping.port = Some(port);
        Ok(external)
    }

    /// Removes the mapping if one was made
    pub async fn unmap(&self) {
        let port = self.mapping.write().port.take();
        let Some(port) = port else {
            return;
        };
        let _ = tokio::task::spawn_blocking(move || {
            use igd_next::{search_gateway, PortMappingProtocol};
            if let Ok(gateway) = search_gateway(Default::default()) {
                match gateway.remove_port(PortMappingProtocol::TCP, port) {
                    Ok(()) => log::info!("Removed IGD port mapping for {}", port),
                    Err(e) => log::debug!("Failed to remove IGD mapping: {}", e),
                }
            }
        })
        .await;
    }

    /// Renews the lease until `cancel` fires
    pub fn spawn_renewal(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mapping = self.mapping.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RENEWAL_INTERVAL) => {}
                }
                let (local_ip, port) = {
                    let mapping = mapping.read();
                    (mapping.local_ip, mapping.port)
                };
                let (Some(local_ip), Some(port)) = (local_ip, port) else {
                    break;
                };
                match tokio::task::spawn_blocking(move || add_mapping(local_ip, port)).await {
                    Ok(Ok(_)) => log::debug!("Renewed IGD port mapping"),
                    Ok(Err(e)) => log::warn!("Failed to renew IGD port mapping: {}", e),
                    Err(e) => log::warn!("IGD renewal task failed: {}", e),
                }
            }
        })
    }
}

fn add_mapping(local_ip: Ipv4Addr, port: u16) -> Result<Ipv4Addr, IgdError> {
    use igd_next::{search_gateway, PortMappingProtocol};

    let gateway =
        search_gateway(Default::default()).map_err(|e| IgdError::GatewayNotFound(e.to_string()))?;
    log::info!("Found IGD gateway: {}", gateway.addr);

    let external = match gateway
        .get_external_ip()
        .map_err(|e| IgdError::ExternalIp(e.to_string()))?
    {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => return Err(IgdError::ExternalIp(format!("IPv6 gateway address {}", ip))),
    };

    let local_addr = SocketAddr::V4(SocketAddrV4::new(local_ip, port));
    gateway
        .add_port(
            PortMappingProtocol::TCP,
            port,
            local_addr,
            PORT_MAPPING_LEASE,
            MAPPING_DESCRIPTION,
        )
        .map_err(|e| IgdError::PortMapping(e.to_string()))?;
    log::info!("Mapped {}:{} -> {}", external, port, local_addr);
    Ok(external)
}

/// Local address of the default route; no packet is sent
pub fn get_local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}
