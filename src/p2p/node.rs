//! Node server
//!
//! Owns the listeners, the outbound connection maker and the peer-level
//! commands (handshake, timed sync, ping, support flags) of every zone.
//! Chain-sync notifications are passed through to the `ProtocolHandler`,
//! which reaches other connections through the `P2pEndpoint` implemented
//! here.
//!
//! A connection context may be held while taking the peer list or ban list
//! locks, never the other way around.

use super::bans::{BanList, FailOutcome};
use super::config::{NodeConfig, ZoneConfig, P2P_CONNECTION_MAKER_INTERVAL, P2P_FAILED_ADDR_FORGET_SECONDS, P2P_GRAY_PEERLIST_HOUSEKEEPING_INTERVAL};
use super::messages::*;
use super::peerlist::{
    unix_now, AnchorPeerlistEntry, PeerListEntry, PeerListManager, Pool, P2P_DEFAULT_PEERS_IN_HANDSHAKE,
};
use super::storage::{load_ban_list, BanEntry, NetState, PeerStore, StorageError, ZoneState};
use crate::core::RelayMethod;
use crate::levin::{decode_payload, encode_payload, LEVIN_DEFAULT_MAX_PACKET_SIZE};
use crate::net::{
    socks, CommandHandler, Connection, ConnectionConfig, ConnectionState, HandlerError, InvokeError,
    Ipv4Subnet, MappingStatus, NetworkAddress, PortMapper, SocksError, Throttle, Zone,
};
use crate::protocol::messages::{NotifyNewTransactions, NOTIFY_NEW_TRANSACTIONS};
use crate::protocol::{P2pEndpoint, ProtocolHandler};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Seeds are asked again only after this long
const SEED_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Background tasks get this long to wind down at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection to {0} timed out")]
    ConnectTimeout(NetworkAddress),
    #[error("No proxy configured for zone {0}")]
    NoProxy(Zone),
    #[error("Proxy error: {0}")]
    Socks(#[from] SocksError),
    #[error("Request failed: {0}")]
    Invoke(#[from] InvokeError),
    #[error("Peer is on network {0}")]
    WrongNetwork(Uuid),
    #[error("Connected to ourselves")]
    SelfConnection,
    #[error("Peer rejected: {0}")]
    Rejected(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Zone {0} is not configured")]
    UnknownZone(Zone),
    #[error("Address {0} is blocked")]
    NotAllowed(NetworkAddress),
}

// =============================================================================
// Status
// =============================================================================

/// One live connection, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub address: NetworkAddress,
    pub incoming: bool,
    pub state: ConnectionState,
    pub peer_id: Option<u64>,
    pub height: u64,
    pub score: i64,
    pub support_flags: u32,
    pub pruning_seed: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub live_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub zone: Zone,
    pub listening: Option<SocketAddr>,
    pub incoming: usize,
    pub outgoing: usize,
    pub max_out_peers: usize,
    pub white: usize,
    pub gray: usize,
    pub anchor: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub peer_id: u64,
    pub height: u64,
    pub target_height: u64,
    pub synchronized: bool,
    pub zones: Vec<ZoneStatus>,
    pub connections: Vec<ConnectionInfo>,
    pub blocked_hosts: usize,
    pub blocked_subnets: usize,
    pub port_mapping: MappingStatus,
}

// =============================================================================
// Node server
// =============================================================================

struct NetZone {
    config: ZoneConfig,
    peerlist: PeerListManager,
    /// Bound at `init`, taken by `run`
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Handles the connections opened for one exchange only (ping-back, seed
/// and gray-list checks); the peer's requests are refused
struct OneShotHandler;

impl CommandHandler for OneShotHandler {
    fn on_invoke(&self, _conn: &Connection, command: u32, _payload: &[u8]) -> Result<Bytes, HandlerError> {
        Err(HandlerError::NotHandled(command))
    }

    fn on_notify(&self, _conn: &Connection, _command: u32, _payload: &[u8]) -> Result<(), HandlerError> {
        Ok(())
    }
}

pub struct NodeServer {
    config: NodeConfig,
    peer_id: u64,
    handler: Arc<ProtocolHandler>,
    zones: HashMap<Zone, NetZone>,
    bans: BanList,
    store: PeerStore,
    connections: RwLock<HashMap<Uuid, Connection>>,
    /// Outbound attempts in flight
    connecting: Mutex<HashSet<NetworkAddress>>,
    /// Unix time of the last failed attempt per address
    failed: Mutex<HashMap<NetworkAddress, i64>>,
    throttle_in: Arc<Throttle>,
    throttle_out: Arc<Throttle>,
    igd: PortMapper,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    anchors_tried: AtomicBool,
    last_seed_attempt: Mutex<Option<Instant>>,
    this: Weak<NodeServer>,
}

impl NodeServer {
    /// Loads the persisted peer lists and bans and wires the node into
    /// `handler`. Nothing is bound or connected until `init` and `run`.
    pub fn new(config: NodeConfig, handler: Arc<ProtocolHandler>) -> Result<Arc<Self>, NodeError> {
        let store = PeerStore::new(&config.data_dir);
        let mut state = store.load_or_default();

        let bans = BanList::default();
        bans.restore(std::mem::take(&mut state.bans));
        if let Some(path) = &config.ban_list {
            let entries = load_ban_list(path)?;
            for entry in &entries {
                match entry {
                    BanEntry::Host(address) => {
                        bans.block_host(address, entry.duration(), true);
                    }
                    BanEntry::Subnet(subnet) => {
                        bans.block_subnet(*subnet, entry.duration());
                    }
                }
            }
            log::info!("{} entries loaded from ban list {}", entries.len(), path.display());
        }

        let mut zones = HashMap::new();
        for zone_config in &config.zones {
            let peerlist = PeerListManager::new(zone_config.zone, config.allow_local_ip);
            peerlist.init(state.take_zone(zone_config.zone));
            log::info!(
                "{} zone: {} white, {} gray and {} anchor peers loaded",
                zone_config.zone,
                peerlist.get_white_peers_count(),
                peerlist.get_gray_peers_count(),
                peerlist.get_anchor_peers_count()
            );
            zones.insert(
                zone_config.zone,
                NetZone {
                    config: zone_config.clone(),
                    peerlist,
                    listener: Mutex::new(None),
                    local_addr: Mutex::new(None),
                },
            );
        }

        for address in &config.add_peers {
            match zones.get(&address.zone()) {
                Some(zone) => {
                    let entry = PeerListEntry::new(address.clone(), rand::random(), unix_now(), 0);
                    zone.peerlist.append_with_peer_white(entry, true);
                }
                None => log::warn!("Ignoring peer {}: zone {} is not configured", address, address.zone()),
            }
        }

        let igd = PortMapper::new(config.igd && !config.hide_my_port && !config.offline);
        let node = Arc::new_cyclic(|this| NodeServer {
            peer_id: rand::random(),
            handler,
            zones,
            bans,
            store,
            connections: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashMap::new()),
            throttle_in: Arc::new(Throttle::new(config.limit_rate_down)),
            throttle_out: Arc::new(Throttle::new(config.limit_rate_up)),
            igd,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            anchors_tried: AtomicBool::new(false),
            last_seed_attempt: Mutex::new(None),
            this: this.clone(),
            config,
        });

        let endpoint: Arc<dyn P2pEndpoint> = node.clone();
        node.handler.set_p2p(Arc::downgrade(&endpoint));
        log::info!("Node id {:016x}", node.peer_id);
        Ok(node)
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn handler(&self) -> &Arc<ProtocolHandler> {
        &self.handler
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub fn peerlist(&self, zone: Zone) -> Option<&PeerListManager> {
        self.zones.get(&zone).map(|z| &z.peerlist)
    }

    /// Where the zone listens, once `init` has bound it
    pub fn local_addr(&self, zone: Zone) -> Option<SocketAddr> {
        self.zones.get(&zone).and_then(|z| *z.local_addr.lock())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Binds the listener of every zone that has one and maps the public
    /// port on the gateway. Fails if a bind address is taken.
    pub async fn init(&self) -> Result<(), NodeError> {
        if self.config.offline {
            log::info!("Offline mode, not listening");
            return Ok(());
        }

        for zone in self.zones.values() {
            let Some(bind) = zone.config.bind else { continue };
            let listener = TcpListener::bind(bind)
                .await
                .map_err(|source| NodeError::Bind { address: bind, source })?;
            let local = listener.local_addr()?;
            log::info!("Listening on {} ({} zone)", local, zone.config.zone);
            *zone.local_addr.lock() = Some(local);
            *zone.listener.lock() = Some(listener);
        }

        if self.igd.is_enabled() {
            if let Some(local) = self.local_addr(Zone::Public) {
                match self.igd.map_port(local.port()).await {
                    Ok(external) => log::info!("Mapped port {} on gateway, external ip {}", local.port(), external),
                    Err(e) => log::warn!("Port mapping failed: {}", e),
                }
            }
        }
        Ok(())
    }

    /// Starts the accept loops, the connection maker, the housekeeping
    /// timers and the protocol handler's idle tasks
    pub fn run(self: &Arc<Self>) {
        let mut tasks = Vec::new();
        for (zone, net_zone) in &self.zones {
            if let Some(listener) = net_zone.listener.lock().take() {
                tasks.push(tokio::spawn(self.clone().accept_loop(*zone, listener)));
            }
        }

        tasks.push(tokio::spawn(
            self.handler.clone().run_idle_tasks(self.cancel.child_token()),
        ));
        if !self.config.offline {
            tasks.push(tokio::spawn(self.clone().connection_maker_loop()));
        }
        tasks.push(tokio::spawn(self.clone().housekeeping_loop()));
        if self.igd.status().mapped_port.is_some() {
            tasks.push(self.igd.spawn_renewal(self.cancel.child_token()));
        }

        self.tasks.lock().extend(tasks);
        log::info!("Node server started");
    }

    /// Stores the peer state, closes every connection and stops the
    /// background tasks
    pub async fn shutdown(&self) {
        log::info!("Stopping node server");
        self.handler.stop();
        self.rebuild_anchors();
        if self.config.persist {
            if let Err(e) = self.store_state() {
                log::warn!("Failed to store peer state: {}", e);
            }
        }

        self.cancel.cancel();
        for conn in self.snapshot() {
            conn.close();
        }
        if self.igd.status().mapped_port.is_some() {
            self.igd.unmap().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks)).await.is_err() {
            log::warn!("Background tasks did not stop in time");
        }
        log::info!("Node server stopped");
    }

    /// Writes peer lists and bans to the state file
    pub fn store_state(&self) -> Result<(), NodeError> {
        let mut zones: Vec<ZoneState> = self
            .zones
            .values()
            .map(|z| ZoneState {
                zone: z.config.zone,
                peers: z.peerlist.snapshot(),
            })
            .collect();
        zones.sort_by_key(|z| z.zone);
        let state = NetState {
            zones,
            bans: self.bans.snapshot(),
        };
        self.store.save(&state)?;
        log::info!("Peer state saved to {}", self.store.path().display());
        Ok(())
    }

    /// Replaces the anchor lists with the current outbound connections
    fn rebuild_anchors(&self) {
        for zone in self.zones.values() {
            zone.peerlist.get_and_empty_anchor_peerlist();
        }
        for conn in self.snapshot() {
            if conn.is_incoming() {
                continue;
            }
            let (peer_id, age) = conn.with_context(|ctx| (ctx.peer_id, ctx.started.elapsed().as_secs()));
            let (Some(peer_id), Some(peerlist)) = (peer_id, self.peerlist(conn.remote_address().zone())) else {
                continue;
            };
            peerlist.append_with_peer_anchor(AnchorPeerlistEntry {
                address: conn.remote_address().clone(),
                id: peer_id,
                first_seen: unix_now() - age as i64,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    fn snapshot(&self) -> Vec<Connection> {
        self.connections
            .read()
            .values()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    fn register(&self, conn: Connection) -> Connection {
        self.connections.write().insert(conn.id(), conn.clone());
        // on_close may have run before the insert
        if conn.is_closed() {
            self.connections.write().remove(&conn.id());
        }
        conn
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            throttle_in: self.throttle_in.clone(),
            throttle_out: self.throttle_out.clone(),
            parent: self.cancel.clone(),
            ..ConnectionConfig::default()
        }
    }

    fn count_connections(&self, zone: Zone, incoming: bool) -> usize {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_incoming() == incoming && c.remote_address().zone() == zone)
            .count()
    }

    /// Listening addresses of the connected peers plus the ones being dialled
    fn connected_addresses(&self) -> HashSet<NetworkAddress> {
        let mut addresses: HashSet<NetworkAddress> = self.connecting.lock().iter().cloned().collect();
        for conn in self.snapshot() {
            if !conn.is_incoming() {
                addresses.insert(conn.remote_address().clone());
                continue;
            }
            // a busy context is skipped rather than waited for
            let port = conn.try_context().map(|ctx| ctx.remote_port).unwrap_or(0);
            if let Ok(port) = u16::try_from(port) {
                if port != 0 {
                    addresses.insert(conn.remote_address().with_port(port));
                }
            }
        }
        addresses
    }

    fn recently_failed(&self) -> HashSet<NetworkAddress> {
        let now = unix_now();
        let mut failed = self.failed.lock();
        failed.retain(|_, at| now - *at < P2P_FAILED_ADDR_FORGET_SECONDS);
        failed.keys().cloned().collect()
    }

    fn is_own_address(&self, address: &NetworkAddress) -> bool {
        match self.local_addr(address.zone()) {
            Some(local) => {
                local.port() == address.port()
                    && (address.is_loopback()
                        || address.is_local()
                        || address.socket_addr().map(|a| a.ip()) == Some(local.ip()))
            }
            None => false,
        }
    }

    fn node_data(&self, zone: Zone) -> BasicNodeData {
        let my_port = if self.config.hide_my_port {
            0
        } else {
            self.local_addr(zone).map(|a| a.port()).unwrap_or(0)
        };
        BasicNodeData {
            network_id: self.config.network_id,
            my_port: u32::from(my_port),
            peer_id: self.peer_id,
            support_flags: P2P_SUPPORT_FLAGS,
        }
    }

    fn check_node_data(&self, data: &BasicNodeData, zone: Zone) -> Result<(), NodeError> {
        if data.network_id != self.config.network_id {
            return Err(NodeError::WrongNetwork(data.network_id));
        }
        if zone == Zone::Public && data.peer_id == self.peer_id {
            return Err(NodeError::SelfConnection);
        }
        Ok(())
    }

    /// Another live connection already carries this peer id
    fn is_peer_connected(&self, current: &Connection, peer_id: u64) -> bool {
        self.snapshot().iter().any(|conn| {
            conn.id() != current.id()
                && conn.remote_address().zone() == current.remote_address().zone()
                && conn.try_context().map_or(false, |ctx| ctx.peer_id == Some(peer_id))
        })
    }

    /// Anonymised white-list head sent to peers
    fn gossip_head(&self, zone: Zone) -> Vec<PeerListEntry> {
        self.peerlist(zone)
            .map(|pl| pl.get_peerlist_head(true, P2P_DEFAULT_PEERS_IN_HANDSHAKE))
            .unwrap_or_default()
    }

    fn merge_gossip(&self, zone: Zone, entries: &[PeerListEntry]) {
        let Some(peerlist) = self.peerlist(zone) else { return };
        peerlist.merge_peerlist(entries, |e| {
            e.address.zone() == zone
                && e.address.port() != 0
                && self.bans.is_allowed(&e.address)
                && !self.is_own_address(&e.address)
        });
    }

    /// Forgets the host and closes every connection to it
    fn evict_host(&self, address: &NetworkAddress) {
        for zone in self.zones.values() {
            zone.peerlist.evict_host_from_peerlist(address);
        }
        for conn in self.snapshot() {
            if conn.remote_address().is_same_host(address) {
                log::info!("{} closing connection to blocked host", conn);
                conn.close();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Bans
    // -------------------------------------------------------------------------

    pub fn block_host(&self, address: &NetworkAddress, duration: Duration) -> bool {
        if !self.bans.block_host(address, duration, false) {
            return false;
        }
        self.evict_host(address);
        true
    }

    pub fn unblock_host(&self, address: &NetworkAddress) -> bool {
        self.bans.unblock_host(address)
    }

    pub fn block_subnet(&self, subnet: Ipv4Subnet, duration: Duration) -> bool {
        if !self.bans.block_subnet(subnet, duration) {
            return false;
        }
        for zone in self.zones.values() {
            zone.peerlist.filter(Pool::White, |e| subnet.contains(&e.address));
            zone.peerlist.filter(Pool::Gray, |e| subnet.contains(&e.address));
        }
        for conn in self.snapshot() {
            if subnet.contains(conn.remote_address()) {
                log::info!("{} closing connection to blocked subnet {}", conn, subnet);
                conn.close();
            }
        }
        true
    }

    pub fn unblock_subnet(&self, subnet: &Ipv4Subnet) -> bool {
        self.bans.unblock_subnet(subnet)
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn status(&self) -> NodeStatus {
        let connections: Vec<ConnectionInfo> = self
            .snapshot()
            .iter()
            .map(|conn| {
                let ctx = conn.context_snapshot();
                let stats = conn.stats();
                ConnectionInfo {
                    id: conn.id(),
                    address: conn.remote_address().clone(),
                    incoming: conn.is_incoming(),
                    state: ctx.state,
                    peer_id: ctx.peer_id,
                    height: ctx.remote_blockchain_height,
                    score: ctx.score,
                    support_flags: ctx.support_flags,
                    pruning_seed: ctx.pruning_seed,
                    bytes_in: stats.bytes_in,
                    bytes_out: stats.bytes_out,
                    live_secs: ctx.started.elapsed().as_secs(),
                }
            })
            .collect();

        let mut zones: Vec<ZoneStatus> = self
            .zones
            .values()
            .map(|z| {
                let zone = z.config.zone;
                let in_zone = connections.iter().filter(|c| c.address.zone() == zone);
                let incoming = in_zone.clone().filter(|c| c.incoming).count();
                ZoneStatus {
                    zone,
                    listening: *z.local_addr.lock(),
                    incoming,
                    outgoing: in_zone.count() - incoming,
                    max_out_peers: z.config.max_out_peers,
                    white: z.peerlist.get_white_peers_count(),
                    gray: z.peerlist.get_gray_peers_count(),
                    anchor: z.peerlist.get_anchor_peers_count(),
                }
            })
            .collect();
        zones.sort_by_key(|z| z.zone);

        NodeStatus {
            peer_id: self.peer_id,
            height: self.handler.core().height(),
            target_height: self.handler.target_height(),
            synchronized: self.handler.is_synchronized(),
            zones,
            connections,
            blocked_hosts: self.bans.blocked_hosts().len(),
            blocked_subnets: self.bans.blocked_subnets().len(),
            port_mapping: self.igd.status(),
        }
    }

    // -------------------------------------------------------------------------
    // Incoming connections
    // -------------------------------------------------------------------------

    async fn accept_loop(self: Arc<Self>, zone: Zone, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => self.on_incoming(zone, stream, remote),
                Err(e) => {
                    log::warn!("Accept error in {} zone: {}", zone, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        log::debug!("{} zone listener stopped", zone);
    }

    fn on_incoming(self: &Arc<Self>, zone: Zone, stream: TcpStream, remote: SocketAddr) {
        let address = NetworkAddress::from(remote);
        if !self.bans.is_allowed(&address) {
            log::debug!("Refusing connection from blocked host {}", address);
            return;
        }
        let Some(net_zone) = self.zones.get(&zone) else { return };
        if let Some(max) = net_zone.config.max_in_peers {
            if self.count_connections(zone, true) >= max {
                log::debug!("Refusing connection from {}: {} incoming peers already", address, max);
                return;
            }
        }
        let per_host = self.config.max_connections_per_ip(&address);
        let from_host = self
            .snapshot()
            .iter()
            .filter(|c| c.is_incoming() && c.remote_address().is_same_host(&address))
            .count();
        if from_host >= per_host {
            log::debug!("Refusing connection from {}: {} connections from this host", address, from_host);
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }
        self.register(Connection::spawn(
            stream,
            address,
            true,
            self.clone(),
            self.connection_config(),
        ));
    }

    fn handle_handshake(&self, conn: &Connection, request: HandshakeRequest) -> Result<HandshakeResponse, HandlerError> {
        let zone = conn.remote_address().zone();
        if !conn.is_incoming() {
            return Err(HandlerError::Violation("handshake request on an outgoing connection".into()));
        }
        if conn.context().is_handshaked() {
            return Err(HandlerError::Violation("repeated handshake".into()));
        }
        self.check_node_data(&request.node_data, zone)
            .map_err(|e| HandlerError::Rejected(e.to_string()))?;
        if request.local_peerlist_new.len() > P2P_DEFAULT_PEERS_IN_HANDSHAKE {
            return Err(HandlerError::Violation(format!(
                "peer sent {} peers in handshake",
                request.local_peerlist_new.len()
            )));
        }

        let peer_id = request.node_data.peer_id;
        if self.is_peer_connected(conn, peer_id) {
            return Err(HandlerError::Rejected(format!("peer {:016x} is already connected", peer_id)));
        }

        conn.with_context(|ctx| {
            ctx.peer_id = Some(peer_id);
            ctx.support_flags = request.node_data.support_flags;
            ctx.remote_port = request.node_data.my_port;
        });
        if let Err(e) = self.handler.process_payload_sync_data(conn, &request.payload_data, true) {
            self.add_host_fail(conn.remote_address(), e.fail_score());
            return Err(HandlerError::Violation(e.to_string()));
        }
        conn.set_max_packet_size(LEVIN_DEFAULT_MAX_PACKET_SIZE);
        self.merge_gossip(zone, &request.local_peerlist_new);

        // only a peer that answers on its announced port makes it to the white list
        if zone == Zone::Public {
            if let Ok(port) = u16::try_from(request.node_data.my_port) {
                if port != 0 {
                    self.spawn_ping_back(
                        conn.remote_address().with_port(port),
                        peer_id,
                        request.payload_data.pruning_seed,
                    );
                }
            }
        }

        let peers = self.gossip_head(zone);
        conn.with_context(|ctx| ctx.sent_addresses.extend(peers.iter().map(|p| p.address.clone())));
        log::info!("{} handshake done, peer id {:016x}", conn, peer_id);

        Ok(HandshakeResponse {
            node_data: self.node_data(zone),
            payload_data: self.handler.get_payload_sync_data(),
            local_peerlist_new: peers,
        })
    }

    fn handle_timed_sync(&self, conn: &Connection, request: TimedSyncRequest) -> Result<TimedSyncResponse, HandlerError> {
        if !conn.context().is_handshaked() {
            return Err(HandlerError::Violation("timed sync before handshake".into()));
        }
        if let Err(e) = self.handler.process_payload_sync_data(conn, &request.payload_data, false) {
            self.add_host_fail(conn.remote_address(), e.fail_score());
            return Err(HandlerError::Violation(e.to_string()));
        }

        let head = self.gossip_head(conn.remote_address().zone());
        let peers = conn.with_context(|ctx| {
            let fresh: Vec<PeerListEntry> = head
                .into_iter()
                .filter(|p| !ctx.sent_addresses.contains(&p.address))
                .collect();
            ctx.sent_addresses.extend(fresh.iter().map(|p| p.address.clone()));
            fresh
        });

        Ok(TimedSyncResponse {
            payload_data: self.handler.get_payload_sync_data(),
            local_peerlist_new: peers,
        })
    }

    // -------------------------------------------------------------------------
    // Responses to our requests
    // -------------------------------------------------------------------------

    fn on_handshake_response(&self, conn: &Connection, response: HandshakeResponse) -> Result<(), HandlerError> {
        let zone = conn.remote_address().zone();
        self.check_node_data(&response.node_data, zone)
            .map_err(|e| HandlerError::Rejected(e.to_string()))?;
        if response.local_peerlist_new.len() > P2P_DEFAULT_PEERS_IN_HANDSHAKE {
            return Err(HandlerError::Violation(format!(
                "peer sent {} peers in handshake",
                response.local_peerlist_new.len()
            )));
        }

        let peer_id = response.node_data.peer_id;
        {
            let mut ctx = conn.context();
            if ctx.is_handshaked() {
                return Err(HandlerError::Violation("repeated handshake response".into()));
            }
            ctx.peer_id = Some(peer_id);
            ctx.support_flags = response.node_data.support_flags;
            ctx.remote_port = u32::from(conn.remote_address().port());
        }
        if let Err(e) = self.handler.process_payload_sync_data(conn, &response.payload_data, true) {
            self.add_host_fail(conn.remote_address(), e.fail_score());
            return Err(HandlerError::Violation(e.to_string()));
        }

        self.merge_gossip(zone, &response.local_peerlist_new);
        if let Some(peerlist) = self.peerlist(zone) {
            peerlist.set_peer_just_seen(peer_id, conn.remote_address(), response.payload_data.pruning_seed);
            peerlist.append_with_peer_anchor(AnchorPeerlistEntry {
                address: conn.remote_address().clone(),
                id: peer_id,
                first_seen: unix_now(),
            });
        }
        conn.set_max_packet_size(LEVIN_DEFAULT_MAX_PACKET_SIZE);
        Ok(())
    }

    fn on_timed_sync_response(&self, conn: &Connection, response: TimedSyncResponse) -> Result<(), HandlerError> {
        if response.local_peerlist_new.len() > P2P_DEFAULT_PEERS_IN_HANDSHAKE {
            return Err(HandlerError::Violation(format!(
                "peer sent {} peers in timed sync",
                response.local_peerlist_new.len()
            )));
        }
        if let Err(e) = self.handler.process_payload_sync_data(conn, &response.payload_data, false) {
            self.add_host_fail(conn.remote_address(), e.fail_score());
            return Err(HandlerError::Violation(e.to_string()));
        }

        let zone = conn.remote_address().zone();
        self.merge_gossip(zone, &response.local_peerlist_new);
        if !conn.is_incoming() {
            let seen = conn.with_context(|ctx| ctx.peer_id.map(|id| (id, ctx.pruning_seed)));
            if let (Some((peer_id, seed)), Some(peerlist)) = (seen, self.peerlist(zone)) {
                peerlist.set_peer_just_seen(peer_id, conn.remote_address(), seed);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Outgoing connections
    // -------------------------------------------------------------------------

    /// Connects to `address` and completes the handshake
    pub async fn connect(self: &Arc<Self>, address: &NetworkAddress) -> Result<Connection, NodeError> {
        self.connect_peer(address, false).await
    }

    async fn connect_peer(self: &Arc<Self>, address: &NetworkAddress, anchor: bool) -> Result<Connection, NodeError> {
        if !self.connecting.lock().insert(address.clone()) {
            return Err(NodeError::Rejected(format!("already connecting to {}", address)));
        }
        let result = self.connect_and_handshake(address, anchor).await;
        self.connecting.lock().remove(address);

        match &result {
            Ok(_) => {
                self.failed.lock().remove(address);
            }
            Err(e) => {
                log::debug!("Failed to connect to {}: {}", address, e);
                self.failed.lock().insert(address.clone(), unix_now());
            }
        }
        result
    }

    async fn connect_and_handshake(
        self: &Arc<Self>,
        address: &NetworkAddress,
        anchor: bool,
    ) -> Result<Connection, NodeError> {
        let stream = self.open_stream(address, self.config.connection_timeout).await?;
        let conn = self.register(Connection::spawn(
            stream,
            address.clone(),
            false,
            self.clone(),
            self.connection_config(),
        ));
        conn.with_context(|ctx| ctx.anchor = anchor);

        let gossip = self.gossip_head(address.zone());
        conn.with_context(|ctx| ctx.sent_addresses.extend(gossip.iter().map(|p| p.address.clone())));
        let request = HandshakeRequest {
            node_data: self.node_data(address.zone()),
            payload_data: self.handler.get_payload_sync_data(),
            local_peerlist_new: gossip,
        };
        if let Err(e) = conn
            .invoke_command::<_, HandshakeResponse>(&request, self.config.handshake_timeout)
            .await
        {
            conn.close();
            return Err(e.into());
        }

        // the response was applied on the reader task before the invoke resolved
        let (peer_id, support_flags) = conn.with_context(|ctx| (ctx.peer_id, ctx.support_flags));
        let Some(peer_id) = peer_id else {
            conn.close();
            return Err(NodeError::Rejected("handshake was not completed".into()));
        };
        if support_flags == 0 {
            self.request_support_flags(conn.clone());
        }
        log::info!("{} handshake done, peer id {:016x}", conn, peer_id);
        Ok(conn)
    }

    async fn open_stream(&self, address: &NetworkAddress, timeout: Duration) -> Result<TcpStream, NodeError> {
        let zone = self
            .zones
            .get(&address.zone())
            .ok_or(NodeError::UnknownZone(address.zone()))?;
        if !self.bans.is_allowed(address) {
            return Err(NodeError::NotAllowed(address.clone()));
        }
        if let Some(proxy) = zone.config.proxy {
            return Ok(socks::connect(proxy, address, timeout).await?);
        }

        let target = address
            .socket_addr()
            .ok_or(NodeError::NoProxy(address.zone()))?;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| NodeError::ConnectTimeout(address.clone()))??;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }
        Ok(stream)
    }

    fn request_support_flags(&self, conn: Connection) {
        let timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            match conn
                .invoke_command::<_, SupportFlagsResponse>(&SupportFlagsRequest, timeout)
                .await
            {
                Ok(response) => conn.with_context(|ctx| ctx.support_flags = response.support_flags),
                Err(e) => log::debug!("{} support flags request failed: {}", conn, e),
            }
        });
    }

    /// Handshakes over a throwaway connection, for peers we only want to
    /// hear from
    async fn one_shot_handshake(&self, address: &NetworkAddress) -> Result<HandshakeResponse, NodeError> {
        let stream = self.open_stream(address, self.config.connection_timeout).await?;
        let conn = Connection::spawn(
            stream,
            address.clone(),
            false,
            Arc::new(OneShotHandler),
            self.connection_config(),
        );
        let request = HandshakeRequest {
            node_data: self.node_data(address.zone()),
            payload_data: self.handler.get_payload_sync_data(),
            local_peerlist_new: Vec::new(),
        };
        let result = conn
            .invoke_command::<_, HandshakeResponse>(&request, self.config.handshake_timeout)
            .await;
        conn.close();

        let response = result?;
        self.check_node_data(&response.node_data, address.zone())?;
        if response.local_peerlist_new.len() > P2P_DEFAULT_PEERS_IN_HANDSHAKE {
            return Err(NodeError::Rejected(format!(
                "{} peers in handshake",
                response.local_peerlist_new.len()
            )));
        }
        Ok(response)
    }

    /// Checks that a peer accepts connections on the port it announced
    async fn try_ping(&self, address: &NetworkAddress, peer_id: u64) -> Result<(), NodeError> {
        let stream = self.open_stream(address, self.config.ping_timeout).await?;
        let conn = Connection::spawn(
            stream,
            address.clone(),
            false,
            Arc::new(OneShotHandler),
            self.connection_config(),
        );
        let result = conn
            .invoke_command::<_, PingResponse>(&PingRequest, self.config.ping_timeout)
            .await;
        conn.close();

        let response = result?;
        if response.status != PING_OK_RESPONSE_STATUS_TEXT || response.peer_id != peer_id {
            return Err(NodeError::Rejected(format!(
                "ping answered with {} by peer {:016x}",
                response.status, response.peer_id
            )));
        }
        Ok(())
    }

    fn spawn_ping_back(&self, address: NetworkAddress, peer_id: u64, pruning_seed: u32) {
        let Some(node) = self.this.upgrade() else { return };
        tokio::spawn(async move {
            match node.try_ping(&address, peer_id).await {
                Ok(()) => {
                    if let Some(peerlist) = node.peerlist(address.zone()) {
                        peerlist.set_peer_just_seen(peer_id, &address, pruning_seed);
                    }
                    log::debug!("Back ping to {} succeeded", address);
                }
                Err(e) => log::debug!("Back ping to {} failed: {}", address, e),
            }
        });
    }

    // -------------------------------------------------------------------------
    // Connection maker
    // -------------------------------------------------------------------------

    async fn connection_maker_loop(self: Arc<Self>) {
        let mut timer = tokio::time::interval(P2P_CONNECTION_MAKER_INTERVAL);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = timer.tick() => self.connections_maker().await,
            }
        }
        log::debug!("Connection maker stopped");
    }

    /// One round of outbound connection attempts
    async fn connections_maker(self: &Arc<Self>) {
        if !self.config.exclusive_nodes.is_empty() {
            self.connect_to_list(&self.config.exclusive_nodes).await;
            return;
        }
        if !self.anchors_tried.swap(true, Ordering::SeqCst) {
            self.connect_to_anchors().await;
        }
        if !self.config.priority_nodes.is_empty() {
            self.connect_to_list(&self.config.priority_nodes).await;
        }

        for net_zone in self.zones.values() {
            let zone = net_zone.config.zone;
            let peerlist = &net_zone.peerlist;
            if zone == Zone::Public && peerlist.get_white_peers_count() == 0 && peerlist.get_gray_peers_count() == 0 {
                self.connect_to_seeds(peerlist).await;
            }

            let outgoing = self.count_connections(zone, false);
            if outgoing >= net_zone.config.max_out_peers {
                continue;
            }
            let mut skip = self.connected_addresses();
            skip.extend(self.recently_failed());
            let candidates = peerlist.get_peers_for_connect(net_zone.config.max_out_peers - outgoing, |a| {
                skip.contains(a) || !self.bans.is_allowed(a) || self.is_own_address(a)
            });
            if candidates.is_empty() {
                continue;
            }
            log::debug!("{} zone: {} outgoing, trying {} more", zone, outgoing, candidates.len());
            join_all(candidates.iter().map(|a| self.connect_peer(a, false))).await;
        }
    }

    async fn connect_to_list(self: &Arc<Self>, list: &[NetworkAddress]) {
        let connected = self.connected_addresses();
        let pending: Vec<&NetworkAddress> = list.iter().filter(|a| !connected.contains(*a)).collect();
        join_all(pending.into_iter().map(|a| self.connect_peer(a, false))).await;
    }

    async fn connect_to_anchors(self: &Arc<Self>) {
        for net_zone in self.zones.values() {
            let connected = self.connected_addresses();
            let picked: Vec<NetworkAddress> = net_zone
                .peerlist
                .get_and_empty_anchor_peerlist()
                .into_iter()
                .map(|a| a.address)
                .filter(|a| !connected.contains(a) && self.bans.is_allowed(a))
                .take(self.config.anchor_connections)
                .collect();
            if picked.is_empty() {
                continue;
            }
            log::info!("Connecting to {} anchor peers", picked.len());
            join_all(picked.iter().map(|a| self.connect_peer(a, true))).await;
        }
    }

    /// Asks the seed nodes for peers; no connection is kept
    async fn connect_to_seeds(&self, peerlist: &PeerListManager) {
        {
            let mut last = self.last_seed_attempt.lock();
            if last.map_or(false, |at| at.elapsed() < SEED_RETRY_INTERVAL) {
                return;
            }
            *last = Some(Instant::now());
        }
        let mut seeds = self.config.seeds();
        if seeds.is_empty() {
            return;
        }
        seeds.shuffle(&mut rand::thread_rng());

        log::info!("Peer lists are empty, asking seed nodes for peers");
        for seed in seeds {
            match self.one_shot_handshake(&seed).await {
                Ok(response) => {
                    log::info!("Seed node {} sent {} peers", seed, response.local_peerlist_new.len());
                    self.merge_gossip(seed.zone(), &response.local_peerlist_new);
                    if peerlist.get_gray_peers_count() > 0 {
                        break;
                    }
                }
                Err(e) => log::debug!("Seed node {} failed: {}", seed, e),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Housekeeping
    // -------------------------------------------------------------------------

    async fn housekeeping_loop(self: Arc<Self>) {
        let start = tokio::time::Instant::now();
        let mut refresh = tokio::time::interval_at(start + self.config.handshake_interval, self.config.handshake_interval);
        let mut gray = tokio::time::interval_at(
            start + P2P_GRAY_PEERLIST_HOUSEKEEPING_INTERVAL,
            P2P_GRAY_PEERLIST_HOUSEKEEPING_INTERVAL,
        );
        let mut store = tokio::time::interval_at(start + self.config.store_interval, self.config.store_interval);
        for timer in [&mut refresh, &mut gray, &mut store] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = refresh.tick() => self.refresh_connections(),
                _ = gray.tick() => {
                    if !self.config.offline {
                        self.gray_peerlist_housekeeping().await;
                    }
                }
                _ = store.tick() => {
                    if self.config.persist {
                        let node = self.clone();
                        match tokio::task::spawn_blocking(move || node.store_state()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => log::warn!("Failed to store peer state: {}", e),
                            Err(e) => log::warn!("Peer state task failed: {}", e),
                        }
                    }
                }
            }
        }
        log::debug!("Housekeeping stopped");
    }

    /// Sends a timed sync to every handshaked connection; peers that fail
    /// to answer are dropped
    fn refresh_connections(&self) {
        let request = TimedSyncRequest {
            payload_data: self.handler.get_payload_sync_data(),
        };
        let timeout = self.config.invoke_timeout;
        for conn in self.snapshot() {
            // busy connections are obviously alive
            if !conn.try_context().map_or(false, |ctx| ctx.is_handshaked()) {
                continue;
            }
            let request = request.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                match conn.invoke_command::<_, TimedSyncResponse>(&request, timeout).await {
                    Ok(_) | Err(InvokeError::ConnectionClosed) => {}
                    Err(e) => {
                        log::info!("{} timed sync failed: {}", conn, e);
                        handler.drop_connection_with_score(&conn, 1, false);
                    }
                }
            });
        }
    }

    /// Handshakes one random gray peer per zone; a live one moves to white,
    /// a dead one is forgotten
    async fn gray_peerlist_housekeeping(&self) {
        for net_zone in self.zones.values() {
            let Some(entry) = net_zone.peerlist.get_random_gray_peer() else { continue };
            if self.connected_addresses().contains(&entry.address) {
                continue;
            }
            match self.one_shot_handshake(&entry.address).await {
                Ok(response) => {
                    log::debug!("Gray peer {} answered, moving to white list", entry.address);
                    net_zone.peerlist.set_peer_just_seen(
                        response.node_data.peer_id,
                        &entry.address,
                        response.payload_data.pruning_seed,
                    );
                }
                Err(e) => {
                    log::debug!("Gray peer {} removed: {}", entry.address, e);
                    net_zone.peerlist.remove_from_peer_gray(&entry.address);
                }
            }
        }
    }
}

// =============================================================================
// Connection handler
// =============================================================================

impl CommandHandler for NodeServer {
    fn on_invoke(&self, conn: &Connection, command: u32, payload: &[u8]) -> Result<Bytes, HandlerError> {
        match command {
            COMMAND_HANDSHAKE => {
                let response = self.handle_handshake(conn, decode_payload(payload)?)?;
                Ok(encode_payload(&response)?)
            }
            COMMAND_TIMED_SYNC => {
                let response = self.handle_timed_sync(conn, decode_payload(payload)?)?;
                Ok(encode_payload(&response)?)
            }
            COMMAND_PING => Ok(encode_payload(&PingResponse {
                status: PING_OK_RESPONSE_STATUS_TEXT.to_string(),
                peer_id: self.peer_id,
            })?),
            COMMAND_REQUEST_SUPPORT_FLAGS => Ok(encode_payload(&SupportFlagsResponse {
                support_flags: P2P_SUPPORT_FLAGS,
            })?),
            other => Err(HandlerError::NotHandled(other)),
        }
    }

    fn on_notify(&self, conn: &Connection, command: u32, payload: &[u8]) -> Result<(), HandlerError> {
        self.handler.handle_notify(conn, command, payload)
    }

    fn on_response(&self, conn: &Connection, command: u32, payload: &[u8]) -> Result<(), HandlerError> {
        match command {
            COMMAND_HANDSHAKE => self.on_handshake_response(conn, decode_payload(payload)?),
            COMMAND_TIMED_SYNC => self.on_timed_sync_response(conn, decode_payload(payload)?),
            _ => Ok(()),
        }
    }

    fn on_callback(&self, conn: &Connection) {
        self.handler.on_callback(conn);
    }

    fn on_close(&self, conn: &Connection) {
        self.connections.write().remove(&conn.id());
        self.handler.on_connection_close(conn);
    }
}

// =============================================================================
// Protocol endpoint
// =============================================================================

impl P2pEndpoint for NodeServer {
    fn for_each_connection(&self, f: &mut dyn FnMut(&Connection) -> bool) {
        for conn in self.snapshot() {
            if !f(&conn) {
                break;
            }
        }
    }

    fn for_connection(&self, id: Uuid, f: &mut dyn FnMut(&Connection)) -> bool {
        let conn = self.connections.read().get(&id).cloned();
        match conn {
            Some(conn) => {
                f(&conn);
                true
            }
            None => false,
        }
    }

    fn relay_notify_to_list(&self, command: u32, payload: Bytes, targets: &[Uuid]) -> bool {
        let conns: Vec<Connection> = {
            let map = self.connections.read();
            targets.iter().filter_map(|id| map.get(id).cloned()).collect()
        };
        let mut sent = false;
        for conn in conns {
            match conn.notify(command, payload.clone()) {
                Ok(()) => sent = true,
                Err(e) => log::debug!("{} relay of command {} failed: {}", conn, command, e),
            }
        }
        sent
    }

    fn send_txs(&self, txs: Vec<Vec<u8>>, zone: Zone, source: Uuid, relay: RelayMethod) -> bool {
        let fluff = match relay {
            RelayMethod::None => return false,
            RelayMethod::Stem => false,
            RelayMethod::Local | RelayMethod::Fluff | RelayMethod::Block => true,
        };

        // the source's context may be held by the caller, so it is filtered first
        let candidates: Vec<Connection> = self
            .snapshot()
            .into_iter()
            .filter(|c| c.id() != source && c.remote_address().zone() == zone && (fluff || !c.is_incoming()))
            .filter(|c| c.try_context().map_or(false, |ctx| ctx.state == ConnectionState::Normal))
            .collect();
        let targets: Vec<Uuid> = if fluff {
            candidates.iter().map(|c| c.id()).collect()
        } else {
            candidates.choose(&mut rand::thread_rng()).map(|c| c.id()).into_iter().collect()
        };
        if targets.is_empty() {
            return false;
        }

        let payload = match encode_payload(&NotifyNewTransactions {
            txs,
            dandelionpp_fluff: fluff,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode transactions: {}", e);
                return false;
            }
        };
        self.relay_notify_to_list(NOTIFY_NEW_TRANSACTIONS, payload, &targets)
    }

    fn drop_connection(&self, conn: &Connection) {
        conn.close();
    }

    fn add_host_fail(&self, address: &NetworkAddress, score: u64) {
        if let FailOutcome::Blocked = self.bans.add_host_fail(address, score) {
            self.evict_host(address);
        }
    }

    fn max_out_peers(&self, zone: Zone) -> usize {
        self.zones.get(&zone).map_or(0, |z| z.config.max_out_peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Core, MemoryCore};
    use crate::protocol::ProtocolConfig;
    use std::path::Path;

    fn node_with(config: NodeConfig, core: MemoryCore) -> Arc<NodeServer> {
        let handler = Arc::new(ProtocolHandler::new(Arc::new(core), ProtocolConfig::default()));
        NodeServer::new(config, handler).unwrap()
    }

    fn local_config(dir: &Path, port: u16) -> NodeConfig {
        NodeConfig::local(SocketAddr::from(([127, 0, 0, 1], port)), dir)
    }

    async fn started(config: NodeConfig, core: MemoryCore) -> Arc<NodeServer> {
        let node = node_with(config, core);
        node.init().await.unwrap();
        node.run();
        node
    }

    fn public_address(node: &NodeServer) -> NetworkAddress {
        NetworkAddress::from(node.local_addr(Zone::Public).unwrap())
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_second_node_cannot_bind_a_taken_port() {
        let dir = tempfile::tempdir().unwrap();
        let first = node_with(local_config(dir.path(), 0), MemoryCore::new());
        first.init().await.unwrap();
        let port = first.local_addr(Zone::Public).unwrap().port();

        let second = node_with(local_config(dir.path(), port), MemoryCore::new());
        assert!(matches!(second.init().await, Err(NodeError::Bind { .. })));

        let third = node_with(local_config(dir.path(), 0), MemoryCore::new());
        assert!(third.init().await.is_ok());
        assert_ne!(third.local_addr(Zone::Public).unwrap().port(), port);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_nodes_synchronize_over_tcp() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let core_a = MemoryCore::new();
        core_a.mine_blocks(9, 10).unwrap();

        let a = started(local_config(dir_a.path(), 0), core_a).await;
        let b = started(local_config(dir_b.path(), 0), MemoryCore::new()).await;
        let a_addr = public_address(&a);
        let b_addr = public_address(&b);

        let conn = b.connect(&a_addr).await.unwrap();
        assert!(conn.context().is_handshaked());
        assert_eq!(conn.context().peer_id, Some(a.peer_id()));

        eventually(|| b.handler().core().top_block_hash() == a.handler().core().top_block_hash()).await;
        assert_eq!(b.handler().core().height(), 10);

        let status = a.status();
        assert_eq!(status.connections.len(), 1);
        assert!(status.connections[0].incoming);
        assert_eq!(status.connections[0].peer_id, Some(b.peer_id()));
        assert_eq!(b.peerlist(Zone::Public).unwrap().contains(&a_addr), Some(Pool::White));
        // a answered the back ping
        eventually(|| a.peerlist(Zone::Public).unwrap().contains(&b_addr) == Some(Pool::White)).await;

        b.shutdown().await;
        a.shutdown().await;

        let state = PeerStore::new(dir_b.path()).load().unwrap();
        let zone = state.zone(Zone::Public).unwrap();
        assert!(zone.white.iter().any(|e| e.address == a_addr));
        assert!(zone.anchor.iter().any(|e| e.address == a_addr));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initiator_gossip_reaches_responder_gray_list() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let known: NetworkAddress = "1.2.3.4:18080".parse().unwrap();
        let a = started(local_config(dir_a.path(), 0), MemoryCore::new()).await;
        let b = started(
            NodeConfig {
                add_peers: vec![known.clone()],
                ..local_config(dir_b.path(), 0)
            },
            MemoryCore::new(),
        )
        .await;

        b.connect(&public_address(&a)).await.unwrap();
        assert_eq!(a.peerlist(Zone::Public).unwrap().contains(&known), Some(Pool::Gray));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wrong_network_is_refused() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = started(local_config(dir_a.path(), 0), MemoryCore::new()).await;
        let b = started(
            NodeConfig {
                network_id: Uuid::new_v4(),
                ..local_config(dir_b.path(), 0)
            },
            MemoryCore::new(),
        )
        .await;

        assert!(b.connect(&public_address(&a)).await.is_err());
        eventually(|| a.connection_count() == 0 && b.connection_count() == 0).await;
        assert!(b.peerlist(Zone::Public).unwrap().contains(&public_address(&a)).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_to_self_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let node = started(local_config(dir.path(), 0), MemoryCore::new()).await;
        assert!(node.connect(&public_address(&node)).await.is_err());
        eventually(|| node.connection_count() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_incoming_connections_are_capped_per_host() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let a = started(
            NodeConfig {
                max_connections_per_ip: Some(1),
                ..local_config(dirs[0].path(), 0)
            },
            MemoryCore::new(),
        )
        .await;
        let b = started(local_config(dirs[1].path(), 0), MemoryCore::new()).await;
        let c = started(local_config(dirs[2].path(), 0), MemoryCore::new()).await;

        b.connect(&public_address(&a)).await.unwrap();
        assert!(c.connect(&public_address(&a)).await.is_err());
        assert_eq!(a.status().zones[0].incoming, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_host_is_disconnected_and_refused() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = started(local_config(dir_a.path(), 0), MemoryCore::new()).await;
        let b = started(local_config(dir_b.path(), 0), MemoryCore::new()).await;
        let a_addr = public_address(&a);

        b.connect(&a_addr).await.unwrap();
        eventually(|| a.connection_count() == 1).await;

        let host: NetworkAddress = "127.0.0.1:1".parse().unwrap();
        assert!(a.block_host(&host, Duration::from_secs(60)));
        eventually(|| a.connection_count() == 0 && b.connection_count() == 0).await;
        assert!(b.connect(&a_addr).await.is_err());
        assert_eq!(a.status().blocked_hosts, 1);

        assert!(a.unblock_host(&host));
        assert!(b.connect(&a_addr).await.is_ok());
    }

    #[test]
    fn test_send_txs_without_targets_relays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let node = node_with(local_config(dir.path(), 0), MemoryCore::new());
        assert!(!node.send_txs(vec![vec![1, 2, 3]], Zone::Public, Uuid::nil(), RelayMethod::None));
        assert!(!node.send_txs(vec![vec![1, 2, 3]], Zone::Public, Uuid::nil(), RelayMethod::Fluff));
        assert!(!node.send_txs(vec![vec![1, 2, 3]], Zone::Public, Uuid::nil(), RelayMethod::Stem));
    }

    #[test]
    fn test_add_peers_and_ban_list_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let ban_file = dir.path().join("bans.txt");
        std::fs::write(&ban_file, "# bad hosts\n5.6.7.8\n10.0.0.0/8\n").unwrap();

        let peer: NetworkAddress = "1.2.3.4:18080".parse().unwrap();
        let config = NodeConfig {
            add_peers: vec![peer.clone()],
            ban_list: Some(ban_file),
            ..local_config(dir.path(), 0)
        };
        let node = node_with(config, MemoryCore::new());

        assert_eq!(node.peerlist(Zone::Public).unwrap().contains(&peer), Some(Pool::White));
        assert!(!node.bans().is_allowed(&"5.6.7.8:1".parse().unwrap()));
        assert!(!node.bans().is_allowed(&"10.1.2.3:1".parse().unwrap()));
        assert!(node.bans().is_allowed(&"1.2.3.4:1".parse().unwrap()));
    }
}
