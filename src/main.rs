//! p2pd: the levin-p2p daemon
//!
//! Runs a node server on top of the in-memory core, or inspects the files
//! a node keeps in its data directory.

use clap::{Args, Parser, Subcommand};
use levin_p2p::core::MemoryCore;
use levin_p2p::net::{NetworkAddress, Zone};
use levin_p2p::p2p::config::P2P_DEFAULT_CONNECTIONS_COUNT;
use levin_p2p::p2p::storage::load_ban_list;
use levin_p2p::p2p::{NodeConfig, NodeServer, PeerStore, ZoneConfig, P2P_DEFAULT_PORT};
use levin_p2p::protocol::{ProtocolConfig, ProtocolHandler};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How often the daemon logs its status
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "p2pd")]
#[command(version = "0.1.0")]
#[command(about = "Levin peer-to-peer node", long_about = None)]
struct Cli {
    /// Data directory for the peer state file
    #[arg(short, long, default_value = ".levin_p2p")]
    data_dir: PathBuf,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Run(RunArgs),

    /// Print the stored peer lists and bans
    Peers,

    /// Validate a ban list file
    CheckBanList {
        /// Path of the ban list
        path: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "0.0.0.0")]
    p2p_bind_ip: IpAddr,

    #[arg(long, default_value_t = P2P_DEFAULT_PORT)]
    p2p_bind_port: u16,

    /// Peer added to the white list at startup
    #[arg(long = "add-peer")]
    add_peers: Vec<NetworkAddress>,

    /// Peer kept connected at all times
    #[arg(long = "add-priority-node")]
    priority_nodes: Vec<NetworkAddress>,

    /// Connect only to these peers
    #[arg(long = "add-exclusive-node")]
    exclusive_nodes: Vec<NetworkAddress>,

    /// Seed node used instead of the built-in ones
    #[arg(long = "seed-node")]
    seed_nodes: Vec<NetworkAddress>,

    /// Do not announce our listening port
    #[arg(long)]
    hide_my_port: bool,

    #[arg(long, default_value_t = P2P_DEFAULT_CONNECTIONS_COUNT)]
    out_peers: usize,

    /// Unlimited when absent
    #[arg(long)]
    in_peers: Option<usize>,

    /// Upload limit in kB/s, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    limit_rate_up: u64,

    /// Download limit in kB/s, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    limit_rate_down: u64,

    /// Neither listen nor connect
    #[arg(long)]
    offline: bool,

    /// File of hosts and subnets to block
    #[arg(long)]
    ban_list: Option<PathBuf>,

    /// Network id, mainnet when absent
    #[arg(long)]
    network_id: Option<Uuid>,

    /// SOCKS5 proxy for an anonymity zone, as `zone,ip:port`
    #[arg(long = "proxy", value_parser = parse_proxy)]
    proxies: Vec<(Zone, SocketAddr)>,

    /// Accept private and loopback addresses as peers
    #[arg(long)]
    allow_local_ip: bool,

    /// Skip UPnP port mapping
    #[arg(long)]
    no_igd: bool,

    #[arg(long)]
    max_connections_per_ip: Option<usize>,

    /// Do not download blocks, only serve them
    #[arg(long)]
    no_sync: bool,
}

fn parse_proxy(s: &str) -> Result<(Zone, SocketAddr), String> {
    let (zone, address) = s
        .split_once(',')
        .ok_or_else(|| format!("expected zone,ip:port, got {}", s))?;
    let zone: Zone = zone.trim().parse().map_err(|e| format!("{}", e))?;
    if zone == Zone::Public {
        return Err("the public zone cannot be proxied".to_string());
    }
    let address = address
        .trim()
        .parse()
        .map_err(|e| format!("invalid proxy address: {}", e))?;
    Ok((zone, address))
}

impl RunArgs {
    fn into_config(self, data_dir: PathBuf) -> NodeConfig {
        let mut public = ZoneConfig::public(SocketAddr::new(self.p2p_bind_ip, self.p2p_bind_port));
        public.max_out_peers = self.out_peers;
        public.max_in_peers = self.in_peers;

        let mut zones = vec![public];
        zones.extend(self.proxies.into_iter().map(|(zone, proxy)| ZoneConfig::proxied(zone, proxy)));

        let defaults = NodeConfig::default();
        NodeConfig {
            network_id: self.network_id.unwrap_or(defaults.network_id),
            data_dir,
            zones,
            hide_my_port: self.hide_my_port,
            offline: self.offline,
            allow_local_ip: self.allow_local_ip,
            igd: !self.no_igd,
            add_peers: self.add_peers,
            priority_nodes: self.priority_nodes,
            exclusive_nodes: self.exclusive_nodes,
            seed_nodes: self.seed_nodes,
            max_connections_per_ip: self.max_connections_per_ip,
            limit_rate_up: self.limit_rate_up,
            limit_rate_down: self.limit_rate_down,
            ban_list: self.ban_list,
            ..defaults
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.as_str())).init();

    match cli.command {
        Commands::Run(args) => {
            let no_sync = args.no_sync;
            let config = args.into_config(cli.data_dir);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_node(config, no_sync))
        }
        Commands::Peers => {
            let state = PeerStore::new(&cli.data_dir).load()?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Commands::CheckBanList { path } => {
            let entries = load_ban_list(&path)?;
            println!("{}: {} entries", path.display(), entries.len());
            Ok(())
        }
    }
}

async fn run_node(config: NodeConfig, no_sync: bool) -> Result<(), Box<dyn std::error::Error>> {
    let core = Arc::new(MemoryCore::new());
    let protocol = ProtocolConfig {
        no_sync,
        ..ProtocolConfig::default()
    };
    let handler = Arc::new(ProtocolHandler::new(core, protocol));

    let node = NodeServer::new(config, handler)?;
    node.init().await?;
    node.run();

    let mut status_timer = tokio::time::interval(STATUS_LOG_INTERVAL);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = status_timer.tick() => {
                let status = node.status();
                log::info!(
                    "Height {}/{}, {} connections, synchronized: {}",
                    status.height,
                    status.target_height,
                    status.connections.len(),
                    status.synchronized
                );
                log::debug!("{}", serde_json::to_string(&status)?);
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy() {
        let (zone, address) = parse_proxy("tor,127.0.0.1:9050").unwrap();
        assert_eq!(zone, Zone::Tor);
        assert_eq!(address.port(), 9050);

        assert!(parse_proxy("public,127.0.0.1:9050").is_err());
        assert!(parse_proxy("tor").is_err());
        assert!(parse_proxy("tor,nowhere").is_err());
    }

    #[test]
    fn test_run_args_build_config() {
        let cli = Cli::parse_from([
            "p2pd",
            "--data-dir",
            "/tmp/node",
            "run",
            "--p2p-bind-port",
            "28080",
            "--out-peers",
            "4",
            "--add-peer",
            "1.2.3.4:18080",
            "--proxy",
            "i2p,127.0.0.1:4447",
            "--no-igd",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        let config = args.into_config(cli.data_dir);

        assert_eq!(config.data_dir, PathBuf::from("/tmp/node"));
        assert!(!config.igd);
        assert_eq!(config.add_peers.len(), 1);
        let public = config.zone(Zone::Public).unwrap();
        assert_eq!(public.bind.map(|b| b.port()), Some(28080));
        assert_eq!(public.max_out_peers, 4);
        assert_eq!(config.zone(Zone::I2p).and_then(|z| z.proxy).map(|p| p.port()), Some(4447));
    }
}
