//! Meshtun CLI
//!
//! Runs a mesh tunnel node: a switch tunnel with a fallback port for the
//! local interface address and a port per connected peer.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::IpNet;
use tracing::{debug, info, warn};

use meshtun_fakeip::FakeIpManager;
use meshtun_logging::init_logging;
use meshtun_network::{
    build_swarm, setup_forwarding, CommandNat, Dialer, DiscoveryTask, Multiaddr, PeerId,
    ResourceLimits, SwarmDriver,
};
use meshtun_settings::Settings;
use meshtun_tunnel::{Port, Tunnel};

/// Meshtun - peer-to-peer mesh VPN
#[derive(Parser, Debug)]
#[command(name = "meshtun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Comma separated remote endpoints (e.g. ipfs/<peer id>)
    #[arg(short = 'e', long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Virtual address of the tunnel interface, in CIDR form
    #[arg(short = 'l', long)]
    local_addr: Option<String>,

    /// Comma separated networks to forward for peers
    #[arg(short = 'f', long, value_delimiter = ',')]
    forward: Vec<String>,

    /// Discovery namespace
    #[arg(short = 'n', long)]
    namespace: Option<String>,

    /// Fake address range (e.g. 198.18.0.0/15)
    #[arg(short = 'p', long)]
    fake_range: Option<String>,

    /// Rule script for domain classification
    #[arg(short = 'r', long)]
    rule_script: Option<PathBuf>,

    /// Geo-IP database used by the rule script
    #[arg(short = 'g', long)]
    geoip_db: Option<PathBuf>,

    /// Swarm listen address
    #[arg(long)]
    listen: Option<String>,

    /// Settings file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Overlay flags on file settings; only flags that were given win
    fn apply(&self, settings: &mut Settings) {
        let config = &mut settings.config;

        if !self.endpoints.is_empty() {
            config.network.endpoints = self.endpoints.clone();
        }
        if let Some(local_addr) = &self.local_addr {
            config.network.local_addr = local_addr.clone();
        }
        if !self.forward.is_empty() {
            config.network.forward = self.forward.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.network.namespace = namespace.clone();
        }
        if let Some(range) = &self.fake_range {
            config.fakeip.range = range.clone();
        }
        if let Some(script) = &self.rule_script {
            config.fakeip.rule_script = Some(script.clone());
        }
        if let Some(db) = &self.geoip_db {
            config.fakeip.geoip_db = Some(db.clone());
        }
        if let Some(listen) = &self.listen {
            settings.node.listen_addr = listen.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load_or_default(),
    }
    .context("Failed to load settings")?;
    cli.apply(&mut settings);

    if cli.save {
        settings.save().context("Failed to save settings")?;
    }

    run(settings).await
}

async fn run(settings: Settings) -> Result<()> {
    let config = &settings.config;
    let namespace = config.network.namespace.clone();

    setup_forwarding(&config.network.forward, &CommandNat)
        .context("Failed to set up forwarding")?;

    let fakeip = if config.fakeip.is_enabled() {
        let manager =
            FakeIpManager::new(&config.fakeip).context("Failed to create fake address manager")?;
        for range in manager.routing_ranges() {
            info!("Routing {} through the tunnel", range);
        }
        Some(Arc::new(manager))
    } else {
        None
    };

    let endpoints = config
        .network
        .endpoints
        .iter()
        .map(|endpoint| parse_endpoint(endpoint))
        .collect::<Result<Vec<_>>>()?;
    let local = local_port_addr(&config.network.local_addr)?;

    let tunnel = Tunnel::switch(config.tunnel.clone(), fakeip);
    spawn_transport(tunnel.add_port(local, true));
    for peer in &endpoints {
        spawn_transport(tunnel.add_port(peer.to_string(), false));
    }
    let mut done = tunnel.start().context("Failed to start tunnel")?;

    let limits = ResourceLimits {
        max_memory_fraction: settings.node.max_memory_fraction,
        ..ResourceLimits::default()
    };
    let listen: Multiaddr = settings
        .node
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", settings.node.listen_addr))?;
    let swarm = build_swarm(&namespace, &limits).context("Failed to build swarm")?;
    let swarm = SwarmDriver::spawn(swarm, &namespace, listen).context("Failed to start swarm")?;
    info!("Local peer ID: {}", swarm.local_peer_id());

    for peer in endpoints {
        let dialer = swarm.clone();
        tokio::spawn(async move {
            if let Err(e) = dialer.dial(peer).await {
                warn!("Endpoint {} unreachable: {}", peer, e);
            }
        });
    }

    let mut discovery = DiscoveryTask::spawn(&namespace, &swarm, Arc::new(swarm.clone()));
    let peers = discovery.take_connected();
    let peer_ports = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            let Some(mut peers) = peers else { return };
            while let Some(peer) = peers.recv().await {
                let addr = peer.to_string();
                if tunnel.get_port(&addr).is_none() {
                    spawn_transport(tunnel.add_port(addr, false));
                }
            }
        })
    };

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            None
        }
        result = &mut done => Some(result),
    };

    discovery.stop().await;
    peer_ports.abort();
    tunnel.close();
    let result = match finished {
        Some(result) => result,
        None => done.await,
    };
    swarm.shutdown().await;

    match result {
        Ok(e) if e.is_closed() => {
            info!("Tunnel closed");
            Ok(())
        }
        Ok(e) => Err(anyhow::Error::new(e).context("Tunnel stopped")),
        Err(_) => anyhow::bail!("Tunnel exited without reporting"),
    }
}

/// Peer ID of an endpoint such as `ipfs/<id>`, `/p2p/<id>` or a bare ID
fn parse_endpoint(endpoint: &str) -> Result<PeerId> {
    let id = endpoint.trim().rsplit('/').next().unwrap_or_default();
    id.parse::<PeerId>()
        .with_context(|| format!("Invalid endpoint {}", endpoint))
}

/// Port address for the local interface: the address part of its CIDR
fn local_port_addr(local: &str) -> Result<String> {
    let addr = match local.parse::<IpNet>() {
        Ok(net) => net.addr(),
        Err(_) => local
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid local address {}", local))?,
    };
    Ok(addr.to_string())
}

/// Drain a port's outbound queue. Packets are only accounted for here; the
/// device and peer stream framing live outside this binary.
fn spawn_transport(port: Arc<Port>) {
    let Some(mut outbound) = port.take_outbound() else {
        return;
    };
    tokio::spawn(async move {
        let mut bytes = 0usize;
        while let Some(msg) = outbound.recv().await {
            bytes += msg.len();
            debug!("{} bytes {} -> {} via {}", msg.len(), msg.src, msg.dst, outbound.address());
        }
        debug!("Port {} closed after {} bytes", outbound.address(), bytes);
    });
}
