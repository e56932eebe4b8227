//! libp2p swarm and its driver task
//!
//! Peers are found on the local network with mDNS. Identify carries the
//! namespace as its protocol version (`/meshtun/<namespace>`); a peer that
//! reports a different one is disconnected and never counts as dialed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{
    connection_limits, identify, mdns, memory_connection_limits, noise, ping, tcp, yamux,
    Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{Dialer, NetworkError, PeerSource, ResourceLimits, Result};

/// Prefix of the identify protocol version
pub const PROTOCOL_PREFIX: &str = "/meshtun/";

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Identify protocol version for `namespace`
pub fn protocol_version(namespace: &str) -> String {
    format!("{}{}", PROTOCOL_PREFIX, namespace)
}

#[derive(NetworkBehaviour)]
pub struct MeshtunBehaviour {
    limits: connection_limits::Behaviour,
    memory: memory_connection_limits::Behaviour,
    mdns: mdns::tokio::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

/// Build a swarm with a fresh identity
pub fn build_swarm(namespace: &str, limits: &ResourceLimits) -> Result<Swarm<MeshtunBehaviour>> {
    let version = protocol_version(namespace);

    let swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::Swarm(e.to_string()))?
        .with_dns()
        .map_err(|e| NetworkError::Swarm(e.to_string()))?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();
            Ok(MeshtunBehaviour {
                limits: limits.connection_behaviour(),
                memory: limits.memory_behaviour(),
                mdns: mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?,
                identify: identify::Behaviour::new(identify::Config::new(
                    version.clone(),
                    key.public(),
                )),
                ping: ping::Behaviour::default(),
            })
        })
        .map_err(|e| NetworkError::Swarm(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    info!("Built swarm {} for {}", swarm.local_peer_id(), version);
    Ok(swarm)
}

type DialReply = oneshot::Sender<Result<()>>;

enum Command {
    Dial { peer: PeerId, reply: DialReply },
    AddAddress { peer: PeerId, addr: Multiaddr },
    Shutdown,
}

/// Owns the swarm and polls it on a background task
pub struct SwarmDriver {
    swarm: Swarm<MeshtunBehaviour>,
    commands: mpsc::Receiver<Command>,
    discovered: broadcast::Sender<PeerId>,
    known: Arc<Mutex<Vec<PeerId>>>,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
    expected_version: String,
    addresses: HashMap<PeerId, Vec<Multiaddr>>,
    verified: HashSet<PeerId>,
    pending: HashMap<PeerId, Vec<DialReply>>,
}

impl SwarmDriver {
    /// Listen on `listen` and start driving the swarm
    pub fn spawn(
        mut swarm: Swarm<MeshtunBehaviour>,
        namespace: &str,
        listen: Multiaddr,
    ) -> Result<SwarmHandle> {
        swarm
            .listen_on(listen)
            .map_err(|e| NetworkError::Swarm(e.to_string()))?;

        let (command_tx, commands) = mpsc::channel(32);
        let (discovered, _) = broadcast::channel(64);
        let known = Arc::new(Mutex::new(Vec::new()));
        let listen_addrs = Arc::new(Mutex::new(Vec::new()));
        let local_peer_id = *swarm.local_peer_id();

        let driver = Self {
            swarm,
            commands,
            discovered: discovered.clone(),
            known: known.clone(),
            listen_addrs: listen_addrs.clone(),
            expected_version: protocol_version(namespace),
            addresses: HashMap::new(),
            verified: HashSet::new(),
            pending: HashMap::new(),
        };
        tokio::spawn(driver.run());

        Ok(SwarmHandle {
            namespace: namespace.to_string(),
            local_peer_id,
            commands: command_tx,
            discovered,
            known,
            listen_addrs,
        })
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Dial { peer, reply }) => self.dial(peer, reply),
                    Some(Command::AddAddress { peer, addr }) => {
                        let addresses = self.addresses.entry(peer).or_default();
                        if !addresses.contains(&addr) {
                            addresses.push(addr);
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = self.swarm.select_next_some() => self.on_event(event),
            }
        }

        for (peer, replies) in self.pending.drain() {
            for reply in replies {
                let _ = reply.send(Err(NetworkError::Dial {
                    peer,
                    reason: "swarm stopped".to_string(),
                }));
            }
        }
        info!("Swarm driver stopped");
    }

    fn dial(&mut self, peer: PeerId, reply: DialReply) {
        if self.verified.contains(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.swarm.is_connected(&peer) {
            // Connected but identify has not answered yet
            self.pending.entry(peer).or_default().push(reply);
            return;
        }

        let addresses = self.addresses.get(&peer).cloned().unwrap_or_default();
        let opts = DialOpts::peer_id(peer).addresses(addresses).build();
        match self.swarm.dial(opts) {
            Ok(()) => self.pending.entry(peer).or_default().push(reply),
            Err(e) => {
                let _ = reply.send(Err(NetworkError::Dial {
                    peer,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn resolve(&mut self, peer: &PeerId, outcome: impl Fn() -> Result<()>) {
        if let Some(replies) = self.pending.remove(peer) {
            for reply in replies {
                let _ = reply.send(outcome());
            }
        }
    }

    fn on_event(&mut self, event: SwarmEvent<MeshtunBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.listen_addrs.lock().push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.lock().retain(|a| a != &address);
            }
            SwarmEvent::Behaviour(MeshtunBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer, addr) in list {
                    debug!("mDNS discovered peer {} at {}", peer, addr);
                    let addresses = self.addresses.entry(peer).or_default();
                    let first_sighting = addresses.is_empty();
                    if !addresses.contains(&addr) {
                        addresses.push(addr);
                    }
                    if first_sighting {
                        self.known.lock().push(peer);
                        let _ = self.discovered.send(peer);
                    }
                }
            }
            SwarmEvent::Behaviour(MeshtunBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                for (peer, addr) in list {
                    debug!("mDNS record for {} at {} expired", peer, addr);
                    if let Some(addresses) = self.addresses.get_mut(&peer) {
                        addresses.retain(|a| a != &addr);
                    }
                }
            }
            SwarmEvent::Behaviour(MeshtunBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                if info.protocol_version == self.expected_version {
                    debug!("Peer {} verified ({})", peer_id, info.protocol_version);
                    self.verified.insert(peer_id);
                    self.resolve(&peer_id, || Ok(()));
                } else {
                    warn!(
                        "Disconnecting {}: namespace {} does not match {}",
                        peer_id, info.protocol_version, self.expected_version
                    );
                    let reason = format!("foreign namespace {}", info.protocol_version);
                    self.resolve(&peer_id, || {
                        Err(NetworkError::Dial {
                            peer: peer_id,
                            reason: reason.clone(),
                        })
                    });
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                }
            }
            SwarmEvent::Behaviour(MeshtunBehaviourEvent::Identify(identify::Event::Error {
                peer_id,
                error,
                ..
            })) => {
                if !self.verified.contains(&peer_id) {
                    warn!("Identify with {} failed: {}", peer_id, error);
                    let reason = format!("identify failed: {}", error);
                    self.resolve(&peer_id, || {
                        Err(NetworkError::Dial {
                            peer: peer_id,
                            reason: reason.clone(),
                        })
                    });
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                if !self.swarm.is_connected(&peer) {
                    let reason = error.to_string();
                    self.resolve(&peer, || {
                        Err(NetworkError::Dial {
                            peer,
                            reason: reason.clone(),
                        })
                    });
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    debug!("Disconnected from {}", peer_id);
                    self.verified.remove(&peer_id);
                    self.resolve(&peer_id, || {
                        Err(NetworkError::Dial {
                            peer: peer_id,
                            reason: "connection closed".to_string(),
                        })
                    });
                }
            }
            SwarmEvent::Behaviour(MeshtunBehaviourEvent::Ping(ping::Event {
                peer,
                result: Ok(rtt),
                ..
            })) => {
                debug!("Ping to {} took {:?}", peer, rtt);
            }
            _ => {}
        }
    }
}

/// Clonable handle to a running [`SwarmDriver`]
#[derive(Clone)]
pub struct SwarmHandle {
    namespace: String,
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    discovered: broadcast::Sender<PeerId>,
    known: Arc<Mutex<Vec<PeerId>>>,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
}

impl SwarmHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Addresses the swarm is currently listening on
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.lock().clone()
    }

    /// Remember an address for `peer`, used by later dials
    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<()> {
        self.commands
            .send(Command::AddAddress { peer, addr })
            .await
            .map_err(|_| NetworkError::Swarm("swarm driver stopped".to_string()))
    }

    /// Stop the driver task
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

impl PeerSource for SwarmHandle {
    fn discover(&self, namespace: &str) -> BoxStream<'static, PeerId> {
        if namespace != self.namespace {
            warn!(
                "Swarm serves namespace '{}', not '{}'",
                self.namespace, namespace
            );
            return stream::empty().boxed();
        }

        // Subscribe before the snapshot so nothing falls between them
        let live = self.discovered.subscribe();
        let seen = self.known.lock().clone();

        let live = stream::unfold(live, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(peer) => return Some((peer, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Discovery feed lagged, skipped {} peers", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::iter(seen).chain(live).boxed()
    }
}

#[async_trait::async_trait]
impl Dialer for SwarmHandle {
    async fn dial(&self, peer: PeerId) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        let stopped = || NetworkError::Swarm("swarm driver stopped".to_string());

        self.commands
            .send(Command::Dial { peer, reply })
            .await
            .map_err(|_| stopped())?;
        outcome.await.map_err(|_| stopped())?
    }
}
