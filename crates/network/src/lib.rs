//! Meshtun Network
//!
//! Collaborators the tunnel needs from the outside world:
//!
//! - Peer discovery and dialing ([`DiscoveryTask`], [`PeerSource`], [`Dialer`])
//! - NAT/forwarding setup for exit ranges ([`setup_forwarding`], [`CommandNat`])
//! - Transport resource ceilings ([`ResourceLimits`])
//! - The libp2p swarm (TCP + Noise + Yamux, mDNS, identify, ping) and its
//!   driver task ([`build_swarm`], [`SwarmDriver`])

mod discovery;
mod forward;
mod limits;
mod swarm;

pub use discovery::{Dialer, DiscoveryTask, PeerSource};
pub use forward::{parse_forward_cidrs, setup_forwarding, CommandNat, NatSetup};
pub use limits::ResourceLimits;
pub use swarm::{
    build_swarm, protocol_version, MeshtunBehaviour, MeshtunBehaviourEvent, SwarmDriver,
    SwarmHandle, PROTOCOL_PREFIX,
};

// Re-export commonly used libp2p types
pub use libp2p::{Multiaddr, PeerId};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid forward CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("NAT setup failed: {0}")]
    NatSetup(String),

    #[error("Dial to {peer} failed: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
