use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bytes::Bytes;
use ipnet::{IpNet, Ipv4Net};

/// Address string a port is registered under in the tunnel's port table
pub type PortAddr = String;

/// Well-known DNS server whose traffic is always intercepted
pub const DNS_SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Interval of the dispatch loop's diagnostic log line
pub const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(30);

/// The DNS server as a single-host network (`8.8.8.8/32`)
pub fn dns_server_net() -> IpNet {
    IpNet::V4(Ipv4Net::from(DNS_SERVER))
}

/// A unit of tunnelled traffic.
///
/// The payload is opaque to the dispatch engine; only the routing metadata
/// is inspected. `Bytes` keeps clones cheap, since a message is handed by
/// reference to every handler in the chain and a handler that forwards it
/// needs its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Address of the port the message entered through (empty until sent)
    pub src: PortAddr,
    /// Destination address the message is routed towards
    pub dst: PortAddr,
    /// Opaque payload
    pub payload: Bytes,
}

impl Message {
    /// Create a message for `dst` with no source yet
    pub fn new(dst: impl Into<PortAddr>, payload: impl Into<Bytes>) -> Self {
        Self {
            src: PortAddr::new(),
            dst: dst.into(),
            payload: payload.into(),
        }
    }

    /// Set the source port address
    pub fn with_src(mut self, src: impl Into<PortAddr>) -> Self {
        self.src = src.into();
        self
    }

    /// Destination parsed as an IP address, if it is one
    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.dst.parse().ok()
    }

    /// Copy of this message re-addressed to `dst`
    pub fn redirect(&self, dst: impl Into<PortAddr>) -> Self {
        Self {
            src: self.src.clone(),
            dst: dst.into(),
            payload: self.payload.clone(),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
