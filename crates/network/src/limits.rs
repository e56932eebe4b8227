use libp2p::{connection_limits, memory_connection_limits};

/// Transport resource ceilings.
///
/// Only the inbound side is limited; outbound dials are left alone. Memory
/// is capped as a fraction of total system memory: once process usage
/// crosses it, new connections are refused.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub max_memory_fraction: f64,
    pub max_pending_incoming: Option<u32>,
    pub max_established_incoming: Option<u32>,
    pub max_established_per_peer: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_fraction: 0.5,
            max_pending_incoming: Some(64),
            max_established_incoming: Some(256),
            max_established_per_peer: Some(8),
        }
    }
}

impl ResourceLimits {
    /// No connection ceilings, memory still capped at the fraction
    pub fn unlimited_connections() -> Self {
        Self {
            max_pending_incoming: None,
            max_established_incoming: None,
            max_established_per_peer: None,
            ..Self::default()
        }
    }

    /// Memory fraction clamped into a usable range
    pub fn memory_fraction(&self) -> f64 {
        if self.max_memory_fraction.is_finite() {
            self.max_memory_fraction.clamp(0.01, 1.0)
        } else {
            0.5
        }
    }

    pub fn connection_limits(&self) -> connection_limits::ConnectionLimits {
        connection_limits::ConnectionLimits::default()
            .with_max_pending_incoming(self.max_pending_incoming)
            .with_max_established_incoming(self.max_established_incoming)
            .with_max_established_per_peer(self.max_established_per_peer)
    }

    pub fn connection_behaviour(&self) -> connection_limits::Behaviour {
        connection_limits::Behaviour::new(self.connection_limits())
    }

    pub fn memory_behaviour(&self) -> memory_connection_limits::Behaviour {
        memory_connection_limits::Behaviour::with_max_percentage(self.memory_fraction())
    }
}
