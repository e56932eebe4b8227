//! Configuration types
//!
//! Plain data passed to constructors. Nothing here is process-global; the
//! settings crate persists [`MeshtunConfig`] and the CLI overlays its flags.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshtunConfig {
    /// Peer network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Fake address settings
    #[serde(default)]
    pub fakeip: FakeIpConfig,

    /// Dispatch engine settings
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Peer network settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Remote endpoints (e.g. `ipfs/<peer id>`)
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Local virtual address in CIDR form, set on the tunnel interface
    #[serde(default = "default_local_addr")]
    pub local_addr: String,

    /// Networks forwarded for remote peers, as CIDRs
    #[serde(default)]
    pub forward: Vec<String>,

    /// Discovery namespace (empty disables discovery)
    #[serde(default)]
    pub namespace: String,
}

fn default_local_addr() -> String {
    "192.168.100.2/24".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            local_addr: default_local_addr(),
            forward: Vec::new(),
            namespace: String::new(),
        }
    }
}

/// Fake address settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FakeIpConfig {
    /// Fake address range in CIDR form (empty disables fake addressing)
    #[serde(default)]
    pub range: String,

    /// Rule script path
    #[serde(default)]
    pub rule_script: Option<PathBuf>,

    /// Geo-IP database path
    #[serde(default)]
    pub geoip_db: Option<PathBuf>,

    /// Maximum live fake/real pairs before the oldest is evicted.
    /// `None` means the pool size is the only bound.
    #[serde(default)]
    pub mapping_capacity: Option<usize>,
}

impl FakeIpConfig {
    /// Config for a bare range with no rules
    pub fn with_range(range: impl Into<String>) -> Self {
        Self {
            range: range.into(),
            ..Self::default()
        }
    }

    /// Whether fake addressing is configured at all
    pub fn is_enabled(&self) -> bool {
        !self.range.trim().is_empty()
    }

    /// Rule script and geo-IP database, only when both are set and non-empty
    pub fn rule_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.rule_script, &self.geoip_db) {
            (Some(script), Some(db))
                if !script.as_os_str().is_empty() && !db.as_os_str().is_empty() =>
            {
                Some((script, db))
            }
            _ => None,
        }
    }
}

/// Dispatch engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Depth of the shared inbound queue. Small values make delivery a
    /// blocking handoff that throttles all producers uniformly.
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,

    /// Depth of each port's outbound queue
    #[serde(default = "default_port_buffer")]
    pub port_buffer: usize,

    /// Seconds between diagnostic log lines
    #[serde(default = "default_diagnostic_interval")]
    pub diagnostic_interval_secs: u64,
}

fn default_inbound_queue() -> usize {
    1
}

fn default_port_buffer() -> usize {
    32
}

fn default_diagnostic_interval() -> u64 {
    crate::DIAGNOSTIC_INTERVAL.as_secs()
}

impl TunnelConfig {
    /// Diagnostic interval as a duration (never zero)
    pub fn diagnostic_interval(&self) -> Duration {
        Duration::from_secs(self.diagnostic_interval_secs.max(1))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            inbound_queue: default_inbound_queue(),
            port_buffer: default_port_buffer(),
            diagnostic_interval_secs: default_diagnostic_interval(),
        }
    }
}
