//! Exit forwarding
//!
//! When a node forwards traffic for other ranges it needs kernel IP
//! forwarding and a masquerade rule per range. That setup runs once at
//! startup and any failure aborts it.

use std::process::Command;

use ipnet::IpNet;
use tracing::{debug, info};

use crate::{NetworkError, Result};

/// Host-level NAT configuration
pub trait NatSetup: Send + Sync {
    fn enable(&self, cidrs: &[IpNet]) -> Result<()>;
}

/// Parse forward ranges. Entries may themselves be comma separated.
pub fn parse_forward_cidrs(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|cidr| !cidr.is_empty())
        .map(|cidr| {
            cidr.parse::<IpNet>()
                .map(|net| net.trunc())
                .map_err(|e| NetworkError::InvalidCidr {
                    cidr: cidr.to_string(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// Parse `entries` and, if any range is configured, enable NAT for them
pub fn setup_forwarding(entries: &[String], nat: &dyn NatSetup) -> Result<Vec<IpNet>> {
    let cidrs = parse_forward_cidrs(entries)?;
    if cidrs.is_empty() {
        debug!("No forward ranges configured");
        return Ok(cidrs);
    }

    nat.enable(&cidrs)?;
    info!("Forwarding enabled for {} range(s)", cidrs.len());
    Ok(cidrs)
}

/// Runs `sysctl` and `iptables`/`ip6tables` on the host
#[derive(Debug, Clone, Default)]
pub struct CommandNat;

impl CommandNat {
    /// Command lines `enable` would run for `cidrs`
    pub fn commands(&self, cidrs: &[IpNet]) -> Vec<Vec<String>> {
        let mut commands = Vec::new();

        if cidrs.iter().any(|net| matches!(net, IpNet::V4(_))) {
            commands.push(args(&["sysctl", "-w", "net.ipv4.ip_forward=1"]));
        }
        if cidrs.iter().any(|net| matches!(net, IpNet::V6(_))) {
            commands.push(args(&["sysctl", "-w", "net.ipv6.conf.all.forwarding=1"]));
        }

        for net in cidrs {
            let tool = match net {
                IpNet::V4(_) => "iptables",
                IpNet::V6(_) => "ip6tables",
            };
            let source = net.to_string();
            commands.push(args(&[
                tool,
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                &source,
                "-j",
                "MASQUERADE",
            ]));
        }

        commands
    }
}

impl NatSetup for CommandNat {
    fn enable(&self, cidrs: &[IpNet]) -> Result<()> {
        for command in self.commands(cidrs) {
            let Some((program, rest)) = command.split_first() else {
                continue;
            };
            debug!("Running {}", command.join(" "));

            let output = Command::new(program).args(rest).output()?;
            if !output.status.success() {
                return Err(NetworkError::NatSetup(format!(
                    "'{}' failed ({}): {}",
                    command.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        Ok(())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}
