//! Meshtun Fake Addressing
//!
//! Translates resolved destinations into synthetic addresses drawn from a
//! reserved range, so domain-based traffic can be intercepted and routed
//! without exposing the real destination to local consumers.
//!
//! ## Components
//!
//! - **AddressPool**: lowest-free-first allocator over an IPv4 range
//! - **AddressMapping**: capacity-aware key/value table with an eviction callback
//! - **FakeIpManager**: keeps two mappings (fake→real, real→fake) in lock-step
//! - **RuleEvaluator**: optional domain classification hook

mod manager;
mod mapping;
mod pool;
mod rule;

pub use manager::{FakeIpManager, FakeIpStats};
pub use mapping::{AddressMapping, EvictionCallback};
pub use pool::AddressPool;
pub use rule::{GeoIpDb, RuleAction, RuleEvaluator, ScriptRules};

use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FakeIpError {
    #[error("Invalid address range: {0}")]
    InvalidRange(String),

    #[error("Unsupported address range {0}: only IPv4 ranges can back a pool")]
    UnsupportedRange(String),

    #[error("Address range {0} has no usable host addresses")]
    RangeTooSmall(String),

    #[error("Address pool exhausted: no free address in {range}")]
    PoolExhausted { range: Ipv4Net },

    #[error("Address {addr} is outside fake range {range}")]
    AddressOutOfRange { addr: IpAddr, range: Ipv4Net },

    #[error("Failed to load rules from {path:?}: {reason}")]
    RuleLoad { path: PathBuf, reason: String },

    #[error("Rule parse error at line {line}: {reason}")]
    RuleParse { line: usize, reason: String },
}

impl FakeIpError {
    /// Whether this is the recoverable pool-exhaustion condition
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, FakeIpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_pool_exhausted() {
        let err = FakeIpError::PoolExhausted {
            range: "10.0.0.0/30".parse().unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "Address pool exhausted: no free address in 10.0.0.0/30"
        );
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_error_display_rule_parse() {
        let err = FakeIpError::RuleParse {
            line: 3,
            reason: "unknown action 'proxy'".to_string(),
        };
        assert_eq!(err.to_string(), "Rule parse error at line 3: unknown action 'proxy'");
        assert!(!err.is_exhausted());
    }

    #[test]
    fn test_error_display_invalid_range() {
        let err = FakeIpError::InvalidRange("not-a-cidr".to_string());
        assert_eq!(err.to_string(), "Invalid address range: not-a-cidr");
    }
}
