//! Address pool
//!
//! Hands out host addresses from a fixed IPv4 range, lowest free address
//! first. Never-issued addresses are tracked by a cursor; released ones go
//! to an ordered set so they are reused before the cursor advances.

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{FakeIpError, Result};

struct PoolState {
    /// Next never-issued address
    next: u32,
    /// Freed addresses below `next`, available for reuse
    released: BTreeSet<u32>,
    /// Addresses currently handed out
    allocated: HashSet<u32>,
}

/// Allocator over the usable host addresses of one IPv4 range.
///
/// The network and broadcast addresses are never issued. The pool is
/// internally synchronised so an eviction callback can hand addresses back
/// while the owner holds its own lock.
pub struct AddressPool {
    network: Ipv4Net,
    first: u32,
    last: u32,
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Create a pool over `network` (host bits are ignored)
    pub fn new(network: Ipv4Net) -> Result<Self> {
        let network = network.trunc();
        if network.prefix_len() >= 31 {
            return Err(FakeIpError::RangeTooSmall(network.to_string()));
        }

        let first = u32::from(network.network()) + 1;
        let last = u32::from(network.broadcast()) - 1;

        Ok(Self {
            network,
            first,
            last,
            state: Mutex::new(PoolState {
                next: first,
                released: BTreeSet::new(),
                allocated: HashSet::new(),
            }),
        })
    }

    /// Parse a CIDR string and create a pool over it
    pub fn parse(range: &str) -> Result<Self> {
        let net: IpNet = range
            .trim()
            .parse()
            .map_err(|e| FakeIpError::InvalidRange(format!("{}: {}", range, e)))?;

        match net {
            IpNet::V4(v4) => Self::new(v4),
            IpNet::V6(_) => Err(FakeIpError::UnsupportedRange(net.to_string())),
        }
    }

    /// Allocate the lowest free address
    pub fn alloc(&self) -> Result<Ipv4Addr> {
        let mut state = self.state.lock();

        let addr = if let Some(addr) = state.released.pop_first() {
            addr
        } else if state.next <= self.last {
            let addr = state.next;
            state.next += 1;
            addr
        } else {
            return Err(FakeIpError::PoolExhausted {
                range: self.network,
            });
        };

        state.allocated.insert(addr);
        Ok(Ipv4Addr::from(addr))
    }

    /// Return an address to the pool.
    ///
    /// Returns false, leaving the pool untouched, if the address is outside
    /// the range or is not currently allocated.
    pub fn free(&self, addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        let mut state = self.state.lock();

        if !state.allocated.remove(&value) {
            warn!("Ignoring free of unallocated address {} in {}", addr, self.network);
            return false;
        }

        // Give the tail back to the cursor so the released set stays small
        if value + 1 == state.next {
            state.next = value;
            while let Some(&top) = state.released.last() {
                if top + 1 != state.next {
                    break;
                }
                state.released.pop_last();
                state.next = top;
            }
        } else {
            state.released.insert(value);
        }

        debug!("Freed {} back to {}", addr, self.network);
        true
    }

    /// The range this pool allocates from
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Whether `addr` is a usable host address of this range
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        value >= self.first && value <= self.last
    }

    /// Whether `addr` is currently handed out
    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        self.state.lock().allocated.contains(&u32::from(addr))
    }

    /// Total number of usable addresses
    pub fn capacity(&self) -> usize {
        (self.last - self.first + 1) as usize
    }

    /// Number of addresses currently handed out
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated.len()
    }

    /// Number of addresses still available
    pub fn available(&self) -> usize {
        self.capacity() - self.allocated()
    }
}
