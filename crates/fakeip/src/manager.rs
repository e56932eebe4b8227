//! Fake address manager
//!
//! Owns the pool and both mapping directions. One lock covers allocation and
//! lookups in both directions, so the fake→real and real→fake tables are
//! never observed out of step.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use meshtun_core::{dns_server_net, FakeIpConfig};

use crate::{AddressMapping, AddressPool, FakeIpError, Result, RuleAction, RuleEvaluator, ScriptRules};

struct Mappings {
    fake_to_real: AddressMapping<Ipv4Addr, IpAddr>,
    real_to_fake: AddressMapping<IpAddr, Ipv4Addr>,
}

/// Point-in-time counters for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeIpStats {
    pub mapped: usize,
    pub pool_capacity: usize,
    pub pool_available: usize,
}

/// Allocates fake addresses and keeps the fake ↔ real bijection
pub struct FakeIpManager {
    network: Ipv4Net,
    pool: Arc<AddressPool>,
    mappings: Mutex<Mappings>,
    rule: Option<Arc<dyn RuleEvaluator>>,
}

impl FakeIpManager {
    /// Build a manager from configuration.
    ///
    /// Fails if the range is malformed, or if both rule paths are set and
    /// the rules cannot be loaded.
    pub fn new(config: &FakeIpConfig) -> Result<Self> {
        let pool = Arc::new(AddressPool::parse(&config.range)?);
        let network = pool.network();

        // Displaced fake addresses go straight back to the pool
        let reclaim = pool.clone();
        let fake_to_real = AddressMapping::new(config.mapping_capacity).with_eviction(
            move |fake: &Ipv4Addr, real: &IpAddr| {
                debug!("Evicted fake address {} (was {})", fake, real);
                reclaim.free(*fake);
            },
        );

        let rule = match config.rule_paths() {
            Some((script, db)) => {
                let rules: Arc<dyn RuleEvaluator> = Arc::new(ScriptRules::load(script, db)?);
                Some(rules)
            }
            None => None,
        };

        info!(
            "Fake address range {} ({} addresses, rules {})",
            network,
            pool.capacity(),
            if rule.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            network,
            pool,
            mappings: Mutex::new(Mappings {
                fake_to_real,
                real_to_fake: AddressMapping::unbounded(),
            }),
            rule,
        })
    }

    /// Build a manager over a bare range with no rules
    pub fn from_range(range: &str) -> Result<Self> {
        Self::new(&FakeIpConfig::with_range(range))
    }

    /// Replace the rule evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn RuleEvaluator>) -> Self {
        self.rule = Some(evaluator);
        self
    }

    /// Fake address for `real`, allocating one if it has none.
    ///
    /// Idempotent per real address while its pair is live. Fails with
    /// [`FakeIpError::PoolExhausted`] when no address is free and the
    /// mapping has no capacity bound to evict against.
    pub fn allocate(&self, domain: &str, real: IpAddr) -> Result<Ipv4Addr> {
        let mut mappings = self.mappings.lock();

        if let Some(fake) = mappings.real_to_fake.get(&real).copied() {
            mappings.real_to_fake.touch(&real);
            mappings.fake_to_real.touch(&fake);
            return Ok(fake);
        }

        // Make room first so a full mapping recycles instead of exhausting
        if mappings.fake_to_real.is_full() {
            if let Some((_, old_real)) = mappings.fake_to_real.pop_oldest() {
                mappings.real_to_fake.remove(&old_real);
            }
        }

        let fake = self.pool.alloc().map_err(|e| {
            warn!("Fake address pool {} exhausted allocating for {} ({})", self.network, domain, real);
            e
        })?;

        for (old_fake, old_real) in mappings.fake_to_real.put(fake, real) {
            debug_assert_ne!(old_fake, fake, "fresh fake address already mapped");
            mappings.real_to_fake.remove(&old_real);
        }
        mappings.real_to_fake.put(real, fake);

        debug!("Allocated fake address {} for {} ({})", fake, domain, real);
        Ok(fake)
    }

    /// Real address behind `fake`
    pub fn resolve_real(&self, fake: IpAddr) -> Option<IpAddr> {
        let IpAddr::V4(fake) = fake else {
            return None;
        };
        self.mappings.lock().fake_to_real.get(&fake).copied()
    }

    /// Fake address assigned to `real`
    pub fn resolve_fake(&self, real: IpAddr) -> Option<Ipv4Addr> {
        self.mappings.lock().real_to_fake.get(&real).copied()
    }

    /// Ranges whose traffic must be intercepted: the fake range and the DNS server
    pub fn routing_ranges(&self) -> Vec<IpNet> {
        vec![IpNet::V4(self.network), dns_server_net()]
    }

    /// Drop the pair for `fake` and return the address to the pool
    pub fn release(&self, fake: Ipv4Addr) -> Result<Option<IpAddr>> {
        if !self.pool.contains(fake) {
            return Err(FakeIpError::AddressOutOfRange {
                addr: IpAddr::V4(fake),
                range: self.network,
            });
        }

        let mut mappings = self.mappings.lock();
        let Some(real) = mappings.fake_to_real.remove(&fake) else {
            return Ok(None);
        };
        mappings.real_to_fake.remove(&real);
        self.pool.free(fake);
        Ok(Some(real))
    }

    /// Evict the least recently used pair, freeing its fake address
    pub fn evict_oldest(&self) -> Option<(Ipv4Addr, IpAddr)> {
        let mut mappings = self.mappings.lock();
        let (fake, real) = mappings.fake_to_real.pop_oldest()?;
        mappings.real_to_fake.remove(&real);
        Some((fake, real))
    }

    /// Whether `addr` lies in the fake range
    pub fn is_fake(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.network.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }

    /// Classify a resolved domain; without rules everything is faked
    pub fn classify(&self, domain: &str, real: IpAddr) -> RuleAction {
        self.rule
            .as_ref()
            .map_or(RuleAction::Fake, |rule| rule.evaluate(domain, real))
    }

    /// Whether a rule evaluator is configured
    pub fn has_rules(&self) -> bool {
        self.rule.is_some()
    }

    /// The configured fake range
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Number of live pairs
    pub fn len(&self) -> usize {
        self.mappings.lock().fake_to_real.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FakeIpStats {
        let mapped = self.mappings.lock().fake_to_real.len();
        FakeIpStats {
            mapped,
            pool_capacity: self.pool.capacity(),
            pool_available: self.pool.available(),
        }
    }
}
