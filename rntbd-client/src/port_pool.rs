//! Pool of local ports recycled across outbound connections.
//!
//! Every connection opened in private-port-pool mode registers its local
//! port here. Once enough distinct ports are known, new connections bind to
//! a random sample of them instead of asking the OS for a fresh ephemeral
//! port, which keeps churn from exhausting the ephemeral range.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PortState {
    references: usize,
    usable: bool,
}

#[derive(Debug, Default)]
struct Pool {
    ports: HashMap<u16, PortState>,
    usable_count: usize,
}

/// Port counts for one address family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolUsage {
    pub ports: usize,
    pub usable: usize,
    pub references: usize,
}

/// Port counts for both address families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortPoolUsage {
    pub ipv4: PoolUsage,
    pub ipv6: PoolUsage,
}

impl fmt::Display for PortPoolUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv4 ports: {} (usable {}, references {}); IPv6 ports: {} (usable {}, references {})",
            self.ipv4.ports,
            self.ipv4.usable,
            self.ipv4.references,
            self.ipv6.ports,
            self.ipv6.usable,
            self.ipv6.references
        )
    }
}

pub struct UserPortPool {
    reuse_threshold: usize,
    candidate_port_count: usize,
    ipv4: Mutex<Pool>,
    ipv6: Mutex<Pool>,
}

impl UserPortPool {
    pub fn new(reuse_threshold: usize, candidate_port_count: usize) -> Self {
        Self {
            reuse_threshold,
            candidate_port_count,
            ipv4: Mutex::new(Pool::default()),
            ipv6: Mutex::new(Pool::default()),
        }
    }

    fn pool(&self, family: AddressFamily) -> &Mutex<Pool> {
        match family {
            AddressFamily::V4 => &self.ipv4,
            AddressFamily::V6 => &self.ipv6,
        }
    }

    /// Returns a random sample of usable ports, or `None` while fewer than
    /// the reuse threshold are known. Callers then bind to port 0.
    pub fn get_candidate_ports(&self, family: AddressFamily) -> Option<Vec<u16>> {
        let pool = self.pool(family).lock();
        if pool.usable_count < self.reuse_threshold || pool.usable_count == 0 {
            return None;
        }

        let mut rng = rand::thread_rng();
        let wanted = self.candidate_port_count.min(pool.usable_count);
        let mut sample = Vec::with_capacity(wanted);
        let usable = pool
            .ports
            .iter()
            .filter(|(_, state)| state.usable)
            .map(|(port, _)| *port);
        for (seen, port) in usable.enumerate() {
            if seen < wanted {
                sample.push(port);
            } else {
                let slot = rng.gen_range(0..=seen);
                if slot < wanted {
                    sample[slot] = port;
                }
            }
        }
        drop(pool);

        // Reservoir sampling keeps early ports in their original slots.
        sample.shuffle(&mut rng);
        Some(sample)
    }

    /// Records a connection bound to `port`. Unknown ports join the pool as usable.
    pub fn add_reference(&self, family: AddressFamily, port: u16) {
        let mut guard = self.pool(family).lock();
        let pool = &mut *guard;
        match pool.ports.get_mut(&port) {
            Some(state) => state.references += 1,
            None => {
                pool.ports.insert(
                    port,
                    PortState {
                        references: 1,
                        usable: true,
                    },
                );
                pool.usable_count += 1;
            }
        }
    }

    /// Releases a connection's port. The port leaves the pool with its last reference.
    pub fn remove_reference(&self, family: AddressFamily, port: u16) {
        let mut guard = self.pool(family).lock();
        let pool = &mut *guard;
        let Some(state) = pool.ports.get_mut(&port) else {
            tracing::warn!(port, "released a port the pool does not track");
            return;
        };
        state.references = state.references.saturating_sub(1);
        if state.references == 0 {
            let usable = state.usable;
            pool.ports.remove(&port);
            if usable {
                pool.usable_count -= 1;
            }
        }
    }

    /// Excludes a port from future candidates after a bind or connect conflict.
    pub fn mark_unusable(&self, family: AddressFamily, port: u16) {
        let mut guard = self.pool(family).lock();
        let pool = &mut *guard;
        if let Some(state) = pool.ports.get_mut(&port) {
            if state.usable {
                state.usable = false;
                pool.usable_count -= 1;
                tracing::debug!(port, "port marked unusable");
            }
        }
    }

    pub fn usage(&self) -> PortPoolUsage {
        let summarize = |pool: &Mutex<Pool>| {
            let pool = pool.lock();
            PoolUsage {
                ports: pool.ports.len(),
                usable: pool.usable_count,
                references: pool.ports.values().map(|s| s.references).sum(),
            }
        };
        PortPoolUsage {
            ipv4: summarize(&self.ipv4),
            ipv6: summarize(&self.ipv6),
        }
    }

    pub fn usage_summary(&self) -> String {
        self.usage().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool_with(ports: std::ops::Range<u16>, threshold: usize, candidates: usize) -> UserPortPool {
        let pool = UserPortPool::new(threshold, candidates);
        for port in ports {
            pool.add_reference(AddressFamily::V4, port);
        }
        pool
    }

    #[test]
    fn test_no_candidates_below_threshold() {
        let pool = pool_with(40000..40009, 10, 5);
        assert_eq!(pool.get_candidate_ports(AddressFamily::V4), None);
        assert_eq!(pool.get_candidate_ports(AddressFamily::V6), None);
    }

    #[test]
    fn test_candidates_distinct_and_usable() {
        let pool = pool_with(40000..40050, 10, 5);
        for _ in 0..20 {
            let candidates = pool.get_candidate_ports(AddressFamily::V4).unwrap();
            assert_eq!(candidates.len(), 5);
            let distinct: HashSet<_> = candidates.iter().collect();
            assert_eq!(distinct.len(), 5);
            assert!(candidates.iter().all(|p| (40000..40050).contains(p)));
        }
    }

    #[test]
    fn test_candidate_count_capped_by_usable_ports() {
        let pool = pool_with(40000..40003, 3, 10);
        let candidates = pool.get_candidate_ports(AddressFamily::V4).unwrap();
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn test_unusable_ports_excluded() {
        let pool = pool_with(40000..40012, 10, 12);
        pool.mark_unusable(AddressFamily::V4, 40000);
        pool.mark_unusable(AddressFamily::V4, 40000);
        pool.mark_unusable(AddressFamily::V4, 40001);

        let candidates = pool.get_candidate_ports(AddressFamily::V4).unwrap();
        assert_eq!(candidates.len(), 10);
        assert!(!candidates.contains(&40000));
        assert!(!candidates.contains(&40001));

        let usage = pool.usage();
        assert_eq!(usage.ipv4.ports, 12);
        assert_eq!(usage.ipv4.usable, 10);

        pool.mark_unusable(AddressFamily::V4, 40002);
        assert_eq!(pool.get_candidate_ports(AddressFamily::V4), None);
    }

    #[test]
    fn test_reference_counting() {
        let pool = UserPortPool::new(1, 1);
        pool.add_reference(AddressFamily::V6, 50000);
        pool.add_reference(AddressFamily::V6, 50000);
        assert_eq!(pool.usage().ipv6.references, 2);

        pool.remove_reference(AddressFamily::V6, 50000);
        assert_eq!(pool.usage().ipv6.ports, 1);
        pool.remove_reference(AddressFamily::V6, 50000);
        assert_eq!(pool.usage().ipv6, PoolUsage::default());

        // Unusable ports still leave with their last reference.
        pool.add_reference(AddressFamily::V6, 50001);
        pool.mark_unusable(AddressFamily::V6, 50001);
        pool.remove_reference(AddressFamily::V6, 50001);
        assert_eq!(pool.usage().ipv6, PoolUsage::default());

        pool.remove_reference(AddressFamily::V6, 50002);
    }

    #[test]
    fn test_usage_summary() {
        let pool = pool_with(40000..40002, 1, 1);
        let summary = pool.usage_summary();
        assert!(summary.contains("IPv4 ports: 2 (usable 2, references 2)"));
        assert!(summary.contains("IPv6 ports: 0"));
    }
}
