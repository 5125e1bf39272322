//! Candidate subnets carved out of the overlay network.
//!
//! The pool is computed once and never mutated. Availability is always a
//! view: candidates minus whatever the caller says is taken. Selection is
//! random so that concurrent acquirers rarely pick the same block; the store
//! is responsible for rejecting the occasional collision.

use ipnet::Ipv4Net;
use rand::seq::IteratorRandom;
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::NetworkError;
use crate::multi_cidr::MultiCidrNetwork;

/// Block and single-IP candidates for one overlay configuration.
#[derive(Debug, Clone)]
pub struct CidrPool {
    network: MultiCidrNetwork,
    block_mask: u8,
    block_pool: Vec<String>,
    single_pool: Vec<String>,
    members: HashSet<String>,
}

impl CidrPool {
    /// Build the pool for `ranges` cut into `/block_mask` blocks.
    ///
    /// The first block of every range is reserved and never offered. Single
    /// IPs come only from the first block of the first range, skipping its
    /// first address.
    pub fn new<S: AsRef<str>>(ranges: &[S], block_mask: u8) -> Result<Self, NetworkError> {
        if ranges.is_empty() {
            return Err(NetworkError::EmptyNetworkList);
        }
        if block_mask > 32 {
            return Err(NetworkError::InvalidMask(block_mask));
        }

        let network = MultiCidrNetwork::new(ranges)?;
        let block_size = block_size(block_mask);

        let mut block_pool = Vec::new();
        for net in network.networks() {
            let base = u64::from(u32::from(net.network()));
            let full_range = 1u64 << (32 - u32::from(net.prefix_len()));
            let mut offset = block_size;
            while offset < full_range {
                block_pool.push(format!("{}/{}", to_addr(base + offset), block_mask));
                offset += block_size;
            }
        }

        let mut single_pool = Vec::new();
        if let Some(first) = network.networks().first() {
            let base = u64::from(u32::from(first.network()));
            for offset in 1..block_size {
                let addr = base + offset;
                if addr > u64::from(u32::MAX) {
                    break;
                }
                single_pool.push(format!("{}/32", to_addr(addr)));
            }
        }

        let members = block_pool
            .iter()
            .chain(single_pool.iter())
            .cloned()
            .collect();

        Ok(Self {
            network,
            block_mask,
            block_pool,
            single_pool,
            members,
        })
    }

    pub fn network(&self) -> &MultiCidrNetwork {
        &self.network
    }

    pub fn block_mask(&self) -> u8 {
        self.block_mask
    }

    pub fn block_pool_size(&self) -> usize {
        self.block_pool.len()
    }

    pub fn single_pool_size(&self) -> usize {
        self.single_pool.len()
    }

    /// A random block not in `taken`, or `None` once the pool is exhausted.
    pub fn get_available_block(&self, taken: &[String]) -> Option<String> {
        pick_available(&self.block_pool, taken)
    }

    /// A random single IP not in `taken`, or `None` once the pool is exhausted.
    pub fn get_available_single_ip(&self, taken: &[String]) -> Option<String> {
        pick_available(&self.single_pool, taken)
    }

    /// Exact string membership in either pool. Callers must pass the
    /// canonical `addr/prefix` form.
    pub fn is_member(&self, subnet: &str) -> bool {
        self.members.contains(subnet)
    }

    /// Whether `subnet` parses and lies inside one of the configured ranges.
    pub fn in_network(&self, subnet: &str) -> bool {
        subnet
            .parse::<Ipv4Net>()
            .map(|net| self.network.contains(net.addr()))
            .unwrap_or(false)
    }
}

fn pick_available(pool: &[String], taken: &[String]) -> Option<String> {
    let taken: HashSet<&str> = taken.iter().map(String::as_str).collect();
    pool.iter()
        .filter(|candidate| !taken.contains(candidate.as_str()))
        .choose(&mut rand::thread_rng())
        .cloned()
}

fn block_size(mask: u8) -> u64 {
    1u64 << (32 - u32::from(mask))
}

fn to_addr(value: u64) -> Ipv4Addr {
    Ipv4Addr::from(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_ranges() {
        let err = CidrPool::new::<&str>(&[], 24).unwrap_err();
        assert_eq!(err, NetworkError::EmptyNetworkList);
    }

    #[test]
    fn test_new_rejects_bad_mask() {
        let err = CidrPool::new(&["10.255.0.0/16"], 33).unwrap_err();
        assert_eq!(err, NetworkError::InvalidMask(33));
    }

    #[test]
    fn test_new_rejects_bad_cidr() {
        let err = CidrPool::new(&["10.255.0.0/16", "banana"], 24).unwrap_err();
        assert_eq!(err, NetworkError::InvalidCidr("banana".to_string()));
    }

    #[test]
    fn test_block_pool_size_single_network() {
        let pool = CidrPool::new(&["10.255.0.0/16"], 24).unwrap();
        assert_eq!(pool.block_pool_size(), 255);
    }

    #[test]
    fn test_block_pool_size_sums_networks() {
        let pool = CidrPool::new(&["10.255.0.0/16", "10.250.0.0/20", "10.0.0.0/8"], 24).unwrap();
        // 256-1 + 16-1 + 65536-1
        assert_eq!(pool.block_pool_size(), 255 + 15 + 65535);
    }

    #[test]
    fn test_block_pool_excludes_first_block() {
        let pool = CidrPool::new(&["10.255.0.0/16"], 24).unwrap();
        assert!(!pool.is_member("10.255.0.0/24"));
        assert!(pool.is_member("10.255.1.0/24"));
        assert!(pool.is_member("10.255.255.0/24"));
    }

    #[test]
    fn test_block_mask_larger_than_network() {
        let pool = CidrPool::new(&["10.255.0.0/24"], 16).unwrap();
        assert_eq!(pool.block_pool_size(), 0);
    }

    #[test]
    fn test_single_pool_size() {
        let pool = CidrPool::new(&["10.255.0.0/16"], 25).unwrap();
        assert_eq!(pool.single_pool_size(), 127);
    }

    #[test]
    fn test_single_pool_only_from_first_network() {
        let pool = CidrPool::new(&["10.255.0.0/16", "10.250.0.0/16"], 24).unwrap();
        assert_eq!(pool.single_pool_size(), 255);
        assert!(pool.is_member("10.255.0.1/32"));
        assert!(pool.is_member("10.255.0.255/32"));
        assert!(!pool.is_member("10.255.0.0/32"));
        assert!(!pool.is_member("10.250.0.1/32"));
    }

    #[test]
    fn test_is_member_requires_exact_match() {
        let pool = CidrPool::new(&["10.255.0.0/16"], 24).unwrap();
        assert!(pool.is_member("10.255.4.0/24"));
        assert!(!pool.is_member("10.255.4.0/23"));
        assert!(!pool.is_member("10.255.4.1/24"));
        assert!(!pool.is_member("10.254.4.0/24"));
    }

    #[test]
    fn test_get_available_block_exhausts_without_repeats() {
        let pool = CidrPool::new(&["10.255.0.0/20"], 24).unwrap();
        let mut taken = Vec::new();
        while let Some(subnet) = pool.get_available_block(&taken) {
            assert!(pool.is_member(&subnet));
            assert!(!taken.contains(&subnet));
            taken.push(subnet);
        }
        assert_eq!(taken.len(), pool.block_pool_size());
        assert_eq!(pool.get_available_block(&taken), None);
    }

    #[test]
    fn test_get_available_single_ip_skips_taken() {
        let pool = CidrPool::new(&["10.255.0.0/16"], 30).unwrap();
        let taken = vec!["10.255.0.1/32".to_string(), "10.255.0.2/32".to_string()];
        assert_eq!(
            pool.get_available_single_ip(&taken),
            Some("10.255.0.3/32".to_string())
        );
    }

    #[test]
    fn test_get_available_ignores_unknown_taken_entries() {
        let pool = CidrPool::new(&["10.255.0.0/23"], 24).unwrap();
        let taken = vec!["192.168.0.0/24".to_string()];
        assert_eq!(
            pool.get_available_block(&taken),
            Some("10.255.1.0/24".to_string())
        );
    }

    #[test]
    fn test_in_network() {
        let pool = CidrPool::new(&["10.255.0.0/16"], 24).unwrap();
        assert!(pool.in_network("10.255.9.0/24"));
        assert!(!pool.in_network("10.254.9.0/24"));
        assert!(!pool.in_network("banana"));
    }
}
