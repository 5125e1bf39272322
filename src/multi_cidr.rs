//! A set of overlay address ranges treated as one network.
//!
//! Every range is stored in its canonical (masked) form, so
//! `10.255.3.7/16` is kept as `10.255.0.0/16`.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::NetworkError;

/// One or more IPv4 ranges, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiCidrNetwork {
    networks: Vec<Ipv4Net>,
    smallest_mask: u8,
}

impl MultiCidrNetwork {
    /// Parse each entry as an IPv4 CIDR.
    ///
    /// `smallest_mask` is the largest prefix length seen, i.e. the smallest
    /// address space among the ranges.
    pub fn new<S: AsRef<str>>(cidrs: &[S]) -> Result<Self, NetworkError> {
        let mut networks = Vec::with_capacity(cidrs.len());
        let mut smallest_mask = 0;

        for cidr in cidrs {
            let net = parse_network(cidr.as_ref())?;
            smallest_mask = smallest_mask.max(net.prefix_len());
            networks.push(net);
        }

        Ok(Self {
            networks,
            smallest_mask,
        })
    }

    pub fn networks(&self) -> &[Ipv4Net] {
        &self.networks
    }

    pub fn smallest_mask(&self) -> u8 {
        self.smallest_mask
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }

    /// First configured range containing `ip`, in configuration order.
    pub fn which_network_contains(&self, ip: Ipv4Addr) -> Option<&Ipv4Net> {
        self.networks.iter().find(|net| net.contains(&ip))
    }
}

/// Parse a CIDR string and mask off host bits.
pub(crate) fn parse_network(cidr: &str) -> Result<Ipv4Net, NetworkError> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|_| NetworkError::InvalidCidr(cidr.to_string()))
}
