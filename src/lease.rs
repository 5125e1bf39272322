//! Lease model shared by the controller, the client and the daemon.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Assignment of an overlay subnet (or single IP) to a host.
///
/// Fields stay as strings on the wire; consumers parse and report
/// malformed values themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub underlay_ip: String,
    pub overlay_subnet: String,
    pub overlay_hardware_addr: String,
}

impl Lease {
    /// Parsed overlay subnet with host bits kept, so `addr()` is the
    /// lease's gateway address.
    pub fn subnet(&self) -> Option<Ipv4Net> {
        self.overlay_subnet.parse().ok()
    }

    pub fn is_single_ip(&self) -> bool {
        self.subnet().map(|net| net.prefix_len() == 32).unwrap_or(false)
    }
}

/// Body of `POST /leases/acquire`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub underlay_ip: String,
    #[serde(default)]
    pub single_overlay_ip: bool,
}

/// Body of `GET /leases`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseList {
    pub leases: Vec<Lease>,
}

/// A six-byte Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddr(pub [u8; 6]);

impl HardwareAddr {
    /// Overlay MAC for a lease: `ee:ee` followed by the four octets of the
    /// lease's first overlay address.
    pub fn from_overlay_ip(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        HardwareAddr([0xee, 0xee, a, b, c, d])
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for HardwareAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(format!("address {}: invalid MAC address", s));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(format!("address {}: invalid MAC address", s));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| format!("address {}: invalid MAC address", s))?;
        }
        Ok(HardwareAddr(bytes))
    }
}

impl Serialize for HardwareAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
