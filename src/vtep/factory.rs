//! VXLAN device lifecycle.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

use super::config::VtepConfig;
use super::netlink::{NetlinkAdapter, VxlanLink};
use crate::error::VtepError;
use crate::lease::HardwareAddr;

/// What the kernel reports about an existing VTEP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtepState {
    pub hardware_addr: HardwareAddr,
    pub overlay_ip: Ipv4Addr,
    pub mtu: u32,
}

pub struct Factory {
    netlink: Arc<dyn NetlinkAdapter>,
}

impl Factory {
    pub fn new(netlink: Arc<dyn NetlinkAdapter>) -> Self {
        Self { netlink }
    }

    /// Create the VTEP, bring it up and give it one address per overlay
    /// network.
    ///
    /// The network holding the lease gets the lease IP, every other network
    /// gets its own first address. All use the network's prefix length.
    pub fn create_vtep(&self, config: &VtepConfig) -> Result<(), VtepError> {
        if !config.overlay_networks.contains(config.lease_ip) {
            return Err(VtepError::LeaseOutsideOverlay(config.lease_ip.to_string()));
        }

        let link = VxlanLink {
            name: config.vtep_name.clone(),
            hardware_addr: config.overlay_hardware_addr,
            vni: config.vni,
            src_addr: config.underlay_ip,
            gbp: true,
            port: config.vtep_port,
            vtep_dev: config.underlay_interface.name.clone(),
        };

        self.netlink
            .link_add_vxlan(&link)
            .map_err(|e| VtepError::CreateLink {
                name: config.vtep_name.clone(),
                reason: e.to_string(),
            })?;

        self.netlink
            .link_set_up(&config.vtep_name)
            .map_err(|e| VtepError::UpLink(e.to_string()))?;

        for network in config.overlay_networks.networks() {
            let ip = if network.contains(&config.lease_ip) {
                config.lease_ip
            } else {
                network.network()
            };
            let addr = Ipv4Net::new(ip, network.prefix_len())
                .map_err(|e| VtepError::AddAddress(e.to_string()))?;
            debug!(device = %config.vtep_name, %addr, "adding overlay address");
            self.netlink
                .addr_add_scope_link(&config.vtep_name, addr)
                .map_err(|e| VtepError::AddAddress(e.to_string()))?;
        }

        info!(
            device = %config.vtep_name,
            vni = config.vni,
            underlay = %config.underlay_interface.name,
            "created vtep"
        );
        Ok(())
    }

    /// Hardware address, overlay IP and MTU of an existing VTEP.
    ///
    /// The overlay IP is the first address that is not the network address
    /// of its own prefix, which is the lease IP when the device was made by
    /// [`create_vtep`](Self::create_vtep).
    pub fn get_vtep_state(&self, name: &str) -> Result<VtepState, VtepError> {
        let link = self
            .netlink
            .link_by_name(name)
            .map_err(|e| VtepError::LinkLookup(e.to_string()))?;

        let addrs = self
            .netlink
            .addr_list(name)
            .map_err(|e| VtepError::ListAddresses(e.to_string()))?;

        let overlay_ip = addrs
            .iter()
            .find(|a| a.addr() != a.network())
            .or_else(|| addrs.first())
            .map(|a| a.addr())
            .ok_or(VtepError::NoAddresses)?;

        let hardware_addr = link
            .hardware_addr
            .ok_or_else(|| VtepError::HardwareAddr(format!("link {} has no hardware address", name)))?;

        Ok(VtepState {
            hardware_addr,
            overlay_ip,
            mtu: link.mtu,
        })
    }

    pub fn delete_vtep(&self, name: &str) -> Result<(), VtepError> {
        let link = self
            .netlink
            .link_by_name(name)
            .map_err(|e| VtepError::FindLink {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        self.netlink
            .link_del(&link.name)
            .map_err(|e| VtepError::DeleteLink {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        info!(device = name, "deleted vtep");
        Ok(())
    }
}
