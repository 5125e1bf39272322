//! Brings routes, ARP and FDB entries on the VTEP in line with the lease set.
//!
//! Every cycle snapshots the kernel state of the link, upserts what the
//! leases require and deletes managed entries no lease accounts for. No state
//! is carried between cycles, so a restarted daemon converges the same way a
//! long-running one does.

use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

use super::netlink::{Link, Neigh, NetlinkAdapter, Route};
use crate::error::ConvergeError;
use crate::lease::{HardwareAddr, Lease};
use crate::multi_cidr::MultiCidrNetwork;

/// Counts from one convergence cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergeSummary {
    /// Routes and neighbor entries written
    pub upserted: usize,
    /// Routes and neighbor entries removed
    pub removed: usize,
    /// Leases outside every overlay network
    pub non_routable: usize,
}

pub struct Converger {
    overlay_network: MultiCidrNetwork,
    local_subnet: Ipv4Net,
    local_vtep: Link,
    netlink: Arc<dyn NetlinkAdapter>,
    is_single_ip: bool,
}

/// Desired kernel state computed from the leases.
#[derive(Default)]
struct Desired {
    routes: Vec<Route>,
    arp: Vec<Neigh>,
    fdb: Vec<Neigh>,
    non_routable: usize,
}

impl Converger {
    /// `local_subnet` is the local lease with host bits kept.
    pub fn new(
        overlay_network: MultiCidrNetwork,
        local_subnet: Ipv4Net,
        local_vtep: Link,
        netlink: Arc<dyn NetlinkAdapter>,
        is_single_ip: bool,
    ) -> Self {
        Self {
            overlay_network,
            local_subnet,
            local_vtep,
            netlink,
            is_single_ip,
        }
    }

    pub fn converge(&self, leases: &[Lease]) -> Result<ConvergeSummary, ConvergeError> {
        let link = self
            .netlink
            .link_by_index(self.local_vtep.index)
            .map_err(|e| ConvergeError::LinkLookup(e.to_string()))?;

        let current_routes = self
            .netlink
            .route_list(link.index)
            .map_err(|e| ConvergeError::ListRoutes(e.to_string()))?;
        let current_fdb = self
            .netlink
            .fdb_list(link.index)
            .map_err(|e| ConvergeError::ListFdb(e.to_string()))?;
        let current_arp = self
            .netlink
            .arp_list(link.index)
            .map_err(|e| ConvergeError::ListArp(e.to_string()))?;

        let desired = self.desired_state(link.index, leases)?;
        let mut summary = ConvergeSummary {
            non_routable: desired.non_routable,
            ..ConvergeSummary::default()
        };

        let present_routes: HashSet<&Route> = current_routes.iter().collect();
        let present_neighs: HashSet<&Neigh> = current_arp.iter().chain(current_fdb.iter()).collect();

        for route in &desired.routes {
            if present_routes.contains(route) {
                continue;
            }
            self.netlink
                .route_replace(route)
                .map_err(|e| ConvergeError::AddRoute(e.to_string()))?;
            summary.upserted += 1;
        }

        for neigh in desired.arp.iter().chain(desired.fdb.iter()) {
            if present_neighs.contains(neigh) {
                continue;
            }
            self.netlink
                .neigh_set(neigh)
                .map_err(|e| ConvergeError::SetNeigh(e.to_string()))?;
            summary.upserted += 1;
        }

        summary.removed += self.remove_stale_routes(&current_routes, &desired.routes)?;
        summary.removed += self.remove_stale_neighs(&current_arp, &desired.arp)?;
        summary.removed += self.remove_stale_neighs(&current_fdb, &desired.fdb)?;

        if summary.non_routable > 0 {
            info!(
                non_routable_lease_count = summary.non_routable,
                "converger: skipped leases outside the overlay networks"
            );
        }
        debug!(
            upserted = summary.upserted,
            removed = summary.removed,
            "converged vtep"
        );
        Ok(summary)
    }

    fn desired_state(&self, link_index: u32, leases: &[Lease]) -> Result<Desired, ConvergeError> {
        let local_net = self.local_subnet.trunc();
        let local_ip = self.local_subnet.addr();
        let local_network = self.overlay_network.which_network_contains(local_ip);
        let mut desired = Desired::default();

        for lease in leases {
            let subnet: Ipv4Net = lease.overlay_subnet.parse().map_err(|_| {
                ConvergeError::ParseLease(format!("invalid CIDR address: {}", lease.overlay_subnet))
            })?;
            let gateway = subnet.addr();
            let dest_net = subnet.trunc();

            if dest_net == local_net {
                continue;
            }
            let Some(lease_network) = self.overlay_network.which_network_contains(gateway) else {
                desired.non_routable += 1;
                continue;
            };

            let underlay_ip: Ipv4Addr = lease
                .underlay_ip
                .parse()
                .map_err(|_| ConvergeError::InvalidUnderlayIp(lease.underlay_ip.clone()))?;
            let hardware_addr: HardwareAddr = lease
                .overlay_hardware_addr
                .parse()
                .map_err(|_| ConvergeError::InvalidHardwareAddr(lease.overlay_hardware_addr.clone()))?;

            // single-IP leases ride the overlay network route
            if dest_net.prefix_len() != 32 {
                let src = if Some(lease_network) == local_network {
                    local_ip
                } else {
                    lease_network.network()
                };
                desired.routes.push(Route {
                    link_index,
                    dst: dest_net,
                    gw: Some(gateway),
                    src: Some(src),
                    onlink: self.is_single_ip,
                });
            }

            desired.arp.push(Neigh::arp(link_index, gateway, hardware_addr));
            desired.fdb.push(Neigh::fdb(link_index, underlay_ip, hardware_addr));
        }

        Ok(desired)
    }

    /// Delete gatewayed routes whose destination no lease wants.
    fn remove_stale_routes(&self, current: &[Route], desired: &[Route]) -> Result<usize, ConvergeError> {
        let wanted: HashSet<Ipv4Net> = desired.iter().map(|r| r.dst).collect();
        let mut removed = 0;

        for route in current {
            if route.gw.is_none() || wanted.contains(&route.dst) {
                continue;
            }
            debug!(dst = %route.dst, "removing stale route");
            self.netlink
                .route_del(route)
                .map_err(|e| ConvergeError::DelRoute(e.to_string()))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Delete permanent entries whose (ip, mac) pair no lease wants.
    fn remove_stale_neighs(&self, current: &[Neigh], desired: &[Neigh]) -> Result<usize, ConvergeError> {
        let wanted: HashSet<(Ipv4Addr, HardwareAddr)> =
            desired.iter().map(|n| (n.ip, n.hardware_addr)).collect();
        let mut removed = 0;

        for neigh in current {
            if !neigh.permanent || wanted.contains(&(neigh.ip, neigh.hardware_addr)) {
                continue;
            }
            debug!(ip = %neigh.ip, mac = %neigh.hardware_addr, kind = ?neigh.kind, "removing stale neighbor");
            self.netlink
                .neigh_del(neigh)
                .map_err(|e| ConvergeError::DelNeigh {
                    ip: neigh.ip.to_string(),
                    mac: neigh.hardware_addr.to_string(),
                    reason: e.to_string(),
                })?;
            removed += 1;
        }
        Ok(removed)
    }
}
