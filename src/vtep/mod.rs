//! VXLAN tunnel endpoint management.
//!
//! `config` derives the per-host VTEP settings, `factory` creates and tears
//! down the device, and `converger` keeps its routes and neighbor tables in
//! line with the cluster's leases. Kernel access goes through the
//! `netlink` adapter traits.

mod config;
mod converger;
mod factory;
pub mod netlink;

pub use config::{ConfigCreator, VtepConfig};
pub use converger::{ConvergeSummary, Converger};
pub use factory::{Factory, VtepState};
pub use netlink::{IpCommandNetlink, Link, NetAdapter, NetlinkAdapter};
