//! # weftnet - overlay networking for container hosts
//!
//! Hands out non-overlapping overlay subnets to hosts, keeps each host's
//! VXLAN tunnel endpoint and forwarding tables in line with every other
//! host's lease, and enforces per-container firewall policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        weftnet                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: controller, daemon, policy, teardown       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Controller (axum)                                          │
//! │    ├── Leaser: acquire / renew / release / expiry           │
//! │    ├── CidrPool over MultiCidrNetwork                       │
//! │    └── LeaseStore (in-memory)                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Daemon                                                     │
//! │    ├── LeaseClient (reqwest, bounded retry)                 │
//! │    ├── VTEP config / factory                                │
//! │    ├── Converger: routes, ARP, FDB                          │
//! │    └── Health endpoint (axum)                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Policy agent                                               │
//! │    ├── PollCycle: policy + ASG loops                        │
//! │    ├── IptablesEnforcer                                     │
//! │    └── LockedIptables (flock + iptables-restore)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use weftnet::cidr_pool::CidrPool;
//!
//! fn main() -> anyhow::Result<()> {
//!     let pool = CidrPool::new(&["10.255.0.0/16", "10.250.0.0/16"], 24)?;
//!     assert_eq!(pool.block_pool_size(), 510);
//!
//!     let taken: Vec<String> = Vec::new();
//!     let subnet = pool.get_available_block(&taken);
//!     println!("next free block: {:?}", subnet);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cidr_pool`] - Block and single-IP candidate pools
//! - [`cli`] - Command-line interface definitions
//! - [`client`] - HTTP lease client
//! - [`cmd_abstraction`] - Mockable process execution
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`controller`] - Lease HTTP API
//! - [`daemon`] - Per-host lease, VTEP and convergence lifecycle
//! - [`error`] - Error types
//! - [`iptables`] - Locked iptables executor
//! - [`lease`] - Lease model and hardware addresses
//! - [`leaser`] - Allocation policy and lease stores
//! - [`lock`] - Host-wide file lock
//! - [`multi_cidr`] - Set of overlay networks
//! - [`policy`] - Policy and ASG reconciliation
//! - [`signal`] - Graceful shutdown signal handling
//! - [`vtep`] - VXLAN device management and convergence

pub mod cidr_pool;
pub mod cli;
pub mod client;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod iptables;
pub mod lease;
pub mod leaser;
pub mod lock;
pub mod multi_cidr;
pub mod policy;
pub mod signal;
pub mod vtep;

pub use cli::{Cli, Commands};
pub use config::{ControllerConfig, DaemonConfig, PolicyConfig};
pub use lease::Lease;
