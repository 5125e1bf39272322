//! Configuration for the controller and the daemon.
//!
//! Both are YAML files. `load` parses and validates; `save` writes
//! atomically through a temporary file in the target directory.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::lock::IPTABLES_LOCK_FILE;
use crate::multi_cidr::MultiCidrNetwork;

/// Lease controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Address the lease API listens on
    pub listen_addr: SocketAddr,

    /// Overlay network ranges leases are carved from
    pub network: Vec<String>,

    /// Prefix length of each block lease
    pub subnet_prefix_length: u8,

    /// Lease lifetime without a renew
    pub lease_expiration_seconds: u64,

    /// How often expired leases are swept
    pub expiry_sweep_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 4103)),
            network: vec!["10.255.0.0/16".to_string()],
            subnet_prefix_length: 24,
            lease_expiration_seconds: 60,
            expiry_sweep_seconds: 10,
        }
    }
}

impl ControllerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_yaml(self, path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        validate_overlay(&self.network, self.subnet_prefix_length)?;
        if self.lease_expiration_seconds == 0 {
            anyhow::bail!("lease_expiration_seconds must be greater than 0");
        }
        if self.expiry_sweep_seconds == 0 {
            anyhow::bail!("expiry_sweep_seconds must be greater than 0");
        }
        Ok(())
    }
}

/// Per-host daemon settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base URL of the lease controller
    pub controller_url: String,

    /// Address the health endpoint listens on
    pub listen_addr: SocketAddr,

    /// This host's underlay address
    pub underlay_ip: Ipv4Addr,

    /// Overlay network ranges
    pub overlay_networks: Vec<String>,

    /// Prefix length of block leases
    pub subnet_prefix_length: u8,

    /// Name of the VXLAN device to create
    pub vtep_name: String,

    /// VXLAN network identifier
    pub vni: u32,

    /// VXLAN UDP port
    pub vtep_port: u16,

    /// Underlay interface to bind the VTEP to. Found by underlay IP if unset.
    pub vxlan_interface_name: Option<String>,

    /// Ask for a single overlay IP instead of a block
    pub single_ip_only: bool,

    /// Seconds between renew/converge cycles
    pub poll_interval_seconds: u64,

    /// Attempts per controller call before giving up
    pub lease_retry_attempts: u32,

    /// Fixed delay between controller call attempts
    pub lease_retry_delay_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            controller_url: "http://127.0.0.1:4103".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 23954)),
            underlay_ip: Ipv4Addr::UNSPECIFIED,
            overlay_networks: vec!["10.255.0.0/16".to_string()],
            subnet_prefix_length: 24,
            vtep_name: "weft-vtep".to_string(),
            vni: 1,
            vtep_port: 4789,
            vxlan_interface_name: None,
            single_ip_only: false,
            poll_interval_seconds: 5,
            lease_retry_attempts: 5,
            lease_retry_delay_ms: 500,
        }
    }
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_yaml(self, path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vtep_name.is_empty() {
            anyhow::bail!("empty vtep name");
        }
        if self.vtep_port == 0 {
            anyhow::bail!("vtep port must be greater than 0");
        }
        if !self.controller_url.starts_with("http://") && !self.controller_url.starts_with("https://") {
            anyhow::bail!("controller_url must be an http(s) URL: {}", self.controller_url);
        }
        validate_overlay(&self.overlay_networks, self.subnet_prefix_length)?;
        if self.poll_interval_seconds == 0 {
            anyhow::bail!("poll_interval_seconds must be greater than 0");
        }
        if self.lease_retry_attempts == 0 {
            anyhow::bail!("lease_retry_attempts must be greater than 0");
        }
        Ok(())
    }
}

/// Policy agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// YAML file describing the policy and per-container rule sets
    pub rules_file: PathBuf,

    /// Seconds between policy cycles
    pub poll_interval_seconds: u64,

    /// Seconds between full ASG cycles
    pub asg_poll_interval_seconds: u64,

    /// Host-wide lock serializing iptables access
    pub lock_file: PathBuf,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules_file: PathBuf::from("/etc/weftnet/rules.yaml"),
            poll_interval_seconds: 5,
            asg_poll_interval_seconds: 5,
            lock_file: PathBuf::from(IPTABLES_LOCK_FILE),
        }
    }
}

impl PolicyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_yaml(self, path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.rules_file.as_os_str().is_empty() {
            anyhow::bail!("rules_file must be set");
        }
        if self.poll_interval_seconds == 0 || self.asg_poll_interval_seconds == 0 {
            anyhow::bail!("poll intervals must be greater than 0");
        }
        Ok(())
    }
}

/// Overlay ranges must parse and each must be strictly larger than a block.
fn validate_overlay(networks: &[String], subnet_prefix_length: u8) -> Result<()> {
    if networks.is_empty() {
        anyhow::bail!("no overlay networks specified");
    }
    if subnet_prefix_length > 32 {
        anyhow::bail!("subnet prefix length {} must be at most 32", subnet_prefix_length);
    }
    let network = MultiCidrNetwork::new(networks).context("creating multiple CIDR Network")?;
    if network.smallest_mask() >= subnet_prefix_length {
        anyhow::bail!(
            "overlay prefix {} must be smaller than subnet prefix {}",
            network.smallest_mask(),
            subnet_prefix_length
        );
    }
    Ok(())
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))
}

fn save_yaml<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let content = serde_yaml::to_string(value).context("Failed to serialize config")?;

    let parent_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .context("Failed to create temporary file for config")?;

    temp_file.write_all(content.as_bytes())?;
    temp_file.as_file().sync_all()?;

    temp_file
        .persist(path)
        .with_context(|| format!("Failed to persist config file: {:?}", path))?;

    Ok(())
}
