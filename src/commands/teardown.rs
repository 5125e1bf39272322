//! Teardown command implementation.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::check_root;
use crate::client::{HttpLeaseClient, LeaseClient};
use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::DaemonConfig;
use crate::vtep::{Factory, IpCommandNetlink};

/// Release this host's lease and delete its VTEP.
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;
    let config = DaemonConfig::load(config_path)?;

    let client = HttpLeaseClient::new(&config.controller_url)
        .context("Failed to build lease client")?
        .with_retry(
            config.lease_retry_attempts,
            Duration::from_millis(config.lease_retry_delay_ms),
        );
    let factory = Factory::new(Arc::new(IpCommandNetlink::new(Arc::new(
        RealCommandExecutor::new(),
    ))));

    teardown(&config, &client, &factory).await?;
    println!("[OK] Lease released and {} removed", config.vtep_name);
    Ok(())
}

/// A release failure is logged and does not stop the device removal, the
/// controller expires the lease on its own.
pub async fn teardown(config: &DaemonConfig, client: &dyn LeaseClient, factory: &Factory) -> Result<()> {
    match client.release(&config.underlay_ip.to_string()).await {
        Ok(()) => info!(underlay_ip = %config.underlay_ip, "released lease"),
        Err(e) => warn!(error = %e, "failed to release lease"),
    }

    factory
        .delete_vtep(&config.vtep_name)
        .context("Failed to delete vtep")?;
    info!(vtep = %config.vtep_name, "deleted vtep");
    Ok(())
}
