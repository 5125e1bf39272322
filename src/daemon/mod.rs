//! Per-host daemon.
//!
//! Startup reuses the lease held by an existing VTEP when the controller
//! still agrees with it, otherwise acquires a new one. The VTEP is then
//! (re)created and every poll interval the daemon renews its lease, fetches
//! the cluster's leases and converges the kernel state.

pub mod health;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::client::{HttpLeaseClient, LeaseClient};
use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::DaemonConfig;
use crate::error::LeaseError;
use crate::lease::Lease;
use crate::signal::ShutdownToken;
use crate::vtep::{
    ConfigCreator, Converger, Factory, IpCommandNetlink, NetAdapter, NetlinkAdapter, VtepConfig, VtepState,
};
use health::NetworkInfo;

pub struct Daemon {
    config: DaemonConfig,
    client: Arc<dyn LeaseClient>,
    netlink: Arc<dyn NetlinkAdapter>,
    net_adapter: Arc<dyn NetAdapter>,
}

/// Everything the poll loop needs once the VTEP is up.
pub struct Running {
    pub lease: Lease,
    pub vtep: VtepConfig,
    pub converger: Arc<Converger>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        client: Arc<dyn LeaseClient>,
        netlink: Arc<dyn NetlinkAdapter>,
        net_adapter: Arc<dyn NetAdapter>,
    ) -> Self {
        Self {
            config,
            client,
            netlink,
            net_adapter,
        }
    }

    /// Lease recorded on an existing VTEP, if there is one.
    fn lease_from_vtep(&self, state: &VtepState) -> Result<Lease> {
        let prefix = if self.config.single_ip_only {
            32
        } else {
            self.config.subnet_prefix_length
        };
        let subnet = Ipv4Net::new(state.overlay_ip, prefix)
            .context("Invalid subnet prefix length")?
            .trunc();
        Ok(Lease {
            underlay_ip: self.config.underlay_ip.to_string(),
            overlay_subnet: subnet.to_string(),
            overlay_hardware_addr: state.hardware_addr.to_string(),
        })
    }

    /// Renew the lease an existing VTEP carries, or acquire a fresh one.
    /// A non-retriable renew failure is fatal.
    pub async fn discover_lease(&self) -> Result<Lease> {
        let factory = Factory::new(Arc::clone(&self.netlink));

        match factory.get_vtep_state(&self.config.vtep_name) {
            Ok(state) => {
                let lease = self.lease_from_vtep(&state)?;
                match self.client.renew(&lease).await {
                    Ok(()) => {
                        info!(subnet = %lease.overlay_subnet, "renewed existing lease");
                        return Ok(lease);
                    }
                    Err(e @ LeaseError::NonRetriable(_)) => {
                        return Err(e).context("Existing lease conflicts with the controller");
                    }
                    Err(e) => warn!(error = %e, "could not renew existing lease, acquiring a new one"),
                }
            }
            Err(e) => debug!(error = %e, "no existing vtep"),
        }

        let lease = self
            .client
            .acquire(&self.config.underlay_ip.to_string(), self.config.single_ip_only)
            .await
            .context("Failed to acquire lease")?;
        info!(
            underlay_ip = %lease.underlay_ip,
            subnet = %lease.overlay_subnet,
            hardware_addr = %lease.overlay_hardware_addr,
            "acquired lease"
        );
        Ok(lease)
    }

    /// Recreate the VTEP for `lease` and build the converger around it.
    pub fn setup_vtep(&self, lease: Lease) -> Result<Running> {
        let vtep = ConfigCreator::new(Arc::clone(&self.net_adapter))
            .create(&self.config, &lease)
            .context("Failed to build vtep config")?;

        let factory = Factory::new(Arc::clone(&self.netlink));
        if factory.get_vtep_state(&vtep.vtep_name).is_ok() {
            factory
                .delete_vtep(&vtep.vtep_name)
                .context("Failed to remove stale vtep")?;
        }
        factory.create_vtep(&vtep).context("Failed to create vtep")?;

        let local_vtep = self
            .netlink
            .link_by_name(&vtep.vtep_name)
            .with_context(|| format!("Failed to find vtep {}", vtep.vtep_name))?;
        let local_subnet = lease
            .subnet()
            .with_context(|| format!("Invalid lease subnet {}", lease.overlay_subnet))?;

        let converger = Arc::new(Converger::new(
            vtep.overlay_networks.clone(),
            local_subnet,
            local_vtep,
            Arc::clone(&self.netlink),
            lease.is_single_ip(),
        ));
        Ok(Running {
            lease,
            vtep,
            converger,
        })
    }

    /// One renew and converge cycle. Only a non-retriable renew failure is
    /// returned; everything else is logged and retried next cycle.
    pub async fn poll_once(&self, running: &Running) -> Result<(), LeaseError> {
        match self.client.renew(&running.lease).await {
            Ok(()) => debug!(subnet = %running.lease.overlay_subnet, "renewed lease"),
            Err(e @ LeaseError::NonRetriable(_)) => return Err(e),
            Err(e) => warn!(error = %e, "renew failed"),
        }

        let leases = match self.client.list().await {
            Ok(leases) => leases,
            Err(e) => {
                warn!(error = %e, "listing leases failed");
                return Ok(());
            }
        };
        // converge shells out to ip/bridge, keep it off the async workers
        let converger = Arc::clone(&running.converger);
        match tokio::task::spawn_blocking(move || converger.converge(&leases)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "convergence failed"),
            Err(e) => warn!(error = %e, "convergence task failed"),
        }
        Ok(())
    }

    /// Run until shutdown or a lease conflict.
    pub async fn run(&self, shutdown: ShutdownToken) -> Result<()> {
        let lease = self.discover_lease().await?;
        let running = self.setup_vtep(lease)?;

        let info = Arc::new(NetworkInfo::new(
            running.lease.overlay_subnet.clone(),
            running.vtep.underlay_interface.mtu,
        ));
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        info!("Daemon health endpoint listening on {}", self.config.listen_addr);
        let graceful = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, health::create_router(info))
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
        });

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds));
        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&running).await {
                        error!(error = %e, "lease conflict, exiting");
                        break Err(anyhow::Error::new(e).context("Lease renewal rejected"));
                    }
                }
            }
        };

        shutdown.cancel();
        match server.await {
            Ok(Err(e)) => warn!("Health server failed: {}", e),
            Err(e) => warn!("Health server task failed: {}", e),
            Ok(Ok(())) => {}
        }
        info!("Daemon stopped");
        outcome
    }
}

/// Build a daemon over the real controller client and kernel adapters.
pub fn build(config: DaemonConfig) -> Result<Daemon> {
    let client = HttpLeaseClient::new(&config.controller_url)
        .context("Failed to build lease client")?
        .with_retry(
            config.lease_retry_attempts,
            Duration::from_millis(config.lease_retry_delay_ms),
        );
    let kernel = Arc::new(IpCommandNetlink::new(Arc::new(RealCommandExecutor::new())));
    Ok(Daemon::new(config, Arc::new(client), kernel.clone(), kernel))
}
