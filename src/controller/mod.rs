//! Lease controller: the HTTP face of the [`Leaser`].
//!
//! Routes:
//! - `POST /leases/acquire` returns the caller's lease, allocating if needed
//! - `POST /leases/renew` extends a lease, `409` on mismatch
//! - `POST /leases/release` drops a lease
//! - `GET /leases` lists unexpired leases

pub mod handlers;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use chrono::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cidr_pool::CidrPool;
use crate::config::ControllerConfig;
use crate::leaser::{LeaseStore, Leaser, MemoryLeaseStore};
use crate::signal::ShutdownToken;

/// State shared by the lease handlers.
pub struct ControllerState {
    pub leaser: Arc<Leaser>,
}

impl ControllerState {
    pub fn new(leaser: Arc<Leaser>) -> Self {
        Self { leaser }
    }
}

pub fn create_router(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/leases", get(handlers::list))
        .route("/leases/acquire", post(handlers::acquire))
        .route("/leases/renew", post(handlers::renew))
        .route("/leases/release", post(handlers::release))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Build a leaser from config over the given store.
pub fn build_leaser(config: &ControllerConfig, store: Arc<dyn LeaseStore>) -> Result<Leaser> {
    let pool = CidrPool::new(&config.network, config.subnet_prefix_length)
        .context("Failed to build CIDR pool")?;
    info!(
        "Lease pool ready: {} blocks of /{} across {} networks, {} single IPs",
        pool.block_pool_size(),
        config.subnet_prefix_length,
        pool.network().len(),
        pool.single_pool_size()
    );
    let ttl = Duration::seconds(
        i64::try_from(config.lease_expiration_seconds).context("lease expiration too large")?,
    );
    Ok(Leaser::new(store, pool, ttl))
}

/// Periodically reclaim expired leases until shutdown.
pub async fn run_expiry_sweep(leaser: Arc<Leaser>, interval: std::time::Duration, shutdown: ShutdownToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = leaser.sweep_expired().await {
            error!("Expiry sweep failed: {}", e);
        }
    }
}

/// Re-read the config file on SIGHUP and rebuild the pool if the overlay
/// network changed.
pub async fn run_config_reload(leaser: Arc<Leaser>, config_path: PathBuf, shutdown: ShutdownToken) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to register SIGHUP handler, config reload disabled: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }
        if let Err(e) = reload_config(&leaser, &config_path) {
            error!("Config reload failed: {:#}", e);
        }
    }
}

fn reload_config(leaser: &Leaser, config_path: &Path) -> Result<()> {
    let config = ControllerConfig::load(config_path)?;
    if leaser.reconfigure(&config.network, config.subnet_prefix_length)? {
        info!("Reloaded overlay network from {:?}", config_path);
    } else {
        info!("Config reloaded, overlay network unchanged");
    }
    Ok(())
}

/// Serve the lease API until shutdown.
///
/// With `reload_from` set, SIGHUP re-reads that file.
pub async fn serve(
    config: &ControllerConfig,
    reload_from: Option<PathBuf>,
    shutdown: ShutdownToken,
) -> Result<()> {
    let leaser = Arc::new(build_leaser(config, Arc::new(MemoryLeaseStore::new()))?);

    if let Some(path) = reload_from {
        tokio::spawn(run_config_reload(Arc::clone(&leaser), path, shutdown.clone()));
    }

    let sweeper = tokio::spawn(run_expiry_sweep(
        Arc::clone(&leaser),
        std::time::Duration::from_secs(config.expiry_sweep_seconds),
        shutdown.clone(),
    ));

    let router = create_router(Arc::new(ControllerState::new(leaser)));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Lease controller listening on {}", config.listen_addr);

    let graceful = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await
        .context("Lease controller server failed")?;

    shutdown.cancel();
    let _ = sweeper.await;
    info!("Lease controller stopped");
    Ok(())
}
