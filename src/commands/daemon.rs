//! Daemon command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use super::check_root;
use crate::config::DaemonConfig;
use crate::daemon;
use crate::signal::{ShutdownGuard, ShutdownToken};

/// Run the per-host daemon until SIGINT/SIGTERM or a lease conflict.
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;
    let config = DaemonConfig::load(config_path)?;
    info!(
        underlay_ip = %config.underlay_ip,
        vtep = %config.vtep_name,
        controller = %config.controller_url,
        "Starting daemon"
    );

    let guard = ShutdownGuard::new(ShutdownToken::new());
    daemon::build(config)?.run(guard.token()).await
}
