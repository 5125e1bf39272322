//! Controller command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::config::ControllerConfig;
use crate::controller;
use crate::signal::{ShutdownGuard, ShutdownToken};

/// Run the lease controller until SIGINT/SIGTERM. SIGHUP reloads the config.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = ControllerConfig::load(config_path)?;
    info!(
        networks = ?config.network,
        subnet_prefix_length = config.subnet_prefix_length,
        "Starting lease controller"
    );

    let guard = ShutdownGuard::new(ShutdownToken::new());
    controller::serve(&config, Some(config_path.to_path_buf()), guard.token()).await
}
