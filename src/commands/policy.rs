//! Policy agent command implementation.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::check_root;
use crate::cmd_abstraction::{CommandExecutor, RealCommandExecutor};
use crate::config::PolicyConfig;
use crate::iptables::{CommandIptables, CommandRestorer, LockedIptables};
use crate::lock::FileLocker;
use crate::policy::{self, FilePlanner, IptablesEnforcer, Planner, PollCycle, TracingAppLogSender};
use crate::signal::{ShutdownGuard, ShutdownToken};

/// Run the policy and ASG loops until SIGINT/SIGTERM.
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;
    let config = PolicyConfig::load(config_path)?;
    info!(rules_file = ?config.rules_file, "Starting policy agent");

    let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::new());
    let iptables = LockedIptables::new(
        Arc::new(CommandIptables::new(Arc::clone(&executor))),
        Arc::new(FileLocker::new(&config.lock_file)),
        Arc::new(CommandRestorer::new(Arc::clone(&executor))),
        executor,
    );
    let planner = Arc::new(FilePlanner::new(&config.rules_file));
    let planners: Vec<Arc<dyn Planner>> = vec![planner.clone()];
    let cycle = Arc::new(PollCycle::new(
        planners,
        Arc::new(IptablesEnforcer::new(Arc::new(iptables))),
        planner,
        Arc::new(TracingAppLogSender),
    ));

    let guard = ShutdownGuard::new(ShutdownToken::new());
    policy::run_loops(
        cycle,
        Duration::from_secs(config.poll_interval_seconds),
        Duration::from_secs(config.asg_poll_interval_seconds),
        guard.token(),
    )
    .await;
    info!("Policy agent stopped");
    Ok(())
}
