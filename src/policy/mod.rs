//! Policy and application security group enforcement.
//!
//! ```text
//! PollCycle
//!   ├── Planner        desired rule sets (FilePlanner)
//!   ├── PolicyClient   cheap "anything changed?" token
//!   ├── RuleEnforcer   installs rule sets (IptablesEnforcer over LockedIptables)
//!   └── AppLogSender   per-container "rules updated" events
//! ```

mod converger;
mod enforcer;
mod planner;
pub mod rules;

pub use converger::{
    AppLogSender, AsgOutcome, AsgSyncReport, AsgTarget, Planner, PolicyClient, PollCycle, TracingAppLogSender,
};
pub use enforcer::{child_chain_name, IptablesEnforcer, RuleEnforcer};
pub use planner::{AsgRules, FilePlanner, RulesFile};
pub use rules::{Chain, LiveChain, LogConfig, RulesWithChain};

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::signal::ShutdownToken;

/// Run the policy and full ASG loops until shutdown. Each loop finishes its
/// in-flight cycle before the next one starts.
pub async fn run_loops(
    cycle: Arc<PollCycle>,
    policy_interval: Duration,
    asg_interval: Duration,
    shutdown: ShutdownToken,
) {
    let policy = {
        let cycle = Arc::clone(&cycle);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(policy_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cycle.do_policy_cycle_with_last_updated_check().await {
                            warn!(error = %e, "policy cycle failed");
                        }
                    }
                }
            }
        })
    };

    let asg = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(asg_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match cycle.do_asg_cycle().await.and_then(AsgSyncReport::into_result) {
                        Ok(report) if !report.deleted_chains.is_empty() => {
                            info!(deleted = report.deleted_chains.len(), "asg cycle removed orphaned chains");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "asg cycle failed"),
                    }
                }
            }
        }
    });

    let (policy, asg) = futures::future::join(policy, asg).await;
    for (name, result) in [("policy", policy), ("asg", asg)] {
        if let Err(e) = result {
            warn!(loop_name = name, error = %e, "loop task ended abnormally");
        }
    }
}
