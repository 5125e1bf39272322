//! Polling reconciler for policy and per-container (ASG) rule sets.
//!
//! Policy and ASG bookkeeping sit behind separate locks, so the two loops
//! never block each other, while a targeted ASG sync and the periodic full
//! ASG poll serialize on the same lock.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use super::enforcer::RuleEnforcer;
use super::rules::{asg_chain_regex, asg_live_chain, Chain, LiveChain, LogConfig, RulesWithChain};
use crate::error::{EnforceError, PolicyError};

const ASG_UPDATED_MESSAGE: &str = "Security group rules were updated";

/// Computes desired rule sets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Planner: Send + Sync {
    async fn get_policy_rules_and_chain(&self) -> anyhow::Result<RulesWithChain>;

    /// Rule sets for `containers`, or for every known container when empty.
    async fn get_asg_rules_and_chains(&self, containers: &[String]) -> anyhow::Result<Vec<RulesWithChain>>;
}

/// Source of the policy "last updated" token.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyClient: Send + Sync {
    async fn get_policies_last_updated(&self) -> anyhow::Result<i64>;
}

/// Delivers application log lines to a container's log stream.
#[cfg_attr(test, automock)]
pub trait AppLogSender: Send + Sync {
    fn send_app_log(&self, message: &str, source_name: &str, tags: &BTreeMap<String, String>) -> anyhow::Result<()>;
}

/// Writes application log events to the process log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAppLogSender;

impl AppLogSender for TracingAppLogSender {
    fn send_app_log(&self, message: &str, source_name: &str, tags: &BTreeMap<String, String>) -> anyhow::Result<()> {
        info!(source_name, ?tags, "{}", message);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsgOutcome {
    /// Desired rules matched what was last enforced
    Unchanged,
    /// Rules were installed in the named chain
    Enforced(String),
    Failed(String),
}

/// Result for one container's parent chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsgTarget {
    pub chain: LiveChain,
    pub outcome: AsgOutcome,
}

/// Per-container outcomes of an ASG sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsgSyncReport {
    pub targets: Vec<AsgTarget>,
    /// Orphaned chains removed by a full poll
    pub deleted_chains: Vec<LiveChain>,
    pub cleanup_error: Option<String>,
}

impl AsgSyncReport {
    pub fn failures(&self) -> impl Iterator<Item = &AsgTarget> {
        self.targets
            .iter()
            .filter(|t| matches!(t.outcome, AsgOutcome::Failed(_)))
    }

    pub fn is_success(&self) -> bool {
        self.cleanup_error.is_none() && self.failures().next().is_none()
    }

    /// Fold every failure into one error.
    pub fn into_result(self) -> Result<Self, PolicyError> {
        let mut errors: Vec<String> = self
            .failures()
            .filter_map(|t| match &t.outcome {
                AsgOutcome::Failed(e) => Some(format!("enforce-asg: {}", e)),
                _ => None,
            })
            .collect();
        if let Some(e) = &self.cleanup_error {
            errors.push(PolicyError::CleanupMatching(e.clone()).to_string());
        }
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(PolicyError::Multiple(errors))
        }
    }
}

#[derive(Default)]
struct AsgState {
    rule_sets: HashMap<LiveChain, RulesWithChain>,
    /// Parent chain to the child chain currently holding its rules
    applied_chains: HashMap<LiveChain, String>,
}

pub struct PollCycle {
    planners: Vec<Arc<dyn Planner>>,
    enforcer: Arc<dyn RuleEnforcer>,
    policy_client: Arc<dyn PolicyClient>,
    app_log_sender: Arc<dyn AppLogSender>,
    last_updated: AtomicI64,
    policy_rule_sets: Mutex<HashMap<Chain, RulesWithChain>>,
    asg: Mutex<AsgState>,
}

impl PollCycle {
    pub fn new(
        planners: Vec<Arc<dyn Planner>>,
        enforcer: Arc<dyn RuleEnforcer>,
        policy_client: Arc<dyn PolicyClient>,
        app_log_sender: Arc<dyn AppLogSender>,
    ) -> Self {
        Self {
            planners,
            enforcer,
            policy_client,
            app_log_sender,
            last_updated: AtomicI64::new(0),
            policy_rule_sets: Mutex::new(HashMap::new()),
            asg: Mutex::new(AsgState::default()),
        }
    }

    /// Run `f` against the enforcer on the blocking pool. Enforcement holds
    /// the host iptables lock and waits on child processes.
    async fn on_enforcer<T, F>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&dyn RuleEnforcer) -> T + Send + 'static,
        T: Send + 'static,
    {
        let enforcer = Arc::clone(&self.enforcer);
        tokio::task::spawn_blocking(move || f(enforcer.as_ref()))
            .await
            .map_err(|e| format!("enforcer task: {}", e))
    }

    /// Run a policy cycle unless the upstream token is unchanged. A token
    /// read failure runs the cycle anyway.
    pub async fn do_policy_cycle_with_last_updated_check(&self) -> Result<(), PolicyError> {
        let remote = match self.policy_client.get_policies_last_updated().await {
            Ok(remote) => remote,
            Err(e) => {
                error!(error = %e, "error getting policies last updated");
                return self.do_policy_cycle().await;
            }
        };

        let local = self.last_updated.load(Ordering::SeqCst);
        if local != 0 && remote <= local {
            debug!(last_updated_remotely = remote, last_updated_locally = local, "skipping poll cycle");
            return Ok(());
        }

        debug!(last_updated_remotely = remote, last_updated_locally = local, "running poll cycle for updated policies");
        self.do_policy_cycle().await?;
        self.last_updated.store(remote, Ordering::SeqCst);
        Ok(())
    }

    pub async fn do_policy_cycle(&self) -> Result<(), PolicyError> {
        let mut rule_sets = self.policy_rule_sets.lock().await;
        let started = Instant::now();

        for planner in &self.planners {
            let desired = planner
                .get_policy_rules_and_chain()
                .await
                .map_err(|e| PolicyError::GetRules(e.to_string()))?;

            let unchanged = rule_sets
                .get(&desired.chain)
                .is_some_and(|old| old.same_rules(&desired));
            if unchanged {
                continue;
            }

            debug!(
                parent = %desired.chain.parent_chain,
                old_rules = rule_sets.get(&desired.chain).map_or(0, |old| old.rules.len()),
                new_rules = desired.rules.len(),
                "updating iptables rules"
            );
            let rules = desired.clone();
            self.on_enforcer(move |enforcer| enforcer.enforce_rules_and_chain(&rules))
                .await
                .and_then(|enforced| enforced.map_err(|e| e.to_string()))
                .map_err(PolicyError::Enforce)?;
            rule_sets.insert(desired.chain.clone(), desired);
        }

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "policy cycle complete");
        Ok(())
    }

    /// Full ASG poll: sync every container, then sweep orphaned chains.
    pub async fn do_asg_cycle(&self) -> Result<AsgSyncReport, PolicyError> {
        self.sync_asgs_for_containers(&[]).await
    }

    /// Sync the named containers, or all of them when `containers` is empty.
    /// Per-container failures land in the report; only a planner failure
    /// aborts the sync.
    pub async fn sync_asgs_for_containers(&self, containers: &[String]) -> Result<AsgSyncReport, PolicyError> {
        let mut state = self.asg.lock().await;
        let started = Instant::now();
        let mut report = AsgSyncReport::default();
        let mut desired_chains = Vec::new();

        for planner in &self.planners {
            let rule_sets = planner
                .get_asg_rules_and_chains(containers)
                .await
                .map_err(|e| PolicyError::GetAsgRules(e.to_string()))?;

            for rule_set in rule_sets {
                let key = rule_set.parent_live_chain();
                let outcome = self.sync_one(&mut state, &key, rule_set).await;
                if let Some(name) = state.applied_chains.get(&key) {
                    desired_chains.push(LiveChain::new(&key.table, name.as_str()));
                }
                report.targets.push(AsgTarget { chain: key, outcome });
            }
        }

        if containers.is_empty() {
            match self.cleanup_asgs_chains_matching(&mut state, desired_chains).await {
                Ok(deleted) => report.deleted_chains = deleted,
                Err(e) => report.cleanup_error = Some(e),
            }
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                targets = report.targets.len(),
                "asg poll cycle complete"
            );
        }

        Ok(report)
    }

    async fn sync_one(&self, state: &mut AsgState, key: &LiveChain, rule_set: RulesWithChain) -> AsgOutcome {
        let unchanged = state
            .rule_sets
            .get(key)
            .is_some_and(|old| old.same_rules(&rule_set));
        if unchanged {
            return AsgOutcome::Unchanged;
        }

        debug!(
            parent = %key.name,
            old_rules = state.rule_sets.get(key).map_or(0, |old| old.rules.len()),
            new_rules = rule_set.rules.len(),
            "updating asg iptables rules"
        );
        let rules = rule_set.clone();
        let enforced = match self
            .on_enforcer(move |enforcer| enforcer.enforce_rules_and_chain(&rules))
            .await
        {
            Ok(enforced) => enforced,
            Err(e) => return AsgOutcome::Failed(e),
        };
        match enforced {
            Ok(chain) => {
                self.update_rule_set(state, key, chain.clone(), rule_set);
                AsgOutcome::Enforced(chain)
            }
            Err(e) => {
                // the new chain is live even though old ones linger
                if let EnforceError::Cleanup { chain, .. } = &e {
                    self.update_rule_set(state, key, chain.clone(), rule_set);
                }
                AsgOutcome::Failed(e.to_string())
            }
        }
    }

    fn update_rule_set(&self, state: &mut AsgState, key: &LiveChain, chain: String, rule_set: RulesWithChain) {
        self.send_app_log(&rule_set.log_config);
        state.applied_chains.insert(key.clone(), chain);
        state.rule_sets.insert(key.clone(), rule_set);
    }

    async fn cleanup_asgs_chains_matching(
        &self,
        state: &mut AsgState,
        desired: Vec<LiveChain>,
    ) -> Result<Vec<LiveChain>, String> {
        let pattern = asg_chain_regex().map_err(|e| e.to_string())?;
        let deleted = self
            .on_enforcer(move |enforcer| enforcer.clean_chains_matching(&pattern, &desired))
            .await?
            .map_err(|e| e.to_string())?;

        debug!(chains = ?deleted, "deleted orphaned chains");

        state.applied_chains.retain(|key, name| {
            !deleted
                .iter()
                .any(|d| d.table == key.table && d.name == *name)
        });
        let AsgState {
            rule_sets,
            applied_chains,
        } = state;
        rule_sets.retain(|key, _| applied_chains.contains_key(key));

        Ok(deleted)
    }

    /// Remove a terminated container's chains and bookkeeping right away.
    pub async fn cleanup_orphaned_asgs_chains(&self, container_handle: &str) -> Result<(), PolicyError> {
        let mut state = self.asg.lock().await;
        let chain = asg_live_chain(container_handle);

        let target = chain.clone();
        self.on_enforcer(move |enforcer| enforcer.cleanup_chain(&target))
            .await
            .and_then(|cleaned| cleaned.map_err(|e| e.to_string()))
            .map_err(PolicyError::CleanupOrphaned)?;

        state.applied_chains.remove(&chain);
        state.rule_sets.remove(&chain);
        Ok(())
    }

    /// Names of the child chains currently recorded as applied.
    pub async fn currently_applied_chain_names(&self) -> Vec<String> {
        let state = self.asg.lock().await;
        let mut names: Vec<String> = state.applied_chains.values().cloned().collect();
        names.sort();
        names
    }

    fn send_app_log(&self, log_config: &LogConfig) {
        if log_config.guid.is_empty() {
            return;
        }
        let mut tags = log_config.tags.clone();
        tags.entry("source_id".to_string())
            .or_insert_with(|| log_config.guid.clone());
        tags.entry("instance_id".to_string())
            .or_insert_with(|| log_config.index.to_string());

        if let Err(e) = self
            .app_log_sender
            .send_app_log(ASG_UPDATED_MESSAGE, &log_config.source_name, &tags)
        {
            error!(error = %e, guid = %log_config.guid, "failed sending app log");
        }
    }
}
