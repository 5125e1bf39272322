//! [`IptablesAdapter`] that holds the host lock around every call.

use std::sync::Arc;
use tracing::debug;

use super::{default_reject_rule, Iptables, IptablesAdapter, IptablesRule, Restorer, FILTER_TABLE};
use crate::cmd_abstraction::{args_to_strings, CommandExecutor};
use crate::error::IptablesError;
use crate::lock::Locker;

pub struct LockedIptables {
    iptables: Arc<dyn Iptables>,
    locker: Arc<dyn Locker>,
    restorer: Arc<dyn Restorer>,
    runner: Arc<dyn CommandExecutor>,
}

impl LockedIptables {
    pub fn new(
        iptables: Arc<dyn Iptables>,
        locker: Arc<dyn Locker>,
        restorer: Arc<dyn Restorer>,
        runner: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            iptables,
            locker,
            restorer,
            runner,
        }
    }

    /// Run `op` under the lock.
    ///
    /// A failed `op` still releases the lock and reports both outcomes.
    fn locked<T>(&self, op: impl FnOnce() -> anyhow::Result<T>) -> Result<T, IptablesError> {
        self.locker
            .lock()
            .map_err(|e| IptablesError::Lock(e.to_string()))?;

        match op() {
            Ok(value) => {
                self.locker
                    .unlock()
                    .map_err(|e| IptablesError::Unlock(e.to_string()))?;
                Ok(value)
            }
            Err(e) => Err(IptablesError::Call {
                call: e.to_string(),
                unlock: self.locker.unlock().err().map(|u| u.to_string()),
            }),
        }
    }

    /// One `iptables-restore --noflush` transaction, every rule prefixed by `prefix`.
    fn bulk_action(&self, table: &str, prefix: &str, rulespec: &[IptablesRule]) -> Result<(), IptablesError> {
        let input = restore_input(table, prefix, rulespec);
        debug!(table, rules = rulespec.len(), "iptables bulk restore");
        self.locked(|| self.restorer.restore(&input))
    }
}

/// Build `iptables-restore` input for one table.
pub(crate) fn restore_input(table: &str, prefix: &str, rulespec: &[IptablesRule]) -> String {
    let mut input = format!("*{}\n", table);
    for rule in rulespec {
        input.push_str(prefix);
        input.push(' ');
        input.push_str(&rule.to_string());
        input.push('\n');
    }
    input.push_str("COMMIT\n");
    input
}

impl IptablesAdapter for LockedIptables {
    fn flush_and_restore(&self, raw_input: &str) -> Result<(), IptablesError> {
        self.locked(|| self.restorer.restore_with_flags(raw_input, &[]))
    }

    fn exists(&self, table: &str, chain: &str, rulespec: &IptablesRule) -> Result<bool, IptablesError> {
        self.locked(|| self.iptables.exists(table, chain, rulespec.args()))
    }

    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, IptablesError> {
        self.locked(|| self.iptables.chain_exists(table, chain))
    }

    fn delete(&self, table: &str, chain: &str, rulespec: &IptablesRule) -> Result<(), IptablesError> {
        self.locked(|| self.iptables.delete(table, chain, rulespec.args()))
    }

    fn delete_after_rule_num(&self, table: &str, chain: &str, rule_num: usize) -> Result<(), IptablesError> {
        self.locked(|| delete_from(self.iptables.as_ref(), table, chain, rule_num))
    }

    fn delete_after_rule_num_keep_reject(
        &self,
        table: &str,
        chain: &str,
        rule_num: usize,
    ) -> Result<(), IptablesError> {
        self.locked(|| {
            delete_from(self.iptables.as_ref(), table, chain, rule_num)?;
            // append_unique leaves a reject that survived above rule_num alone
            self.iptables
                .append_unique(table, chain, default_reject_rule().args())
        })
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError> {
        self.locked(|| self.iptables.list(table, chain))
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError> {
        self.locked(|| self.iptables.list_chains(table))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.locked(|| self.iptables.new_chain(table, chain))
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.locked(|| self.iptables.clear_chain(table, chain))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.locked(|| self.iptables.delete_chain(table, chain))
    }

    fn rename_chain(&self, table: &str, old_chain: &str, new_chain: &str) -> Result<(), IptablesError> {
        self.locked(|| self.iptables.rename_chain(table, old_chain, new_chain))
    }

    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        pos: u32,
        rulespec: &[IptablesRule],
    ) -> Result<(), IptablesError> {
        self.bulk_action(table, &format!("-I {} {}", chain, pos), rulespec)
    }

    fn bulk_append(&self, table: &str, chain: &str, rulespec: &[IptablesRule]) -> Result<(), IptablesError> {
        self.bulk_action(table, &format!("-A {}", chain), rulespec)
    }

    fn rule_count(&self, table: &str) -> Result<usize, IptablesError> {
        self.locker
            .lock()
            .map_err(|e| IptablesError::Lock(e.to_string()))?;

        let listed = self
            .runner
            .execute("iptables", &args_to_strings(&["-w", "-S", "-t", table]))
            .and_then(|output| {
                if output.success {
                    Ok(output.stdout)
                } else {
                    anyhow::bail!("{}", output.message())
                }
            });

        match listed {
            Ok(stdout) => {
                self.locker
                    .unlock()
                    .map_err(|e| IptablesError::Unlock(e.to_string()))?;
                Ok(stdout.trim().lines().filter(|l| !l.trim().is_empty()).count())
            }
            Err(e) => Err(IptablesError::Runner {
                call: e.to_string(),
                unlock: self.locker.unlock().err().map(|u| u.to_string()),
            }),
        }
    }

    fn allow_traffic_for_range(&self, rulespec: &[IptablesRule]) -> Result<(), IptablesError> {
        self.bulk_action(FILTER_TABLE, "-I FORWARD 1", rulespec)
    }
}

/// Delete every rule from `rule_num` on.
///
/// `list` output starts with the chain's `-N` line, so rule `n` is entry `n`.
/// Each delete shifts the tail down by one, so the same position is deleted
/// repeatedly.
fn delete_from(iptables: &dyn Iptables, table: &str, chain: &str, rule_num: usize) -> anyhow::Result<()> {
    let rules = iptables.list(table, chain)?;
    let position = rule_num.to_string();
    for _ in rules.iter().skip(rule_num) {
        iptables.delete(table, chain, &[position.clone(), "--wait".to_string()])?;
    }
    Ok(())
}
