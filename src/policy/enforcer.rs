//! iptables-backed rule enforcement.
//!
//! A rule set lives in a generated child chain (`<prefix><timestamp>`) that
//! the parent chain jumps to. Enforcing builds the new child, puts its jump
//! at the head of the parent and only then removes the previous children, so
//! traffic is never evaluated against a half-written rule set.

use chrono::Utc;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::rules::{LiveChain, RulesWithChain, ASG_CHILD_PREFIX, MAX_CHAIN_NAME_LEN};
use crate::error::{EnforceError, IptablesError};
use crate::iptables::{IptablesAdapter, IptablesRule, FILTER_TABLE};

#[cfg_attr(test, automock)]
pub trait RuleEnforcer: Send + Sync {
    /// Install `rules` and return the name of the chain now holding them.
    fn enforce_rules_and_chain(&self, rules: &RulesWithChain) -> Result<String, EnforceError>;

    /// Delete live chains matching `pattern` that are not in `desired`,
    /// returning the ones removed.
    fn clean_chains_matching(
        &self,
        pattern: &Regex,
        desired: &[LiveChain],
    ) -> Result<Vec<LiveChain>, EnforceError>;

    /// Remove a parent chain, everything jumping to it and its children.
    fn cleanup_chain(&self, chain: &LiveChain) -> Result<(), EnforceError>;
}

type SuffixFn = dyn Fn() -> String + Send + Sync;

pub struct IptablesEnforcer {
    iptables: Arc<dyn IptablesAdapter>,
    suffix: Box<SuffixFn>,
}

impl IptablesEnforcer {
    pub fn new(iptables: Arc<dyn IptablesAdapter>) -> Self {
        Self {
            iptables,
            suffix: Box::new(|| Utc::now().timestamp_micros().to_string()),
        }
    }

    /// Replace the child chain suffix generator.
    pub fn with_suffix(mut self, suffix: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.suffix = Box::new(suffix);
        self
    }

    fn install(&self, rules: &RulesWithChain, child: &str) -> Result<(), IptablesError> {
        let table = &rules.chain.table;
        let parent = &rules.chain.parent_chain;

        if !self.iptables.chain_exists(table, parent)? {
            self.iptables.new_chain(table, parent)?;
        }
        self.iptables.new_chain(table, child)?;

        let linked = self.fill_and_link(rules, child);
        if linked.is_err() {
            if let Err(e) = self.remove_chain(table, child) {
                warn!(table = %table, chain = %child, error = %e, "failed to remove unlinked chain");
            }
        }
        linked
    }

    fn fill_and_link(&self, rules: &RulesWithChain, child: &str) -> Result<(), IptablesError> {
        let table = &rules.chain.table;
        if !rules.rules.is_empty() {
            self.iptables.bulk_append(table, child, &rules.rules)?;
        }
        self.iptables
            .bulk_insert(table, &rules.chain.parent_chain, 1, &[IptablesRule::new(&["-j", child])])
    }

    /// Drop jumps from `parent` to older children with `prefix`, then the
    /// children themselves.
    fn remove_previous(
        &self,
        table: &str,
        parent: &str,
        prefix: &str,
        keep: &str,
    ) -> Result<(), IptablesError> {
        for line in self.iptables.list(table, parent)? {
            let Some(rule) = appended_rule(&line, parent) else {
                continue;
            };
            let Some(target) = jump_target(&rule) else {
                continue;
            };
            if target == keep || !target.starts_with(prefix) {
                continue;
            }
            let target = target.to_string();
            self.iptables.delete(table, parent, &rule)?;
            self.iptables.clear_chain(table, &target)?;
            self.iptables.delete_chain(table, &target)?;
            debug!(table, parent, chain = %target, "removed previous chain");
        }
        Ok(())
    }

    /// Delete every rule in `table` that jumps to `target`.
    fn remove_references(&self, table: &str, chains: &[String], target: &str) -> Result<(), IptablesError> {
        for chain in chains {
            if chain == target {
                continue;
            }
            for line in self.iptables.list(table, chain)? {
                let Some(rule) = appended_rule(&line, chain) else {
                    continue;
                };
                if jump_target(&rule) == Some(target) {
                    self.iptables.delete(table, chain, &rule)?;
                }
            }
        }
        Ok(())
    }

    fn remove_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        self.iptables.clear_chain(table, chain)?;
        self.iptables.delete_chain(table, chain)
    }
}

impl RuleEnforcer for IptablesEnforcer {
    fn enforce_rules_and_chain(&self, rules: &RulesWithChain) -> Result<String, EnforceError> {
        let child = child_chain_name(&rules.chain.prefix, &(self.suffix)());
        self.install(rules, &child)?;

        self.remove_previous(
            &rules.chain.table,
            &rules.chain.parent_chain,
            &rules.chain.prefix,
            &child,
        )
        .map_err(|e| EnforceError::Cleanup {
            chain: child.clone(),
            reason: e.to_string(),
        })?;

        debug!(
            table = %rules.chain.table,
            parent = %rules.chain.parent_chain,
            chain = %child,
            rules = rules.rules.len(),
            "enforced rules"
        );
        Ok(child)
    }

    fn clean_chains_matching(
        &self,
        pattern: &Regex,
        desired: &[LiveChain],
    ) -> Result<Vec<LiveChain>, EnforceError> {
        let mut tables: BTreeSet<&str> = desired.iter().map(|c| c.table.as_str()).collect();
        tables.insert(FILTER_TABLE);

        let mut deleted = Vec::new();
        for table in tables {
            let chains = self.iptables.list_chains(table)?;
            for chain in &chains {
                let live = LiveChain::new(table, chain.as_str());
                if !pattern.is_match(chain) || desired.contains(&live) {
                    continue;
                }
                self.remove_references(table, &chains, chain)?;
                self.remove_chain(table, chain)?;
                deleted.push(live);
            }
        }

        if !deleted.is_empty() {
            info!(count = deleted.len(), "removed orphaned chains");
        }
        Ok(deleted)
    }

    fn cleanup_chain(&self, chain: &LiveChain) -> Result<(), EnforceError> {
        let table = chain.table.as_str();
        if !self.iptables.chain_exists(table, &chain.name)? {
            debug!(table, chain = %chain.name, "chain already gone");
            return Ok(());
        }

        let children: Vec<String> = self
            .iptables
            .list(table, &chain.name)?
            .iter()
            .filter_map(|line| appended_rule(line, &chain.name))
            .filter_map(|rule| jump_target(&rule).map(str::to_string))
            .filter(|target| target.starts_with(ASG_CHILD_PREFIX))
            .collect();

        let chains = self.iptables.list_chains(table)?;
        self.remove_references(table, &chains, &chain.name)?;
        self.remove_chain(table, &chain.name)?;
        for child in &children {
            self.remove_chain(table, child)?;
        }

        info!(table, chain = %chain.name, children = children.len(), "cleaned up chain");
        Ok(())
    }
}

/// Child chain name, trimming the prefix so the suffix always fits.
pub fn child_chain_name(prefix: &str, suffix: &str) -> String {
    let room = MAX_CHAIN_NAME_LEN.saturating_sub(suffix.len());
    let prefix: String = prefix.chars().take(room).collect();
    let mut name = format!("{}{}", prefix, suffix);
    name.truncate(MAX_CHAIN_NAME_LEN);
    name
}

/// Rule spec of an `-A <chain> ...` line from `iptables -S`.
fn appended_rule(line: &str, chain: &str) -> Option<IptablesRule> {
    let tokens = split_rule_line(line);
    match tokens.as_slice() {
        [flag, name, rest @ ..] if flag == "-A" && name == chain => Some(IptablesRule(rest.to_vec())),
        _ => None,
    }
}

fn jump_target(rule: &IptablesRule) -> Option<&str> {
    let args = rule.args();
    args.iter()
        .position(|a| a == "-j" || a == "--jump")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Split an `iptables -S` line, keeping double-quoted arguments whole.
fn split_rule_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
