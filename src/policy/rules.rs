//! Rule-set model shared by planners, the poll cycle and the enforcer.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::iptables::{IptablesRule, FILTER_TABLE};

/// Prefix of per-container parent chains.
pub const ASG_CHAIN_PREFIX: &str = "asg-";
/// Prefix of the generated chains holding a container's rules.
pub const ASG_CHILD_PREFIX: &str = "asgr-";
/// Live chains eligible for orphan cleanup.
pub const ASG_CHAIN_PATTERN: &str = "^asgr-";

/// iptables refuses chain names longer than this.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

const ASG_HANDLE_LEN: usize = 24;

/// Logical identity of an enforced rule set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Chain {
    pub table: String,
    pub parent_chain: String,
    /// Prefix of the child chains generated for this rule set.
    pub prefix: String,
}

/// A chain as it exists in the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LiveChain {
    pub table: String,
    pub name: String,
}

impl LiveChain {
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }
}

/// Where application log events for a container go.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogConfig {
    pub guid: String,
    pub index: u32,
    pub source_name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RulesWithChain {
    pub chain: Chain,
    pub rules: Vec<IptablesRule>,
    #[serde(default)]
    pub log_config: LogConfig,
}

impl RulesWithChain {
    /// Same chain and the same rules in the same order. Log config is not
    /// part of what gets enforced, so it is ignored.
    pub fn same_rules(&self, other: &RulesWithChain) -> bool {
        self.chain == other.chain && self.rules == other.rules
    }

    /// Kernel identity of the parent chain.
    pub fn parent_live_chain(&self) -> LiveChain {
        LiveChain::new(&self.chain.table, &self.chain.parent_chain)
    }
}

/// Parent chain name for a container handle.
pub fn asg_chain_name(container_handle: &str) -> String {
    let handle: String = container_handle.chars().take(ASG_HANDLE_LEN).collect();
    format!("{}{}", ASG_CHAIN_PREFIX, handle)
}

/// Live parent chain for a container handle.
pub fn asg_live_chain(container_handle: &str) -> LiveChain {
    LiveChain::new(FILTER_TABLE, asg_chain_name(container_handle))
}

/// Regex matching generated ASG child chains.
pub fn asg_chain_regex() -> Result<Regex, regex::Error> {
    Regex::new(ASG_CHAIN_PATTERN)
}
