//! Firewall rule plumbing.
//!
//! ```text
//! IptablesAdapter (LockedIptables)
//!   ├── Locker    host-wide flock around every call
//!   ├── Iptables  single rule/chain operations (CommandIptables)
//!   └── Restorer  atomic multi-rule transactions (CommandRestorer)
//! ```

mod command;
mod locked;

pub use command::{CommandIptables, CommandRestorer};
pub use locked::LockedIptables;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(test)]
use mockall::automock;

use crate::error::IptablesError;

pub const FILTER_TABLE: &str = "filter";
pub const NAT_TABLE: &str = "nat";

/// One rule specification, as the argument list after the chain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IptablesRule(pub Vec<String>);

impl IptablesRule {
    pub fn new(args: &[&str]) -> Self {
        Self(args.iter().map(|a| a.to_string()).collect())
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for IptablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Terminal deny kept at the end of input chains.
pub fn default_reject_rule() -> IptablesRule {
    IptablesRule::new(&["-j", "REJECT", "--reject-with", "icmp-port-unreachable"])
}

/// Unlocked single-call iptables operations.
#[cfg_attr(test, automock)]
pub trait Iptables: Send + Sync {
    fn exists(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<bool>;
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool>;
    fn insert(&self, table: &str, chain: &str, pos: u32, rulespec: &[String]) -> Result<()>;
    fn append_unique(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()>;
    fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()>;
    /// `-S` output for one chain, including its `-N` line.
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>>;
    fn list_chains(&self, table: &str) -> Result<Vec<String>>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;
    /// Flush a chain, creating it if missing.
    fn clear_chain(&self, table: &str, chain: &str) -> Result<()>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;
    fn rename_chain(&self, table: &str, old_chain: &str, new_chain: &str) -> Result<()>;
}

/// Applies `iptables-restore` input.
#[cfg_attr(test, automock)]
pub trait Restorer: Send + Sync {
    /// Restore without flushing tables that the input does not mention.
    fn restore(&self, input: &str) -> Result<()>;
    fn restore_with_flags(&self, input: &str, flags: &[String]) -> Result<()>;
}

/// Locked, transactional firewall operations used by the policy engine.
#[cfg_attr(test, automock)]
pub trait IptablesAdapter: Send + Sync {
    fn flush_and_restore(&self, raw_input: &str) -> Result<(), IptablesError>;
    fn exists(&self, table: &str, chain: &str, rulespec: &IptablesRule) -> Result<bool, IptablesError>;
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, IptablesError>;
    fn delete(&self, table: &str, chain: &str, rulespec: &IptablesRule) -> Result<(), IptablesError>;
    fn delete_after_rule_num(&self, table: &str, chain: &str, rule_num: usize) -> Result<(), IptablesError>;
    fn delete_after_rule_num_keep_reject(
        &self,
        table: &str,
        chain: &str,
        rule_num: usize,
    ) -> Result<(), IptablesError>;
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, IptablesError>;
    fn list_chains(&self, table: &str) -> Result<Vec<String>, IptablesError>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;
    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;
    fn rename_chain(&self, table: &str, old_chain: &str, new_chain: &str) -> Result<(), IptablesError>;
    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        pos: u32,
        rulespec: &[IptablesRule],
    ) -> Result<(), IptablesError>;
    fn bulk_append(&self, table: &str, chain: &str, rulespec: &[IptablesRule]) -> Result<(), IptablesError>;
    fn rule_count(&self, table: &str) -> Result<usize, IptablesError>;
    fn allow_traffic_for_range(&self, rulespec: &[IptablesRule]) -> Result<(), IptablesError>;
}
