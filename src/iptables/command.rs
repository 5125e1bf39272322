//! iptables and iptables-restore driven through [`CommandExecutor`].

use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use super::{Iptables, Restorer};
use crate::cmd_abstraction::{run_checked, CommandExecutor};

const IPTABLES: &str = "iptables";
const IPTABLES_RESTORE: &str = "iptables-restore";

/// [`Iptables`] over the `iptables` binary.
pub struct CommandIptables {
    executor: Arc<dyn CommandExecutor>,
}

impl CommandIptables {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn run(&self, table: &str, action: &[&str], rulespec: &[String]) -> Result<String> {
        let args = build_args(table, action, rulespec);
        debug!("{} {}", IPTABLES, args.join(" "));
        run_checked(self.executor.as_ref(), IPTABLES, &args)
    }
}

/// `-t <table> <action...> <rulespec...>` plus `--wait` unless already given.
fn build_args(table: &str, action: &[&str], rulespec: &[String]) -> Vec<String> {
    let mut args = vec!["-t".to_string(), table.to_string()];
    args.extend(action.iter().map(|a| a.to_string()));
    args.extend(rulespec.iter().cloned());
    if !rulespec.iter().any(|a| a == "--wait" || a == "-w") {
        args.push("--wait".to_string());
    }
    args
}

impl Iptables for CommandIptables {
    fn exists(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<bool> {
        let args = build_args(table, &["-C", chain], rulespec);
        let output = self.executor.execute(IPTABLES, &args)?;
        match (output.success, output.code) {
            (true, _) => Ok(true),
            // -C exits 1 when the rule is absent
            (false, Some(1)) => Ok(false),
            _ => anyhow::bail!("{} {} failed: {}", IPTABLES, args.join(" "), output.message()),
        }
    }

    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        Ok(self.list_chains(table)?.iter().any(|c| c == chain))
    }

    fn insert(&self, table: &str, chain: &str, pos: u32, rulespec: &[String]) -> Result<()> {
        let pos = pos.to_string();
        self.run(table, &["-I", chain, &pos], rulespec).map(|_| ())
    }

    fn append_unique(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()> {
        if self.exists(table, chain, rulespec)? {
            return Ok(());
        }
        self.run(table, &["-A", chain], rulespec).map(|_| ())
    }

    fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()> {
        self.run(table, &["-D", chain], rulespec).map(|_| ())
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        let stdout = self.run(table, &["-S", chain], &[])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let stdout = self.run(table, &["-S"], &[])?;
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                match fields.next() {
                    Some("-N") | Some("-P") => fields.next().map(String::from),
                    _ => None,
                }
            })
            .collect())
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(table, &["-N", chain], &[]).map(|_| ())
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        if self.chain_exists(table, chain)? {
            self.run(table, &["-F", chain], &[]).map(|_| ())
        } else {
            self.new_chain(table, chain)
        }
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(table, &["-X", chain], &[]).map(|_| ())
    }

    fn rename_chain(&self, table: &str, old_chain: &str, new_chain: &str) -> Result<()> {
        self.run(table, &["-E", old_chain, new_chain], &[]).map(|_| ())
    }
}

/// [`Restorer`] over the `iptables-restore` binary.
pub struct CommandRestorer {
    executor: Arc<dyn CommandExecutor>,
}

impl CommandRestorer {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

impl Restorer for CommandRestorer {
    fn restore(&self, input: &str) -> Result<()> {
        self.restore_with_flags(input, &["--noflush".to_string()])
    }

    fn restore_with_flags(&self, input: &str, flags: &[String]) -> Result<()> {
        let output = self
            .executor
            .execute_with_stdin(IPTABLES_RESTORE, flags, input)?;
        if !output.success {
            anyhow::bail!(
                "iptables-restore error: exit status {} combined output: {}{}",
                output.code.unwrap_or(-1),
                output.stdout,
                output.stderr
            );
        }
        Ok(())
    }
}
