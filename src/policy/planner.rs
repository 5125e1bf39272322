//! Rule sets read from a local YAML file.
//!
//! ```yaml
//! policy:
//!   chain: { table: filter, parent_chain: FORWARD, prefix: "vpa--" }
//!   rules:
//!     - ["-s", "10.255.1.0/24", "-d", "10.255.2.0/24", "-j", "ACCEPT"]
//! asgs:
//!   - container_handle: 6f1c2e7a-9d1b-4c55
//!     rules:
//!       - ["-d", "0.0.0.0/0", "-p", "tcp", "--dport", "443", "-j", "ACCEPT"]
//!     log_config: { guid: app-guid, index: 0, source_name: CELL }
//! ```
//!
//! The file's modification time serves as the "last updated" token.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::converger::{Planner, PolicyClient};
use super::rules::{asg_chain_name, Chain, LogConfig, RulesWithChain, ASG_CHILD_PREFIX};
use crate::iptables::{IptablesRule, FILTER_TABLE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsgRules {
    pub container_handle: String,
    #[serde(default)]
    pub rules: Vec<IptablesRule>,
    #[serde(default)]
    pub log_config: LogConfig,
}

impl AsgRules {
    fn into_rules_with_chain(self) -> RulesWithChain {
        RulesWithChain {
            chain: Chain {
                table: FILTER_TABLE.to_string(),
                parent_chain: asg_chain_name(&self.container_handle),
                prefix: ASG_CHILD_PREFIX.to_string(),
            },
            rules: self.rules,
            log_config: self.log_config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesFile {
    pub policy: RulesWithChain,
    #[serde(default)]
    pub asgs: Vec<AsgRules>,
}

pub struct FilePlanner {
    path: PathBuf,
}

impl FilePlanner {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn read(&self) -> Result<RulesFile> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read rules file: {:?}", self.path))?;
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse rules file: {:?}", self.path))
    }
}

#[async_trait]
impl Planner for FilePlanner {
    async fn get_policy_rules_and_chain(&self) -> Result<RulesWithChain> {
        Ok(self.read().await?.policy)
    }

    async fn get_asg_rules_and_chains(&self, containers: &[String]) -> Result<Vec<RulesWithChain>> {
        Ok(self
            .read()
            .await?
            .asgs
            .into_iter()
            .filter(|asg| containers.is_empty() || containers.contains(&asg.container_handle))
            .map(AsgRules::into_rules_with_chain)
            .collect())
    }
}

#[async_trait]
impl PolicyClient for FilePlanner {
    async fn get_policies_last_updated(&self) -> Result<i64> {
        let modified = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("Failed to stat rules file: {:?}", self.path))?
            .modified()?;
        let micros = modified.duration_since(UNIX_EPOCH)?.as_micros();
        Ok(i64::try_from(micros)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RULES: &str = r#"
policy:
  chain: { table: filter, parent_chain: FORWARD, prefix: "vpa--" }
  rules:
    - ["-s", "10.255.1.0/24", "-j", "ACCEPT"]
asgs:
  - container_handle: one
    rules:
      - ["-p", "tcp", "--dport", "443", "-j", "ACCEPT"]
    log_config: { guid: app-guid, index: 2, source_name: CELL }
  - container_handle: two
"#;

    fn planner_with(content: &str) -> (TempDir, FilePlanner) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, FilePlanner::new(path))
    }

    #[tokio::test]
    async fn test_policy_rules_from_file() {
        let (_dir, planner) = planner_with(RULES);
        let policy = planner.get_policy_rules_and_chain().await.unwrap();
        assert_eq!(policy.chain.parent_chain, "FORWARD");
        assert_eq!(policy.chain.prefix, "vpa--");
        assert_eq!(
            policy.rules,
            vec![IptablesRule::new(&["-s", "10.255.1.0/24", "-j", "ACCEPT"])]
        );
    }

    #[tokio::test]
    async fn test_asg_rules_get_container_chains() {
        let (_dir, planner) = planner_with(RULES);
        let all = planner.get_asg_rules_and_chains(&[]).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].chain.parent_chain, "asg-one");
        assert_eq!(all[0].chain.prefix, "asgr-");
        assert_eq!(all[0].log_config.index, 2);
        assert!(all[1].rules.is_empty());

        let only_two = planner
            .get_asg_rules_and_chains(&["two".to_string()])
            .await
            .unwrap();
        assert_eq!(only_two.len(), 1);
        assert_eq!(only_two[0].chain.parent_chain, "asg-two");
    }

    #[tokio::test]
    async fn test_last_updated_tracks_modification_time() {
        let (_dir, planner) = planner_with(RULES);
        assert!(planner.get_policies_last_updated().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_missing_or_malformed_file() {
        let planner = FilePlanner::new("/nonexistent/rules.yaml");
        let err = planner.get_policy_rules_and_chain().await.unwrap_err();
        assert!(err.to_string().contains("Failed to read rules file"));
        assert!(planner.get_policies_last_updated().await.is_err());

        let (_dir, planner) = planner_with("policy: [not, a, map]");
        let err = planner.get_asg_rules_and_chains(&[]).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse rules file"));
    }
}
