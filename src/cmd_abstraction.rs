//! Process execution behind a trait.
//!
//! Every adapter that drives a system tool (`ip`, `bridge`, `iptables`,
//! `iptables-restore`) goes through [`CommandExecutor`] so unit tests can
//! script the tool's output instead of touching the host.

use anyhow::Result;
use std::io::Write;
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status was zero
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Successful output carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Failed output with exit `code` and `stderr`.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            code: Some(code),
        }
    }

    /// stderr if present, otherwise stdout, trimmed.
    pub fn message(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs external programs.
///
/// Arguments are `&[String]` rather than `&[&str]` because mockall cannot
/// express the nested lifetime.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Like [`execute`](Self::execute), writing `stdin` to the child first.
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// [`CommandExecutor`] backed by `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin_data: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(stdin_data.as_bytes())?;
        }

        let output = child.wait_with_output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Run a command and return its stdout, failing on a non-zero exit.
pub fn run_checked(executor: &dyn CommandExecutor, cmd: &str, args: &[String]) -> Result<String> {
    let output = executor.execute(cmd, args)?;
    if output.success {
        Ok(output.stdout)
    } else {
        anyhow::bail!("{} {} failed: {}", cmd, args.join(" "), output.message())
    }
}

pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
