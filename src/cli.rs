//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "weftnet")]
#[command(author, version, about = "Overlay network lease controller, VTEP daemon and policy agent")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (defaults to /etc/weftnet/<command>.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    /// Config path for the selected command.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            let name = match self.command {
                Commands::Controller => "controller",
                Commands::Daemon | Commands::Teardown => "daemon",
                Commands::Policy => "policy",
                Commands::Version => "weftnet",
            };
            PathBuf::from(format!("/etc/weftnet/{}.yaml", name))
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the lease API
    Controller,

    /// Hold this host's lease, manage its VTEP and converge routes
    Daemon,

    /// Enforce policy and per-container rule sets
    Policy,

    /// Release this host's lease and delete its VTEP
    Teardown,

    /// Show version
    Version,
}
