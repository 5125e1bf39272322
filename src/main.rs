//! weftnet - overlay network lease controller, VTEP daemon and policy agent.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use weftnet::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config_path();
    match cli.command {
        Commands::Controller => weftnet::commands::controller::run(&config_path).await,
        Commands::Daemon => weftnet::commands::daemon::run(&config_path).await,
        Commands::Policy => weftnet::commands::policy::run(&config_path).await,
        Commands::Teardown => weftnet::commands::teardown::run(&config_path).await,
        Commands::Version => {
            println!("weftnet {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
