//! Node agent daemon
//!
//! # Usage
//!
//! ```bash
//! # Defaults, overridden by NODE_DATA_ROOT / NODE_SNAPSHOT_THRESHOLD / NODE_STANDBY
//! node-agent
//!
//! # Explicit config file and first user
//! node-agent --config node.toml --user alice
//!
//! # Passive replica
//! node-agent --data-root /var/lib/node --standby
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use node_agent::{Drivers, NodeRuntime};
use statemachine::StateMachineConfig;
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (environment variables still override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding one subdirectory per database (overrides NODE_DATA_ROOT)
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Start as a passive replica that applies commits but never reconciles
    #[arg(long, default_value_t = false)]
    standby: bool,

    /// Users created when the default database is first initialized
    #[arg(long = "user")]
    users: Vec<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_filter: String,
}

impl Args {
    fn state_machine_config(&self) -> Result<StateMachineConfig> {
        let mut config = match &self.config {
            Some(path) => StateMachineConfig::load(path)?,
            None => StateMachineConfig::from_env(),
        };
        if let Some(root) = &self.data_root {
            config.data_root = root.clone();
        }
        if self.standby {
            config.standby = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_filter.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.state_machine_config()?;
    info!(
        data_root = %config.data_root.display(),
        snapshot_threshold = config.snapshot_threshold,
        standby = config.standby,
        "Node agent starting"
    );
    let standby = config.standby;

    let runtime = NodeRuntime::start(config, Drivers::in_memory()).await?;
    if standby {
        info!("Standby replica; default database is created by the leader");
    } else {
        let db = runtime.ensure_default_database(args.users.clone()).await?;
        info!(database_id = %db.id(), name = %db.name(), "Serving default database");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    runtime.shutdown().await
}
