use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use stagehand::{HarnessConfig, Result};

/// Brings up a declared set of processes and mock origins for testing
#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Brings up a declared set of processes and mock origins for testing")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start every service in a config, wait for Ctrl-C, then tear down
    Run {
        /// Path to the JSON harness config
        config: PathBuf,

        /// Override the per-endpoint retry budget
        #[arg(long)]
        retries: Option<u32>,

        /// Override the pause between connect attempts (ms)
        #[arg(long)]
        backoff_ms: Option<u64>,
    },

    /// Serve a single mock origin from a config until interrupted
    Origin {
        /// Path to the JSON harness config
        config: PathBuf,

        /// Name of the mock origin service to serve
        name: String,
    },
}

/// Loads the harness config and applies command-line overrides.
pub fn load_config(path: &Path, retries: Option<u32>, backoff_ms: Option<u64>) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::from_path(path)?;

    if let Some(retries) = retries {
        config.readiness.retries = retries;
    }
    if let Some(backoff_ms) = backoff_ms {
        config.readiness.backoff_millis = backoff_ms;
    }

    config.validate()?;
    Ok(config)
}
