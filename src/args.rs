use std::path::PathBuf;

use clap::Args;

use crate::config;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Config directory (default: ~/.myndhyve-cli)
    #[arg(
        long,
        value_name = "DIR",
        env = "MYNDHYVE_CONFIG_DIR",
        global = true
    )]
    pub config_dir: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Verbose logging
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

impl CommonArgs {
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(config::config_dir)
    }
}
