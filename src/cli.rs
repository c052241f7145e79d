use std::path::PathBuf;

use clap::Parser;

/// Command-line options for tern.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the config file (default: platform config dir).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Sync only the named accounts; repeatable.
    #[arg(long = "account", short = 'a')]
    pub accounts: Vec<String>,

    /// Compute and log every change without applying any.
    #[arg(long)]
    pub dry_run: bool,

    /// Exit after one sync round even if idle folders are configured.
    #[arg(long)]
    pub once: bool,

    /// Log output format: "line" or "machine".
    #[arg(long, default_value = "line")]
    pub info_format: String,
}
