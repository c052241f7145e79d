//! Top-level run loop: load config, spawn one worker per account,
//! aggregate outcomes into the process exit code.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::Config;
use crate::sched::{self, AbortFlag};

/// Exit code when any account or folder worker failed.
pub const EXIT_PARTIAL: i32 = 100;

pub async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    if config.accounts.is_empty() {
        bail!("no accounts configured in {}", config_path.display());
    }

    if !cli.accounts.is_empty() {
        config
            .accounts
            .retain(|a| cli.accounts.contains(&a.name));
        if config.accounts.is_empty() {
            bail!("no configured account matches {:?}", cli.accounts);
        }
    }
    if cli.dry_run {
        for account in &mut config.accounts {
            account.options.dry_run = true;
        }
    }

    let status_dir = config.general.resolved_status_dir()?;
    std::fs::create_dir_all(&status_dir)
        .with_context(|| format!("creating status dir {}", status_dir.display()))?;

    let abort = AbortFlag::new();
    sched::install_signal_handlers(abort.clone());

    let general = Arc::new(config.general.clone());
    let mut handles = Vec::new();
    for account in config.accounts {
        let account = Arc::new(account);
        let general = general.clone();
        let status_dir = status_dir.clone();
        let abort = abort.clone();
        let run_once = cli.once;
        info!(account = %account.name, "starting account worker");
        handles.push(tokio::spawn(async move {
            let name = account.name.clone();
            let outcome =
                sched::sync_account(account, general, status_dir, abort, run_once).await;
            (name, outcome)
        }));
    }

    let mut failed = false;
    for handle in join_all(handles).await {
        match handle {
            Ok((name, Ok(report))) => {
                info!(
                    account = %name,
                    synced = report.folders_synced,
                    failed = report.folders_failed,
                    "account finished"
                );
                if report.folders_failed > 0 {
                    failed = true;
                }
            }
            Ok((name, Err(e))) => {
                warn!(account = %name, error = %e, "account failed");
                failed = true;
            }
            Err(e) => {
                warn!(error = %e, "account worker panicked");
                failed = true;
            }
        }
    }

    Ok(if failed { EXIT_PARTIAL } else { 0 })
}
