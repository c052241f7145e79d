//! User hooks, run as shell commands.

use tokio::process::Command;
use tracing::{info, warn};

pub async fn run_hook(name: &str, command: &str) {
    info!(hook = name, command, "running hook");
    match Command::new("sh").arg("-c").arg(command).status().await {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(hook = name, code = ?status.code(), "hook exited nonzero"),
        Err(e) => warn!(hook = name, error = %e, "hook could not be started"),
    }
}
