// vmsnap watcher - validates /etc/fstab after it changes
// A broken fstab entry makes the restored VM fail to boot, so every settled
// change is dry-run with `mount -a -vf` and the result logged.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use vmsnap_common::AgentConfig;

/// What a poll decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Unchanged,
    /// Changed, but too recently; checked again on the next poll
    Settling,
    Validate,
}

/// Tracks the fstab modification time that was last validated
struct FstabWatch {
    path: PathBuf,
    settle: chrono::Duration,
    validated: Option<DateTime<Utc>>,
}

impl FstabWatch {
    /// The file as found at startup counts as validated
    fn new(path: PathBuf, settle: Duration) -> Self {
        let validated = modified_at(&path);
        Self {
            path,
            settle: chrono::Duration::from_std(settle).unwrap_or_else(|_| chrono::Duration::seconds(60)),
            validated,
        }
    }

    fn observe(&mut self, modified: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Check {
        let Some(modified) = modified else {
            return Check::Unchanged;
        };
        if self.validated == Some(modified) {
            return Check::Unchanged;
        }
        if now - modified < self.settle {
            return Check::Settling;
        }
        self.validated = Some(modified);
        Check::Validate
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .ok()
}

/// Dry-run every fstab entry
fn validate_fstab() -> Result<String> {
    let output = Command::new("mount")
        .args(["-a", "-vf"])
        .output()
        .context("Failed to run mount")?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(anyhow::anyhow!("mount -a -vf failed: {}", stderr.trim()))
    }
}

async fn poll(watch: &mut FstabWatch) {
    let modified = modified_at(&watch.path);
    match watch.observe(modified, Utc::now()) {
        Check::Unchanged => {}
        Check::Settling => log::debug!("{} changed recently, waiting for it to settle", watch.path.display()),
        Check::Validate => {
            log::info!(
                "{} changed at {}, validating entries",
                watch.path.display(),
                modified.map(|m| m.to_rfc3339()).unwrap_or_default()
            );
            match tokio::task::spawn_blocking(validate_fstab).await {
                Ok(Ok(output)) => {
                    log::info!("fstab validated");
                    for line in output.lines() {
                        log::debug!("  {line}");
                    }
                }
                Ok(Err(e)) => log::error!("fstab validation failed: {e:#}"),
                Err(e) => log::error!("fstab validation task failed: {e}"),
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AgentConfig::new();
    log::info!(
        "Starting vmsnap watcher v{} on {} (every {}s)",
        env!("CARGO_PKG_VERSION"),
        config.fstab.display(),
        config.fstab_poll_secs
    );

    let mut watch = FstabWatch::new(config.fstab.clone(), Duration::from_secs(config.fstab_settle_secs));
    let mut ticker = tokio::time::interval(Duration::from_secs(config.fstab_poll_secs.max(1)));

    // Wait for termination signal between polls
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = ticker.tick() => poll(&mut watch).await,
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
                break;
            }
        }
    }

    Ok(())
}
