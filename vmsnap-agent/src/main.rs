// vmsnap agent - host-invoked crash-consistent snapshot handler
// Invoked as `vmsnap-agent -<operation>`; the outcome is reported through the
// status file, so the exit code is always 0.

mod blob;
mod classify;
mod freezer;
mod handler;
mod identity;
mod mounts;
mod orchestrator;
mod reporter;
mod run_log;
mod snapshotter;
mod timeout;

use anyhow::Result;
use handler::Operation;
use identity::DmiMachineId;
use vmsnap_common::{AgentConfig, EXTENSION_NAME};

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(arg) = std::env::args().nth(1) else {
        log::error!("usage: vmsnap-agent -install|-uninstall|-enable|-disable|-update|-daemon");
        return;
    };
    let Some(op) = Operation::parse(&arg) else {
        log::error!("Unknown operation: {arg}");
        return;
    };

    log::info!(
        "{EXTENSION_NAME} v{} handling {}",
        env!("CARGO_PKG_VERSION"),
        op.keyword()
    );

    // Freezing needs CAP_SYS_ADMIN; carry on so the failure is reported
    if matches!(op, Operation::Enable | Operation::Daemon) && !nix::unistd::geteuid().is_root() {
        log::warn!("vmsnap-agent is not running as root, freezing will fail");
    }

    if let Err(e) = dispatch(op) {
        log::error!("{} failed: {e:#}", op.keyword());
    }
}

fn dispatch(op: Operation) -> Result<()> {
    let config = AgentConfig::new();
    if let Err(errors) = config.validate() {
        for error in &errors {
            log::warn!("Configuration: {error}");
        }
    }

    match op {
        Operation::Install | Operation::Uninstall | Operation::Disable | Operation::Update => {
            handler::acknowledge(&config, op)
        }
        Operation::Enable => {
            let machine = DmiMachineId::new();
            handler::enable(&config, &machine, handler::spawn_daemon).map(|launched| {
                if !launched {
                    log::info!("Nothing to do for this request");
                }
            })
        }
        Operation::Daemon => {
            let outcome = handler::daemon(&config)?;
            log::info!("Backup finished: {}", outcome.message);
            Ok(())
        }
    }
}
