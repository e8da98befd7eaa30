//! Handler operations invoked by the host
//!
//! Every operation reads the newest `<seq>.settings` file from the config
//! directory. `enable` admits the request and starts a detached `daemon`
//! process, which runs the backup attempt and reports its outcome.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::blob::BlobWriter;
use crate::freezer::{Freezer, FsFreezer};
use crate::identity::{IdentityGuard, MachineIdSource, StateStore};
use crate::orchestrator::{Orchestrator, RunContext, RunOutcome, RunSettings};
use crate::reporter::{BlobStatusSink, LocalStatusFile, StatusReporter, StatusSink};
use crate::run_log::{BlobLogSink, LocalLogSink, LogSink, RunLog};
use crate::snapshotter::{BlobSnapshotter, Snapshotter};
use vmsnap_common::{
    AgentConfig, ErrorCode, HandlerSettings, OPERATION_DISABLE, OPERATION_ENABLE, OPERATION_INSTALL,
    OPERATION_UNINSTALL, OPERATION_UPDATE, RequestHeader, SnapshotThreadConfig, StatusRecord,
};

const SETTINGS_EXTENSION: &str = "settings";

/// Operations the host can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Uninstall,
    Enable,
    Disable,
    Update,
    Daemon,
}

impl Operation {
    /// Match order matters: `uninstall` before `install`
    const MATCH_ORDER: [Operation; 6] = [
        Operation::Disable,
        Operation::Uninstall,
        Operation::Install,
        Operation::Enable,
        Operation::Update,
        Operation::Daemon,
    ];

    /// Accepts `enable`, `-enable` and `/enable` (case-insensitive)
    pub fn parse(arg: &str) -> Option<Self> {
        let name = arg.trim_start_matches(['-', '/']).to_lowercase();
        Self::MATCH_ORDER
            .into_iter()
            .find(|op| name.starts_with(op.keyword()))
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Uninstall => "uninstall",
            Operation::Enable => "enable",
            Operation::Disable => "disable",
            Operation::Update => "update",
            Operation::Daemon => "daemon",
        }
    }

    /// Name used in status records
    pub fn status_name(self) -> &'static str {
        match self {
            Operation::Install => OPERATION_INSTALL,
            Operation::Uninstall => OPERATION_UNINSTALL,
            Operation::Enable | Operation::Daemon => OPERATION_ENABLE,
            Operation::Disable => OPERATION_DISABLE,
            Operation::Update => OPERATION_UPDATE,
        }
    }
}

/// The newest request found in the config directory
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub sequence: i64,
    pub settings_path: PathBuf,
    pub settings: HandlerSettings,
}

impl HandlerContext {
    pub fn load(config: &AgentConfig) -> Result<Self> {
        let (sequence, settings_path) = latest_settings(&config.config_dir)?;
        let raw = std::fs::read_to_string(&settings_path)
            .with_context(|| format!("Failed to read {}", settings_path.display()))?;

        // An unparsable file still yields a context so the daemon can report
        // a parameter error under its sequence number.
        let settings = HandlerSettings::from_json(&raw).unwrap_or_else(|e| {
            log::error!("Invalid settings in {}: {e}", settings_path.display());
            HandlerSettings::default()
        });

        Ok(Self {
            sequence,
            settings_path,
            settings,
        })
    }

    pub fn header(&self) -> RequestHeader {
        self.settings.header(self.sequence)
    }
}

/// Highest-numbered `<n>.settings` file in `config_dir`
pub fn latest_settings(config_dir: &Path) -> Result<(i64, PathBuf)> {
    let mut latest: Option<(i64, PathBuf)> = None;

    for entry in WalkDir::new(config_dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to list {}", config_dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(SETTINGS_EXTENSION)
        {
            continue;
        }
        let Some(sequence) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        else {
            continue;
        };
        if latest.as_ref().is_none_or(|(best, _)| sequence > *best) {
            latest = Some((sequence, path.to_path_buf()));
        }
    }

    latest.ok_or_else(|| {
        anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no .settings file in {}", config_dir.display()),
        ))
    })
}

/// Local status file plus the request's status blob, when it named one
pub fn build_reporter(config: &AgentConfig, header: &RequestHeader) -> StatusReporter {
    let local = Box::new(LocalStatusFile::new(config.status_file(header.sequence)));
    let remote = header.status_blob_uri.as_ref().and_then(|uri| {
        match BlobWriter::new() {
            Ok(writer) => Some(Box::new(BlobStatusSink::new(writer, uri.clone())) as Box<dyn StatusSink>),
            Err(e) => {
                log::warn!("Status blob disabled: {e:#}");
                None
            }
        }
    });
    StatusReporter::new(header, local, remote)
}

fn build_log_sink(config: &AgentConfig, header: &RequestHeader) -> Box<dyn LogSink> {
    if let Some(uri) = header.logs_blob_uri.as_ref() {
        match BlobWriter::new() {
            Ok(writer) => return Box::new(BlobLogSink::new(writer, uri.clone())),
            Err(e) => log::warn!("Logs blob disabled, logging locally: {e:#}"),
        }
    }
    Box::new(LocalLogSink::new(config.local_log_file()))
}

/// install, uninstall, disable, update: acknowledge with a success status
pub fn acknowledge(config: &AgentConfig, op: Operation) -> Result<()> {
    let ctx = match HandlerContext::load(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::info!("{} with no request to report on: {e:#}", op.status_name());
            return Ok(());
        }
    };
    let reporter = build_reporter(config, &ctx.header());
    let name = op.status_name();
    reporter.report(StatusRecord::terminal(
        name,
        ErrorCode::Success,
        format!("{name} Succeeded"),
    ))
}

/// Admit the newest request and hand it to a daemon process.
///
/// Returns whether the daemon was launched.
pub fn enable<L>(config: &AgentConfig, machine: &dyn MachineIdSource, launch: L) -> Result<bool>
where
    L: FnOnce() -> Result<()>,
{
    let ctx = HandlerContext::load(config)?;
    let header = ctx.header();
    log::info!(
        "enable: sequence {} from {}",
        header.sequence,
        ctx.settings_path.display()
    );

    let store = StateStore::new(&config.state_dir);
    let admission = IdentityGuard::new(&store, machine).admit(&header, Utc::now())?;
    if !admission.is_admitted() {
        log::info!("Request not admitted: {admission}");
        return Ok(false);
    }

    let reporter = build_reporter(config, &header);
    if let Err(e) = reporter.report(StatusRecord::transitioning(
        OPERATION_ENABLE,
        "Transitioning state in enable",
    )) {
        log::warn!("Cannot write transitioning status: {e:#}");
    }

    launch().context("Failed to start the backup daemon")?;
    Ok(true)
}

/// Start `<this binary> -daemon` detached from our stdio
pub fn spawn_daemon() -> Result<()> {
    let exe = std::env::current_exe().context("Cannot locate the agent binary")?;
    let child = Command::new(&exe)
        .arg("-daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", exe.display()))?;
    log::info!("Started daemon (pid {})", child.id());
    Ok(())
}

/// Run the backup attempt for the newest request with the real collaborators
pub fn daemon(config: &AgentConfig) -> Result<RunOutcome> {
    let snapshotter: Arc<dyn Snapshotter> = match BlobSnapshotter::new() {
        Ok(snapshotter) => Arc::new(snapshotter),
        Err(e) => {
            // Nothing can be snapshotted without a client: report it before
            // anything is frozen.
            let ctx = HandlerContext::load(config)?;
            let reporter = build_reporter(config, &ctx.header());
            reporter.report(StatusRecord::terminal(
                OPERATION_ENABLE,
                ErrorCode::SnapshotFailureTotal,
                format!("Cannot create storage client: {e:#}{}", ErrorCode::SnapshotFailureTotal.message_suffix()),
            ))?;
            return Err(e);
        }
    };
    let freezer = FsFreezer::new();
    match freezer.mount_count() {
        Ok(count) => log::info!("{count} freezable mount(s)"),
        Err(e) => log::warn!("Cannot count mounts: {e:#}"),
    }
    run_daemon(config, freezer, snapshotter)
}

pub fn run_daemon<F: Freezer>(
    config: &AgentConfig,
    freezer: F,
    snapshotter: Arc<dyn Snapshotter>,
) -> Result<RunOutcome> {
    let ctx = HandlerContext::load(config)?;
    let header = ctx.header();
    let reporter = build_reporter(config, &header);
    let log = RunLog::new(Some(build_log_sink(config, &header)));
    let mut run = RunContext::new(header, log);

    let thread_config = SnapshotThreadConfig::load_or_default(&config.conf_file);
    run.log.info(format!(
        "daemon: sequence {}, timeout {}s, safefreeze {}, doseq {}",
        ctx.sequence,
        thread_config.timeout().as_secs(),
        thread_config.safe_freeze(),
        thread_config.do_seq()
    ));

    let mut orchestrator = Orchestrator::new(freezer, snapshotter, RunSettings::from_config(&thread_config))
        .with_do_seq_path(config.conf_file.clone());
    let outcome = orchestrator.run(&ctx.settings, &mut run, &reporter);

    run.log.info(format!(
        "Attempt finished with {} in stage {} (inconsistent: {}, doseq: {}, {} log entries)",
        outcome.code,
        run.stage().as_str(),
        outcome.inconsistent,
        outcome.do_seq,
        run.log.len() + 1
    ));
    run.log.commit();
    Ok(outcome)
}
