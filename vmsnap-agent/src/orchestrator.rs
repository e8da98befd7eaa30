//! Freeze, snapshot, thaw
//!
//! One `Orchestrator::run` is one backup attempt. Once anything may have been
//! frozen the thaw phase always runs, whatever happened in between, and every
//! collaborator failure (error or panic) is turned into an `ErrorCode` here
//! instead of escaping the attempt.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::classify::{Classification, SnapshotStage, classify};
use crate::freezer::{FreezeResult, Freezer, ThawResult};
use crate::reporter::StatusReporter;
use crate::run_log::RunLog;
use crate::snapshotter::Snapshotter;
use crate::timeout::{Supervised, TimeoutGuard, panic_message};
use vmsnap_common::{
    BackupRequest, ErrorCode, HandlerSettings, OPERATION_ENABLE, RequestCommand, RequestHeader,
    SnapshotInfo, SnapshotThreadConfig, StatusRecord, format_elapsed, format_error_list,
    set_do_seq_flag,
};

/// Thaw attempts per run; the phase stops at the first error-free attempt
pub const THAW_ATTEMPTS: usize = 3;

/// Where an attempt currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Validating,
    Freezing,
    Snapshotting,
    Thawing,
    Reporting,
    Success,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Validating => "validating",
            Stage::Freezing => "freezing",
            Stage::Snapshotting => "snapshotting",
            Stage::Thawing => "thawing",
            Stage::Reporting => "reporting",
            Stage::Success => "success",
            Stage::Error => "error",
        }
    }
}

/// How the snapshot stage is bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Deadline passed into the snapshot call
    Safe,
    /// Snapshot runs on a worker that is abandoned at the deadline
    Supervised,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub mode: SnapshotMode,
    pub timeout: Duration,
    /// Snapshot disks one at a time, set once a run has asked for doseq
    pub sequential: bool,
}

impl RunSettings {
    pub fn from_config(config: &SnapshotThreadConfig) -> Self {
        Self {
            mode: if config.safe_freeze() {
                SnapshotMode::Safe
            } else {
                SnapshotMode::Supervised
            },
            timeout: config.timeout(),
            sequential: config.do_seq(),
        }
    }
}

/// Final result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub code: ErrorCode,
    /// Human-readable, never empty, ends with the code suffix
    pub message: String,
    pub snapshot_info: Option<Vec<SnapshotInfo>>,
    /// Snapshot completion or thaw ordering could not be confirmed
    pub inconsistent: bool,
    /// The doseq flag was requested for later runs
    pub do_seq: bool,
}

impl RunOutcome {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = format!("{OPERATION_ENABLE} finished");
        }
        message.push_str(&code.message_suffix());
        Self {
            code,
            message,
            snapshot_info: None,
            inconsistent: false,
            do_seq: false,
        }
    }

    pub fn status_record(&self) -> StatusRecord {
        StatusRecord::terminal(OPERATION_ENABLE, self.code, self.message.clone())
            .with_snapshot_info(self.snapshot_info.clone())
    }
}

/// State of one attempt, passed through every stage
pub struct RunContext {
    pub header: RequestHeader,
    pub log: RunLog,
    stage: Stage,
    started: Instant,
}

impl RunContext {
    pub fn new(header: RequestHeader, log: RunLog) -> Self {
        Self {
            header,
            log,
            stage: Stage::Idle,
            started: Instant::now(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        self.log.info(format!(
            "{} -> {} (seq {}, {} elapsed)",
            self.stage.as_str(),
            stage.as_str(),
            self.header.sequence,
            format_elapsed(self.started.elapsed())
        ));
        self.stage = stage;
    }
}

pub struct Orchestrator<F: Freezer> {
    freezer: F,
    snapshotter: Arc<dyn Snapshotter>,
    settings: RunSettings,
    do_seq_path: Option<PathBuf>,
}

impl<F: Freezer> Orchestrator<F> {
    pub fn new(freezer: F, snapshotter: Arc<dyn Snapshotter>, settings: RunSettings) -> Self {
        Self {
            freezer,
            snapshotter,
            settings,
            do_seq_path: None,
        }
    }

    /// Configuration file that receives `doseq = 1` when requested
    pub fn with_do_seq_path(mut self, path: PathBuf) -> Self {
        self.do_seq_path = Some(path);
        self
    }

    #[cfg(test)]
    pub fn freezer(&self) -> &F {
        &self.freezer
    }

    /// Run one attempt and report its terminal status
    pub fn run(
        &mut self,
        settings: &HandlerSettings,
        ctx: &mut RunContext,
        reporter: &StatusReporter,
    ) -> RunOutcome {
        ctx.enter(Stage::Validating);
        let request = match BackupRequest::from_settings(settings, ctx.header.sequence) {
            Ok(request) => request,
            Err(e) => {
                ctx.log.error(format!("Invalid request: {e}"));
                let outcome = RunOutcome::new(ErrorCode::ParameterError, format!("Invalid request: {e}"));
                return self.finish(ctx, reporter, outcome);
            }
        };

        if request.command == RequestCommand::Install {
            let outcome = RunOutcome::new(ErrorCode::Success, "Install Succeeded");
            return self.finish(ctx, reporter, outcome);
        }

        ctx.log.info(format!(
            "Snapshot requested for {} disk(s), mode {:?}, timeout {}s, sequential {}",
            request.disks.len(),
            self.settings.mode,
            self.settings.timeout.as_secs(),
            self.settings.sequential
        ));

        // Last status write before anything is frozen: the status file may
        // live on one of the filesystems about to be frozen.
        if let Err(e) = reporter.report(StatusRecord::transitioning(
            OPERATION_ENABLE,
            "Transitioning: freezing file systems",
        )) {
            ctx.log.warn(format!("Cannot write transitioning status: {e:#}"));
        }
        ctx.log.commit();

        let outcome = self.backup(&request, ctx);
        self.finish(ctx, reporter, outcome)
    }

    fn backup(&mut self, request: &BackupRequest, ctx: &mut RunContext) -> RunOutcome {
        ctx.enter(Stage::Freezing);
        let freeze = match catch_unwind(AssertUnwindSafe(|| self.freezer.freeze())) {
            Ok(Ok(freeze)) => freeze,
            Ok(Err(e)) => {
                ctx.log.error(format!("Freeze could not be attempted: {e:#}"));
                let code = code_for_error(&e, ErrorCode::FreezeFailure);
                return self.abort_after_freeze(ctx, code, format!("Enable failed to freeze: {e:#}"));
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                ctx.log.error(format!("Freeze panicked: {msg}"));
                return self.abort_after_freeze(
                    ctx,
                    ErrorCode::FreezeFailure,
                    format!("Enable failed to freeze: {msg}"),
                );
            }
        };

        if !freeze.errors.is_empty() {
            ctx.log.error(format!("Freeze failed: {freeze}"));
            let thaw = self.thaw_with_retry(ctx);
            let verdict = classify(&freeze, &SnapshotStage::NotRun, Some(&thaw));
            return self.conclude(ctx, verdict, &freeze, SnapshotStage::NotRun, &thaw);
        }
        ctx.log.info(format!("Froze {} mount(s)", freeze.frozen.len()));

        ctx.enter(Stage::Snapshotting);
        let snapshot = self.snapshot(request, ctx);

        ctx.enter(Stage::Thawing);
        let thaw = self.thaw_with_retry(ctx);

        let verdict = classify(&freeze, &snapshot, Some(&thaw));
        self.conclude(ctx, verdict, &freeze, snapshot, &thaw)
    }

    fn snapshot(&self, request: &BackupRequest, ctx: &mut RunContext) -> SnapshotStage {
        let guard = TimeoutGuard::new(self.settings.timeout);
        let sequential = self.settings.sequential;

        let stage = match self.settings.mode {
            SnapshotMode::Safe => {
                let deadline = guard.deadline();
                match catch_unwind(AssertUnwindSafe(|| {
                    self.snapshotter.snapshot_all(request, Some(deadline), sequential)
                })) {
                    Ok(Ok(result)) => SnapshotStage::Completed(result),
                    Ok(Err(e)) => SnapshotStage::Failed(format!("{e:#}")),
                    Err(panic) => SnapshotStage::Failed(panic_message(panic.as_ref())),
                }
            }
            SnapshotMode::Supervised => {
                let snapshotter = Arc::clone(&self.snapshotter);
                let owned = request.clone();
                match guard.supervise(move || snapshotter.snapshot_all(&owned, None, sequential)) {
                    Supervised::Completed(Ok(result)) => SnapshotStage::Completed(result),
                    Supervised::Completed(Err(e)) => SnapshotStage::Failed(format!("{e:#}")),
                    Supervised::Failed(msg) => SnapshotStage::Failed(msg),
                    Supervised::Abandoned { waited } => {
                        ctx.log.warn(format!(
                            "Snapshot did not finish within {}s (waited {}), thawing without it",
                            guard.limit().as_secs(),
                            format_elapsed(waited)
                        ));
                        SnapshotStage::Abandoned
                    }
                }
            }
        };

        match &stage {
            SnapshotStage::Completed(result) if result.errors.is_empty() => {
                ctx.log.info(format!("Snapshotted {} disk(s)", result.snapshots.len()));
            }
            SnapshotStage::Completed(result) => ctx.log.error(format!("Snapshot errors: {result}")),
            SnapshotStage::Failed(msg) => ctx.log.error(format!("Snapshot failed: {msg}")),
            SnapshotStage::NotRun | SnapshotStage::Abandoned => {}
        }
        stage
    }

    /// Thaw up to `THAW_ATTEMPTS` times. `inconsistent` accumulates over
    /// attempts; errors are those of the last attempt.
    fn thaw_with_retry(&mut self, ctx: &mut RunContext) -> ThawResult {
        let mut inconsistent = false;
        let mut errors = Vec::new();

        for attempt in 1..=THAW_ATTEMPTS {
            let result = match catch_unwind(AssertUnwindSafe(|| self.freezer.thaw())) {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => ThawResult {
                    errors: vec![("thaw".to_string(), format!("{e:#}"))],
                    inconsistent: false,
                },
                Err(panic) => ThawResult {
                    errors: vec![("thaw".to_string(), panic_message(panic.as_ref()))],
                    inconsistent: false,
                },
            };
            inconsistent |= result.inconsistent;

            if result.errors.is_empty() {
                if attempt > 1 {
                    ctx.log.info(format!("Thaw succeeded on attempt {attempt}"));
                }
                return ThawResult {
                    errors: Vec::new(),
                    inconsistent,
                };
            }

            ctx.log.warn(format!(
                "Thaw attempt {attempt}/{THAW_ATTEMPTS} failed: {}",
                format_error_list(&result.errors)
            ));
            errors = result.errors;
        }

        ThawResult { errors, inconsistent }
    }

    /// Freeze itself failed: thaw whatever may be held and stop
    fn abort_after_freeze(&mut self, ctx: &mut RunContext, code: ErrorCode, message: String) -> RunOutcome {
        ctx.enter(Stage::Thawing);
        let thaw = self.thaw_with_retry(ctx);
        let mut outcome = RunOutcome::new(code, message);
        outcome.inconsistent = thaw.inconsistent;
        outcome
    }

    fn conclude(
        &self,
        ctx: &mut RunContext,
        verdict: Classification,
        freeze: &FreezeResult,
        snapshot: SnapshotStage,
        thaw: &ThawResult,
    ) -> RunOutcome {
        let message = match verdict.code {
            ErrorCode::Success => format!("{OPERATION_ENABLE} Succeeded"),
            ErrorCode::SuccessWithWarning => format!(
                "{OPERATION_ENABLE} Succeeded with thaw warnings: {}",
                format_error_list(&thaw.errors)
            ),
            ErrorCode::FreezeFailure => format!(
                "{OPERATION_ENABLE} failed with the file system freeze error: {}",
                format_error_list(&freeze.errors)
            ),
            ErrorCode::ThawFailure => format!(
                "{OPERATION_ENABLE} failed with the file system thaw error: {}",
                format_error_list(&thaw.errors)
            ),
            ErrorCode::TimeoutInconsistent => format!(
                "{OPERATION_ENABLE} failed: snapshot did not complete within {}s, file systems were thawed",
                self.settings.timeout.as_secs()
            ),
            ErrorCode::SnapshotFailureTotal | ErrorCode::SnapshotFailurePartial => match &snapshot {
                SnapshotStage::Completed(result) => {
                    format!("{OPERATION_ENABLE} failed with the snapshot error: {result}")
                }
                SnapshotStage::Failed(msg) => {
                    format!("{OPERATION_ENABLE} failed with the snapshot error: {msg}")
                }
                SnapshotStage::NotRun | SnapshotStage::Abandoned => {
                    format!("{OPERATION_ENABLE} failed with the snapshot error")
                }
            },
            ErrorCode::ParameterError | ErrorCode::FileNotFound => {
                format!("{OPERATION_ENABLE} failed")
            }
        };

        let inconsistent = snapshot.is_inconsistent() || thaw.inconsistent;
        let mut outcome = RunOutcome::new(verdict.code, message);
        outcome.inconsistent = inconsistent;
        outcome.do_seq = verdict.set_do_seq;
        if let SnapshotStage::Completed(result) = snapshot {
            outcome.snapshot_info = Some(result.snapshots);
        }

        if verdict.set_do_seq {
            self.persist_do_seq(ctx);
        }
        outcome
    }

    fn persist_do_seq(&self, ctx: &mut RunContext) {
        let Some(path) = self.do_seq_path.as_deref() else {
            ctx.log.warn("doseq requested but no configuration file is set");
            return;
        };
        match set_do_seq_flag(path) {
            Ok(()) => ctx.log.info(format!("Set doseq in {}", path.display())),
            Err(e) => ctx.log.warn(format!("Cannot persist doseq flag: {e:#}")),
        }
    }

    fn finish(&self, ctx: &mut RunContext, reporter: &StatusReporter, outcome: RunOutcome) -> RunOutcome {
        ctx.enter(Stage::Reporting);
        if let Err(e) = reporter.report(outcome.status_record()) {
            ctx.log.error(format!("Cannot write final status: {e:#}"));
        }

        if outcome.code.is_success() {
            ctx.log.info(&outcome.message);
            ctx.enter(Stage::Success);
        } else {
            ctx.log.error(&outcome.message);
            ctx.enter(Stage::Error);
        }
        outcome
    }
}

/// `FileNotFound` when the error chain holds an io NotFound, else `fallback`
pub fn code_for_error(err: &anyhow::Error, fallback: ErrorCode) -> ErrorCode {
    let not_found = err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
    });
    if not_found { ErrorCode::FileNotFound } else { fallback }
}
