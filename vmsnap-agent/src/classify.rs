//! Maps stage results to a single reported outcome

use crate::freezer::{FreezeResult, ThawResult};
use crate::snapshotter::SnapshotResult;
use vmsnap_common::ErrorCode;

/// What the snapshot stage produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStage {
    /// Freeze failed, so no snapshot was requested
    NotRun,
    Completed(SnapshotResult),
    /// The supervised worker missed the deadline
    Abandoned,
    /// The snapshot call returned an error or panicked
    Failed(String),
}

impl SnapshotStage {
    /// Completion of the snapshot could not be confirmed
    pub fn is_inconsistent(&self) -> bool {
        match self {
            SnapshotStage::Completed(result) => result.inconsistent,
            SnapshotStage::Abandoned => true,
            SnapshotStage::NotRun | SnapshotStage::Failed(_) => false,
        }
    }
}

/// Classifier verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub code: ErrorCode,
    /// Persist the doseq flag so later requests are handled sequentially
    pub set_do_seq: bool,
}

/// Classify a run that got past validation.
///
/// Precedence: freeze errors, then snapshot errors (total before partial),
/// then an abandoned snapshot, then thaw errors, then success. A thaw that
/// did not run is treated like an error-free one.
pub fn classify(freeze: &FreezeResult, snapshot: &SnapshotStage, thaw: Option<&ThawResult>) -> Classification {
    let thaw_inconsistent = thaw.is_some_and(|t| t.inconsistent);
    let thaw_failed = thaw.is_some_and(|t| !t.errors.is_empty());
    let both_inconsistent = thaw_inconsistent && snapshot.is_inconsistent();

    let code = if !freeze.errors.is_empty() {
        ErrorCode::FreezeFailure
    } else {
        match snapshot {
            SnapshotStage::Completed(result) if !result.errors.is_empty() => {
                if result.all_failed {
                    ErrorCode::SnapshotFailureTotal
                } else {
                    ErrorCode::SnapshotFailurePartial
                }
            }
            SnapshotStage::Failed(_) => ErrorCode::SnapshotFailureTotal,
            SnapshotStage::Abandoned => ErrorCode::TimeoutInconsistent,
            SnapshotStage::NotRun | SnapshotStage::Completed(_) => {
                if !thaw_failed {
                    ErrorCode::Success
                } else if !thaw_inconsistent && !snapshot.is_inconsistent() {
                    ErrorCode::SuccessWithWarning
                } else {
                    ErrorCode::ThawFailure
                }
            }
        }
    };

    Classification {
        code,
        set_do_seq: both_inconsistent || code == ErrorCode::ThawFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshotter::{failed_disk, succeeded_disk};

    fn frozen() -> FreezeResult {
        FreezeResult {
            frozen: vec!["/".to_string()],
            errors: vec![],
        }
    }

    fn freeze_failed() -> FreezeResult {
        FreezeResult {
            frozen: vec!["/data".to_string()],
            errors: vec![("/".to_string(), "busy".to_string())],
        }
    }

    fn snapshot_ok() -> SnapshotStage {
        SnapshotStage::Completed(SnapshotResult::from_disks(vec![succeeded_disk("os", "t")], false))
    }

    fn thaw_ok() -> ThawResult {
        ThawResult::default()
    }

    fn thaw_errors(inconsistent: bool) -> ThawResult {
        ThawResult {
            errors: vec![("/".to_string(), "EIO".to_string())],
            inconsistent,
        }
    }

    #[test]
    fn test_clean_run_is_success() {
        let c = classify(&frozen(), &snapshot_ok(), Some(&thaw_ok()));
        assert_eq!(c.code, ErrorCode::Success);
        assert!(!c.set_do_seq);
    }

    #[test]
    fn test_freeze_failure_beats_snapshot_failure() {
        let snapshot = SnapshotStage::Completed(SnapshotResult::from_disks(
            vec![failed_disk("os", "x")],
            false,
        ));
        let c = classify(&freeze_failed(), &snapshot, Some(&thaw_ok()));
        assert_eq!(c.code, ErrorCode::FreezeFailure);
    }

    #[test]
    fn test_total_and_partial_snapshot_failures() {
        let total = SnapshotStage::Completed(SnapshotResult::from_disks(
            vec![failed_disk("os", "x"), failed_disk("data", "y")],
            false,
        ));
        assert_eq!(
            classify(&frozen(), &total, Some(&thaw_ok())).code,
            ErrorCode::SnapshotFailureTotal
        );

        let partial = SnapshotStage::Completed(SnapshotResult::from_disks(
            vec![succeeded_disk("os", "t"), failed_disk("data", "y")],
            false,
        ));
        assert_eq!(
            classify(&frozen(), &partial, Some(&thaw_ok())).code,
            ErrorCode::SnapshotFailurePartial
        );
    }

    #[test]
    fn test_thaw_errors_do_not_override_snapshot_failure() {
        let total = SnapshotStage::Completed(SnapshotResult::from_disks(
            vec![failed_disk("os", "x")],
            false,
        ));
        let c = classify(&frozen(), &total, Some(&thaw_errors(false)));
        assert_eq!(c.code, ErrorCode::SnapshotFailureTotal);
    }

    #[test]
    fn test_thaw_errors_when_consistent_is_warning() {
        let c = classify(&frozen(), &snapshot_ok(), Some(&thaw_errors(false)));
        assert_eq!(c.code, ErrorCode::SuccessWithWarning);
        assert!(!c.set_do_seq);
    }

    #[test]
    fn test_thaw_errors_when_inconsistent_is_failure() {
        let c = classify(&frozen(), &snapshot_ok(), Some(&thaw_errors(true)));
        assert_eq!(c.code, ErrorCode::ThawFailure);
        assert!(c.set_do_seq);
    }

    #[test]
    fn test_abandoned_snapshot() {
        let c = classify(&frozen(), &SnapshotStage::Abandoned, Some(&thaw_ok()));
        assert_eq!(c.code, ErrorCode::TimeoutInconsistent);
        assert!(!c.set_do_seq);

        let inconsistent_thaw = ThawResult {
            errors: vec![],
            inconsistent: true,
        };
        let c = classify(&frozen(), &SnapshotStage::Abandoned, Some(&inconsistent_thaw));
        assert_eq!(c.code, ErrorCode::TimeoutInconsistent);
        assert!(c.set_do_seq);
    }

    #[test]
    fn test_snapshot_exception() {
        let c = classify(&frozen(), &SnapshotStage::Failed("boom".into()), Some(&thaw_ok()));
        assert_eq!(c.code, ErrorCode::SnapshotFailureTotal);
    }
}
