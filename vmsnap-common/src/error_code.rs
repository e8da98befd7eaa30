//! Outcome taxonomy reported to the host
//!
//! Every attempt ends in exactly one of these codes. The numeric values are
//! part of the wire format and must not change.

use serde::{Deserialize, Serialize};

use crate::status::StatusKind;

/// Numeric code carried by `transitioning` records. Not a terminal outcome.
pub const TRANSITIONING_CODE: u32 = 4;

/// Closed set of outcomes for a backup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Success,
    SuccessWithWarning,
    ThawFailure,
    ParameterError,
    FileNotFound,
    /// No disk could be snapshotted, typically because storage is unreachable
    SnapshotFailureTotal,
    FreezeFailure,
    TimeoutInconsistent,
    /// Some disks were snapshotted, typically a restricted network
    SnapshotFailurePartial,
}

impl ErrorCode {
    /// Wire value of this code
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::SuccessWithWarning => 1,
            ErrorCode::ThawFailure => 2,
            ErrorCode::ParameterError => 11,
            ErrorCode::FileNotFound => 12,
            ErrorCode::SnapshotFailureTotal => 76,
            ErrorCode::FreezeFailure => 121,
            ErrorCode::TimeoutInconsistent => 122,
            ErrorCode::SnapshotFailurePartial => 761,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::SuccessWithWarning => "success_with_warning",
            ErrorCode::ThawFailure => "thaw_failure",
            ErrorCode::ParameterError => "parameter_error",
            ErrorCode::FileNotFound => "file_not_found",
            ErrorCode::SnapshotFailureTotal => "snapshot_failure_total",
            ErrorCode::FreezeFailure => "freeze_failure",
            ErrorCode::TimeoutInconsistent => "timeout_inconsistent",
            ErrorCode::SnapshotFailurePartial => "snapshot_failure_partial",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success | ErrorCode::SuccessWithWarning)
    }

    /// Terminal status reported alongside this code
    pub fn status(self) -> StatusKind {
        if self.is_success() {
            StatusKind::Success
        } else {
            StatusKind::Error
        }
    }

    /// Suffix appended to human messages so the host can grep the code name
    pub fn message_suffix(self) -> String {
        format!(" [{}:{}]", self.as_str(), self.code())
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}
