//! Status records written for the host after every transition

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error_code::{ErrorCode, TRANSITIONING_CODE};

/// Status value as the host understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Transitioning,
    Success,
    Error,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Transitioning => "transitioning",
            StatusKind::Success => "success",
            StatusKind::Error => "error",
        }
    }
}

/// Snapshot metadata for a single disk, surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    /// Disk identifier (blob URI without its query string)
    pub disk_id: String,
    /// Snapshot identifier returned by storage
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// Full snapshot URI, when the snapshot succeeded
    #[serde(default)]
    pub snapshot_uri: Option<String>,
    pub is_successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A single status record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub operation: String,
    pub status: StatusKind,
    pub status_code: u32,
    pub message: String,
    #[serde(rename = "taskId")]
    pub task_id: Option<String>,
    #[serde(rename = "commandStartTimeUTCTicks")]
    pub command_start_time_utc_ticks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_info: Option<Vec<SnapshotInfo>>,
}

impl StatusRecord {
    /// Record for an intermediate transition
    pub fn transitioning(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: StatusKind::Transitioning,
            status_code: TRANSITIONING_CODE,
            message: message.into(),
            task_id: None,
            command_start_time_utc_ticks: None,
            snapshot_info: None,
        }
    }

    /// Record for a terminal outcome
    pub fn terminal(operation: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            status: code.status(),
            status_code: code.code(),
            message: message.into(),
            task_id: None,
            command_start_time_utc_ticks: None,
            snapshot_info: None,
        }
    }

    pub fn with_task(mut self, task_id: Option<&str>, ticks: Option<&str>) -> Self {
        self.task_id = task_id.map(String::from);
        self.command_start_time_utc_ticks = ticks.map(String::from);
        self
    }

    pub fn with_snapshot_info(mut self, info: Option<Vec<SnapshotInfo>>) -> Self {
        self.snapshot_info = info;
        self
    }
}

/// Envelope written to the status file and status blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub version: String,
    #[serde(rename = "timestampUTC")]
    pub timestamp_utc: String,
    pub status: StatusRecord,
}

impl StatusReport {
    pub fn new(record: StatusRecord, now: DateTime<Utc>) -> Self {
        Self {
            version: "1.0".to_string(),
            timestamp_utc: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            status: record,
        }
    }

    /// Serialize in the host's format: a one-element JSON array
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&[self])
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let mut reports: Vec<StatusReport> = serde_json::from_str(json)?;
        reports
            .pop()
            .ok_or_else(|| serde::de::Error::custom("status file contains no report"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_terminal_record_uses_code_status() {
        let record = StatusRecord::terminal("Enable", ErrorCode::FreezeFailure, "freeze failed");
        assert_eq!(record.status, StatusKind::Error);
        assert_eq!(record.status_code, 121);
    }

    #[test]
    fn test_report_json_shape() {
        let record = StatusRecord::terminal("Enable", ErrorCode::Success, "Enable Succeeded")
            .with_task(Some("task-1"), Some("636000000000000000"))
            .with_snapshot_info(Some(vec![SnapshotInfo {
                disk_id: "https://acct.blob.core.windows.net/vhds/os.vhd".to_string(),
                snapshot_id: Some("2016-01-01T00:00:00.0000000Z".to_string()),
                snapshot_uri: None,
                is_successful: true,
                error: None,
            }]));
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let json = StatusReport::new(record, now).to_json().unwrap();

        assert!(json.starts_with('['));
        assert!(json.contains("\"timestampUTC\":\"2024-01-02T03:04:05Z\""));
        assert!(json.contains("\"status\":\"success\""));
        assert!(json.contains("\"status_code\":0"));
        assert!(json.contains("\"taskId\":\"task-1\""));
        assert!(json.contains("\"commandStartTimeUTCTicks\":\"636000000000000000\""));
        assert!(json.contains("\"diskId\""));
        assert!(json.contains("\"isSuccessful\":true"));
    }

    #[test]
    fn test_status_kind_name_matches_wire_value() {
        for kind in [StatusKind::Transitioning, StatusKind::Success, StatusKind::Error] {
            let wire = serde_json::to_string(&kind).unwrap();
            assert_eq!(wire, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_snapshot_info_omitted_when_absent() {
        let record = StatusRecord::transitioning("Enable", "Transitioning state in enable");
        let json = StatusReport::new(record, Utc::now()).to_json().unwrap();
        assert!(!json.contains("snapshot_info"));
        assert!(json.contains("\"status\":\"transitioning\""));
        assert!(json.contains("\"status_code\":4"));
    }

    #[test]
    fn test_from_json() {
        let record = StatusRecord::terminal("Enable", ErrorCode::ParameterError, "bad input");
        let json = StatusReport::new(record.clone(), Utc::now()).to_json().unwrap();
        let parsed = StatusReport::from_json(&json).unwrap();
        assert_eq!(parsed.status, record);
    }
}
