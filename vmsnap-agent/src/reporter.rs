//! Status reporting
//!
//! Every record goes to the local status file first. If the request named a
//! status blob the same bytes are uploaded there too; upload failures are
//! warnings and never change the outcome of the run. Each write replaces the
//! whole record, so repeating a report leaves the same content behind.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::blob::BlobWriter;
use vmsnap_common::{RequestHeader, StatusRecord, StatusReport, write_atomic};

/// A place status reports are written to
pub trait StatusSink {
    fn name(&self) -> &str;
    fn write(&self, report_json: &str) -> Result<()>;
}

/// `<status_dir>/<seq>.status`
pub struct LocalStatusFile {
    path: PathBuf,
}

impl LocalStatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StatusSink for LocalStatusFile {
    fn name(&self) -> &str {
        "status file"
    }

    fn write(&self, report_json: &str) -> Result<()> {
        write_atomic(&self.path, report_json.as_bytes())
    }
}

/// Status blob named by the request
pub struct BlobStatusSink {
    writer: BlobWriter,
    uri: String,
}

impl BlobStatusSink {
    pub fn new(writer: BlobWriter, uri: String) -> Self {
        Self { writer, uri }
    }
}

impl StatusSink for BlobStatusSink {
    fn name(&self) -> &str {
        "status blob"
    }

    fn write(&self, report_json: &str) -> Result<()> {
        self.writer
            .put_block_blob(&self.uri, report_json.as_bytes(), "application/json")
    }
}

pub struct StatusReporter {
    task_id: Option<String>,
    command_start_ticks: Option<String>,
    local: Box<dyn StatusSink>,
    remote: Option<Box<dyn StatusSink>>,
}

impl StatusReporter {
    pub fn new(header: &RequestHeader, local: Box<dyn StatusSink>, remote: Option<Box<dyn StatusSink>>) -> Self {
        Self {
            task_id: header.task_id.clone(),
            command_start_ticks: header.command_start_ticks.clone(),
            local,
            remote,
        }
    }

    pub fn report(&self, record: StatusRecord) -> Result<()> {
        self.report_at(record, Utc::now())
    }

    /// Write `record` stamped with `now`.
    ///
    /// Only a local write failure is returned; remote failures are logged.
    pub fn report_at(&self, record: StatusRecord, now: DateTime<Utc>) -> Result<()> {
        let record = record.with_task(self.task_id.as_deref(), self.command_start_ticks.as_deref());
        log::info!(
            "{} status {} ({})",
            record.operation,
            record.status.as_str(),
            record.status_code
        );
        let json = StatusReport::new(record, now).to_json()?;

        let local = self.local.write(&json);
        if let Err(e) = &local {
            log::error!("cannot write status to the {}: {e:#}", self.local.name());
        }

        if let Some(remote) = &self.remote {
            match remote.write(&json) {
                Ok(()) => log::info!("status report uploaded to the {}", remote.name()),
                Err(e) => log::warn!("cannot write status to the {}: {e:#}", remote.name()),
            }
        }

        local
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;
    use chrono::TimeZone;
    use vmsnap_common::{ErrorCode, StatusKind};

    fn header() -> RequestHeader {
        RequestHeader {
            sequence: 3,
            task_id: Some("task-9".to_string()),
            command_start_ticks: Some("635556672000000000".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_report_stamps_task_fields() {
        let local = MemorySink::default();
        let reporter = StatusReporter::new(&header(), Box::new(local.clone()), None);
        reporter
            .report(StatusRecord::terminal("Enable", ErrorCode::Success, "Enable Succeeded"))
            .unwrap();

        let records = local.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id.as_deref(), Some("task-9"));
        assert_eq!(records[0].status, StatusKind::Success);
    }

    #[test]
    fn test_remote_failure_is_swallowed() {
        let local = MemorySink::default();
        let reporter = StatusReporter::new(
            &header(),
            Box::new(local.clone()),
            Some(Box::new(MemorySink::failing())),
        );
        let result = reporter.report(StatusRecord::terminal(
            "Enable",
            ErrorCode::FreezeFailure,
            "freeze failed",
        ));
        assert!(result.is_ok());
        assert_eq!(local.records()[0].status_code, 121);
    }

    #[test]
    fn test_local_failure_is_returned_but_remote_still_written() {
        let remote = MemorySink::default();
        let reporter = StatusReporter::new(
            &header(),
            Box::new(MemorySink::failing()),
            Some(Box::new(remote.clone())),
        );
        let result = reporter.report(StatusRecord::transitioning("Enable", "Transitioning"));
        assert!(result.is_err());
        assert_eq!(remote.records().len(), 1);
    }

    #[test]
    fn test_repeated_report_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status").join("3.status");
        let reporter = StatusReporter::new(&header(), Box::new(LocalStatusFile::new(path.clone())), None);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = StatusRecord::terminal("Enable", ErrorCode::SnapshotFailurePartial, "partial");

        reporter.report_at(record.clone(), now).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        reporter.report_at(record, now).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        let parsed = StatusReport::from_json(&second).unwrap();
        assert_eq!(parsed.status.status_code, 761);
    }
}
