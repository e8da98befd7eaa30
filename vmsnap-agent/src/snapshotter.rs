//! Storage-level disk snapshots
//!
//! Each disk is a page blob addressed by a SAS URI. A snapshot is requested
//! with `PUT <uri>&comp=snapshot`; storage answers with the snapshot id in the
//! `x-ms-snapshot` header.

use anyhow::{Result, bail};
use rayon::prelude::*;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_LENGTH;
use std::time::{Duration, Instant};

use crate::blob::{STORAGE_API_VERSION, http_client, with_query};
use vmsnap_common::{BackupRequest, DiskTarget, SnapshotInfo, format_error_list};

/// Per-request ceiling when no deadline applies
const SNAPSHOT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of snapshotting every disk of a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotResult {
    /// `(disk, error)` for every disk that was not snapshotted
    pub errors: Vec<(String, String)>,
    /// Per-disk metadata, in request order
    pub snapshots: Vec<SnapshotInfo>,
    /// Every disk failed
    pub all_failed: bool,
    /// Completion could not be confirmed before the deadline
    pub inconsistent: bool,
}

impl SnapshotResult {
    pub fn from_disks(snapshots: Vec<SnapshotInfo>, inconsistent: bool) -> Self {
        let errors: Vec<(String, String)> = snapshots
            .iter()
            .filter(|s| !s.is_successful)
            .map(|s| {
                (
                    s.disk_id.clone(),
                    s.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                )
            })
            .collect();
        let all_failed = !snapshots.is_empty() && errors.len() == snapshots.len();
        Self {
            errors,
            snapshots,
            all_failed,
            inconsistent,
        }
    }
}

impl std::fmt::Display for SnapshotResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} disks failed: {}",
            self.errors.len(),
            self.snapshots.len(),
            format_error_list(&self.errors)
        )
    }
}

/// Takes storage snapshots of a request's disks
pub trait Snapshotter: Send + Sync {
    /// Snapshot every disk. With a deadline the call must return by then,
    /// marking disks it could not finish as failed and the result inconsistent.
    /// `sequential` asks for one disk at a time.
    fn snapshot_all(
        &self,
        request: &BackupRequest,
        deadline: Option<Instant>,
        sequential: bool,
    ) -> Result<SnapshotResult>;
}

/// Snapshotter for blob-backed disks
pub struct BlobSnapshotter {
    client: Client,
}

enum DiskError {
    Deadline(String),
    Failed(String),
}

impl BlobSnapshotter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client(SNAPSHOT_REQUEST_TIMEOUT)?,
        })
    }

    fn snapshot_disk(
        &self,
        disk: &DiskTarget,
        metadata: &[(String, String)],
        deadline: Option<Instant>,
    ) -> std::result::Result<String, DiskError> {
        let timeout = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(DiskError::Deadline(
                        "deadline passed before the snapshot was requested".to_string(),
                    ));
                }
                remaining.min(SNAPSHOT_REQUEST_TIMEOUT)
            }
            None => SNAPSHOT_REQUEST_TIMEOUT,
        };

        let uri = with_query(&disk.blob_uri, "comp", "snapshot")
            .map_err(|e| DiskError::Failed(format!("invalid blob URI: {e:#}")))?;
        let mut request = self
            .client
            .put(uri)
            .timeout(timeout)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header(CONTENT_LENGTH, 0);
        for (key, value) in metadata {
            request = request.header(format!("x-ms-meta-{}", metadata_key(key)), value.as_str());
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                DiskError::Deadline(format!("snapshot request timed out: {e}"))
            } else {
                DiskError::Failed(format!("snapshot request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiskError::Failed(format!("storage returned HTTP {status}")));
        }

        response
            .headers()
            .get("x-ms-snapshot")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| DiskError::Failed("response carried no snapshot id".to_string()))
    }
}

impl Snapshotter for BlobSnapshotter {
    fn snapshot_all(
        &self,
        request: &BackupRequest,
        deadline: Option<Instant>,
        sequential: bool,
    ) -> Result<SnapshotResult> {
        if request.disks.is_empty() {
            bail!("request names no disks");
        }
        if sequential {
            log::info!("doseq set, snapshotting {} disk(s) one at a time", request.disks.len());
        }

        let outcomes: Vec<(SnapshotInfo, bool)> = map_disks(&request.disks, sequential, |disk| {
            let disk_id = disk.disk_id().to_string();
            match self.snapshot_disk(disk, &request.backup_metadata, deadline) {
                Ok(snapshot_id) => (succeeded(disk_id, snapshot_id), false),
                Err(DiskError::Deadline(error)) => (failed(disk_id, error), true),
                Err(DiskError::Failed(error)) => (failed(disk_id, error), false),
            }
        });

        let inconsistent = outcomes.iter().any(|(_, timed_out)| *timed_out);
        let snapshots = outcomes.into_iter().map(|(info, _)| info).collect();
        Ok(SnapshotResult::from_disks(snapshots, inconsistent))
    }
}

/// Apply `f` to every disk in request order, in parallel unless `sequential`
fn map_disks<T, F>(disks: &[DiskTarget], sequential: bool, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&DiskTarget) -> T + Sync + Send,
{
    if sequential {
        disks.iter().map(f).collect()
    } else {
        disks.par_iter().map(f).collect()
    }
}

fn succeeded(disk_id: String, snapshot_id: String) -> SnapshotInfo {
    let snapshot_uri = with_query(&disk_id, "snapshot", &snapshot_id).ok();
    SnapshotInfo {
        disk_id,
        snapshot_id: Some(snapshot_id),
        snapshot_uri,
        is_successful: true,
        error: None,
    }
}

fn failed(disk_id: String, error: String) -> SnapshotInfo {
    SnapshotInfo {
        disk_id,
        snapshot_id: None,
        snapshot_uri: None,
        is_successful: false,
        error: Some(error),
    }
}

/// Metadata names must be valid identifiers
fn metadata_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

/// Build a SnapshotInfo for a successful disk
#[cfg(test)]
pub fn succeeded_disk(disk_id: &str, snapshot_id: &str) -> SnapshotInfo {
    succeeded(disk_id.to_string(), snapshot_id.to_string())
}

#[cfg(test)]
pub fn failed_disk(disk_id: &str, error: &str) -> SnapshotInfo {
    failed(disk_id.to_string(), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_all_failed_requires_every_disk() {
        let partial = SnapshotResult::from_disks(
            vec![succeeded_disk("os", "t1"), failed_disk("data", "HTTP 403")],
            false,
        );
        assert_eq!(partial.errors, vec![("data".to_string(), "HTTP 403".to_string())]);
        assert!(!partial.all_failed);

        let total = SnapshotResult::from_disks(
            vec![failed_disk("os", "timeout"), failed_disk("data", "timeout")],
            true,
        );
        assert!(total.all_failed);
        assert!(total.inconsistent);

        let ok = SnapshotResult::from_disks(vec![succeeded_disk("os", "t1")], false);
        assert!(ok.errors.is_empty());
        assert!(!ok.all_failed);
    }

    #[test]
    fn test_metadata_key() {
        assert_eq!(metadata_key("vm-id"), "vm_id");
        assert_eq!(metadata_key("1st"), "_1st");
        assert_eq!(metadata_key("Backup_Tag"), "Backup_Tag");
    }

    #[test]
    fn test_snapshot_uri_has_no_credentials() {
        let info = succeeded_disk("https://a/c/os.vhd", "2024-01-01T00:00:00Z");
        assert_eq!(
            info.snapshot_uri.as_deref(),
            Some("https://a/c/os.vhd?snapshot=2024-01-01T00%3A00%3A00Z")
        );

        // A disk id that is not a URI still gets a successful record
        let bare = succeeded_disk("os", "t1");
        assert!(bare.is_successful);
        assert_eq!(bare.snapshot_uri, None);
    }

    fn disks(n: usize) -> Vec<DiskTarget> {
        (0..n)
            .map(|i| DiskTarget {
                blob_uri: format!("https://a/c/disk{i}.vhd?sig=x"),
            })
            .collect()
    }

    /// Runs `map_disks` with a body that sleeps, returning the highest number
    /// of bodies that were running at once and the visited disk ids
    fn track_overlap(sequential: bool) -> (usize, Vec<String>) {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let ids = map_disks(&disks(4), sequential, |disk| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            active.fetch_sub(1, Ordering::SeqCst);
            disk.disk_id().to_string()
        });
        (peak.load(Ordering::SeqCst), ids)
    }

    #[test]
    fn test_sequential_disks_never_overlap() {
        let (peak, ids) = track_overlap(true);
        assert_eq!(peak, 1);
        assert_eq!(
            ids,
            vec![
                "https://a/c/disk0.vhd",
                "https://a/c/disk1.vhd",
                "https://a/c/disk2.vhd",
                "https://a/c/disk3.vhd",
            ]
        );
    }

    #[test]
    fn test_parallel_disks_keep_request_order() {
        let (_, ids) = track_overlap(false);
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[0], "https://a/c/disk0.vhd");
        assert_eq!(ids[3], "https://a/c/disk3.vhd");
    }

    #[test]
    fn test_expired_deadline_fails_without_network() {
        let snapshotter = BlobSnapshotter::new().unwrap();
        let disk = DiskTarget {
            blob_uri: "https://127.0.0.1:9/c/os.vhd?sig=x".to_string(),
        };
        let past = Instant::now() - Duration::from_millis(1);
        match snapshotter.snapshot_disk(&disk, &[], Some(past)) {
            Err(DiskError::Deadline(_)) => {}
            _ => panic!("expected deadline error"),
        }
    }
}
