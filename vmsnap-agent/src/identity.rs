//! Request admission
//!
//! Three small persisted tokens decide whether a request may start a backup:
//! the last task id (duplicate delivery), the machine identity (restore or
//! clone of the VM) and the last sequence number (stale or replayed requests).
//! Rejections leave no trace besides a log line.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use vmsnap_common::request::MAX_COMMAND_AGE_MINUTES;
use vmsnap_common::validation::validate_token;
use vmsnap_common::{RequestHeader, write_atomic};

/// Sequence value stored after a restore/clone, below any real sequence number
pub const RESET_SEQUENCE: i64 = -1;

/// A single-line persisted token
#[derive(Debug, Clone)]
struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    fn read(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let value = contents.trim();
                Ok((!value.is_empty()).then(|| value.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    fn write(&self, value: &str) -> Result<()> {
        validate_token(value).map_err(|e| anyhow::anyhow!("Refusing to store token: {e}"))?;
        write_atomic(&self.path, value.as_bytes())
    }
}

/// Persisted identity and sequence tokens
#[derive(Debug, Clone)]
pub struct StateStore {
    task: TokenFile,
    machine: TokenFile,
    sequence: TokenFile,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            task: TokenFile {
                path: state_dir.join("taskidentity"),
            },
            machine: TokenFile {
                path: state_dir.join("machineidentity"),
            },
            sequence: TokenFile {
                path: state_dir.join("mrseq"),
            },
        }
    }

    pub fn last_task_id(&self) -> Result<Option<String>> {
        self.task.read()
    }

    pub fn save_task_id(&self, task_id: &str) -> Result<()> {
        self.task.write(task_id)
    }

    pub fn machine_identity(&self) -> Result<Option<String>> {
        self.machine.read()
    }

    pub fn save_machine_identity(&self, identity: &str) -> Result<()> {
        self.machine.write(identity)
    }

    pub fn last_sequence(&self) -> Result<Option<i64>> {
        match self.sequence.read()? {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .with_context(|| format!("Corrupt sequence token: {raw}")),
            None => Ok(None),
        }
    }

    pub fn save_sequence(&self, sequence: i64) -> Result<()> {
        self.sequence.write(&sequence.to_string())
    }
}

/// Source of the current machine identity
pub trait MachineIdSource {
    fn current_identity(&self) -> Result<String>;
}

/// Identity derived from the DMI product UUID, or /etc/machine-id when the
/// firmware does not expose one. Hashed so the raw id never lands on disk.
pub struct DmiMachineId {
    candidates: Vec<PathBuf>,
}

impl DmiMachineId {
    pub fn new() -> Self {
        Self {
            candidates: vec![
                PathBuf::from("/sys/class/dmi/id/product_uuid"),
                PathBuf::from("/etc/machine-id"),
            ],
        }
    }
}

impl Default for DmiMachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineIdSource for DmiMachineId {
    fn current_identity(&self) -> Result<String> {
        for path in &self.candidates {
            if let Ok(raw) = std::fs::read_to_string(path) {
                let raw = raw.trim();
                if !raw.is_empty() {
                    let digest = Sha256::digest(raw.to_lowercase().as_bytes());
                    return Ok(digest.iter().map(|b| format!("{b:02x}")).collect());
                }
            }
        }
        anyhow::bail!("No machine identity source is readable")
    }
}

/// Why a request was or was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Same task id as the last admitted request
    DuplicateTask(String),
    /// Sequence number not above the stored one
    StaleSequence { incoming: i64, stored: i64 },
    /// Command was issued too long ago (or in the future)
    ExpiredCommand,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

impl std::fmt::Display for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Admission::Admitted => write!(f, "admitted"),
            Admission::DuplicateTask(task_id) => write!(f, "duplicate task {task_id}"),
            Admission::StaleSequence { incoming, stored } => {
                write!(f, "sequence {incoming} is not newer than {stored}")
            }
            Admission::ExpiredCommand => write!(
                f,
                "command issued more than {MAX_COMMAND_AGE_MINUTES} minutes away from now"
            ),
        }
    }
}

pub struct IdentityGuard<'a> {
    store: &'a StateStore,
    machine: &'a dyn MachineIdSource,
}

impl<'a> IdentityGuard<'a> {
    pub fn new(store: &'a StateStore, machine: &'a dyn MachineIdSource) -> Self {
        Self { store, machine }
    }

    /// Decide whether `header` may start a backup, persisting the new
    /// sequence number and task id when it may.
    pub fn admit(&self, header: &RequestHeader, now: DateTime<Utc>) -> Result<Admission> {
        if let Some(task_id) = header.task_id.as_deref() {
            if self.store.last_task_id()?.as_deref() == Some(task_id) {
                log::info!("TaskId is same as last, so skip: {task_id}");
                return Ok(Admission::DuplicateTask(task_id.to_string()));
            }
        }

        self.check_machine_identity()?;

        let stored = self.store.last_sequence()?;
        if let Some(stored) = stored {
            if header.sequence <= stored {
                log::info!(
                    "Sequence {} is not newer than the last processed {}, skipping",
                    header.sequence,
                    stored
                );
                return Ok(Admission::StaleSequence {
                    incoming: header.sequence,
                    stored,
                });
            }
        }
        self.store.save_sequence(header.sequence)?;

        if header.is_stale_at(now) {
            log::info!("the call time stamp is out of date, so skip it");
            return Ok(Admission::ExpiredCommand);
        }

        if let Some(task_id) = header.task_id.as_deref() {
            self.store.save_task_id(task_id)?;
        }

        Ok(Admission::Admitted)
    }

    fn check_machine_identity(&self) -> Result<()> {
        let current = match self.machine.current_identity() {
            Ok(current) => current,
            Err(e) => {
                // Without an identity restores cannot be detected; the
                // sequence check still applies.
                log::warn!("Cannot determine machine identity: {e:#}");
                return Ok(());
            }
        };

        match self.store.machine_identity()? {
            None => self.store.save_machine_identity(&current),
            Some(stored) if stored == current => Ok(()),
            Some(stored) => {
                log::info!(
                    "machine identity changed ({stored} -> {current}), resetting sequence to {RESET_SEQUENCE}"
                );
                self.store.save_sequence(RESET_SEQUENCE)?;
                self.store.save_machine_identity(&current)
            }
        }
    }
}
