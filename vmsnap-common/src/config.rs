// Centralized filesystem locations for the agent

use std::path::{Path, PathBuf};

use crate::validation::{ValidationError, ValidationResult, validate_config_path};

/// Agent locations with support for environment variable overrides
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory where the host drops `<seq>.settings` files
    pub config_dir: PathBuf,

    /// Directory where `<seq>.status` files are written
    pub status_dir: PathBuf,

    /// Directory holding persisted identity and sequence tokens
    pub state_dir: PathBuf,

    /// Snapshot thread configuration (default: /etc/vmsnap/vmbackup.conf)
    pub conf_file: PathBuf,

    /// Directory for the local run log when no logs endpoint is given
    pub log_dir: PathBuf,

    /// Filesystem table watched by vmsnap-watcher
    pub fstab: PathBuf,

    /// Seconds between fstab checks
    pub fstab_poll_secs: u64,

    /// Minimum age of an fstab change before it is validated
    pub fstab_settle_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/var/lib/vmsnap/config"),
            status_dir: PathBuf::from("/var/lib/vmsnap/status"),
            state_dir: PathBuf::from("/var/lib/vmsnap/state"),
            conf_file: PathBuf::from("/etc/vmsnap/vmbackup.conf"),
            log_dir: PathBuf::from("/var/log/vmsnap"),
            fstab: PathBuf::from("/etc/fstab"),
            fstab_poll_secs: 5 * 60,
            fstab_settle_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Create a new configuration with environment variable overrides
    ///
    /// Supported environment variables:
    /// - VMSNAP_CONFIG_DIR: Override settings directory
    /// - VMSNAP_STATUS_DIR: Override status directory
    /// - VMSNAP_STATE_DIR: Override persisted state directory
    /// - VMSNAP_CONF_FILE: Override snapshot thread configuration file
    /// - VMSNAP_LOG_DIR: Override local run log directory
    /// - VMSNAP_FSTAB: Override the watched filesystem table
    pub fn new() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("VMSNAP_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("VMSNAP_STATUS_DIR") {
            config.status_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("VMSNAP_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }

        if let Ok(file) = std::env::var("VMSNAP_CONF_FILE") {
            config.conf_file = PathBuf::from(file);
        }

        if let Ok(dir) = std::env::var("VMSNAP_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if let Ok(file) = std::env::var("VMSNAP_FSTAB") {
            config.fstab = PathBuf::from(file);
        }

        config
    }

    /// Build a configuration rooted under a single directory (used by tests
    /// and by hosts that keep all agent state in one place)
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            status_dir: root.join("status"),
            state_dir: root.join("state"),
            conf_file: root.join("vmbackup.conf"),
            log_dir: root.join("log"),
            fstab: root.join("fstab"),
            ..Self::default()
        }
    }

    /// Path of the status file for a given sequence number
    pub fn status_file(&self, sequence: i64) -> PathBuf {
        self.status_dir.join(format!("{sequence}.status"))
    }

    /// Path of the local run log
    pub fn local_log_file(&self) -> PathBuf {
        self.log_dir.join("vmsnap-run.log")
    }

    pub fn validate(&self) -> ValidationResult {
        let errors: Vec<ValidationError> = [
            ("config_dir", &self.config_dir),
            ("status_dir", &self.status_dir),
            ("state_dir", &self.state_dir),
            ("conf_file", &self.conf_file),
            ("log_dir", &self.log_dir),
            ("fstab", &self.fstab),
        ]
        .into_iter()
        .filter_map(|(field, path)| {
            validate_config_path(path)
                .err()
                .map(|message| ValidationError::new(field, message))
        })
        .collect();

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
