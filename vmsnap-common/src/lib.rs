// Shared types and utilities for vmsnap

pub mod config;
pub mod error_code;
pub mod format;
pub mod request;
pub mod snapshot_config;
pub mod status;
pub mod validation;

pub use config::AgentConfig;
pub use error_code::{ErrorCode, TRANSITIONING_CODE};
pub use format::{format_elapsed, format_error_list};
pub use request::{
    BackupRequest, DiskTarget, HandlerSettings, ParameterError, RequestCommand, RequestHeader,
    SettingsMap,
};
pub use snapshot_config::{SnapshotThreadConfig, set_do_seq_flag, write_atomic};
pub use status::{SnapshotInfo, StatusKind, StatusRecord, StatusReport};

/// Name the agent reports itself under
pub const EXTENSION_NAME: &str = "VMSnapshotLinux";

/// Operation names used in status records
pub const OPERATION_ENABLE: &str = "Enable";
pub const OPERATION_INSTALL: &str = "Install";
pub const OPERATION_UNINSTALL: &str = "Uninstall";
pub const OPERATION_DISABLE: &str = "Disable";
pub const OPERATION_UPDATE: &str = "Update";
