//! Snapshot thread configuration
//!
//! Sectioned TOML file read at the start of every daemon run:
//!
//! ```toml
//! [SnapshotThread]
//! timeout = 60
//! safefreeze = true
//! doseq = 1
//! ```
//!
//! Files written as `key: value` lines by older agents are read too, and
//! flag values may be booleans, integers or strings (`1`, `False`, `yes`).

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::validation::validate_timeout;

/// Name of the section holding snapshot settings
pub const SECTION: &str = "SnapshotThread";

/// Default freeze-hold timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfFile {
    #[serde(rename = "SnapshotThread", default)]
    snapshot_thread: SnapshotThreadConfig,
}

/// Options in the `[SnapshotThread]` section
///
/// A value that cannot be understood is dropped with a warning; the other
/// options are still read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotThreadConfig {
    /// Freeze-hold timeout in seconds
    #[serde(default, deserialize_with = "lenient_secs")]
    pub timeout: Option<u64>,

    /// Pass the deadline into the snapshot call instead of supervising a worker
    #[serde(default, deserialize_with = "lenient_flag")]
    pub safefreeze: Option<bool>,

    /// Set after an inconsistent freeze/thaw cycle; snapshots disks one at a time
    #[serde(default, deserialize_with = "lenient_flag")]
    pub doseq: Option<bool>,
}

/// Any value a hand-edited or legacy file may carry
#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    let flag = match Option::<RawValue>::deserialize(deserializer)? {
        None => None,
        Some(RawValue::Bool(b)) => Some(b),
        Some(RawValue::Int(i)) => Some(i != 0),
        Some(RawValue::Text(text)) => parse_flag(&text),
        Some(RawValue::Other(_)) => None,
    };
    Ok(flag)
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("Ignoring unrecognised flag value {other:?}");
            None
        }
    }
}

fn lenient_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let secs = match Option::<RawValue>::deserialize(deserializer)? {
        Some(RawValue::Int(i)) => u64::try_from(i).ok(),
        Some(RawValue::Text(text)) => text.trim().parse().ok(),
        _ => None,
    };
    Ok(secs)
}

/// Read a config file as TOML, falling back to `key: value` lines
fn read_table(path: &Path) -> anyhow::Result<toml::Table> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match toml::from_str::<toml::Table>(&contents) {
        Ok(table) => Ok(table),
        Err(e) => {
            log::debug!(
                "{} is not TOML ({}), reading it as key: value lines",
                path.display(),
                e.message()
            );
            Ok(parse_ini(&contents))
        }
    }
}

/// Sections of `key = value` / `key: value` lines, values kept as strings.
/// Keys before the first section header are ignored.
fn parse_ini(contents: &str) -> toml::Table {
    let mut table = toml::Table::new();
    let mut section: Option<String> = None;

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            table
                .entry(name.clone())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            section = Some(name);
            continue;
        }
        let Some(name) = section.as_ref() else {
            continue;
        };
        let Some((key, value)) = line.split_once(['=', ':']) else {
            continue;
        };
        if let Some(toml::Value::Table(entries)) = table.get_mut(name) {
            entries.insert(
                key.trim().to_string(),
                toml::Value::String(value.trim().to_string()),
            );
        }
    }
    table
}

impl SnapshotThreadConfig {
    /// Load configuration from file. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let file: ConfFile = toml::Value::Table(read_table(path)?)
            .try_into()
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(file.snapshot_thread)
    }

    /// Load configuration, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("cannot read config file or file not present: {e:#}");
                Self::default()
            }
        }
    }

    /// Effective freeze-hold timeout
    pub fn timeout(&self) -> Duration {
        let secs = match self.timeout {
            Some(secs) => match validate_timeout(secs) {
                Ok(()) => secs,
                Err(e) => {
                    log::warn!("Ignoring configured timeout {secs}: {e}");
                    DEFAULT_TIMEOUT_SECS
                }
            },
            None => DEFAULT_TIMEOUT_SECS,
        };
        Duration::from_secs(secs)
    }

    /// Whether the synchronous (deadline-in-call) mode is selected
    pub fn safe_freeze(&self) -> bool {
        self.safefreeze.unwrap_or(true)
    }

    pub fn do_seq(&self) -> bool {
        self.doseq.unwrap_or(false)
    }
}

/// Persist `doseq = 1` in the configuration file
///
/// Other keys and sections in the file are preserved; a legacy `key: value`
/// file is rewritten as TOML. Setting the flag when it is already on leaves
/// the file untouched.
pub fn set_do_seq_flag(path: &Path) -> anyhow::Result<()> {
    let mut table = if path.exists() {
        read_table(path)?
    } else {
        toml::Table::new()
    };

    let section = table
        .entry(SECTION)
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    if !section.is_table() {
        log::warn!("{SECTION} in {} is not a section, replacing it", path.display());
        *section = toml::Value::Table(toml::Table::new());
    }
    let Some(section) = section.as_table_mut() else {
        anyhow::bail!("{SECTION} is not a table in {}", path.display());
    };

    let already_set = section
        .get("doseq")
        .cloned()
        .and_then(|value| lenient_flag(value).ok().flatten())
        .unwrap_or(false);
    if already_set {
        return Ok(());
    }
    section.insert("doseq".to_string(), toml::Value::Integer(1));

    let contents = toml::to_string_pretty(&table).context("Failed to serialize configuration")?;
    write_atomic(path, contents.as_bytes())
}

/// Write a file by renaming a sibling temp file over it
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SnapshotThreadConfig::load(&dir.path().join("absent.conf")).unwrap();
        assert_eq!(config, SnapshotThreadConfig::default());
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert!(config.safe_freeze());
        assert!(!config.do_seq());
    }

    #[test]
    fn test_load_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.conf");
        std::fs::write(&path, "[SnapshotThread]\ntimeout = 120\nsafefreeze = false\n").unwrap();

        let config = SnapshotThreadConfig::load(&path).unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(120));
        assert!(!config.safe_freeze());
    }

    #[test]
    fn test_out_of_range_timeout_uses_default() {
        let config = SnapshotThreadConfig {
            timeout: Some(0),
            ..Default::default()
        };
        assert_eq!(config.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn test_load_or_default_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.conf");
        std::fs::write(&path, "this is = = not toml").unwrap();
        assert_eq!(SnapshotThreadConfig::load_or_default(&path), SnapshotThreadConfig::default());
    }

    #[test]
    fn test_set_do_seq_flag_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("vmbackup.conf");

        set_do_seq_flag(&path).unwrap();
        let config = SnapshotThreadConfig::load(&path).unwrap();
        assert!(config.do_seq());
    }

    #[test]
    fn test_set_do_seq_flag_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.conf");
        std::fs::write(&path, "[SnapshotThread]\ntimeout = 30\n\n[Other]\nkey = \"v\"\n").unwrap();

        set_do_seq_flag(&path).unwrap();
        set_do_seq_flag(&path).unwrap();

        let config = SnapshotThreadConfig::load(&path).unwrap();
        assert!(config.do_seq());
        assert_eq!(config.timeout, Some(30));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[Other]"));
    }

    #[test]
    fn test_flags_accept_integers_and_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.conf");
        std::fs::write(&path, "[SnapshotThread]\ntimeout = 30\nsafefreeze = 0\ndoseq = \"yes\"\n").unwrap();

        let config = SnapshotThreadConfig::load(&path).unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(!config.safe_freeze());
        assert!(config.do_seq());
    }

    #[test]
    fn test_unknown_flag_value_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.conf");
        std::fs::write(&path, "[SnapshotThread]\ntimeout = 45\nsafefreeze = \"maybe\"\n").unwrap();

        let config = SnapshotThreadConfig::load(&path).unwrap();
        assert_eq!(config.timeout, Some(45));
        assert_eq!(config.safefreeze, None);
        assert!(config.safe_freeze());
    }

    #[test]
    fn test_reads_key_colon_value_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.conf");
        std::fs::write(&path, "[SnapshotThread]\ntimeout: 30\nsafefreeze: False\ndoseq: 1").unwrap();

        let config = SnapshotThreadConfig::load(&path).unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(!config.safe_freeze());
        assert!(config.do_seq());
    }

    #[test]
    fn test_set_do_seq_flag_rewrites_key_colon_value_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.conf");
        std::fs::write(&path, "[SnapshotThread]\ntimeout: 30\nsafefreeze: False\n").unwrap();

        set_do_seq_flag(&path).unwrap();

        let config = SnapshotThreadConfig::load(&path).unwrap();
        assert!(config.do_seq());
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(!config.safe_freeze());
        assert!(toml::from_str::<toml::Table>(&std::fs::read_to_string(&path).unwrap()).is_ok());
    }

    #[test]
    fn test_set_do_seq_flag_keeps_legacy_on_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmbackup.conf");
        let legacy = "[SnapshotThread]\ndoseq: 1";
        std::fs::write(&path, legacy).unwrap();

        set_do_seq_flag(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), legacy);
    }
}
