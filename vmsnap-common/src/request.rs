//! Backup request model
//!
//! The host hands the agent a settings file with a public and a protected
//! key/value group. Everything the agent needs is pulled out of those maps
//! once, here, and carried as typed fields afterwards.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::validation::validate_blob_uri;

/// Command that installs the agent through the request payload
pub const INSTALL_COMMAND: &str = "install";
/// Command that requests a backup snapshot
pub const SNAPSHOT_COMMAND: &str = "snapshot";

/// Requests issued longer ago (or further in the future) than this are dropped
pub const MAX_COMMAND_AGE_MINUTES: i64 = 150;

/// Flat key/value view of one settings group
pub type SettingsMap = BTreeMap<String, String>;

/// Problems found while validating a request
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("settings file is malformed: {0}")]
    MalformedSettings(String),

    #[error("required field empty or not correct: {0}")]
    MissingField(&'static str),

    #[error("command is not correct: {0}")]
    UnknownCommand(String),

    #[error("field {field} could not be decoded: {reason}")]
    InvalidObject { field: &'static str, reason: String },

    #[error("invalid disk uri: {0}")]
    InvalidUri(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    runtime_settings: Vec<RuntimeSettings>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeSettings {
    handler_settings: RawHandlerSettings,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHandlerSettings {
    #[serde(default)]
    public_settings: Option<Value>,
    #[serde(default)]
    protected_settings: Option<Value>,
}

/// Both settings groups of one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerSettings {
    pub public: SettingsMap,
    pub protected: SettingsMap,
}

impl HandlerSettings {
    /// Parse a `<seq>.settings` file
    pub fn from_json(json: &str) -> Result<Self, ParameterError> {
        let file: SettingsFile = serde_json::from_str(json)
            .map_err(|e| ParameterError::MalformedSettings(e.to_string()))?;
        let runtime = file
            .runtime_settings
            .into_iter()
            .next()
            .ok_or_else(|| ParameterError::MalformedSettings("no runtimeSettings entry".into()))?;

        let public = match runtime.handler_settings.public_settings {
            Some(value) => settings_map(value, "publicSettings")?,
            None => SettingsMap::new(),
        };
        let protected = match runtime.handler_settings.protected_settings {
            Some(value) => settings_map(value, "protectedSettings")?,
            None => SettingsMap::new(),
        };

        Ok(Self { public, protected })
    }

    /// Look a key up in the protected group first, then the public one.
    /// Empty values count as absent.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.protected
            .get(key)
            .or_else(|| self.public.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Fields needed for admission and reporting, available even when the
    /// rest of the request is invalid
    pub fn header(&self, sequence: i64) -> RequestHeader {
        RequestHeader {
            sequence,
            command: self.public.get("commandToExecute").cloned(),
            task_id: self.lookup("taskId").map(String::from),
            command_start_ticks: self.lookup("commandStartTimeUTCTicks").map(String::from),
            status_blob_uri: self.lookup("statusBlobUri").map(String::from),
            logs_blob_uri: self.lookup("logsBlobUri").map(String::from),
        }
    }
}

fn settings_map(value: Value, field: &'static str) -> Result<SettingsMap, ParameterError> {
    let value = match value {
        Value::String(encoded) if encoded.is_empty() => return Ok(SettingsMap::new()),
        Value::String(encoded) => decode_object(&encoded, field)?,
        other => other,
    };

    match value {
        Value::Object(entries) => Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::Null => None,
                Value::String(s) => Some((key, s)),
                other => Some((key, other.to_string())),
            })
            .collect()),
        Value::Null => Ok(SettingsMap::new()),
        _ => Err(ParameterError::InvalidObject {
            field,
            reason: "expected a JSON object".into(),
        }),
    }
}

fn decode_object(encoded: &str, field: &'static str) -> Result<Value, ParameterError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ParameterError::InvalidObject { field, reason: e.to_string() })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ParameterError::InvalidObject { field, reason: e.to_string() })
}

/// Request fields that never fail to parse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeader {
    /// Sequence number taken from the settings file name
    pub sequence: i64,
    pub command: Option<String>,
    pub task_id: Option<String>,
    /// .NET UTC ticks (100ns units since 0001-01-01) as sent by the host
    pub command_start_ticks: Option<String>,
    pub status_blob_uri: Option<String>,
    pub logs_blob_uri: Option<String>,
}

impl RequestHeader {
    pub fn command_start_time(&self) -> Option<DateTime<Utc>> {
        let ticks = self.command_start_ticks.as_deref()?.trim().parse::<i64>().ok()?;
        ticks_to_datetime(ticks)
    }

    /// True when the command was issued too far from `now` to be trusted
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match self.command_start_time() {
            Some(issued) => (now - issued).num_minutes().abs() > MAX_COMMAND_AGE_MINUTES,
            None => false,
        }
    }
}

/// Convert .NET ticks to a UTC timestamp
pub fn ticks_to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks < 0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1, 1, 1)?.and_hms_opt(0, 0, 0)?;
    let at = epoch.checked_add_signed(Duration::microseconds(ticks / 10))?;
    Some(at.and_utc())
}

/// What the request asks the agent to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCommand {
    Install,
    Snapshot,
}

impl RequestCommand {
    pub fn parse(command: &str) -> Result<Self, ParameterError> {
        match command.trim().to_lowercase().as_str() {
            INSTALL_COMMAND => Ok(Self::Install),
            SNAPSHOT_COMMAND => Ok(Self::Snapshot),
            _ => Err(ParameterError::UnknownCommand(command.to_string())),
        }
    }
}

/// One disk to snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTarget {
    /// Blob URI including its SAS query string
    pub blob_uri: String,
}

impl DiskTarget {
    /// URI without credentials, safe to log and report
    pub fn disk_id(&self) -> &str {
        self.blob_uri
            .split_once('?')
            .map(|(base, _)| base)
            .unwrap_or(&self.blob_uri)
    }
}

/// A validated backup request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub header: RequestHeader,
    pub command: RequestCommand,
    pub disks: Vec<DiskTarget>,
    pub backup_metadata: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct PublicObject {
    #[serde(rename = "backupMetadata", default)]
    backup_metadata: Option<Vec<MetadataEntry>>,
}

#[derive(Deserialize)]
struct MetadataEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Deserialize)]
struct ProtectedObject {
    #[serde(rename = "blobSASUri", default)]
    blob_sas_uri: Option<Vec<String>>,
}

impl BackupRequest {
    pub fn from_settings(settings: &HandlerSettings, sequence: i64) -> Result<Self, ParameterError> {
        let header = settings.header(sequence);
        let command = header
            .command
            .as_deref()
            .ok_or(ParameterError::MissingField("commandToExecute"))
            .and_then(RequestCommand::parse)?;

        if command == RequestCommand::Install {
            return Ok(Self {
                header,
                command,
                disks: Vec::new(),
                backup_metadata: Vec::new(),
            });
        }

        let public_object: PublicObject = decode_field(settings.public.get("objectStr"), "public objectStr")?;
        let protected_object: ProtectedObject =
            decode_field(settings.protected.get("objectStr"), "protected objectStr")?;

        let backup_metadata = public_object
            .backup_metadata
            .ok_or(ParameterError::MissingField("backupMetadata"))?
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();

        let uris = protected_object
            .blob_sas_uri
            .filter(|uris| !uris.is_empty())
            .ok_or(ParameterError::MissingField("blobSASUri"))?;

        let mut disks = Vec::with_capacity(uris.len());
        for uri in uris {
            validate_blob_uri(&uri).map_err(|reason| {
                ParameterError::InvalidUri(format!("{}: {reason}", DiskTarget { blob_uri: uri.clone() }.disk_id()))
            })?;
            disks.push(DiskTarget { blob_uri: uri });
        }

        Ok(Self {
            header,
            command,
            disks,
            backup_metadata,
        })
    }
}

fn decode_field<T: serde::de::DeserializeOwned>(
    raw: Option<&String>,
    field: &'static str,
) -> Result<T, ParameterError> {
    let raw = raw
        .filter(|s| !s.is_empty())
        .ok_or(ParameterError::MissingField(field))?;
    let value = decode_object(raw, field)?;
    serde_json::from_value(value).map_err(|e| ParameterError::InvalidObject {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn encode(value: serde_json::Value) -> String {
        STANDARD.encode(value.to_string())
    }

    fn settings_json(command: &str) -> String {
        let public_obj = encode(serde_json::json!({
            "backupMetadata": [{"Key": "vmid", "Value": "abc"}]
        }));
        let protected_obj = encode(serde_json::json!({
            "blobSASUri": [
                "https://acct.blob.core.windows.net/vhds/os.vhd?sig=secret",
                "https://acct.blob.core.windows.net/vhds/data.vhd?sig=secret"
            ]
        }));
        serde_json::json!({
            "runtimeSettings": [{
                "handlerSettings": {
                    "publicSettings": {
                        "commandToExecute": command,
                        "objectStr": public_obj
                    },
                    "protectedSettings": {
                        "taskId": "task-42",
                        "commandStartTimeUTCTicks": "635000000000000000",
                        "statusBlobUri": "https://acct.blob.core.windows.net/status/s.json?sig=x",
                        "logsBlobUri": "",
                        "objectStr": protected_obj
                    }
                }
            }]
        })
        .to_string()
    }

    #[test]
    fn test_parse_snapshot_request() {
        let settings = HandlerSettings::from_json(&settings_json("Snapshot")).unwrap();
        let request = BackupRequest::from_settings(&settings, 7).unwrap();

        assert_eq!(request.command, RequestCommand::Snapshot);
        assert_eq!(request.header.sequence, 7);
        assert_eq!(request.header.task_id.as_deref(), Some("task-42"));
        assert!(request.header.status_blob_uri.is_some());
        // Empty values are treated as absent
        assert!(request.header.logs_blob_uri.is_none());
        assert_eq!(request.disks.len(), 2);
        assert_eq!(
            request.disks[0].disk_id(),
            "https://acct.blob.core.windows.net/vhds/os.vhd"
        );
        assert_eq!(request.backup_metadata, vec![("vmid".to_string(), "abc".to_string())]);
    }

    #[test]
    fn test_install_command_needs_no_disks() {
        let json = serde_json::json!({
            "runtimeSettings": [{"handlerSettings": {"publicSettings": {"commandToExecute": "Install"}}}]
        })
        .to_string();
        let settings = HandlerSettings::from_json(&json).unwrap();
        let request = BackupRequest::from_settings(&settings, 1).unwrap();
        assert_eq!(request.command, RequestCommand::Install);
        assert!(request.disks.is_empty());
    }

    #[test]
    fn test_unknown_command() {
        let settings = HandlerSettings::from_json(&settings_json("reboot")).unwrap();
        let err = BackupRequest::from_settings(&settings, 1).unwrap_err();
        assert_eq!(err, ParameterError::UnknownCommand("reboot".to_string()));
    }

    #[test]
    fn test_missing_protected_object() {
        let json = serde_json::json!({
            "runtimeSettings": [{"handlerSettings": {"publicSettings": {
                "commandToExecute": "snapshot",
                "objectStr": encode(serde_json::json!({"backupMetadata": []}))
            }}}]
        })
        .to_string();
        let settings = HandlerSettings::from_json(&json).unwrap();
        let err = BackupRequest::from_settings(&settings, 1).unwrap_err();
        assert_eq!(err, ParameterError::MissingField("protected objectStr"));
    }

    #[test]
    fn test_protected_settings_may_be_base64() {
        let protected = encode(serde_json::json!({"taskId": "t-1"}));
        let json = serde_json::json!({
            "runtimeSettings": [{"handlerSettings": {
                "publicSettings": {"commandToExecute": "snapshot"},
                "protectedSettings": protected
            }}]
        })
        .to_string();
        let settings = HandlerSettings::from_json(&json).unwrap();
        assert_eq!(settings.header(3).task_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_malformed_settings() {
        assert!(matches!(
            HandlerSettings::from_json("{not json"),
            Err(ParameterError::MalformedSettings(_))
        ));
        assert!(matches!(
            HandlerSettings::from_json(r#"{"runtimeSettings": []}"#),
            Err(ParameterError::MalformedSettings(_))
        ));
    }

    #[test]
    fn test_ticks_conversion() {
        // 2015-01-01T00:00:00Z
        let at = ticks_to_datetime(635_556_672_000_000_000).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap());
        assert!(ticks_to_datetime(-1).is_none());
    }

    #[test]
    fn test_stale_command() {
        let header = RequestHeader {
            command_start_ticks: Some("635556672000000000".to_string()),
            ..Default::default()
        };
        let issued = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        assert!(!header.is_stale_at(issued + Duration::minutes(149)));
        assert!(header.is_stale_at(issued + Duration::minutes(151)));
        assert!(header.is_stale_at(issued - Duration::minutes(151)));

        let no_ticks = RequestHeader::default();
        assert!(!no_ticks.is_stale_at(Utc::now()));
    }
}
