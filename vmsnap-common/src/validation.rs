//! Validation utilities
//!
//! Checks applied to request fields and configuration values before the
//! agent acts on them.

use std::path::Path;
use url::Url;

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validation result
pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Smallest accepted freeze-hold timeout in seconds
pub const MIN_TIMEOUT_SECS: u64 = 1;
/// Largest accepted freeze-hold timeout in seconds
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Validate a disk blob URI
///
/// # Examples
/// ```
/// # use vmsnap_common::validation::validate_blob_uri;
/// assert!(validate_blob_uri("https://acct.blob.core.windows.net/vhds/os.vhd?sig=x").is_ok());
/// assert!(validate_blob_uri("ftp://acct/vhds/os.vhd").is_err());
/// assert!(validate_blob_uri("https://").is_err());
/// ```
pub fn validate_blob_uri(uri: &str) -> Result<(), String> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err("URI cannot be empty".to_string());
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err("URI cannot contain whitespace".to_string());
    }

    let url = Url::parse(trimmed).map_err(|e| format!("Invalid URI: {e}"))?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err("URI must use http or https".to_string());
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("URI has no host".to_string());
    }
    if url.path().trim_matches('/').is_empty() {
        return Err("URI has no blob path".to_string());
    }

    Ok(())
}

/// Validate the freeze-hold timeout
pub fn validate_timeout(seconds: u64) -> Result<(), String> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&seconds) {
        return Err(format!(
            "Timeout must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds"
        ));
    }
    Ok(())
}

/// Validate a persisted token (task id or machine identity)
///
/// Tokens are stored as single-line files, so they cannot span lines.
pub fn validate_token(token: &str) -> Result<(), String> {
    if token.trim().is_empty() {
        return Err("Token cannot be empty".to_string());
    }
    if token.len() > 1024 {
        return Err("Token too long (max 1024 characters)".to_string());
    }
    if token.contains('\n') || token.contains('\r') || token.contains('\0') {
        return Err("Token cannot contain line breaks or null bytes".to_string());
    }
    Ok(())
}

/// Validate that a configured path is absolute and free of traversal
pub fn validate_config_path(path: &Path) -> Result<(), String> {
    if !path.is_absolute() {
        return Err(format!("Path must be absolute: {}", path.display()));
    }

    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(format!("Path cannot contain '..': {}", path.display()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_blob_uri() {
        assert!(validate_blob_uri("https://a.blob.core.windows.net/c/d.vhd?sv=1&sig=2").is_ok());
        assert!(validate_blob_uri("http://localhost:10000/c/d.vhd").is_ok());
        assert!(validate_blob_uri("").is_err());
        assert!(validate_blob_uri("a.blob.core.windows.net/c/d.vhd").is_err());
        assert!(validate_blob_uri("https://").is_err());
        assert!(validate_blob_uri("ftp://a.blob.core.windows.net/c/d.vhd").is_err());
        assert!(validate_blob_uri("https://a.blob.core.windows.net").is_err());
        assert!(validate_blob_uri("https://a.blob.core.windows.net/").is_err());
        assert!(validate_blob_uri("https://a.blob.core.windows.net/c/d e.vhd").is_err());
    }

    #[test]
    fn test_validate_timeout() {
        assert!(validate_timeout(60).is_ok());
        assert!(validate_timeout(1).is_ok());
        assert!(validate_timeout(3600).is_ok());
        assert!(validate_timeout(0).is_err());
        assert!(validate_timeout(3601).is_err());
    }

    #[test]
    fn test_validate_token() {
        assert!(validate_token("3f2a-task").is_ok());
        assert!(validate_token("").is_err());
        assert!(validate_token("   ").is_err());
        assert!(validate_token("a\nb").is_err());
        assert!(validate_token(&"x".repeat(1025)).is_err());
    }

    #[test]
    fn test_validate_config_path() {
        assert!(validate_config_path(&PathBuf::from("/var/lib/vmsnap")).is_ok());
        assert!(validate_config_path(&PathBuf::from("relative/path")).is_err());
        assert!(validate_config_path(&PathBuf::from("/var/../etc")).is_err());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("timeout", "out of range");
        assert_eq!(err.to_string(), "timeout: out of range");
    }
}
