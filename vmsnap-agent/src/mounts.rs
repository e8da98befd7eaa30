// Mount table enumeration for vmsnap-agent

use anyhow::{Context, Result};
use std::path::Path;

/// Filesystem types that never hold guest data and cannot be frozen
const PSEUDO_FS_TYPES: &[&str] = &[
    "autofs",
    "binfmt_misc",
    "bpf",
    "cgroup",
    "cgroup2",
    "configfs",
    "debugfs",
    "devpts",
    "devtmpfs",
    "efivarfs",
    "fuse.gvfsd-fuse",
    "fusectl",
    "hugetlbfs",
    "mqueue",
    "nfs",
    "nfs4",
    "cifs",
    "nsfs",
    "proc",
    "pstore",
    "ramfs",
    "rpc_pipefs",
    "securityfs",
    "squashfs",
    "sysfs",
    "tmpfs",
    "tracefs",
    "iso9660",
];

/// A single mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl Mount {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    /// Whether this mount should take part in a freeze
    pub fn is_freezable(&self) -> bool {
        !self.is_read_only()
            && !PSEUDO_FS_TYPES.contains(&self.fs_type.as_str())
            && self.mount_point.starts_with('/')
    }
}

/// Read the mount table of the current process
pub fn read_mounts(path: &Path) -> Result<Vec<Mount>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mount table {}", path.display()))?;
    Ok(parse_mounts(&contents))
}

/// Parse `/proc/self/mounts` formatted text
pub fn parse_mounts(contents: &str) -> Vec<Mount> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(Mount {
                device: unescape(device),
                mount_point: unescape(mount_point),
                fs_type: fs_type.to_string(),
                options: options.split(',').map(String::from).collect(),
            })
        })
        .collect()
}

/// Mounts to freeze, in freeze order
///
/// Later entries in the mount table are frozen first so that a parent
/// filesystem is frozen after the filesystems stacked on top of it. When the
/// same mount point appears twice only the last (visible) entry is kept.
pub fn freeze_order(mounts: &[Mount]) -> Vec<Mount> {
    let mut seen = std::collections::HashSet::new();
    mounts
        .iter()
        .rev()
        .filter(|m| seen.insert(m.mount_point.clone()))
        .filter(|m| m.is_freezable())
        .cloned()
        .collect()
}

/// Decode the octal escapes (`\040` for space) used in the mount table
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
