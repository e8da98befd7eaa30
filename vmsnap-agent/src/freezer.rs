//! Filesystem freeze and thaw
//!
//! `FsFreezer` quiesces mounted filesystems with the FIFREEZE ioctl and
//! releases them with FITHAW. It remembers every mount it froze so a thaw
//! always covers exactly those mounts, even when the freeze stopped halfway.

use anyhow::{Context, Result};
use nix::errno::Errno;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use crate::mounts::{self, Mount};
use vmsnap_common::format_error_list;

nix::ioctl_readwrite!(fifreeze, b'X', 119, libc::c_int);
nix::ioctl_readwrite!(fithaw, b'X', 120, libc::c_int);

/// Outcome of a freeze call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreezeResult {
    /// Mounts frozen by this call, in freeze order
    pub frozen: Vec<String>,
    /// `(mount, error)` for every mount that could not be frozen
    pub errors: Vec<(String, String)>,
}

impl std::fmt::Display for FreezeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frozen: [{}], errors: {}",
            self.frozen.join(", "),
            format_error_list(&self.errors)
        )
    }
}

/// Outcome of one thaw attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThawResult {
    /// `(mount, error)` for every mount that is still frozen
    pub errors: Vec<(String, String)>,
    /// A mount was found already thawed, so the thaw cannot be proven to
    /// have followed snapshot completion
    pub inconsistent: bool,
}

impl std::fmt::Display for ThawResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "errors: {}, inconsistent: {}",
            format_error_list(&self.errors),
            self.inconsistent
        )
    }
}

/// Quiesces and releases filesystem writes
pub trait Freezer {
    /// Freeze every relevant mount. Per-mount failures are reported in the
    /// result; `Err` means nothing could be attempted.
    fn freeze(&mut self) -> Result<FreezeResult>;

    /// Thaw every mount this freezer currently holds frozen
    fn thaw(&mut self) -> Result<ThawResult>;
}

/// Freezer backed by the FIFREEZE/FITHAW ioctls
pub struct FsFreezer {
    mount_table: PathBuf,
    held: Vec<String>,
}

impl FsFreezer {
    pub fn new() -> Self {
        Self::with_mount_table(PathBuf::from("/proc/self/mounts"))
    }

    pub fn with_mount_table(mount_table: PathBuf) -> Self {
        Self {
            mount_table,
            held: Vec::new(),
        }
    }

    /// Number of freezable mounts, for logging
    pub fn mount_count(&self) -> Result<usize> {
        let table = mounts::read_mounts(&self.mount_table)?;
        Ok(mounts::freeze_order(&table).len())
    }

    fn freeze_mount(mount: &Mount) -> std::result::Result<(), Errno> {
        let dir = File::open(&mount.mount_point).map_err(|e| {
            e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
        })?;
        let mut arg: libc::c_int = 0;
        // SAFETY: the fd is an open directory on the target filesystem and
        // `arg` outlives the call.
        unsafe { fifreeze(dir.as_raw_fd(), &mut arg) }.map(|_| ())
    }

    fn thaw_mount(mount_point: &str) -> std::result::Result<(), Errno> {
        let dir = File::open(mount_point).map_err(|e| {
            e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
        })?;
        let mut arg: libc::c_int = 0;
        // SAFETY: as in freeze_mount.
        unsafe { fithaw(dir.as_raw_fd(), &mut arg) }.map(|_| ())
    }
}

impl Default for FsFreezer {
    fn default() -> Self {
        Self::new()
    }
}

impl Freezer for FsFreezer {
    fn freeze(&mut self) -> Result<FreezeResult> {
        let table = mounts::read_mounts(&self.mount_table).context("Cannot enumerate mounts")?;
        let targets = mounts::freeze_order(&table);
        let mut result = FreezeResult::default();

        for mount in &targets {
            match Self::freeze_mount(mount) {
                Ok(()) => {
                    log::debug!("Froze {} ({} on {})", mount.mount_point, mount.fs_type, mount.device);
                    self.held.push(mount.mount_point.clone());
                    result.frozen.push(mount.mount_point.clone());
                }
                Err(Errno::EOPNOTSUPP) => {
                    log::info!(
                        "Skipping {}: {} does not support freezing",
                        mount.mount_point,
                        mount.fs_type
                    );
                }
                Err(errno) => {
                    // Stop here: the attempt has failed and every further
                    // freeze only lengthens the write stall.
                    result
                        .errors
                        .push((mount.mount_point.clone(), errno.desc().to_string()));
                    break;
                }
            }
        }

        Ok(result)
    }

    fn thaw(&mut self) -> Result<ThawResult> {
        let mut result = ThawResult::default();
        let mut still_held = Vec::new();

        for mount_point in self.held.iter().rev() {
            match Self::thaw_mount(mount_point) {
                Ok(()) => log::debug!("Thawed {mount_point}"),
                // Not frozen any more: someone else thawed it first
                Err(Errno::EINVAL) => {
                    log::warn!("{mount_point} was already thawed");
                    result.inconsistent = true;
                }
                Err(errno) => {
                    result
                        .errors
                        .push((mount_point.clone(), errno.desc().to_string()));
                    still_held.push(mount_point.clone());
                }
            }
        }

        // Keep freeze order for the mounts that remain held
        still_held.reverse();
        self.held = still_held;
        Ok(result)
    }
}
