//! On-disk record of the running hypervisor
//!
//! The interrupt handler cannot rely on the in-process handle having reached
//! the run guard, so the QEMU pid is also written to a small JSON file that
//! only this driver process ever writes.

use cap_std_ext::{cap_std, cap_std::fs::Dir, dirext::CapStdExtDirExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of pid records in the system temporary directory
pub const PIDFILE_PREFIX: &str = "qinstall-qemu";

/// Location of the pid record for this driver process.
///
/// The driver's own pid is part of the name, so concurrent runs never see
/// each other's record.
pub fn default_path() -> PathBuf {
    std::env::temp_dir().join(format!("{PIDFILE_PREFIX}.{}.json", std::process::id()))
}

/// The running hypervisor, as recorded on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PidRecord {
    /// Process id of QEMU
    pub pid: u32,
    /// Monitor endpoint QEMU was started with
    pub monitor: String,
}

impl PidRecord {
    /// Write the record to a JSON file atomically
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> color_eyre::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;

        let parent = path.parent().unwrap_or(Path::new("/"));
        let filename = path.file_name().unwrap_or_else(|| path.as_os_str());

        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())?;
        dir.atomic_write(filename, json)?;

        Ok(())
    }

    /// Read the record from a JSON file
    pub fn read_from_file(path: impl AsRef<Path>) -> color_eyre::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Remove the record, ignoring a missing file
pub fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Removing {}: {e}", path.display()),
    }
}

/// Kill the process the record at `path` names, then remove it.
///
/// Used when the in-process handle is gone (e.g. from a signal handler).
/// Callers must own the record: see [`crate::cleanup::RunGuard::new`].
/// A process that already exited is not an error.
pub fn kill_recorded(path: &Path) {
    if !path.exists() {
        return;
    }
    match PidRecord::read_from_file(path) {
        Ok(record) => {
            let Ok(raw) = i32::try_from(record.pid) else {
                return;
            };
            match kill(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) => debug!("Killed recorded pid {}", record.pid),
                Err(e) => debug!("Killing recorded pid {}: {e}", record.pid),
            }
        }
        Err(e) => debug!("Reading {}: {e}", path.display()),
    }
    remove(path);
}
