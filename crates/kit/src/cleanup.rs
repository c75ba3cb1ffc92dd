//! Releasing everything a run holds, on every way out
//!
//! A [`RunGuard`] owns the VM process and the temporary files of the run.
//! Releasing happens when the guard is dropped (normal return or an error
//! propagating out of `main`) or from the interrupt handler, which runs on
//! its own thread and then exits the process with status 130.
//!
//! The output directory is never the guard's to remove: a failed run leaves
//! it behind for inspection.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, warn};

use crate::pidfile;
use crate::qemu::VmProcess;

/// Exit status after an interrupt, as a shell would report SIGINT.
pub const INTERRUPTED_EXIT: i32 = 130;

#[derive(Debug, Default)]
struct GuardState {
    vm: Option<VmProcess>,
    temp_paths: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct RunGuard {
    state: Arc<Mutex<GuardState>>,
    pidfile: PathBuf,
}

impl RunGuard {
    /// A guard whose VM records its pid at `pidfile`.
    ///
    /// Anything already at `pidfile` was left by an earlier process and names
    /// a pid this run does not own, so it is discarded unread.
    pub fn new(pidfile: PathBuf) -> Self {
        pidfile::remove(&pidfile);
        Self {
            state: Default::default(),
            pidfile,
        }
    }

    /// Create the guard for this process and hook SIGINT/SIGTERM to it.
    pub fn install() -> Result<Self> {
        let guard = Self::new(pidfile::default_path());
        let state = Arc::downgrade(&guard.state);
        let recorded = guard.pidfile.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupted, cleaning up");
            if let Some(state) = state.upgrade() {
                release_state(&mut state.lock().unwrap_or_else(PoisonError::into_inner));
            }
            pidfile::kill_recorded(&recorded);
            std::process::exit(INTERRUPTED_EXIT);
        })
        .context("Installing signal handler")?;
        Ok(guard)
    }

    /// Where a VM launched for this run must record its pid.
    pub fn pidfile(&self) -> &Path {
        &self.pidfile
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of the VM. There is only ever one per run.
    pub fn adopt(&self, vm: VmProcess) -> Result<()> {
        let mut state = self.state();
        if let Some(existing) = state.vm.as_ref().filter(|v| v.is_live()) {
            return Err(eyre!(
                "A VM (pid {}) is already running for this invocation",
                existing.pid()
            ));
        }
        state.vm = Some(vm);
        Ok(())
    }

    /// Stop the VM now, keeping the guard usable for the rest of the run.
    pub fn stop_vm(&self) {
        if let Some(mut vm) = self.state().vm.take() {
            vm.teardown();
        }
    }

    /// Remove `path` (file or directory) on release.
    pub fn track_temp(&self, path: impl Into<PathBuf>) {
        self.state().temp_paths.push(path.into());
    }

    /// Stop tracking `path`, once its owner has cleaned it up or renamed it.
    pub fn untrack(&self, path: &Path) {
        self.state().temp_paths.retain(|p| p != path);
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> Vec<PathBuf> {
        self.state().temp_paths.clone()
    }

    /// Tear everything down. Idempotent.
    pub fn release(&self) {
        release_state(&mut self.state());
        // Covers a VM whose handle never reached the guard
        pidfile::kill_recorded(&self.pidfile);
    }
}

fn release_state(state: &mut GuardState) {
    if let Some(mut vm) = state.vm.take() {
        vm.teardown();
    }
    for path in state.temp_paths.drain(..) {
        remove_path(&path);
    }
}

fn remove_path(path: &Path) {
    let r = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match r {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Removing {}: {e}", path.display()),
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;
    use crate::pidfile::PidRecord;

    fn spawn_vm(pidfile: &Path) -> VmProcess {
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        VmProcess::adopt(child, pidfile.to_owned())
    }

    fn is_running(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[test]
    fn test_release_is_idempotent() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pidfile = td.path().join("pid.json");
        let staging = td.path().join("staging");
        std::fs::create_dir(&staging)?;
        std::fs::write(staging.join("vars"), "SWAP_SIZE=2G\n")?;

        let guard = RunGuard::new(pidfile.clone());
        let vm = spawn_vm(&pidfile);
        let pid = vm.pid();
        guard.adopt(vm)?;
        guard.track_temp(&staging);

        let renamed = td.path().join("image.iso");
        std::fs::write(&renamed, "")?;
        guard.track_temp(&renamed);
        guard.untrack(&renamed);

        guard.release();
        assert!(!staging.exists());
        assert!(renamed.exists());
        assert!(!is_running(pid));
        assert!(guard.tracked().is_empty());
        guard.release();
        Ok(())
    }

    #[test]
    fn test_refuses_second_vm() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pidfile = td.path().join("pid.json");
        let guard = RunGuard::new(pidfile.clone());
        guard.adopt(spawn_vm(&pidfile))?;
        // The rejected handle is dropped, which kills it
        assert!(guard.adopt(spawn_vm(&td.path().join("other.json"))).is_err());
        guard.stop_vm();
        guard.adopt(spawn_vm(&pidfile))?;
        Ok(())
    }

    #[test]
    fn test_release_kills_vm_recorded_after_creation() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pidfile = td.path().join("pid.json");
        let guard = RunGuard::new(pidfile.clone());
        // Launched, but the handle never reached the guard
        let mut child = Command::new("sleep").arg("60").spawn()?;
        PidRecord {
            pid: child.id(),
            monitor: String::new(),
        }
        .write_to_file(guard.pidfile())?;
        drop(guard);
        assert!(!child.wait()?.success());
        assert!(!pidfile.exists());
        Ok(())
    }

    #[test]
    fn test_leftover_record_is_not_killed() -> Result<()> {
        let td = tempfile::tempdir()?;
        let pidfile = td.path().join("pid.json");
        let mut bystander = Command::new("sleep").arg("60").spawn()?;
        PidRecord {
            pid: bystander.id(),
            monitor: "127.0.0.1:55555".into(),
        }
        .write_to_file(&pidfile)?;

        let guard = RunGuard::new(pidfile.clone());
        assert!(!pidfile.exists());
        guard.release();
        drop(guard);

        assert!(bystander.try_wait()?.is_none());
        bystander.kill()?;
        bystander.wait()?;
        Ok(())
    }
}
