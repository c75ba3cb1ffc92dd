//! QEMU process management
//!
//! Builds the hypervisor command line for the fixed device topology and owns
//! the running process. A [`VmProcess`] kills QEMU when torn down or dropped;
//! its pid is also recorded on disk so a signal handler can find it.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::{debug, info, instrument};

use crate::config::SSH_FORWARD_PORT;
use crate::envdetect::{Acceleration, CapabilityRecord};
use crate::errors::ProvisionError;
use crate::monitor::MonitorEndpoint;
use crate::pidfile::{self, PidRecord};

/// Name of the disk image inside the output directory.
pub const DISK_IMAGE: &str = "disk.qcow2";

/// Where the guest's display goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayMode {
    /// A local window
    Local,
    /// A VNC listener, e.g. `127.0.0.1:0`
    Vnc(String),
}

#[derive(Debug, Clone)]
pub struct QemuConfig {
    pub memory_mb: u32,
    pub vcpus: u32,
    pub firmware_code: PathBuf,
    pub firmware_vars: Utf8PathBuf,
    pub disk: Utf8PathBuf,
    /// Installer ISO; boots first when present
    pub install_media: Option<Utf8PathBuf>,
    pub recipe_media: Option<Utf8PathBuf>,
    pub monitor: Option<MonitorEndpoint>,
    pub guest_agent_socket: Option<Utf8PathBuf>,
    pub display: DisplayMode,
}

/// Acceleration and CPU model flags.
///
/// The host CPU model is only passed through when a hardware accelerator is
/// in use; under TCG QEMU picks its default model.
pub fn accel_args(caps: &CapabilityRecord) -> Vec<&'static str> {
    match caps.acceleration {
        Acceleration::NativeHypervisor if caps.is_darwin => vec!["-accel", "hvf", "-cpu", "host"],
        Acceleration::NativeHypervisor => vec!["-accel", "kvm", "-cpu", "host"],
        Acceleration::None => vec!["-accel", "tcg"],
    }
}

impl QemuConfig {
    /// Full argument list, excluding the binary itself.
    pub fn args(&self, caps: &CapabilityRecord) -> Vec<String> {
        let mut args: Vec<String> = [
            "-name",
            "qinstall",
            "-machine",
            "q35",
            "-m",
            &format!("{}M", self.memory_mb),
            "-smp",
            &self.vcpus.to_string(),
        ]
        .into_iter()
        .map(ToOwned::to_owned)
        .collect();
        args.extend(accel_args(caps).into_iter().map(ToOwned::to_owned));

        args.extend([
            "-drive".to_owned(),
            format!(
                "if=pflash,format=raw,readonly=on,file={}",
                self.firmware_code.display()
            ),
            "-drive".to_owned(),
            format!("if=pflash,format=raw,file={}", self.firmware_vars),
            "-drive".to_owned(),
            format!("if=virtio,format=qcow2,file={}", self.disk),
        ]);

        if let Some(iso) = &self.install_media {
            args.extend([
                "-drive".to_owned(),
                format!("media=cdrom,readonly=on,index=0,file={iso}"),
                "-boot".to_owned(),
                "once=d".to_owned(),
            ]);
        }
        if let Some(iso) = &self.recipe_media {
            args.extend([
                "-drive".to_owned(),
                format!("media=cdrom,readonly=on,index=1,file={iso}"),
            ]);
        }

        args.extend([
            "-nic".to_owned(),
            format!("user,model=virtio-net-pci,hostfwd=tcp:127.0.0.1:{SSH_FORWARD_PORT}-:22"),
        ]);

        match &self.display {
            DisplayMode::Local => args.extend(["-display".to_owned(), "default".to_owned()]),
            DisplayMode::Vnc(listen) => args.extend([
                "-display".to_owned(),
                "none".to_owned(),
                "-vnc".to_owned(),
                listen.clone(),
            ]),
        }

        if let Some(sock) = &self.guest_agent_socket {
            args.extend([
                "-device".to_owned(),
                "virtio-serial-pci".to_owned(),
                "-chardev".to_owned(),
                format!("socket,path={sock},server=on,wait=off,id=qga0"),
                "-device".to_owned(),
                "virtserialport,chardev=qga0,name=org.qemu.guest_agent.0".to_owned(),
            ]);
        }

        if let Some(monitor) = &self.monitor {
            args.extend(["-monitor".to_owned(), monitor.qemu_arg()]);
        }
        args
    }
}

/// Create an empty qcow2 disk.
#[instrument(skip(image_tool))]
pub fn create_disk(image_tool: &Path, path: &Utf8Path, size_gb: u32) -> Result<(), ProvisionError> {
    let o = Command::new(image_tool)
        .args(["create", "-q", "-f", "qcow2", path.as_str()])
        .arg(format!("{size_gb}G"))
        .output()
        .map_err(|e| ProvisionError::DiskCreateFailure(format!("running qemu-img: {e}")))?;
    if !o.status.success() {
        let stderr = String::from_utf8_lossy(&o.stderr);
        return Err(ProvisionError::DiskCreateFailure(format!(
            "qemu-img {}: {}",
            o.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// The running hypervisor.
#[derive(Debug)]
pub struct VmProcess {
    child: Option<Child>,
    pid: u32,
    pidfile: PathBuf,
}

/// Start QEMU in the background, recording its pid at `pidfile`.
#[instrument(skip_all)]
pub fn launch(config: &QemuConfig, caps: &CapabilityRecord, pidfile: &Path) -> Result<VmProcess> {
    let mut cmd = Command::new(&caps.hypervisor);
    cmd.args(config.args(caps)).stdin(Stdio::null());
    debug!("Running {cmd:?}");
    let child = cmd.spawn().context("Failed to spawn QEMU")?;
    let mut vm = VmProcess::adopt(child, pidfile.to_owned());
    let record = PidRecord {
        pid: vm.pid,
        monitor: config
            .monitor
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    };
    if let Err(e) = record.write_to_file(&vm.pidfile) {
        vm.teardown();
        return Err(e.wrap_err("Recording QEMU pid"));
    }
    info!("Started QEMU (pid {})", vm.pid);
    Ok(vm)
}

impl VmProcess {
    pub(crate) fn adopt(child: Child, pidfile: PathBuf) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
            pidfile,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether teardown has not happened yet.
    pub fn is_live(&self) -> bool {
        self.child.is_some()
    }

    /// Kill and reap QEMU if it is still running, and forget its pid.
    ///
    /// Safe to call any number of times, and on a process that already
    /// exited.
    pub fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("QEMU (pid {}) already exited: {status}", self.pid),
                _ => {
                    if let Err(e) = child.kill() {
                        debug!("Killing QEMU (pid {}): {e}", self.pid);
                    }
                    match child.wait() {
                        Ok(status) => debug!("QEMU (pid {}) terminated: {status}", self.pid),
                        Err(e) => debug!("Waiting for QEMU (pid {}): {e}", self.pid),
                    }
                }
            }
        }
        pidfile::remove(&self.pidfile);
    }
}

impl Drop for VmProcess {
    fn drop(&mut self) {
        self.teardown();
    }
}
