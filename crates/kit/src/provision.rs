//! The provisioning workflow
//!
//! 1. Refuse to touch an existing output directory.
//! 2. Probe the host (programs and firmware) and resolve the install media.
//! 3. Build the recipe media, firmware variable store and disk into the
//!    output directory.
//! 4. Boot QEMU from the installer, wait for its prompt, and type the
//!    bootstrap command that runs the recipe.
//! 5. Poll the monitor until the guest powers itself off.
//! 6. Leave a `run` script for booting the result.
//!
//! The VM and staging files are owned by the [`RunGuard`], so a failure or an
//! interrupt kills QEMU and removes them. The output directory is not: once
//! created it stays, complete or not, and a retry needs it moved away first.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{info, instrument};

use crate::cleanup::RunGuard;
use crate::completion;
use crate::config::{
    ProvisionConfig, RecipeParameters, BOOTSTRAP_COMMAND, OUTPUT_DIR, SSH_FORWARD_PORT,
    VNC_LISTEN,
};
use crate::envdetect::{CapabilityRecord, HostProbe, SystemHost};
use crate::errors::ProvisionError;
use crate::firmware::{self, Firmware, FirmwareSource};
use crate::launcher;
use crate::media;
use crate::monitor::{MonitorClient, Netcat};
use crate::qemu::{self, DisplayMode, QemuConfig, DISK_IMAGE};
use crate::recipe::{self, InstallerMedia};
use crate::utils;

const GUEST_AGENT_SOCKET: &str = "qinstall-qga.sock";

/// Fail if `dir` exists in any form.
pub fn check_output_dir(dir: &Utf8Path) -> Result<(), ProvisionError> {
    if dir.symlink_metadata().is_ok() {
        return Err(ProvisionError::DirectoryConflict(dir.to_owned()));
    }
    Ok(())
}

/// Provision a VM into the default output directory.
pub fn run(headless: bool, guard: &RunGuard) -> Result<()> {
    // Before anything that could fail for other reasons
    check_output_dir(Utf8Path::new(OUTPUT_DIR))?;
    let recipe = RecipeParameters::from_host()?;
    let caps = CapabilityRecord::get_cached()?;
    provision(&ProvisionConfig::new(recipe, headless), caps, guard)
}

fn display_mode(headless: bool) -> DisplayMode {
    if headless {
        DisplayMode::Vnc(VNC_LISTEN.to_owned())
    } else {
        DisplayMode::Local
    }
}

/// Everything checked before any state is created.
///
/// Missing firmware is a missing dependency like any program, so it is found
/// here rather than when the output directory is filled.
fn preflight(
    config: &ProvisionConfig,
    caps: &CapabilityRecord,
    host: &dyn HostProbe,
) -> Result<FirmwareSource, ProvisionError> {
    check_output_dir(&config.output_dir)?;
    info!(
        "Host: acceleration {}, netcat {}, downloads via {}",
        caps.acceleration, caps.netcat_dialect, caps.download_tool
    );
    firmware::find(host, &caps.hypervisor)
}

/// What the installer VM boots from, all inside the output directory.
#[derive(Debug)]
struct Prepared {
    recipe_media: InstallerMedia,
    firmware: Firmware,
    disk: Utf8PathBuf,
}

/// Create the output directory and fill it.
fn prepare_output(
    config: &ProvisionConfig,
    caps: &CapabilityRecord,
    firmware: &FirmwareSource,
    guard: &RunGuard,
) -> Result<Prepared> {
    std::fs::create_dir(&config.output_dir)
        .with_context(|| format!("Creating {}", config.output_dir))?;
    let recipe_media = recipe::synthesize(&config.recipe, caps, &config.output_dir, guard)?;
    let firmware = firmware.install(&config.output_dir)?;
    let disk = config.output_dir.join(DISK_IMAGE);
    qemu::create_disk(&caps.image_tool, &disk, config.recipe.disk_size_gb)?;
    info!("Created {disk} ({}G)", config.recipe.disk_size_gb);
    Ok(Prepared {
        recipe_media,
        firmware,
        disk,
    })
}

#[instrument(skip_all, fields(output = %config.output_dir))]
pub(crate) fn provision(
    config: &ProvisionConfig,
    caps: &CapabilityRecord,
    guard: &RunGuard,
) -> Result<()> {
    let firmware = preflight(config, caps, &SystemHost)?;

    let install_media = media::acquire(&config.media, caps, guard, utils::confirm)?;
    let install_media = Utf8PathBuf::from_path_buf(install_media)
        .map_err(|p| eyre!("Install media path is not UTF-8: {}", p.display()))?;

    let prepared = prepare_output(config, caps, &firmware, guard)?;

    let qga = std::env::temp_dir().join(GUEST_AGENT_SOCKET);
    guard.track_temp(&qga);
    let qga = Utf8PathBuf::from_path_buf(qga)
        .map_err(|p| eyre!("Temporary directory is not UTF-8: {}", p.display()))?;
    let display = display_mode(config.headless);
    let install = QemuConfig {
        memory_mb: config.memory_mb,
        vcpus: config.vcpus,
        firmware_code: prepared.firmware.code.clone(),
        firmware_vars: prepared.firmware.vars.clone(),
        disk: prepared.disk.clone(),
        install_media: Some(install_media),
        recipe_media: Some(prepared.recipe_media.path().to_owned()),
        monitor: Some(config.monitor.clone()),
        guest_agent_socket: Some(qga),
        display: display.clone(),
    };
    let vm = qemu::launch(&install, caps, guard.pidfile())?;
    guard.adopt(vm)?;
    if config.headless {
        info!("Guest display is on VNC {VNC_LISTEN}");
    }

    info!(
        "Waiting {}s for the installer to boot",
        config.boot_delay.as_secs()
    );
    std::thread::sleep(config.boot_delay);
    utils::wait_for_enter("Press Enter once the installer shows its root prompt")?;

    let client = MonitorClient::new(config.monitor.clone(), Netcat::new(caps));
    client
        .type_text(BOOTSTRAP_COMMAND, config.key_pacing)
        .wrap_err("Typing the bootstrap command")?;
    info!("Recipe started; waiting for the guest to power off");

    let progress = completion::create_poll_spinner();
    let polls = completion::await_shutdown(&client, config.poll, &progress)?;
    info!("Installation finished after {polls} liveness checks");
    guard.stop_vm();

    let boot = launcher::boot_config(config.memory_mb, config.vcpus, &prepared.firmware, display);
    let run_script = launcher::write(&boot, caps, &config.output_dir)?;
    info!(
        "Boot the installed VM with {run_script}, then ssh -p {SSH_FORWARD_PORT} {}@127.0.0.1",
        config.recipe.username
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    use std::process::Command;

    use super::*;
    use crate::envdetect::probe;
    use crate::envdetect::tests::FakeHost;
    use crate::envdetect::DiscWriter;
    use crate::pidfile::PidRecord;

    fn config(output_dir: Utf8PathBuf) -> ProvisionConfig {
        let mut c = ProvisionConfig::new(
            RecipeParameters {
                disk_size_gb: 20,
                swap_size_gb: 2,
                hostname: "archvm".into(),
                username: "arch".into(),
                ssh_public_key: "ssh-ed25519 AAAA me".into(),
            },
            true,
        );
        c.output_dir = output_dir;
        c
    }

    #[test]
    fn test_check_output_dir() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let vm = root.join("vm");
        check_output_dir(&vm)?;
        std::fs::write(&vm, "")?;
        assert!(matches!(
            check_output_dir(&vm),
            Err(ProvisionError::DirectoryConflict(p)) if p == vm
        ));
        Ok(())
    }

    #[test]
    fn test_existing_output_dir_creates_nothing() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let vm = root.join("vm");
        std::fs::create_dir(&vm)?;
        let pidfile = root.join("pid.json");
        // Left behind by some earlier process, naming one we do not own
        let mut bystander = Command::new("sleep").arg("60").spawn()?;
        PidRecord {
            pid: bystander.id(),
            monitor: "127.0.0.1:55555".into(),
        }
        .write_to_file(&pidfile)?;
        let caps = probe(&FakeHost::complete_linux())?;
        let guard = RunGuard::new(pidfile.into_std_path_buf());

        let err = provision(&config(vm.clone()), &caps, &guard).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::DirectoryConflict(_))
        ));
        drop(guard);
        let entries: Vec<_> = std::fs::read_dir(root)?
            .map(|e| e.map(|e| e.file_name()))
            .collect::<std::io::Result<_>>()?;
        assert_eq!(entries, vec![std::ffi::OsString::from("vm")]);
        assert_eq!(std::fs::read_dir(&vm)?.count(), 0);

        assert!(bystander.try_wait()?.is_none());
        bystander.kill()?;
        bystander.wait()?;
        Ok(())
    }

    #[test]
    fn test_missing_firmware_is_found_first() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let host = FakeHost::complete_linux();
        let caps = probe(&host)?;
        let vm = root.join("vm");

        let err = preflight(&config(vm.clone()), &caps, &host).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::MissingDependency { what: "UEFI firmware", .. }
        ));
        assert!(!vm.exists());
        Ok(())
    }

    #[test]
    fn test_media_build_failure_leaves_output_dir() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let writer = root.join("broken-mkisofs");
        std::fs::write(&writer, "#!/bin/sh\necho 'no space left' >&2\nexit 1\n")?;
        std::fs::set_permissions(&writer, Permissions::from_mode(0o755))?;
        let mut caps = probe(&FakeHost::complete_linux())?;
        caps.disc_writer = DiscWriter::Mkisofs(writer.into_std_path_buf());
        let firmware = FirmwareSource {
            code: root.join("OVMF_CODE.fd").into_std_path_buf(),
            vars_template: root.join("OVMF_VARS.fd").into_std_path_buf(),
        };
        let vm = root.join("vm");
        let guard = RunGuard::new(root.join("pid.json").into_std_path_buf());

        let err = prepare_output(&config(vm.clone()), &caps, &firmware, &guard).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::MediaBuildFailure(_))
        ));
        drop(guard);
        assert!(vm.is_dir());
        Ok(())
    }

    #[test]
    fn test_display_mode() {
        assert_eq!(display_mode(false), DisplayMode::Local);
        assert_eq!(display_mode(true), DisplayMode::Vnc("127.0.0.1:0".into()));
    }
}
