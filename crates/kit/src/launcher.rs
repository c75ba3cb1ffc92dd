//! The `run` script left in the output directory
//!
//! Boots the installed disk with the same machine the installer ran on,
//! minus the installer and recipe media and the monitor.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indoc::formatdoc;
use itertools::Itertools;
use tracing::info;

use crate::envdetect::CapabilityRecord;
use crate::firmware::{Firmware, VARS_FILE};
use crate::qemu::{DisplayMode, QemuConfig, DISK_IMAGE};

pub const LAUNCHER_NAME: &str = "run";

/// The machine booted by the launcher.
///
/// Disk and variable store are named relative to the output directory; the
/// script changes into its own directory first.
pub fn boot_config(
    memory_mb: u32,
    vcpus: u32,
    firmware: &Firmware,
    display: DisplayMode,
) -> QemuConfig {
    QemuConfig {
        memory_mb,
        vcpus,
        firmware_code: firmware.code.clone(),
        firmware_vars: Utf8PathBuf::from(VARS_FILE),
        disk: Utf8PathBuf::from(DISK_IMAGE),
        install_media: None,
        recipe_media: None,
        monitor: None,
        guest_agent_socket: Some(Utf8PathBuf::from("qga.sock")),
        display,
    }
}

fn quote(s: &str) -> Result<String> {
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .map_err(|e| eyre!("Cannot quote {s:?}: {e}"))
}

/// Render the script text.
pub fn render(config: &QemuConfig, caps: &CapabilityRecord) -> Result<String> {
    let hypervisor = caps
        .hypervisor
        .to_str()
        .ok_or_else(|| eyre!("Hypervisor path is not UTF-8"))?;
    let command = std::iter::once(quote(hypervisor))
        .chain(config.args(caps).iter().map(|a| quote(a)))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .join(" \\\n    ");
    Ok(formatdoc! {r#"
        #!/bin/sh
        # Boots the VM installed by qinstall. Extra arguments go to QEMU.
        set -eu
        cd "$(dirname "$0")"
        exec {command} \
            "$@"
    "#})
}

/// Write an executable `run` script into `output_dir`.
pub fn write(config: &QemuConfig, caps: &CapabilityRecord, output_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let path = output_dir.join(LAUNCHER_NAME);
    let script = render(config, caps)?;
    std::fs::write(&path, script).with_context(|| format!("Writing {path}"))?;
    std::fs::set_permissions(&path, Permissions::from_mode(0o755))
        .with_context(|| format!("Making {path} executable"))?;
    info!("Wrote {path}");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::envdetect::probe;
    use crate::envdetect::tests::FakeHost;

    fn firmware() -> Firmware {
        Firmware {
            code: "/usr/share/OVMF/OVMF_CODE.fd".into(),
            vars: "vm/efi-vars.fd".into(),
        }
    }

    #[test]
    fn test_render() -> Result<()> {
        let mut host = FakeHost::complete_linux();
        host.paths.clear();
        let caps = probe(&host)?;
        let config = boot_config(2048, 1, &firmware(), DisplayMode::Vnc("127.0.0.1:0".into()));
        let script = render(&config, &caps)?;
        let (header, exec) = script.split_once("exec ").unwrap();
        assert_eq!(
            header,
            "#!/bin/sh\n# Boots the VM installed by qinstall. Extra arguments go to QEMU.\nset -eu\ncd \"$(dirname \"$0\")\"\n"
        );
        let words = shlex::split(&exec.replace(" \\\n    ", " ")).unwrap();
        let mut expected = vec!["/usr/bin/qemu-system-x86_64".to_owned()];
        expected.extend(config.args(&caps));
        expected.push("$@".to_owned());
        assert_eq!(words, expected);
        assert!(!words.iter().any(|w| w == "-cpu"));
        Ok(())
    }

    #[test]
    fn test_write_is_executable() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let caps = probe(&FakeHost::complete_linux())?;
        let config = boot_config(4096, 2, &firmware(), DisplayMode::Local);
        let path = write(&config, &caps, dir)?;
        assert_eq!(path, dir.join(LAUNCHER_NAME));
        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let script = std::fs::read_to_string(&path)?;
        assert!(script.contains("-accel \\\n    kvm \\\n    -cpu \\\n    host"));
        assert!(!script.contains("cdrom"));
        assert!(!script.contains("-monitor"));
        Ok(())
    }
}
