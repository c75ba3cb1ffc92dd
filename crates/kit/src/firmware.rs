//! UEFI firmware for the guest
//!
//! QEMU boots the guest with an OVMF/edk2 code image (shared, read-only) and
//! a per-VM copy of the variable store, which lives in the output directory
//! next to the disk so the installed bootloader entries persist.

use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::debug;

use crate::envdetect::HostProbe;
use crate::errors::ProvisionError;

/// Name of the writable variable store in the output directory.
pub const VARS_FILE: &str = "efi-vars.fd";

/// (code, variable template) pairs shipped by common distributions.
const SYSTEM_CANDIDATES: &[(&str, &str)] = &[
    (
        "/usr/share/edk2/x64/OVMF_CODE.4m.fd",
        "/usr/share/edk2/x64/OVMF_VARS.4m.fd",
    ),
    (
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/OVMF/OVMF_VARS_4M.fd",
    ),
    (
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/edk2/ovmf/OVMF_VARS.fd",
    ),
    ("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd"),
    (
        "/usr/share/qemu/edk2-x86_64-code.fd",
        "/usr/share/qemu/edk2-i386-vars.fd",
    ),
];

/// Firmware files for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub code: PathBuf,
    pub vars: Utf8PathBuf,
}

/// An installed code image and the template for its variable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSource {
    pub code: PathBuf,
    pub vars_template: PathBuf,
}

/// Candidate pairs, starting with the `share/qemu` directory next to the
/// hypervisor binary (Homebrew and other prefix installs).
fn candidates(hypervisor: &Path) -> Vec<(PathBuf, PathBuf)> {
    let prefix_share = hypervisor
        .parent()
        .and_then(Path::parent)
        .map(|prefix| prefix.join("share/qemu"));
    prefix_share
        .into_iter()
        .map(|share| {
            (
                share.join("edk2-x86_64-code.fd"),
                share.join("edk2-i386-vars.fd"),
            )
        })
        .chain(
            SYSTEM_CANDIDATES
                .iter()
                .map(|(c, v)| (PathBuf::from(c), PathBuf::from(v))),
        )
        .collect()
}

/// Find a (code, variable template) pair.
pub fn find(host: &dyn HostProbe, hypervisor: &Path) -> Result<FirmwareSource, ProvisionError> {
    let all = candidates(hypervisor);
    all.iter()
        .find(|(code, vars)| host.path_exists(code) && host.path_exists(vars))
        .map(|(code, vars)| FirmwareSource {
            code: code.clone(),
            vars_template: vars.clone(),
        })
        .ok_or_else(|| {
            let names = all
                .iter()
                .map(|(c, _)| c.to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            ProvisionError::MissingDependency {
                what: "UEFI firmware",
                candidates: names.join(", "),
            }
        })
}

impl FirmwareSource {
    /// Copy a fresh variable store into `output_dir`.
    pub fn install(&self, output_dir: &Utf8Path) -> Result<Firmware> {
        let vars = output_dir.join(VARS_FILE);
        debug!("Copying {} to {vars}", self.vars_template.display());
        std::fs::copy(&self.vars_template, &vars).with_context(|| {
            format!(
                "Copying firmware variables from {}",
                self.vars_template.display()
            )
        })?;
        Ok(Firmware {
            code: self.code.clone(),
            vars,
        })
    }
}
