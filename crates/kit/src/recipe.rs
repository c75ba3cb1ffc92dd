//! Recipe media synthesis
//!
//! The guest-side installer recipe is a fixed script plus two small
//! `KEY=value` files. They are staged in a temporary directory and written
//! into an ISO image which is attached to the VM as a second CD-ROM drive.
//! The guest mounts it by volume label and sources the parameter files, so
//! values are shell-quoted whenever they need it.

use std::fs::{File, Permissions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, instrument};

use crate::cleanup::RunGuard;
use crate::config::{RecipeParameters, RECIPE_LABEL};
use crate::envdetect::{CapabilityRecord, DiscWriter};
use crate::errors::ProvisionError;

/// The entry script, executed in the guest.
pub const ENTRY_SCRIPT: &str = "install";
/// Parameters for the live environment (swap).
pub const VARS_FILE: &str = "vars";
/// Parameters for the installed system (identity).
pub const INSTALL_VARS_FILE: &str = "install-vars";
/// File name of the image inside the output directory.
pub const RECIPE_IMAGE: &str = "recipe.iso";

const RECIPE_TEMPLATE: &str = include_str!("../scripts/install.sh");

/// A built recipe image. Never modified once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerMedia {
    path: Utf8PathBuf,
}

impl InstallerMedia {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

fn build_failure(context: &str, e: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::MediaBuildFailure(format!("{context}: {e}"))
}

fn kv_lines(pairs: &[(&str, String)]) -> Result<String, ProvisionError> {
    pairs.iter().try_fold(String::new(), |mut acc, (k, v)| {
        let quoted = shlex::try_quote(v).map_err(|e| build_failure(k, e))?;
        acc.push_str(k);
        acc.push('=');
        acc.push_str(&quoted);
        acc.push('\n');
        Ok(acc)
    })
}

/// Render the contents of the `vars` and `install-vars` files.
pub fn render_parameter_files(
    params: &RecipeParameters,
) -> Result<(String, String), ProvisionError> {
    let vars = kv_lines(&[("SWAP_SIZE", format!("{}G", params.swap_size_gb))])?;
    let install_vars = kv_lines(&[
        ("HOSTNAME", params.hostname.clone()),
        ("USERNAME", params.username.clone()),
        ("SSH_KEY", params.ssh_public_key.clone()),
        ("DISK_SIZE", format!("{}G", params.disk_size_gb)),
    ])?;
    Ok((vars, install_vars))
}

fn disc_writer_command(writer: &DiscWriter, staging: &Utf8Path, output: &Utf8Path) -> Command {
    match writer {
        DiscWriter::Mkisofs(bin) => {
            let mut cmd = Command::new(bin);
            cmd.args(["-quiet", "-o", output.as_str(), "-V", RECIPE_LABEL, "-J", "-R"])
                .arg(staging.as_str());
            cmd
        }
        DiscWriter::Hdiutil(bin) => {
            let mut cmd = Command::new(bin);
            cmd.args([
                "makehybrid",
                "-iso",
                "-joliet",
                "-default-volume-name",
                RECIPE_LABEL,
                "-o",
                output.as_str(),
                staging.as_str(),
            ]);
            cmd
        }
    }
}

fn write_staging(staging: &Utf8Path, params: &RecipeParameters) -> Result<(), ProvisionError> {
    let entry = staging.join(ENTRY_SCRIPT);
    {
        let f = File::create(&entry).map_err(|e| build_failure(entry.as_str(), e))?;
        let mut f = BufWriter::new(f);
        f.write_all(RECIPE_TEMPLATE.as_bytes())
            .map_err(|e| build_failure(entry.as_str(), e))?;
        let f = f.into_inner().map_err(|e| build_failure(entry.as_str(), e))?;
        f.set_permissions(Permissions::from_mode(0o755))
            .map_err(|e| build_failure(entry.as_str(), e))?;
    }
    let (vars, install_vars) = render_parameter_files(params)?;
    for (name, contents) in [(VARS_FILE, vars), (INSTALL_VARS_FILE, install_vars)] {
        let path = staging.join(name);
        std::fs::write(&path, contents).map_err(|e| build_failure(path.as_str(), e))?;
    }
    Ok(())
}

/// Build the recipe image into `output_dir`.
///
/// The staging directory is tracked by `guard` while it exists, so an
/// interrupt mid-build still removes it.
#[instrument(skip(params, caps, guard))]
pub fn synthesize(
    params: &RecipeParameters,
    caps: &CapabilityRecord,
    output_dir: &Utf8Path,
    guard: &RunGuard,
) -> Result<InstallerMedia, ProvisionError> {
    let td = tempfile::Builder::new()
        .prefix("qinstall-recipe.")
        .tempdir()
        .map_err(|e| build_failure("creating staging directory", e))?;
    guard.track_temp(td.path());
    let r = Utf8Path::from_path(td.path())
        .ok_or_else(|| build_failure("staging directory", "path is not UTF-8"))
        .and_then(|staging| write_image(params, caps, staging, output_dir));
    guard.untrack(td.path());
    r
}

fn write_image(
    params: &RecipeParameters,
    caps: &CapabilityRecord,
    staging: &Utf8Path,
    output_dir: &Utf8Path,
) -> Result<InstallerMedia, ProvisionError> {
    write_staging(staging, params)?;

    let output = output_dir.join(RECIPE_IMAGE);
    let mut cmd = disc_writer_command(&caps.disc_writer, staging, &output);
    debug!("Running {cmd:?}");
    let o = cmd
        .output()
        .map_err(|e| build_failure("running disc image writer", e))?;
    if !o.status.success() {
        let stderr = String::from_utf8_lossy(&o.stderr);
        return Err(ProvisionError::MediaBuildFailure(format!(
            "disc image writer {}: {}",
            o.status,
            stderr.trim()
        )));
    }
    if !output.exists() {
        return Err(build_failure(output.as_str(), "not created by disc image writer"));
    }
    info!("Built recipe media {output}");
    Ok(InstallerMedia { path: output })
}
