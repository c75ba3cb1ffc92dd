//! Install media acquisition
//!
//! Resolves the installer ISO to a verified local file, downloading it with
//! the host's download tool if the operator agrees. Verification compares the
//! SHA-256 digest against the mirror's `sha256sums.txt`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::cleanup::RunGuard;
use crate::envdetect::{CapabilityRecord, DownloadTool};
use crate::errors::ProvisionError;

/// Where the install media lives locally and where to fetch it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub path: PathBuf,
    pub url: String,
    /// A `sha256sum`-format listing covering the file named in `url`
    pub checksums_url: String,
}

impl MediaSource {
    /// The file name the checksum listing knows the media by.
    fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }
}

fn failure(msg: impl Into<String>) -> ProvisionError {
    ProvisionError::MediaAcquisitionFailure(msg.into())
}

/// The command fetching `url` into `dest`, or `None` without a tool.
pub fn download_command(tool: DownloadTool, url: &str, dest: &Path) -> Option<Command> {
    let mut cmd = match tool {
        DownloadTool::Curl => {
            let mut c = Command::new("curl");
            c.args(["-fL", "-o"]).arg(dest);
            c
        }
        DownloadTool::Wget => {
            let mut c = Command::new("wget");
            c.arg("-O").arg(dest);
            c
        }
        DownloadTool::Unavailable => return None,
    };
    cmd.arg(url);
    Some(cmd)
}

/// Download `url` to `dest`, going through `dest.part` so an interrupted
/// transfer never looks like a complete file.
fn fetch(
    tool: DownloadTool,
    url: &str,
    dest: &Path,
    guard: &RunGuard,
) -> Result<(), ProvisionError> {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    let Some(mut cmd) = download_command(tool, url, &part) else {
        return Err(failure("no download tool available"));
    };
    guard.track_temp(&part);
    debug!("Running {cmd:?}");
    let r = match cmd.status() {
        Err(e) => Err(failure(format!("running {tool}: {e}"))),
        Ok(status) if !status.success() => {
            if let Err(e) = std::fs::remove_file(&part) {
                debug!("Removing {}: {e}", part.display());
            }
            Err(failure(format!("downloading {url}: {tool} {status}")))
        }
        Ok(_) => std::fs::rename(&part, dest)
            .map_err(|e| failure(format!("renaming {}: {e}", part.display()))),
    };
    guard.untrack(&part);
    r
}

/// Find the digest for `file_name` in a `sha256sum`-format listing.
///
/// Both text (`hash  name`) and binary (`hash *name`) markers are accepted.
pub fn expected_checksum(listing: &str, file_name: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let (hash, name) = line.trim().split_once(char::is_whitespace)?;
        let name = name.trim_start();
        let name = name.strip_prefix('*').unwrap_or(name);
        (name == file_name).then(|| hash.to_ascii_lowercase())
    })
}

/// SHA-256 of `path`, as lowercase hex.
pub fn sha256_of(path: &Path) -> Result<String, ProvisionError> {
    let mut f = File::open(path)
        .map_err(|e| failure(format!("opening {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher)
        .map_err(|e| failure(format!("computing checksum of {}: {e}", path.display())))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn verify(
    source: &MediaSource,
    caps: &CapabilityRecord,
    guard: &RunGuard,
) -> Result<(), ProvisionError> {
    let td = tempfile::tempdir()
        .map_err(|e| failure(format!("creating temporary directory: {e}")))?;
    guard.track_temp(td.path());
    let r = verify_with_listing(source, caps, td.path(), guard);
    guard.untrack(td.path());
    r
}

fn verify_with_listing(
    source: &MediaSource,
    caps: &CapabilityRecord,
    workdir: &Path,
    guard: &RunGuard,
) -> Result<(), ProvisionError> {
    let listing_path = workdir.join("sha256sums.txt");
    fetch(caps.download_tool, &source.checksums_url, &listing_path, guard)?;
    let listing = std::fs::read_to_string(&listing_path)
        .map_err(|e| failure(format!("reading checksum listing: {e}")))?;
    let name = source.file_name();
    let expected = expected_checksum(&listing, name)
        .ok_or_else(|| failure(format!("{name} not listed in {}", source.checksums_url)))?;
    let actual = sha256_of(&source.path)?;
    if actual != expected {
        return Err(failure(format!(
            "checksum mismatch for {}: expected {expected}, got {actual}",
            source.path.display()
        )));
    }
    debug!("{} has the expected checksum", source.path.display());
    Ok(())
}

/// Produce a verified local copy of the install media.
///
/// `confirm` is asked before downloading and receives the question to ask.
/// A file that fails verification is left in place for inspection; partial
/// downloads are tracked by `guard` until renamed into place.
#[instrument(skip_all, fields(path = %source.path.display()))]
pub fn acquire(
    source: &MediaSource,
    caps: &CapabilityRecord,
    guard: &RunGuard,
    confirm: impl FnOnce(&str) -> bool,
) -> Result<PathBuf, ProvisionError> {
    if !source.path.exists() {
        if caps.download_tool == DownloadTool::Unavailable {
            return Err(failure(format!(
                "{} not found and no download tool is available",
                source.path.display()
            )));
        }
        let question = format!(
            "{} not found. Download it from {}?",
            source.path.display(),
            source.url
        );
        if !confirm(&question) {
            return Err(failure(format!("{} not found; download declined", source.path.display())));
        }
        info!("Downloading {}", source.url);
        fetch(caps.download_tool, &source.url, &source.path, guard)?;
    }
    if let Err(e) = verify(source, caps, guard) {
        warn!("Verification failed; leaving {} in place", source.path.display());
        return Err(e);
    }
    info!("Using install media {}", source.path.display());
    Ok(source.path.clone())
}
