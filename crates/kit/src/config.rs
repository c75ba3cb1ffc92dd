//! Edit-time configuration
//!
//! qinstall deliberately has almost no runtime knobs: the guest identity,
//! sizes and paths below are constants, and the only flag is `--headless`.
//! Change them here and rebuild.

use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use const_format::concatcp;

use crate::completion::PollPolicy;
use crate::errors::ProvisionError;
use crate::media::MediaSource;
use crate::monitor::MonitorEndpoint;

/// Directory receiving the recipe image, firmware variables, disk and launcher.
pub const OUTPUT_DIR: &str = "vm";

pub const DISK_SIZE_GB: u32 = 20;
pub const SWAP_SIZE_GB: u32 = 2;
pub const HOSTNAME: &str = "archvm";
pub const USERNAME: &str = "arch";

/// Public keys tried in order, relative to the home directory.
pub const SSH_PUBLIC_KEY_FILES: &[&str] = &[".ssh/id_ed25519.pub", ".ssh/id_rsa.pub"];

pub const MEMORY_MB: u32 = 4096;
pub const VCPUS: u32 = 2;

pub const MONITOR_HOST: &str = "127.0.0.1";
pub const MONITOR_PORT: u16 = 55555;
/// A monitor session still open after this long is hung up on.
pub const MONITOR_SESSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Host port forwarded to the guest's sshd.
pub const SSH_FORWARD_PORT: u16 = 2222;

/// VNC listener used with `--headless` (display 0, i.e. TCP 5900).
pub const VNC_LISTEN: &str = "127.0.0.1:0";

pub const ISO_RELEASE: &str = "2024.10.01";
pub const ISO_NAME: &str = concatcp!("archlinux-", ISO_RELEASE, "-x86_64.iso");
pub const ISO_MIRROR: &str = concatcp!("https://geo.mirror.pkgbuild.com/iso/", ISO_RELEASE, "/");
pub const ISO_URL: &str = concatcp!(ISO_MIRROR, ISO_NAME);
pub const ISO_CHECKSUMS_URL: &str = concatcp!(ISO_MIRROR, "sha256sums.txt");

/// Volume label of the recipe image; the bootstrap line mounts it by label.
pub const RECIPE_LABEL: &str = "RECIPE";

/// Typed at the installer prompt once it is up.
pub const BOOTSTRAP_COMMAND: &str = concatcp!(
    "mkdir -p /run/recipe && mount -o ro /dev/disk/by-label/",
    RECIPE_LABEL,
    " /run/recipe && /run/recipe/install<ret>"
);

/// Wait before asking the operator to confirm the installer prompt is up.
pub const BOOT_DELAY: Duration = Duration::from_secs(45);
/// Pause after a full command has been typed.
pub const KEY_PACING: Duration = Duration::from_secs(1);
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const POLL_DEADLINE: Duration = Duration::from_secs(4 * 60 * 60);

/// Parameters rendered into the recipe media.
///
/// Only presence is checked; a nonsensical hostname or key shows up as a
/// failure inside the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeParameters {
    pub disk_size_gb: u32,
    pub swap_size_gb: u32,
    pub hostname: String,
    pub username: String,
    pub ssh_public_key: String,
}

impl RecipeParameters {
    /// Build the parameters from the constants above plus the invoking
    /// user's SSH public key.
    pub fn from_host() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;
        let ssh_public_key = read_public_key(&home)?;
        let params = Self {
            disk_size_gb: DISK_SIZE_GB,
            swap_size_gb: SWAP_SIZE_GB,
            hostname: HOSTNAME.to_owned(),
            username: USERNAME.to_owned(),
            ssh_public_key,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        for (name, value) in [
            ("hostname", &self.hostname),
            ("username", &self.username),
            ("ssh public key", &self.ssh_public_key),
        ] {
            if value.trim().is_empty() {
                return Err(ProvisionError::InvalidParameter(name));
            }
        }
        Ok(())
    }
}

fn read_public_key(home: &Path) -> Result<String> {
    let Some(path) = SSH_PUBLIC_KEY_FILES
        .iter()
        .map(|p| home.join(p))
        .find(|p| p.exists())
    else {
        return Err(eyre!(
            "No SSH public key found in {} (tried {})",
            home.display(),
            SSH_PUBLIC_KEY_FILES.join(", ")
        ));
    };
    let key = std::fs::read_to_string(&path)
        .with_context(|| format!("Reading {}", path.display()))?;
    Ok(key.trim().to_owned())
}

/// Everything a provisioning run needs, assembled once in [`crate::provision::run`].
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub output_dir: Utf8PathBuf,
    pub recipe: RecipeParameters,
    pub media: MediaSource,
    pub headless: bool,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub monitor: MonitorEndpoint,
    pub boot_delay: Duration,
    pub key_pacing: Duration,
    pub poll: PollPolicy,
}

impl ProvisionConfig {
    pub fn new(recipe: RecipeParameters, headless: bool) -> Self {
        Self {
            output_dir: Utf8PathBuf::from(OUTPUT_DIR),
            recipe,
            media: MediaSource {
                path: PathBuf::from(ISO_NAME),
                url: ISO_URL.to_owned(),
                checksums_url: ISO_CHECKSUMS_URL.to_owned(),
            },
            headless,
            memory_mb: MEMORY_MB,
            vcpus: VCPUS,
            monitor: MonitorEndpoint::new(MONITOR_HOST, MONITOR_PORT),
            boot_delay: BOOT_DELAY,
            key_pacing: KEY_PACING,
            poll: PollPolicy {
                interval: POLL_INTERVAL,
                deadline: Some(POLL_DEADLINE),
            },
        }
    }
}
