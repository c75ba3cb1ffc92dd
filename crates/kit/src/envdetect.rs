//! Host capability detection
//!
//! Detects hardware acceleration, the download tool, the disc image writer,
//! the netcat dialect and the QEMU binaries. Results are computed once per
//! process and cached.
//!

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::ProvisionError;

pub const HYPERVISOR: &str = "qemu-system-x86_64";
pub const IMAGE_TOOL: &str = "qemu-img";
pub const NETCAT: &str = "nc";
/// ISO writers accepting mkisofs-style arguments, in order of preference.
pub const ISO_WRITERS: &[&str] = &["mkisofs", "genisoimage", "xorrisofs"];
const DARWIN_HDIUTIL: &str = "/usr/bin/hdiutil";
const DARWIN_NETCAT: &str = "/usr/bin/nc";
const DARWIN_SYSCTL: &str = "/usr/sbin/sysctl";
const KVM_DEVICE: &str = "/dev/kvm";

/// Hardware-assisted virtualization available to the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Acceleration {
    /// Pure software emulation
    None,
    /// KVM on Linux, Hypervisor.framework on macOS
    NativeHypervisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DownloadTool {
    Curl,
    Wget,
    Unavailable,
}

/// Flavor of the installed `nc`.
///
/// The flavors disagree on how to get the client to hang up once its
/// standard input is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum NetcatDialect {
    Bsd,
    Gnu,
    Other,
}

impl NetcatDialect {
    /// Classify `nc -h` output by its first non-empty line.
    pub fn from_help_output(help: &str) -> Self {
        let Some(first) = help.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Self::Other;
        };
        if first.contains("OpenBSD netcat") {
            Self::Bsd
        } else if first.starts_with("GNU netcat") {
            Self::Gnu
        } else {
            Self::Other
        }
    }
}

/// The program used to write the recipe ISO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DiscWriter {
    /// `mkisofs` or a compatible clone (`genisoimage`, `xorrisofs`)
    Mkisofs(PathBuf),
    /// macOS `hdiutil makehybrid`
    Hdiutil(PathBuf),
}

/// Everything the other components need to know about the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityRecord {
    pub acceleration: Acceleration,
    pub download_tool: DownloadTool,
    pub netcat_dialect: NetcatDialect,
    pub netcat: PathBuf,
    pub hypervisor: PathBuf,
    pub image_tool: PathBuf,
    pub disc_writer: DiscWriter,
    pub is_darwin: bool,
}

/// Read-only view of the host used by [`probe`].
pub trait HostProbe {
    fn is_darwin(&self) -> bool;
    /// An executable named `name` on `PATH`.
    fn find_program(&self, name: &str) -> Option<PathBuf>;
    fn path_exists(&self, path: &Path) -> bool;
    /// Combined stdout and stderr of running `program`, regardless of its
    /// exit status; `None` if it could not be started at all.
    fn output(&self, program: &Path, args: &[&str]) -> Option<String>;
}

/// The real host.
#[derive(Debug, Default)]
pub struct SystemHost;

impl HostProbe for SystemHost {
    fn is_darwin(&self) -> bool {
        cfg!(target_os = "macos")
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn output(&self, program: &Path, args: &[&str]) -> Option<String> {
        let o = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .ok()?;
        let mut r = String::from_utf8_lossy(&o.stdout).into_owned();
        r.push_str(&String::from_utf8_lossy(&o.stderr));
        Some(r)
    }
}

fn require(
    host: &dyn HostProbe,
    what: &'static str,
    candidates: &[&str],
) -> Result<PathBuf, ProvisionError> {
    candidates
        .iter()
        .find_map(|c| host.find_program(c))
        .ok_or_else(|| ProvisionError::missing(what, candidates))
}

fn detect_download_tool(host: &dyn HostProbe) -> DownloadTool {
    if host.find_program("curl").is_some() {
        DownloadTool::Curl
    } else if host.find_program("wget").is_some() {
        DownloadTool::Wget
    } else {
        DownloadTool::Unavailable
    }
}

fn detect_acceleration(host: &dyn HostProbe) -> Acceleration {
    let available = if host.is_darwin() {
        let sysctl = host
            .find_program("sysctl")
            .unwrap_or_else(|| PathBuf::from(DARWIN_SYSCTL));
        host.output(&sysctl, &["-n", "kern.hv_support"])
            .is_some_and(|v| v.trim() == "1")
    } else {
        host.path_exists(Path::new(KVM_DEVICE))
    };
    if available {
        Acceleration::NativeHypervisor
    } else {
        warn!("No hardware acceleration available; installation will be slow");
        Acceleration::None
    }
}

/// Probe the host.
///
/// On macOS the disc image writer and netcat ship with the base system and
/// are not checked.
pub fn probe(host: &dyn HostProbe) -> Result<CapabilityRecord, ProvisionError> {
    let is_darwin = host.is_darwin();

    let download_tool = detect_download_tool(host);
    if download_tool == DownloadTool::Unavailable {
        return Err(ProvisionError::missing("download tool", &["curl", "wget"]));
    }

    let (disc_writer, netcat) = if is_darwin {
        (
            DiscWriter::Hdiutil(PathBuf::from(DARWIN_HDIUTIL)),
            host.find_program(NETCAT)
                .unwrap_or_else(|| PathBuf::from(DARWIN_NETCAT)),
        )
    } else {
        (
            DiscWriter::Mkisofs(require(host, "disc image writer", ISO_WRITERS)?),
            require(host, "line-mode network client", &[NETCAT])?,
        )
    };
    let hypervisor = require(host, "hypervisor", &[HYPERVISOR])?;
    let image_tool = require(host, "disk image tool", &[IMAGE_TOOL])?;

    let netcat_dialect = host
        .output(&netcat, &["-h"])
        .map(|help| NetcatDialect::from_help_output(&help))
        .unwrap_or(NetcatDialect::Other);

    let acceleration = detect_acceleration(host);

    let r = CapabilityRecord {
        acceleration,
        download_tool,
        netcat_dialect,
        netcat,
        hypervisor,
        image_tool,
        disc_writer,
        is_darwin,
    };
    debug!("Host capabilities: {r:?}");
    Ok(r)
}

impl CapabilityRecord {
    /// Get the capabilities of the real host
    ///
    /// Performs detection once per process lifetime and caches the result;
    /// a failed probe is not cached.
    pub fn get_cached() -> Result<&'static Self, ProvisionError> {
        static CAPS: OnceLock<CapabilityRecord> = OnceLock::new();
        if let Some(r) = CAPS.get() {
            return Ok(r);
        }
        let r = probe(&SystemHost)?;
        Ok(CAPS.get_or_init(|| r))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{HashMap, HashSet};
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A host whose state is entirely described by its fields.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct FakeHost {
        pub darwin: bool,
        pub programs: HashMap<String, PathBuf>,
        pub paths: HashSet<PathBuf>,
        pub outputs: HashMap<String, String>,
    }

    impl FakeHost {
        pub(crate) fn with_programs(names: &[&str]) -> Self {
            let programs = names
                .iter()
                .map(|n| (n.to_string(), PathBuf::from(format!("/usr/bin/{n}"))))
                .collect();
            Self {
                programs,
                ..Default::default()
            }
        }

        /// A Linux host with every dependency installed.
        pub(crate) fn complete_linux() -> Self {
            let mut h = Self::with_programs(&["curl", "mkisofs", "nc", HYPERVISOR, IMAGE_TOOL]);
            h.outputs.insert(
                "/usr/bin/nc -h".into(),
                "OpenBSD netcat (Debian patchlevel 1.226-1ubuntu2)\nusage: nc [-46CDdFhklNnrStUuvZz]\n"
                    .into(),
            );
            h.paths.insert(PathBuf::from(KVM_DEVICE));
            h
        }
    }

    impl HostProbe for FakeHost {
        fn is_darwin(&self) -> bool {
            self.darwin
        }

        fn find_program(&self, name: &str) -> Option<PathBuf> {
            self.programs.get(name).cloned()
        }

        fn path_exists(&self, path: &Path) -> bool {
            self.paths.contains(path)
        }

        fn output(&self, program: &Path, args: &[&str]) -> Option<String> {
            let key = std::iter::once(program.to_string_lossy().into_owned())
                .chain(args.iter().map(|a| a.to_string()))
                .collect::<Vec<_>>()
                .join(" ");
            self.outputs.get(&key).cloned()
        }
    }

    #[test]
    fn test_probe_complete_linux() {
        let caps = probe(&FakeHost::complete_linux()).unwrap();
        assert_eq!(caps.acceleration, Acceleration::NativeHypervisor);
        assert_eq!(caps.download_tool, DownloadTool::Curl);
        assert_eq!(caps.netcat_dialect, NetcatDialect::Bsd);
        assert_eq!(
            caps.disc_writer,
            DiscWriter::Mkisofs(PathBuf::from("/usr/bin/mkisofs"))
        );
        assert!(!caps.is_darwin);
    }

    #[test]
    fn test_probe_is_deterministic() {
        let host = FakeHost::complete_linux();
        assert_eq!(probe(&host).unwrap(), probe(&host).unwrap());
    }

    #[test]
    fn test_cached_probe() {
        // Whatever the build host has, both calls agree
        match (CapabilityRecord::get_cached(), CapabilityRecord::get_cached()) {
            (Ok(a), Ok(b)) => assert!(std::ptr::eq(a, b)),
            (Err(_), Err(_)) => {}
            (a, b) => panic!("inconsistent probes: {a:?} / {b:?}"),
        }
    }

    /// Formatted log output of `f`, at the default (info) level.
    fn captured_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
        #[derive(Clone, Default)]
        struct Buffer(Arc<Mutex<Vec<u8>>>);

        impl std::io::Write for Buffer {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Buffer::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let r = tracing::subscriber::with_default(subscriber, f);
        let logs = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        (r, logs)
    }

    #[test]
    fn test_no_kvm_is_not_fatal() {
        let mut host = FakeHost::complete_linux();
        host.paths.clear();
        let (caps, logs) = captured_logs(|| probe(&host).unwrap());
        assert_eq!(caps.acceleration, Acceleration::None);
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("No hardware acceleration available"), "{logs}");
    }

    #[test]
    fn test_kvm_present_is_quiet() {
        let (caps, logs) = captured_logs(|| probe(&FakeHost::complete_linux()).unwrap());
        assert_eq!(caps.acceleration, Acceleration::NativeHypervisor);
        assert!(!logs.contains("WARN"), "{logs}");
    }

    #[test]
    fn test_program_lookup_skips_non_executable() {
        let td = tempfile::tempdir().unwrap();
        let name = "qinstall-test-not-executable";
        std::fs::write(td.path().join(name), "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(td.path().join(name), Permissions::from_mode(0o644)).unwrap();
        let found = which::which_in(name, Some(td.path()), td.path()).ok();
        assert_eq!(found, None);

        std::fs::set_permissions(td.path().join(name), Permissions::from_mode(0o755)).unwrap();
        let found = which::which_in(name, Some(td.path()), td.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), name);
    }

    #[test]
    fn test_wget_fallback_and_writer_alternatives() {
        let mut host = FakeHost::complete_linux();
        host.programs.remove("curl");
        host.programs.remove("mkisofs");
        host.programs
            .insert("wget".into(), PathBuf::from("/usr/bin/wget"));
        host.programs
            .insert("genisoimage".into(), PathBuf::from("/usr/bin/genisoimage"));
        let caps = probe(&host).unwrap();
        assert_eq!(caps.download_tool, DownloadTool::Wget);
        assert_eq!(
            caps.disc_writer,
            DiscWriter::Mkisofs(PathBuf::from("/usr/bin/genisoimage"))
        );
    }

    #[test]
    fn test_missing_dependencies() {
        for missing in ["curl", "mkisofs", "nc", HYPERVISOR, IMAGE_TOOL] {
            let mut host = FakeHost::complete_linux();
            host.programs.remove(missing);
            let err = probe(&host).unwrap_err();
            assert!(
                matches!(err, ProvisionError::MissingDependency { .. }),
                "{missing}: {err}"
            );
        }
    }

    #[test]
    fn test_darwin_skips_writer_and_netcat() {
        let mut host = FakeHost::with_programs(&["curl", HYPERVISOR, IMAGE_TOOL, "sysctl"]);
        host.darwin = true;
        host.outputs
            .insert("/usr/bin/sysctl -n kern.hv_support".into(), "1\n".into());
        let caps = probe(&host).unwrap();
        assert!(caps.is_darwin);
        assert_eq!(caps.acceleration, Acceleration::NativeHypervisor);
        assert_eq!(
            caps.disc_writer,
            DiscWriter::Hdiutil(PathBuf::from(DARWIN_HDIUTIL))
        );
        assert_eq!(caps.netcat, PathBuf::from(DARWIN_NETCAT));
        // No help output recorded for the assumed nc
        assert_eq!(caps.netcat_dialect, NetcatDialect::Other);
    }

    #[test]
    fn test_darwin_without_hv_support() {
        let mut host = FakeHost::with_programs(&["curl", HYPERVISOR, IMAGE_TOOL, "sysctl"]);
        host.darwin = true;
        host.outputs
            .insert("/usr/bin/sysctl -n kern.hv_support".into(), "0\n".into());
        assert_eq!(probe(&host).unwrap().acceleration, Acceleration::None);
    }

    #[test]
    fn test_netcat_dialects() {
        assert_eq!(
            NetcatDialect::from_help_output("OpenBSD netcat (Debian patchlevel 1.219-1)\n"),
            NetcatDialect::Bsd
        );
        assert_eq!(
            NetcatDialect::from_help_output(
                "GNU netcat 0.7.1, a rewrite of the famous networking tool.\nBasic usages:\n"
            ),
            NetcatDialect::Gnu
        );
        assert_eq!(
            NetcatDialect::from_help_output("\n\nusage: nc [-46AacCDdEFhklMnOortUuvz]\n"),
            NetcatDialect::Other
        );
        assert_eq!(NetcatDialect::from_help_output(""), NetcatDialect::Other);
    }

    #[test]
    fn test_display() {
        assert_eq!(Acceleration::NativeHypervisor.to_string(), "native-hypervisor");
        assert_eq!(NetcatDialect::Gnu.to_string(), "gnu");
        assert_eq!(DownloadTool::Curl.to_string(), "curl");
    }
}
