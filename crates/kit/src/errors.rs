//! Failure categories for a provisioning run
//!
//! Every category is fatal for the run as a whole; the distinction exists so
//! that callers can react to the one case that is not a failure at all
//! (an unreachable monitor while polling for shutdown).

use std::time::Duration;

use camino::Utf8PathBuf;

/// Errors raised by the provisioning components.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// A required host program is absent.
    #[error("missing dependency: {what} (looked for {candidates})")]
    MissingDependency {
        /// Human name of the capability, e.g. "disc image writer"
        what: &'static str,
        /// The program names or paths that were searched for
        candidates: String,
    },

    /// The install media is absent, was declined, or failed verification.
    #[error("install media unavailable: {0}")]
    MediaAcquisitionFailure(String),

    /// The output directory already exists; nothing is overwritten.
    #[error("output directory already exists: {0}")]
    DirectoryConflict(Utf8PathBuf),

    /// The disc-image writer exited unsuccessfully.
    #[error("building recipe media failed: {0}")]
    MediaBuildFailure(String),

    /// Creating the virtual disk failed.
    #[error("creating disk image failed: {0}")]
    DiskCreateFailure(String),

    /// A monitor session could not be completed.
    #[error("monitor at {endpoint} unreachable: {reason}")]
    MonitorUnreachable {
        /// The `host:port` of the monitor socket
        endpoint: String,
        /// What went wrong with the session
        reason: String,
    },

    /// The guest did not power off within the polling deadline.
    #[error("guest did not shut down within {}s", .0.as_secs())]
    GuestTimeout(Duration),

    /// A recipe parameter is empty.
    #[error("recipe parameter {0} must not be empty")]
    InvalidParameter(&'static str),
}

impl ProvisionError {
    pub(crate) fn missing(what: &'static str, candidates: &[&str]) -> Self {
        Self::MissingDependency {
            what,
            candidates: candidates.join(", "),
        }
    }

    pub(crate) fn is_monitor_unreachable(&self) -> bool {
        matches!(self, Self::MonitorUnreachable { .. })
    }
}
