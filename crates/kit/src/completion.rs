//! Waiting for the guest to power itself off
//!
//! There is no completion message from the guest. QEMU exits when the guest
//! powers off, taking its monitor socket with it, so a monitor session that
//! cannot connect is the signal that installation finished.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{debug, info, instrument};

use crate::errors::ProvisionError;
use crate::monitor::{MonitorClient, MonitorTransport};

/// Harmless monitor command used purely as a liveness probe.
pub const LIVENESS_COMMAND: &str = "info block";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Give up with [`ProvisionError::GuestTimeout`] after this long;
    /// `None` waits forever.
    pub deadline: Option<Duration>,
}

/// Create a spinner for the wait
pub fn create_poll_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Installing...");
    pb
}

/// Block until the guest has shut down.
///
/// Returns the number of successful liveness probes made before the monitor
/// went away.
#[instrument(skip_all, fields(endpoint = %client.endpoint()))]
pub fn await_shutdown<T: MonitorTransport>(
    client: &MonitorClient<T>,
    policy: PollPolicy,
    progress: &ProgressBar,
) -> Result<u64, ProvisionError> {
    let start = Instant::now();
    let probe = [LIVENESS_COMMAND.to_owned()];
    let mut polls = 0u64;
    loop {
        match client.send(&probe) {
            Ok(()) => {}
            Err(e) if e.is_monitor_unreachable() => {
                debug!("Monitor gone after {polls} poll(s): {e}");
                progress.finish_and_clear();
                info!("Guest has shut down");
                return Ok(polls);
            }
            Err(e) => return Err(e),
        }
        polls += 1;
        progress.set_message(format!("Installing... (guest alive, {polls} checks)"));
        if let Some(deadline) = policy.deadline {
            if start.elapsed() >= deadline {
                progress.abandon_with_message("Timed out waiting for the guest");
                return Err(ProvisionError::GuestTimeout(deadline));
            }
        }
        std::thread::sleep(policy.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::tests::RecordingTransport;
    use crate::monitor::MonitorEndpoint;

    fn client(transport: RecordingTransport) -> MonitorClient<RecordingTransport> {
        MonitorClient::new(MonitorEndpoint::new("127.0.0.1", 55555), transport)
    }

    #[test]
    fn test_refused_returns_immediately() {
        let c = client(RecordingTransport::failing_from(0));
        // Would take an hour if it slept even once
        let policy = PollPolicy {
            interval: Duration::from_secs(3600),
            deadline: None,
        };
        let start = Instant::now();
        let polls = await_shutdown(&c, policy, &ProgressBar::hidden()).unwrap();
        assert_eq!(polls, 0);
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(c.transport().session_count(), 1);
    }

    #[test]
    fn test_polls_until_gone() {
        let c = client(RecordingTransport::failing_from(3));
        let policy = PollPolicy {
            interval: Duration::ZERO,
            deadline: None,
        };
        let polls = await_shutdown(&c, policy, &ProgressBar::hidden()).unwrap();
        assert_eq!(polls, 3);
        assert_eq!(c.transport().session_count(), 4);
    }

    #[test]
    fn test_deadline() {
        let c = client(RecordingTransport::default());
        let policy = PollPolicy {
            interval: Duration::ZERO,
            deadline: Some(Duration::ZERO),
        };
        let err = await_shutdown(&c, policy, &ProgressBar::hidden()).unwrap_err();
        assert!(matches!(err, ProvisionError::GuestTimeout(_)));
    }
}
