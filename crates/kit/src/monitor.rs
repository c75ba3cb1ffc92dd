//! Sessions with the QEMU human monitor
//!
//! The monitor is a line-oriented text protocol on a TCP socket. Each
//! session is one short-lived `nc` connection: write the commands, hang up.
//! QEMU only serves one monitor client at a time, so a [`MonitorClient`]
//! never runs two sessions concurrently.

use std::fmt::Display;
use std::io::{Read as _, Write as _};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::config::MONITOR_SESSION_TIMEOUT;
use crate::envdetect::{CapabilityRecord, NetcatDialect};
use crate::errors::ProvisionError;
use crate::keys;

/// Address of the monitor socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEndpoint {
    pub host: String,
    pub port: u16,
}

impl MonitorEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The `-monitor` argument making QEMU listen on this endpoint.
    pub fn qemu_arg(&self) -> String {
        format!("tcp:{}:{},server=on,wait=off", self.host, self.port)
    }
}

impl Display for MonitorEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One connection's worth of monitor I/O.
pub trait MonitorTransport {
    /// Connect, write each line followed by a newline, and disconnect.
    /// The error is a human-readable reason.
    fn session(&self, endpoint: &MonitorEndpoint, lines: &[String]) -> Result<(), String>;
}

/// Flags that make `nc` hang up once its input is exhausted.
///
/// Unknown flavors get nothing and keep the connection open until the peer
/// closes it; [`Netcat`] hangs up on them after a timeout.
pub fn dialect_flags(dialect: NetcatDialect) -> &'static [&'static str] {
    match dialect {
        NetcatDialect::Bsd => &["-q", "0"],
        NetcatDialect::Gnu => &["-c"],
        NetcatDialect::Other => &[],
    }
}

/// How often a running session is checked for exit.
const SESSION_POLL: Duration = Duration::from_millis(20);

/// Sessions through the host's `nc`.
///
/// A refused connection makes `nc` exit at once. One still running after
/// `session_timeout` is connected and has delivered its input, so it is
/// killed and the session counts as completed.
#[derive(Debug, Clone)]
pub struct Netcat {
    program: PathBuf,
    dialect: NetcatDialect,
    session_timeout: Duration,
}

impl Netcat {
    pub fn new(caps: &CapabilityRecord) -> Self {
        Self {
            program: caps.netcat.clone(),
            dialect: caps.netcat_dialect,
            session_timeout: MONITOR_SESSION_TIMEOUT,
        }
    }

    fn command(&self, endpoint: &MonitorEndpoint) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(dialect_flags(self.dialect))
            .arg(&endpoint.host)
            .arg(endpoint.port.to_string());
        cmd
    }

    fn finish(&self, mut child: Child) -> Result<(), String> {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        if let Err(e) = pipe.read_to_string(&mut stderr) {
                            debug!("Reading nc stderr: {e}");
                        }
                    }
                    return Err(format!("nc {status}: {}", stderr.trim()));
                }
                Ok(None) if start.elapsed() >= self.session_timeout => {
                    debug!(
                        "nc still connected after {:?}; hanging up",
                        self.session_timeout
                    );
                    if let Err(e) = child.kill() {
                        debug!("Killing nc: {e}");
                    }
                    if let Err(e) = child.wait() {
                        debug!("Waiting for nc: {e}");
                    }
                    return Ok(());
                }
                Ok(None) => std::thread::sleep(SESSION_POLL),
                Err(e) => return Err(format!("waiting for nc: {e}")),
            }
        }
    }
}

impl MonitorTransport for Netcat {
    fn session(&self, endpoint: &MonitorEndpoint, lines: &[String]) -> Result<(), String> {
        let mut child = self
            .command(endpoint)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("spawning {}: {e}", self.program.display()))?;
        {
            let Some(mut stdin) = child.stdin.take() else {
                return Err("nc stdin unavailable".to_owned());
            };
            for line in lines {
                // A write error means nc already gave up; its exit status says why.
                if writeln!(stdin, "{line}").is_err() {
                    break;
                }
            }
        }
        self.finish(child)
    }
}

/// Serialized access to one monitor endpoint.
#[derive(Debug)]
pub struct MonitorClient<T> {
    endpoint: MonitorEndpoint,
    transport: T,
    session_lock: Mutex<()>,
}

impl<T: MonitorTransport> MonitorClient<T> {
    pub fn new(endpoint: MonitorEndpoint, transport: T) -> Self {
        Self {
            endpoint,
            transport,
            session_lock: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &MonitorEndpoint {
        &self.endpoint
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one session writing `lines`.
    pub fn send(&self, lines: &[String]) -> Result<(), ProvisionError> {
        let _session = self
            .session_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug!("monitor {}: {} line(s)", self.endpoint, lines.len());
        self.transport
            .session(&self.endpoint, lines)
            .map_err(|reason| ProvisionError::MonitorUnreachable {
                endpoint: self.endpoint.to_string(),
                reason,
            })
    }

    /// Type `literal` into the guest, then give its console `pacing` to
    /// catch up.
    #[instrument(skip(self))]
    pub fn type_text(&self, literal: &str, pacing: Duration) -> Result<(), ProvisionError> {
        let keys = keys::compile(literal);
        if keys.is_empty() {
            return Ok(());
        }
        debug!("typing {} key(s)", keys.len());
        self.send(&keys.monitor_commands())?;
        std::thread::sleep(pacing);
        Ok(())
    }
}
