//! Process Harness
//!
//! Launches and supervises the broker/client processes under test.
//! A spawned process offers no readiness signal, so callers apply the
//! configured startup delay before touching its socket; teardown is
//! graceful SIGTERM first, escalating to SIGKILL after a bounded wait,
//! and `kill_on_drop` backstops every exit path the runner might take.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Delay between spawning a process under test and first contacting its
/// socket. The protocol offers no readiness signal, so this bounded
/// pause is the sole mitigation for the start-vs-connect race; raise it
/// via configuration on slow machines rather than editing call sites.
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_millis(500);

/// How long a process gets to exit after SIGTERM before SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Command line and environment for one process under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Label used in logs and failure reports
    pub name: String,
    /// Executable path
    pub command: String,
    /// Arguments, passed through verbatim
    pub args: Vec<String>,
    /// Extra environment variables, forwarded opaquely (library search
    /// paths and the like; never interpreted here)
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Harness error types
#[derive(Debug)]
pub enum HarnessError {
    /// Spawning the process failed outright
    Spawn {
        name: String,
        source: std::io::Error,
    },
    /// The process exited before the protocol exchange began
    EarlyExit { name: String, status: ExitStatus },
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::Spawn { name, source } => {
                write!(f, "failed to spawn '{}': {}", name, source)
            }
            HarnessError::EarlyExit { name, status } => {
                write!(f, "'{}' exited before the exchange began: {}", name, status)
            }
        }
    }
}

impl std::error::Error for HarnessError {}

/// An owned process under test. The handle is the single owner: it
/// terminates the process, and `kill_on_drop` covers any path where
/// `terminate` never runs.
pub struct ProcessHandle {
    name: String,
    child: Child,
    terminated: bool,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
}

impl ProcessHandle {
    /// Spawn a process with stdin/stdout detached and stderr captured
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, HarnessError> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
            name: spec.name.clone(),
            source,
        })?;

        debug!(process = %spec.name, pid = ?child.id(), "spawned");

        // Drain stderr as it is produced so the pipe can never fill and
        // stall the process; the buffer is only surfaced on failure
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        Ok(Self {
            name: spec.name.clone(),
            child,
            terminated: false,
            stderr_task: Some(stderr_task),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the process has already exited, without blocking
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Wait up to `limit` for the process to exit on its own (helper
    /// processes a scenario runs to completion)
    pub async fn wait_exit(&mut self, limit: Duration) -> Option<ExitStatus> {
        match timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        }
    }

    /// Stop the process: SIGTERM, a bounded wait, then SIGKILL.
    /// Idempotent; terminating an already-exited process is a no-op.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(process = %self.name, %status, "already exited");
            return;
        }

        if let Some(pid) = self.child.id() {
            // SAFETY: signalling a pid we own; the worst a stale pid can
            // get is an ESRCH return, which is ignored
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(process = %self.name, %status, "terminated"),
            Ok(Err(e)) => warn!(process = %self.name, error = %e, "wait failed"),
            Err(_) => {
                warn!(process = %self.name, "did not exit after SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        }
    }

    /// Captured stderr, available once the process has exited. Surfaced
    /// to the user only when a scenario fails.
    pub async fn stderr_output(&mut self) -> String {
        let Some(mut task) = self.stderr_task.take() else {
            return String::new();
        };
        match timeout(Duration::from_secs(1), &mut task).await {
            Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
            _ => {
                task.abort();
                String::new()
            }
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}
