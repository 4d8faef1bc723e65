//! Per-invocation options and results.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::Duration;

use crate::process::{ProcessIo, ProcessResult, SharedWriter};

/// Default limit on how long a remote command may run.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default time allowed to establish the connection for `run`.
pub const DEFAULT_RUN_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time allowed to establish the connection for `run_async`.
pub const DEFAULT_ASYNC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for a single `SshConnection::run` call.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// Variables exported in the remote shell before the command runs.
    pub env: BTreeMap<String, String>,
    pub io: ProcessIo,
    /// Bounds master channel setup and ssh's own TCP connect.
    pub connect_timeout: Duration,
    /// Return non-zero exits as results instead of `SshError::RemoteCommand`.
    pub ignore_status: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            env: BTreeMap::new(),
            io: ProcessIo::default(),
            connect_timeout: DEFAULT_RUN_CONNECT_TIMEOUT,
            ignore_status: false,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.io.stdin = Some(data.into());
        self
    }

    /// Stream stdout to `writer` as it arrives. Like `CommandResult::stdout`,
    /// the stream starts after the connection marker.
    pub fn with_stdout_tee(mut self, writer: SharedWriter) -> Self {
        self.io.stdout_tee = Some(writer);
        self
    }

    pub fn with_stderr_tee(mut self, writer: SharedWriter) -> Self {
        self.io.stderr_tee = Some(writer);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Best-effort mode: a non-zero remote exit is not an error.
    pub fn ignore_status(mut self) -> Self {
        self.ignore_status = true;
        self
    }
}

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// The command as the caller gave it.
    pub command: String,
    /// What the remote command wrote to stdout, framing removed.
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    pub(crate) fn from_process(command: &str, stdout: String, process: ProcessResult) -> Self {
        Self {
            command: command.to_string(),
            stdout,
            stderr: process.stderr,
            exit_status: process.exit_status,
            duration: process.duration,
            timed_out: process.timed_out,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0 && !self.timed_out
    }
}

/// Remove the connection marker line for `token` and everything before it.
///
/// Returns `None` when no line starts with the marker, meaning the command
/// never reached the remote shell.
pub(crate) fn strip_connection_marker(output: &str, token: &str) -> Option<String> {
    let marker = format!("CONNECTED: {}", token);
    let mut offset = 0;
    for line in output.split_inclusive('\n') {
        if line.starts_with(&marker) {
            return Some(output[offset + line.len()..].to_string());
        }
        offset += line.len();
    }
    None
}

/// Tee writer that drops everything up to and including the marker line.
///
/// Output that never reaches the marker is never forwarded.
pub(crate) struct MarkerFilter {
    marker: String,
    inner: SharedWriter,
    pending: Vec<u8>,
    passed: bool,
}

impl MarkerFilter {
    pub(crate) fn new(token: &str, inner: SharedWriter) -> Self {
        Self {
            marker: format!("CONNECTED: {}", token),
            inner,
            pending: Vec::new(),
            passed: false,
        }
    }

    fn forward(&self, data: &[u8]) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdout tee poisoned"))?;
        inner.write_all(data)
    }
}

impl Write for MarkerFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.passed {
            self.forward(buf)?;
            return Ok(buf.len());
        }

        self.pending.extend_from_slice(buf);
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            if line.starts_with(self.marker.as_bytes()) {
                self.passed = true;
                let rest = std::mem::take(&mut self.pending);
                if !rest.is_empty() {
                    self.forward(&rest)?;
                }
                break;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock() {
            Ok(mut inner) => inner.flush(),
            Err(_) => Ok(()),
        }
    }
}
