//! Local process execution.
//!
//! This module defines the `ProcessRunner` trait the ssh layer drives
//! every invocation through, and a std::process based implementation.
//! Tests substitute a scripted lab host behind the same trait.

mod local_runner;

#[cfg(test)]
pub(crate) mod fake;

pub use local_runner::LocalRunner;

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A writer shared with the reader threads of a running process.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Stream bindings for a single process invocation.
#[derive(Clone, Default)]
pub struct ProcessIo {
    /// Bytes written to the process stdin, which is closed afterwards.
    pub stdin: Option<Vec<u8>>,
    /// Receives stdout as it streams, in addition to the captured copy.
    pub stdout_tee: Option<SharedWriter>,
    /// Receives stderr as it streams, in addition to the captured copy.
    pub stderr_tee: Option<SharedWriter>,
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.as_ref().map(Vec::len))
            .field("stdout_tee", &self.stdout_tee.is_some())
            .field("stderr_tee", &self.stderr_tee.is_some())
            .finish()
    }
}

/// Outcome of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// The command line as it was executed.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process was killed by a signal.
    pub exit_status: i32,
    pub duration: Duration,
    /// The process was killed because it outlived its timeout.
    pub timed_out: bool,
}

/// Runs local command lines (Dependency Inversion Principle).
///
/// The ssh layer only ever needs two shapes of execution: run to
/// completion with a timeout, or launch and keep a handle.
pub trait ProcessRunner: Send + Sync {
    /// Run `argv` to completion, killing it once `timeout` elapses.
    ///
    /// A timeout is reported through `ProcessResult::timed_out`, not as an error.
    fn run(&self, argv: &[String], io: &ProcessIo, timeout: Duration) -> io::Result<ProcessResult>;

    /// Launch `argv` in the background with its output discarded.
    fn spawn(&self, argv: &[String]) -> io::Result<Box<dyn BackgroundProcess>>;
}

/// Handle to a process launched by `ProcessRunner::spawn`.
pub trait BackgroundProcess: Send {
    /// OS process id.
    fn id(&self) -> u32;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Stop the process and reap it. Safe to call more than once.
    fn terminate(&mut self);
}

/// Render an argv as a single shell-like line for logs and results.
pub fn command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || "\"'$;&|<>()".contains(c)) {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
