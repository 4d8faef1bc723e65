//! Error types for labcap.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ssh::CommandResult;

pub type SshResult<T> = Result<T, SshError>;
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Errors raised while running commands over ssh.
///
/// Connection-level variants mean ssh never reached the remote shell.
/// `RemoteCommand` means the shell ran the command and it exited non-zero.
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Master ssh connection to {host} timed out after {timeout:?}")]
    ConnectionSetup { host: String, timeout: Duration },

    #[error("DNS failed to find host {host}")]
    DnsFailure {
        host: String,
        result: Box<CommandResult>,
    },

    #[error("Ssh connection to {host} timed out")]
    Timeout {
        host: String,
        result: Box<CommandResult>,
    },

    #[error("Permission denied connecting to {host}")]
    PermissionDenied {
        host: String,
        result: Box<CommandResult>,
    },

    #[error("Unknown host {host}")]
    UnknownHost {
        host: String,
        result: Box<CommandResult>,
    },

    #[error("Ssh to {host} failed for unknown reasons: {}", .result.stderr.trim())]
    Connection {
        host: String,
        result: Box<CommandResult>,
    },

    #[error("Command '{}' exited with status {}", .result.command, .result.exit_status)]
    RemoteCommand { result: Box<CommandResult> },

    #[error("Failed to launch ssh: {0}")]
    Process(#[from] std::io::Error),
}

impl SshError {
    /// The result of the failed invocation, when one was produced.
    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            SshError::DnsFailure { result, .. }
            | SshError::Timeout { result, .. }
            | SshError::PermissionDenied { result, .. }
            | SshError::UnknownHost { result, .. }
            | SshError::Connection { result, .. }
            | SshError::RemoteCommand { result } => Some(result),
            SshError::ConnectionSetup { .. } | SshError::Process(_) => None,
        }
    }

    /// True when ssh never reached the remote shell.
    pub fn is_connection_error(&self) -> bool {
        !matches!(self, SshError::RemoteCommand { .. })
    }
}

/// Errors raised by the remote capture controller.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to configure interface {iface}: {reason}")]
    InterfaceConfiguration { iface: String, reason: String },

    #[error("Unknown band '{0}': expected 2G or 5G")]
    UnknownBand(String),

    #[error("Unsupported bandwidth {bandwidth} MHz for channel {channel}")]
    UnsupportedBandwidth { channel: u32, bandwidth: u32 },

    #[error("Remote returned an invalid pid: '{0}'")]
    InvalidPid(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors loading the labcap configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid value for '{key}': {value}")]
    Parse { key: String, value: String },

    #[error("Missing required '{0}' setting")]
    Missing(String),
}
