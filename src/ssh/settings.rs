//! Connection settings for a remote host.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default ssh port.
pub const DEFAULT_PORT: u16 = 22;

/// Default time allowed for ssh to establish a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default keepalive interval sent to the server.
pub const DEFAULT_ALIVE_INTERVAL: Duration = Duration::from_secs(300);

/// `StrictHostKeyChecking` policy passed to ssh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyChecking {
    Yes,
    #[default]
    No,
    AcceptNew,
}

impl HostKeyChecking {
    pub fn as_ssh_value(&self) -> &'static str {
        match self {
            HostKeyChecking::Yes => "yes",
            HostKeyChecking::No => "no",
            HostKeyChecking::AcceptNew => "accept-new",
        }
    }
}

impl FromStr for HostKeyChecking {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yes" | "true" => Ok(HostKeyChecking::Yes),
            "no" | "false" => Ok(HostKeyChecking::No),
            "accept-new" => Ok(HostKeyChecking::AcceptNew),
            other => Err(format!("unknown host key checking policy: {}", other)),
        }
    }
}

impl fmt::Display for HostKeyChecking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ssh_value())
    }
}

/// How to reach and authenticate against one remote host.
///
/// Built once and handed to a single `SshConnection`, which never mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub hostname: String,
    pub username: String,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    pub host_key_checking: HostKeyChecking,
    /// File ssh records host keys in; `/dev/null` keeps lab hosts out of ~/.ssh.
    pub known_hosts_file: PathBuf,
    pub connect_timeout: Duration,
    pub alive_interval: Duration,
    /// ssh binary to run.
    pub executable: String,
    /// scp binary used for file transfers.
    pub scp_executable: String,
}

impl ConnectionSettings {
    /// Create settings for `username@hostname` with lab defaults.
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            port: None,
            identity_file: None,
            host_key_checking: HostKeyChecking::default(),
            known_hosts_file: PathBuf::from("/dev/null"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            alive_interval: DEFAULT_ALIVE_INTERVAL,
            executable: "ssh".to_string(),
            scp_executable: "scp".to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_host_key_checking(mut self, policy: HostKeyChecking) -> Self {
        self.host_key_checking = policy;
        self
    }

    pub fn with_known_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_file = path.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_executables(mut self, ssh: impl Into<String>, scp: impl Into<String>) -> Self {
        self.executable = ssh.into();
        self.scp_executable = scp.into();
        self
    }

    /// `user@host` login string.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    /// The port ssh will actually connect to.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}
