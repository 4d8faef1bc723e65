//! Persistent ssh connection to one remote host.
//!
//! The first command opens a backgrounded `ssh -N` master that holds a
//! multiplexing control socket; later commands pass `ControlPath` and skip
//! the handshake. Every command is framed with a per-call token so output
//! from ssh itself can never be mistaken for command output.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::command::{
    strip_connection_marker, CommandResult, MarkerFilter, RunOptions, DEFAULT_COMMAND_TIMEOUT,
};
use super::formatter::{SshFormatter, SshOptions};
use super::settings::ConnectionSettings;
use crate::error::{SshError, SshResult};
use crate::process::{command_line, BackgroundProcess, ProcessIo, ProcessRunner, SharedWriter};

/// How often the control socket is checked for while the master starts.
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Extra attempts made when ssh fails to resolve the host.
const DNS_RETRIES: u32 = 2;

/// ssh exits with 255 when it fails before the remote command runs.
const SSH_FAILURE_STATUS: i32 = 255;

static DNS_FAILURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^ssh: .*: (Name or service not known|Temporary failure in name resolution)")
        .expect("valid DNS failure pattern")
});
static TIMEOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^ssh: connect to host .* port .*: Connection timed out\r?$")
        .expect("valid timeout pattern")
});
static UNKNOWN_HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^ssh: Could not resolve hostname .*: ").expect("valid unknown host pattern")
});
const PERMISSION_DENIED: &str = "Permission denied";

/// Live master channel. Holding one means the socket is expected to exist.
struct MasterChannel {
    socket_path: PathBuf,
    process: Box<dyn BackgroundProcess>,
    tempdir: TempDir,
}

impl MasterChannel {
    fn is_healthy(&mut self) -> bool {
        self.socket_path.exists() && self.process.is_alive()
    }

    fn close(mut self) {
        self.process.terminate();
        if let Err(e) = self.tempdir.close() {
            debug!("Failed to remove master ssh directory: {}", e);
        }
    }
}

/// A port forward from a local port to a port on the remote host.
struct Tunnel {
    local_port: u16,
    remote_port: u16,
    process: Box<dyn BackgroundProcess>,
}

/// Runs commands on one remote host over ssh.
///
/// Safe to share between threads. The master channel lock is only held
/// while the channel is checked, created or torn down; commands themselves
/// run concurrently over the shared socket.
pub struct SshConnection {
    settings: ConnectionSettings,
    formatter: SshFormatter,
    runner: Arc<dyn ProcessRunner>,
    master: Mutex<Option<MasterChannel>>,
    tunnels: Mutex<Vec<Tunnel>>,
}

impl SshConnection {
    /// Create a connection. Nothing is started until the first command.
    pub fn new(settings: ConnectionSettings, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            settings,
            formatter: SshFormatter::new(),
            runner,
            master: Mutex::new(None),
            tunnels: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Control socket of the current master channel, if one is held.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.lock_master()
            .as_ref()
            .map(|channel| channel.socket_path.clone())
    }

    fn lock_master(&self) -> MutexGuard<'_, Option<MasterChannel>> {
        self.master.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tunnels(&self) -> MutexGuard<'_, Vec<Tunnel>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure a healthy master channel exists and return its socket path.
    ///
    /// A channel whose socket vanished or whose process died is torn down
    /// and replaced. Calling this with a healthy channel does nothing.
    pub fn setup_master_channel(&self, timeout: Duration) -> SshResult<PathBuf> {
        let mut master = self.lock_master();

        if let Some(channel) = master.as_mut() {
            if channel.is_healthy() {
                return Ok(channel.socket_path.clone());
            }
            info!("Master ssh connection to {} is down", self.settings.hostname);
            if let Some(channel) = master.take() {
                channel.close();
            }
        }

        let tempdir = tempfile::Builder::new().prefix("ssh-master").tempdir()?;
        let socket_path = tempdir.path().join("socket");

        let mut options = SshOptions::new();
        options.insert("ControlMaster".to_string(), "yes".to_string());
        options.insert("ControlPath".to_string(), socket_path.display().to_string());
        options.insert("BatchMode".to_string(), "yes".to_string());
        let argv = self
            .formatter
            .format_ssh_local_command(&self.settings, &[("-N", None)], &options);

        info!("Starting master ssh connection to {}", self.settings.hostname);
        let mut process = self.runner.spawn(&argv)?;

        let deadline = Instant::now() + timeout;
        while !socket_path.exists() {
            if Instant::now() >= deadline || !process.is_alive() {
                process.terminate();
                return Err(SshError::ConnectionSetup {
                    host: self.settings.hostname.clone(),
                    timeout,
                });
            }
            thread::sleep(MASTER_POLL_INTERVAL);
        }

        *master = Some(MasterChannel {
            socket_path: socket_path.clone(),
            process,
            tempdir,
        });
        Ok(socket_path)
    }

    /// Tear down the master channel if one is held.
    pub fn close_master_channel(&self) {
        if let Some(channel) = self.lock_master().take() {
            debug!("Closing master ssh connection to {}", self.settings.hostname);
            channel.close();
        }
    }

    /// Run `command` on the remote host and wait for it.
    ///
    /// Connection-level failures are classified into distinct `SshError`
    /// variants; DNS failures are retried twice before giving up. A non-zero
    /// exit is `SshError::RemoteCommand` unless `ignore_status` is set, and
    /// is never retried here.
    pub fn run(&self, command: &str, options: &RunOptions) -> SshResult<CommandResult> {
        let mut retries_left = DNS_RETRIES;
        loop {
            match self.run_once(command, options) {
                Err(SshError::DnsFailure { .. }) if retries_left > 0 => {
                    retries_left -= 1;
                    debug!(
                        "Failed to resolve {}, retrying ({} left)",
                        self.settings.hostname, retries_left
                    );
                }
                other => return other,
            }
        }
    }

    fn run_once(&self, command: &str, options: &RunOptions) -> SshResult<CommandResult> {
        let socket_path = match self.setup_master_channel(options.connect_timeout) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    "Failed to create master ssh connection, using normal ssh connection: {}",
                    e
                );
                None
            }
        };

        let mut extra_options = SshOptions::new();
        extra_options.insert("BatchMode".to_string(), "yes".to_string());
        extra_options.insert(
            "ConnectTimeout".to_string(),
            options.connect_timeout.as_secs().max(1).to_string(),
        );
        if let Some(path) = &socket_path {
            extra_options.insert("ControlPath".to_string(), path.display().to_string());
        }

        let token = Uuid::new_v4().to_string();
        let full_command = format!("echo \"CONNECTED: {}\"; {}", token, command);
        let argv = self.formatter.format_command(
            &full_command,
            &options.env,
            &self.settings,
            &extra_options,
        );

        let mut io = options.io.clone();
        if let Some(tee) = io.stdout_tee.take() {
            let filter: SharedWriter = Arc::new(Mutex::new(MarkerFilter::new(&token, tee)));
            io.stdout_tee = Some(filter);
        }

        let process = self.runner.run(&argv, &io, options.timeout)?;

        match strip_connection_marker(&process.stdout, &token) {
            Some(stdout) => {
                let result = CommandResult::from_process(command, stdout, process);
                // A killed command reports through `timed_out`, not as a failure.
                if result.exit_status != 0 && !result.timed_out && !options.ignore_status {
                    return Err(SshError::RemoteCommand {
                        result: Box::new(result),
                    });
                }
                Ok(result)
            }
            None => {
                let stdout = process.stdout.clone();
                Err(self.classify_failure(CommandResult::from_process(command, stdout, process)))
            }
        }
    }

    /// Map an invocation that never reached the remote shell to an error.
    fn classify_failure(&self, result: CommandResult) -> SshError {
        let host = self.settings.hostname.clone();
        let stderr = &result.stderr;

        let dns_failure = result.exit_status == SSH_FAILURE_STATUS
            && DNS_FAILURE_PATTERN.is_match(stderr);
        let timed_out = TIMEOUT_PATTERN.is_match(stderr);
        let permission_denied = stderr.contains(PERMISSION_DENIED);
        let unknown_host = UNKNOWN_HOST_PATTERN.is_match(stderr);

        let result = Box::new(result);
        if dns_failure {
            SshError::DnsFailure { host, result }
        } else if timed_out {
            SshError::Timeout { host, result }
        } else if permission_denied {
            SshError::PermissionDenied { host, result }
        } else if unknown_host {
            SshError::UnknownHost { host, result }
        } else {
            SshError::Connection { host, result }
        }
    }

    /// Start `command` in the background and return as soon as it is launched.
    ///
    /// The result's stdout holds the remote pid. `connect_timeout` is usually
    /// `DEFAULT_ASYNC_CONNECT_TIMEOUT`.
    pub fn run_async(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        connect_timeout: Duration,
    ) -> SshResult<CommandResult> {
        let wrapped = format!("({}) < /dev/null > /dev/null 2>&1 & echo -n $!", command);
        let options = RunOptions {
            env: env.clone(),
            connect_timeout,
            ..RunOptions::default()
        };
        self.run(&wrapped, &options)
    }

    /// Copy a local file or directory to the remote host.
    pub fn send_file(&self, local_path: &Path, remote_path: &str) -> SshResult<CommandResult> {
        let source = local_path.display().to_string();
        let destination = self.formatter.remote_path(&self.settings, remote_path);
        self.transfer(&source, &destination)
    }

    /// Copy a remote file or directory to `local_path`.
    pub fn pull_file(&self, local_path: &Path, remote_path: &str) -> SshResult<CommandResult> {
        let source = self.formatter.remote_path(&self.settings, remote_path);
        let destination = local_path.display().to_string();
        self.transfer(&source, &destination)
    }

    fn transfer(&self, source: &str, destination: &str) -> SshResult<CommandResult> {
        let mut extra_options = SshOptions::new();
        extra_options.insert("BatchMode".to_string(), "yes".to_string());
        match self.setup_master_channel(self.settings.connect_timeout) {
            Ok(path) => {
                extra_options.insert("ControlPath".to_string(), path.display().to_string());
            }
            Err(e) => warn!("Transferring without master ssh connection: {}", e),
        }

        let argv = self
            .formatter
            .format_scp_command(&self.settings, source, destination, &extra_options);
        let command = command_line(&argv);
        debug!("Copying {} to {}", source, destination);

        let process = self
            .runner
            .run(&argv, &ProcessIo::default(), DEFAULT_COMMAND_TIMEOUT)?;
        let stdout = process.stdout.clone();
        let result = CommandResult::from_process(&command, stdout, process);
        if !result.success() {
            return Err(SshError::RemoteCommand {
                result: Box::new(result),
            });
        }
        Ok(result)
    }

    /// Forward `local_port` (or a free port) to `remote_port` on the remote host.
    ///
    /// Returns the local port in use.
    pub fn create_ssh_tunnel(&self, remote_port: u16, local_port: Option<u16>) -> SshResult<u16> {
        if let Some(port) = local_port {
            if let Some(tunnel) = self.lock_tunnels().iter().find(|t| t.local_port == port) {
                if tunnel.remote_port == remote_port {
                    return Ok(port);
                }
            }
        }

        let local_port = match local_port {
            Some(port) => port,
            None => find_free_port()?,
        };

        let mut options = SshOptions::new();
        options.insert("BatchMode".to_string(), "yes".to_string());
        options.insert("ExitOnForwardFailure".to_string(), "yes".to_string());
        let forward = format!("{}:localhost:{}", local_port, remote_port);
        let argv = self.formatter.format_ssh_local_command(
            &self.settings,
            &[("-n", None), ("-N", None), ("-L", Some(forward))],
            &options,
        );

        info!(
            "Opening tunnel localhost:{} -> {}:{}",
            local_port, self.settings.hostname, remote_port
        );
        let process = self.runner.spawn(&argv)?;
        self.lock_tunnels().push(Tunnel {
            local_port,
            remote_port,
            process,
        });
        Ok(local_port)
    }

    /// Close the tunnel bound to `local_port`. Returns false if none existed.
    pub fn close_ssh_tunnel(&self, local_port: u16) -> bool {
        let mut tunnels = self.lock_tunnels();
        let Some(index) = tunnels.iter().position(|t| t.local_port == local_port) else {
            return false;
        };
        let mut tunnel = tunnels.remove(index);
        tunnel.process.terminate();
        true
    }

    /// Local ports with an open tunnel.
    pub fn tunnel_ports(&self) -> Vec<u16> {
        self.lock_tunnels().iter().map(|t| t.local_port).collect()
    }

    /// Close all tunnels and the master channel. Safe to call repeatedly.
    pub fn close(&self) {
        for mut tunnel in self.lock_tunnels().drain(..) {
            tunnel.process.terminate();
        }
        self.close_master_channel();
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ask the OS for a currently unused local TCP port.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
