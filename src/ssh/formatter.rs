//! Builds ssh and scp argument vectors from `ConnectionSettings`.

use std::collections::BTreeMap;

use super::settings::ConnectionSettings;

/// `-o Key=Value` options, kept sorted so command lines are stable.
pub type SshOptions = BTreeMap<String, String>;

/// Turns structured connection settings into ssh/scp invocations.
#[derive(Debug, Clone, Default)]
pub struct SshFormatter;

impl SshFormatter {
    pub fn new() -> Self {
        Self
    }

    /// Build an ssh invocation that connects to the host without running a command.
    ///
    /// `extra_flags` are appended after the default flags, a `None` value
    /// producing a bare switch. `extra_options` override the defaults.
    pub fn format_ssh_local_command(
        &self,
        settings: &ConnectionSettings,
        extra_flags: &[(&str, Option<String>)],
        extra_options: &SshOptions,
    ) -> Vec<String> {
        let mut argv = vec![settings.executable.clone(), "-a".to_string(), "-x".to_string()];

        if let Some(port) = settings.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        if let Some(identity) = &settings.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }

        for (flag, value) in extra_flags {
            argv.push(flag.to_string());
            if let Some(value) = value {
                argv.push(value.clone());
            }
        }

        push_options(&mut argv, settings, extra_options);
        argv.push(settings.destination());
        argv
    }

    /// Build an ssh invocation that runs `command` on the host.
    ///
    /// `env` entries are exported in the remote shell before the command runs.
    pub fn format_command(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
        settings: &ConnectionSettings,
        extra_options: &SshOptions,
    ) -> Vec<String> {
        let mut argv = self.format_ssh_local_command(settings, &[], extra_options);

        let mut remote = String::new();
        for (key, value) in env {
            remote.push_str(&format!("export {}={}; ", key, shell_quote(value)));
        }
        remote.push_str(command);

        argv.push(remote);
        argv
    }

    /// Build an scp invocation copying `source` to `destination`.
    ///
    /// Remote paths are given as `user@host:path`; see `remote_path`.
    pub fn format_scp_command(
        &self,
        settings: &ConnectionSettings,
        source: &str,
        destination: &str,
        extra_options: &SshOptions,
    ) -> Vec<String> {
        let mut argv = vec![settings.scp_executable.clone(), "-r".to_string()];

        if let Some(port) = settings.port {
            argv.push("-P".to_string());
            argv.push(port.to_string());
        }
        if let Some(identity) = &settings.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }

        push_options(&mut argv, settings, extra_options);
        argv.push(source.to_string());
        argv.push(destination.to_string());
        argv
    }

    /// `user@host:path` form of a remote path for scp.
    pub fn remote_path(&self, settings: &ConnectionSettings, path: &str) -> String {
        format!("{}:{}", settings.destination(), path)
    }
}

fn push_options(argv: &mut Vec<String>, settings: &ConnectionSettings, extra_options: &SshOptions) {
    let mut options = SshOptions::new();
    options.insert(
        "StrictHostKeyChecking".to_string(),
        settings.host_key_checking.as_ssh_value().to_string(),
    );
    options.insert(
        "UserKnownHostsFile".to_string(),
        settings.known_hosts_file.display().to_string(),
    );
    options.insert(
        "ConnectTimeout".to_string(),
        settings.connect_timeout.as_secs().max(1).to_string(),
    );
    options.insert(
        "ServerAliveInterval".to_string(),
        settings.alive_interval.as_secs().to_string(),
    );
    for (key, value) in extra_options {
        options.insert(key.clone(), value.clone());
    }

    for (key, value) in options {
        argv.push("-o".to_string());
        argv.push(format!("{}={}", key, value));
    }
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
