//! labcap configuration.
//!
//! A `key = value` file, `#` comments allowed, followed by `LABCAP_<KEY>`
//! environment overrides for every key.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::ssh::{ConnectionSettings, HostKeyChecking};

const DEFAULT_CONFIG_PATH: &str = "/etc/labcap.conf";
const DEFAULT_USERNAME: &str = "root";
const DEFAULT_LOG_PATH: &str = "/tmp/labcap";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Keys recognised in the file and as `LABCAP_<KEY>` variables.
const KEYS: &[&str] = &[
    "hostname",
    "username",
    "port",
    "identity_file",
    "host_key_checking",
    "known_hosts_file",
    "connect_timeout",
    "log_path",
    "log_level",
    "log_file",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub hostname: String,
    pub username: String,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    pub host_key_checking: HostKeyChecking,
    pub known_hosts_file: Option<PathBuf>,
    pub connect_timeout: Option<Duration>,
    /// Local directory capture segments are relocated into.
    pub log_path: PathBuf,
    pub log_level: String,
    /// Write logs here instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            username: DEFAULT_USERNAME.to_string(),
            port: None,
            identity_file: None,
            host_key_checking: HostKeyChecking::default(),
            known_hosts_file: None,
            connect_timeout: None,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load from `path`, or from `LABCAP_CONFIG` / the default location.
    ///
    /// An explicit path must exist; the default file is optional so a
    /// host can be given purely through the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        match path {
            Some(path) => config.apply_file(path)?,
            None => {
                let path = env::var("LABCAP_CONFIG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
                if path.exists() {
                    config.apply_file(&path)?;
                }
            }
        }

        for key in KEYS {
            if let Ok(value) = env::var(format!("LABCAP_{}", key.to_uppercase())) {
                config.set(key, value.trim())?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse file contents without consulting the environment.
    pub fn from_str_contents(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_contents(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.apply_contents(&contents)
    }

    fn apply_contents(&mut self, contents: &str) -> Result<(), ConfigError> {
        for line in contents.lines() {
            if let Some((key, value)) = parse_config_line(line) {
                self.set(key, value)?;
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Parse {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "hostname" => self.hostname = value.to_string(),
            "username" => self.username = value.to_string(),
            "port" => self.port = Some(value.parse().map_err(|_| invalid())?),
            "identity_file" => self.identity_file = Some(PathBuf::from(value)),
            "host_key_checking" => self.host_key_checking = value.parse().map_err(|_| invalid())?,
            "known_hosts_file" => self.known_hosts_file = Some(PathBuf::from(value)),
            "connect_timeout" => {
                let secs: u64 = value.parse().map_err(|_| invalid())?;
                self.connect_timeout = Some(Duration::from_secs(secs));
            }
            "log_path" => self.log_path = PathBuf::from(value),
            "log_level" => self.log_level = value.to_string(),
            "log_file" => self.log_file = Some(PathBuf::from(value)),
            _ => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::Missing("hostname".to_string()));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Missing("username".to_string()));
        }
        Ok(())
    }

    /// Connection settings for the configured capture host.
    pub fn connection_settings(&self) -> ConnectionSettings {
        let mut settings = ConnectionSettings::new(&self.hostname, &self.username)
            .with_host_key_checking(self.host_key_checking);
        if let Some(port) = self.port {
            settings = settings.with_port(port);
        }
        if let Some(identity) = &self.identity_file {
            settings = settings.with_identity_file(identity);
        }
        if let Some(known_hosts) = &self.known_hosts_file {
            settings = settings.with_known_hosts_file(known_hosts);
        }
        if let Some(timeout) = self.connect_timeout {
            settings = settings.with_connect_timeout(timeout);
        }
        settings
    }

    /// Default filter directive for the tracing subscriber.
    pub fn tracing_filter(&self) -> String {
        format!("labcap={}", self.log_level)
    }
}

/// Parse a key=value line, skipping comments and empty lines.
fn parse_config_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();

    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}
