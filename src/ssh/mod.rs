//! Remote command execution over ssh.
//!
//! `SshConnection` owns one host's persistent master channel and runs
//! framed commands through a `ProcessRunner`. `SshFormatter` turns
//! `ConnectionSettings` into the ssh/scp command lines it needs.

mod command;
mod connection;
mod formatter;
mod settings;

pub use command::{
    CommandResult, RunOptions, DEFAULT_ASYNC_CONNECT_TIMEOUT, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_RUN_CONNECT_TIMEOUT,
};
pub use connection::{find_free_port, SshConnection};
pub use formatter::{shell_quote, SshFormatter, SshOptions};
pub use settings::{ConnectionSettings, HostKeyChecking};
