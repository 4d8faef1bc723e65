//! labcap - remote wireless packet capture over ssh.
//!
//! `ssh::SshConnection` keeps a multiplexed master connection to a capture
//! host and runs framed commands over it. `capture::PacketCapture` uses that
//! connection to drive tcpdump on the host's monitor interfaces and to
//! relocate rotated capture segments to local storage.

pub mod capture;
pub mod config;
pub mod error;
pub mod process;
pub mod ssh;

pub use capture::{Band, CaptureTimings, PacketCapture, PcapProperties, ScanResult};
pub use config::Config;
pub use error::{CaptureError, CaptureResult, ConfigError, SshError, SshResult};
pub use process::{LocalRunner, ProcessRunner};
pub use ssh::{CommandResult, ConnectionSettings, HostKeyChecking, RunOptions, SshConnection};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
