//! Remote wireless packet capture.
//!
//! A capture host carries two monitor-mode radios, one per band, and a
//! managed-mode radio used for scanning. `PacketCapture` drives tcpdump on
//! those radios over a shared `SshConnection` and moves finished rotation
//! segments off the host while the capture runs.

mod channel;
mod controller;
mod scan;
mod watcher;

pub use channel::{center_channel, channel_to_freq};
pub use controller::PacketCapture;
pub use scan::{parse_scan_results, ScanResult};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::CaptureError;

/// Managed-mode interface used for scans.
pub const SCAN_INTERFACE: &str = "wlan2";

/// Number of rotation files tcpdump cycles through (`-W`).
pub const MAX_PCAP_FILES: u32 = 20;

/// Size of each rotation file in millions of bytes (`-C`).
pub const MAX_PCAP_FILE_SIZE_MB: u32 = 100;

/// tcpdump prints this once it has attached to the interface.
pub const LISTENING_MARKER: &str = "listening on";

/// A capture band, each served by its own monitor interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Band {
    TwoG,
    FiveG,
}

impl Band {
    pub const ALL: [Band; 2] = [Band::TwoG, Band::FiveG];

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::TwoG => "2G",
            Band::FiveG => "5G",
        }
    }

    /// Monitor-mode interface dedicated to this band.
    pub fn monitor_interface(&self) -> &'static str {
        match self {
            Band::TwoG => "mon0",
            Band::FiveG => "mon1",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Band {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "2G" => Ok(Band::TwoG),
            "5G" => Ok(Band::FiveG),
            _ => Err(CaptureError::UnknownBand(s.to_string())),
        }
    }
}

/// Polling cadence of the capture controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTimings {
    /// Delay between checks of the tcpdump log for the listening marker.
    pub start_poll_interval: Duration,
    /// Number of log checks before a capture is declared failed.
    pub start_attempts: u32,
    /// Delay between checks for a new rotation segment.
    pub watcher_poll_interval: Duration,
    /// Delay between scans while looking for a network.
    pub scan_poll_interval: Duration,
}

impl Default for CaptureTimings {
    fn default() -> Self {
        Self {
            start_poll_interval: Duration::from_secs(1),
            start_attempts: 3,
            watcher_poll_interval: Duration::from_secs(2),
            scan_poll_interval: Duration::from_secs(3),
        }
    }
}

/// Bookkeeping for one running capture.
#[derive(Debug)]
pub struct PcapProperties {
    /// Remote tcpdump pid.
    pub pid: u32,
    /// Remote directory holding the segments and tcpdump log.
    pub tmp_dir: String,
    /// Remote segment path without its rotation suffix.
    pub pcap_file: String,
    pub(crate) watcher: JoinHandle<()>,
}

/// Active captures keyed by band.
///
/// Removing a band's entry is the signal its watcher waits for; the
/// condvar wakes the watcher instead of letting it sleep out its interval.
#[derive(Debug, Default)]
pub(crate) struct CaptureRegistry {
    captures: Mutex<HashMap<Band, PcapProperties>>,
    stopped: Condvar,
}

impl CaptureRegistry {
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<Band, PcapProperties>> {
        self.captures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a band's entry and wake its watcher.
    pub(crate) fn remove(&self, band: Band) -> Option<PcapProperties> {
        let removed = self.lock().remove(&band);
        self.stopped.notify_all();
        removed
    }

    /// Wait up to `timeout` for a stop, returning the reacquired guard.
    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, HashMap<Band, PcapProperties>>,
        timeout: Duration,
    ) -> MutexGuard<'a, HashMap<Band, PcapProperties>> {
        match self.stopped.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}
