//! Background relocation of rotated capture segments.
//!
//! tcpdump writes `<file>00`, `<file>01`, ... and only ever appends to the
//! newest one, so once segment N+1 exists segment N is complete and can be
//! pulled and deleted. When the capture's registry entry disappears the
//! watcher drains any segments tcpdump rotated while being stopped, pulls
//! the last one and exits.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Band, CaptureRegistry, MAX_PCAP_FILES};
use crate::ssh::{RunOptions, SshConnection};

/// Relocates one capture's segments to local storage.
pub(crate) struct SegmentWatcher {
    pub band: Band,
    pub ssh: Arc<SshConnection>,
    pub registry: Arc<CaptureRegistry>,
    /// Remote segment path without its rotation suffix.
    pub pcap_file: String,
    /// Local directory receiving the segments.
    pub log_path: PathBuf,
    /// File name local segments are derived from.
    pub pcap_name: String,
    pub poll_interval: Duration,
}

impl SegmentWatcher {
    /// Start watching on a dedicated thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("pcap-watcher-{}", self.band))
            .spawn(move || self.run())
    }

    fn run(self) {
        // Remote suffixes wrap after MAX_PCAP_FILES; local names keep counting.
        let mut remote_index = 0;
        let mut local_seq = 0;
        let mut stopping = false;

        loop {
            let next_index = (remote_index + 1) % MAX_PCAP_FILES;
            let current = self.segment_path(remote_index);
            let next = self.segment_path(next_index);

            if self.segment_exists(&next) {
                self.relocate(&current, local_seq, true);
                remote_index = next_index;
                local_seq += 1;
                continue;
            }

            if stopping {
                self.relocate(&current, local_seq, false);
                info!("Packet capture watcher for {} finished", self.band);
                break;
            }

            let captures = self.registry.lock();
            if !captures.contains_key(&self.band) {
                // tcpdump may have rotated after `next` was checked; look again.
                stopping = true;
                continue;
            }
            drop(self.registry.wait(captures, self.poll_interval));
        }
    }

    fn segment_path(&self, index: u32) -> String {
        format!("{}{:02}", self.pcap_file, index)
    }

    fn segment_exists(&self, path: &str) -> bool {
        match self
            .ssh
            .run(&format!("ls {}", path), &RunOptions::new().ignore_status())
        {
            Ok(result) => result.stderr.trim().is_empty() && result.stdout.contains(path),
            Err(e) => {
                warn!("Failed to check for {}: {}", path, e);
                false
            }
        }
    }

    /// Pull a segment into `log_path`, optionally deleting the remote copy.
    fn relocate(&self, remote: &str, local_seq: u32, delete: bool) {
        let local = self
            .log_path
            .join(format!("{}{:02}", self.pcap_name, local_seq));
        debug!("Pulling {} to {}", remote, local.display());

        if let Err(e) = self.ssh.pull_file(&local, remote) {
            warn!("Failed to pull capture segment {}: {}", remote, e);
            return;
        }
        if delete {
            let rm = format!("rm -rf {}", remote);
            if let Err(e) = self.ssh.run(&rm, &RunOptions::new().ignore_status()) {
                warn!("Failed to remove capture segment {}: {}", remote, e);
            }
        }
    }
}
