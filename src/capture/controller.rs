//! Capture host controller.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::channel::{center_channel, channel_to_freq};
use super::scan::{parse_scan_results, ScanResult};
use super::watcher::SegmentWatcher;
use super::{
    Band, CaptureRegistry, CaptureTimings, PcapProperties, LISTENING_MARKER, MAX_PCAP_FILES,
    MAX_PCAP_FILE_SIZE_MB, SCAN_INTERFACE,
};
use crate::error::{CaptureError, CaptureResult};
use crate::process::{LocalRunner, ProcessRunner};
use crate::ssh::{CommandResult, ConnectionSettings, RunOptions, SshConnection};

/// Marker `iw` prints for an interface that does not exist.
const NO_SUCH_DEVICE: &str = "No such device";

/// Controls packet captures on one remote capture host.
///
/// Construction (re)creates the host's monitor and scan interfaces;
/// `close` stops any remaining captures and removes them again.
pub struct PacketCapture {
    ssh: Arc<SshConnection>,
    registry: Arc<CaptureRegistry>,
    /// Remote directories to remove on close.
    tmp_dirs: Vec<String>,
    timings: CaptureTimings,
    closed: bool,
}

impl PacketCapture {
    /// Connect to a capture host using local ssh.
    pub fn new(settings: ConnectionSettings) -> CaptureResult<Self> {
        Self::with_runner(settings, Arc::new(LocalRunner::new()))
    }

    /// Connect to a capture host through a custom process runner.
    pub fn with_runner(
        settings: ConnectionSettings,
        runner: Arc<dyn ProcessRunner>,
    ) -> CaptureResult<Self> {
        let ssh = Arc::new(SshConnection::new(settings, runner));
        let capture = Self {
            ssh,
            registry: Arc::new(CaptureRegistry::default()),
            tmp_dirs: Vec::new(),
            timings: CaptureTimings::default(),
            closed: false,
        };

        for band in Band::ALL {
            capture.create_interface(band.monitor_interface(), "monitor")?;
        }
        capture.create_interface(SCAN_INTERFACE, "managed")?;

        Ok(capture)
    }

    /// Override the polling cadence.
    pub fn with_timings(mut self, timings: CaptureTimings) -> Self {
        self.timings = timings;
        self
    }

    /// The connection shared with the segment watchers.
    pub fn connection(&self) -> &Arc<SshConnection> {
        &self.ssh
    }

    /// Bands currently capturing, with their remote pids.
    pub fn active_captures(&self) -> Vec<(Band, u32)> {
        let mut active: Vec<_> = self
            .registry
            .lock()
            .iter()
            .map(|(band, properties)| (*band, properties.pid))
            .collect();
        active.sort();
        active
    }

    fn run_best_effort(&self, command: &str) -> CaptureResult<CommandResult> {
        Ok(self.ssh.run(command, &RunOptions::new().ignore_status())?)
    }

    fn create_interface(&self, iface: &str, mode: &str) -> CaptureResult<()> {
        // Interfaces are numbered after the phy they live on: mon0 -> phy0.
        let phy = iface
            .chars()
            .last()
            .filter(|c| c.is_ascii_digit())
            .unwrap_or('0');

        self.run_best_effort(&format!("iw dev {} del", iface))?;
        self.run_best_effort(&format!("iw phy{} interface add {} type {}", phy, iface, mode))?;
        self.run_best_effort(&format!("ip link set {} up", iface))?;

        let result = self.run_best_effort(&format!("iw dev {} info", iface))?;
        if !result.stderr.trim().is_empty() || !result.stdout.contains(iface) {
            return Err(CaptureError::InterfaceConfiguration {
                iface: iface.to_string(),
                reason: format!("interface missing after creation: {}", result.stderr.trim()),
            });
        }

        debug!("Configured {} interface {}", mode, iface);
        Ok(())
    }

    fn remove_interface(&self, iface: &str) -> CaptureResult<()> {
        self.run_best_effort(&format!("iw dev {} del", iface))?;

        let result = self.run_best_effort(&format!("iw dev {} info", iface))?;
        if !result.stderr.contains(NO_SUCH_DEVICE) && !result.stdout.contains(NO_SUCH_DEVICE) {
            return Err(CaptureError::InterfaceConfiguration {
                iface: iface.to_string(),
                reason: "interface still present after deletion".to_string(),
            });
        }
        Ok(())
    }

    /// Tune a band's monitor interface to a 20 MHz channel.
    ///
    /// Returns whether the interface reports the channel afterwards.
    pub fn configure_monitor_mode(&self, band: Band, channel: u32) -> bool {
        self.configure_monitor_mode_with_bandwidth(band, channel, 20)
    }

    /// Tune a band's monitor interface to `channel` at `bandwidth` MHz.
    pub fn configure_monitor_mode_with_bandwidth(
        &self,
        band: Band,
        channel: u32,
        bandwidth: u32,
    ) -> bool {
        match self.try_configure_monitor_mode(band, channel, bandwidth) {
            Ok(true) => true,
            Ok(false) => {
                error!("Failed to configure monitor mode for {} on channel {}", band, channel);
                false
            }
            Err(e) => {
                error!("Failed to configure monitor mode for {}: {}", band, e);
                false
            }
        }
    }

    fn try_configure_monitor_mode(
        &self,
        band: Band,
        channel: u32,
        bandwidth: u32,
    ) -> CaptureResult<bool> {
        let iface = band.monitor_interface();
        let unsupported = || CaptureError::UnsupportedBandwidth { channel, bandwidth };

        let command = if bandwidth == 20 {
            format!("iw dev {} set channel {}", iface, channel)
        } else {
            let control = channel_to_freq(channel).ok_or_else(unsupported)?;
            let center = center_channel(channel, bandwidth)
                .and_then(channel_to_freq)
                .ok_or_else(unsupported)?;
            format!("iw dev {} set freq {} {} {}", iface, control, bandwidth, center)
        };
        self.run_best_effort(&command)?;

        let result = self.run_best_effort(&format!("iw dev {} info", iface))?;
        Ok(result.stderr.trim().is_empty()
            && result.stdout.contains(&format!("channel {} ", channel)))
    }

    /// Start capturing on `band`, relocating segments into `log_path`.
    ///
    /// Local segments are named `<file_name_stem>_<band>.pcapNN`. Returns the
    /// remote tcpdump pid, or `None` if the band is already capturing or
    /// tcpdump never reported that it was listening.
    pub fn start_packet_capture(
        &mut self,
        band: Band,
        log_path: &Path,
        file_name_stem: &str,
    ) -> CaptureResult<Option<u32>> {
        if self.registry.lock().contains_key(&band) {
            error!("Packet capture already running on {}", band);
            return Ok(None);
        }

        fs::create_dir_all(log_path)?;

        let tmp_dir = self
            .ssh
            .run("mktemp -d", &RunOptions::new())?
            .stdout
            .trim()
            .to_string();
        self.tmp_dirs.push(tmp_dir.clone());

        let pcap_name = format!("{}_{}.pcap", file_name_stem, band);
        let pcap_file = format!("{}/{}", tmp_dir, pcap_name);
        let pcap_log = format!("{}/{}.log", tmp_dir, pcap_name);

        let command = format!(
            "tcpdump -i {} -W {} -C {} -w {} > {} 2>&1 & echo $!",
            band.monitor_interface(),
            MAX_PCAP_FILES,
            MAX_PCAP_FILE_SIZE_MB,
            pcap_file,
            pcap_log
        );
        let output = self.ssh.run(&command, &RunOptions::new())?;
        let pid: u32 = output
            .stdout
            .trim()
            .parse()
            .map_err(|_| CaptureError::InvalidPid(output.stdout.trim().to_string()))?;

        if !self.wait_for_listening(&pcap_log)? {
            error!("Packet capture on {} failed to start (pid {})", band, pid);
            if let Err(e) = self.run_best_effort(&format!("kill {}", pid)) {
                warn!("Failed to kill stray tcpdump {}: {}", pid, e);
            }
            return Ok(None);
        }

        // Hold the registry while the watcher starts so its first membership
        // check sees this capture.
        let mut captures = self.registry.lock();
        let watcher = SegmentWatcher {
            band,
            ssh: self.ssh.clone(),
            registry: self.registry.clone(),
            pcap_file: pcap_file.clone(),
            log_path: log_path.to_path_buf(),
            pcap_name,
            poll_interval: self.timings.watcher_poll_interval,
        }
        .spawn()?;
        captures.insert(
            band,
            PcapProperties {
                pid,
                tmp_dir,
                pcap_file,
                watcher,
            },
        );
        drop(captures);

        info!("Started packet capture on {} (pid {})", band, pid);
        Ok(Some(pid))
    }

    fn wait_for_listening(&self, pcap_log: &str) -> CaptureResult<bool> {
        let command = format!("grep \"{}\" {}", LISTENING_MARKER, pcap_log);
        for attempt in 0..self.timings.start_attempts {
            if attempt > 0 {
                thread::sleep(self.timings.start_poll_interval);
            }
            let result = self.run_best_effort(&command)?;
            if result.stdout.contains(LISTENING_MARKER) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stop the capture whose tcpdump has `pid`.
    ///
    /// Blocks until the watcher has pulled the final segment and exited.
    /// An unknown pid is logged and ignored.
    pub fn stop_packet_capture(&mut self, pid: u32) -> CaptureResult<()> {
        let band = self
            .registry
            .lock()
            .iter()
            .find(|(_, properties)| properties.pid == pid)
            .map(|(band, _)| *band);

        let Some(band) = band else {
            error!("No packet capture found with pid {}", pid);
            return Ok(());
        };

        self.run_best_effort(&format!("kill {}", pid))?;

        let Some(properties) = self.registry.remove(band) else {
            return Ok(());
        };
        if properties.watcher.join().is_err() {
            error!("Packet capture watcher for {} panicked", band);
        }

        self.run_best_effort(&format!("rm -rf {}", properties.tmp_dir))?;
        self.tmp_dirs.retain(|dir| dir != &properties.tmp_dir);

        info!("Stopped packet capture on {} (pid {})", band, pid);
        Ok(())
    }

    /// Scan with the managed interface and decode the results.
    pub fn get_wifi_scan_results(&self) -> CaptureResult<Vec<ScanResult>> {
        let result = self.run_best_effort(&format!("iw dev {} scan", SCAN_INTERFACE))?;
        Ok(parse_scan_results(&result.stdout))
    }

    /// Scan repeatedly until `ssid` shows up or `timeout` passes.
    pub fn start_scan_and_find_network(&self, ssid: &str, timeout: Duration) -> CaptureResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .get_wifi_scan_results()?
                .iter()
                .any(|result| result.ssid == ssid)
            {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(self.timings.scan_poll_interval);
        }
    }

    /// Stop remaining captures, remove the monitor interfaces and temp dirs,
    /// and close the connection. Does nothing once it has succeeded.
    pub fn close(&mut self) -> CaptureResult<()> {
        if self.closed {
            return Ok(());
        }

        for (band, pid) in self.active_captures() {
            warn!("Stopping packet capture on {} left running at close", band);
            if let Err(e) = self.stop_packet_capture(pid) {
                error!("Failed to stop packet capture on {}: {}", band, e);
            }
        }

        for band in Band::ALL {
            self.remove_interface(band.monitor_interface())?;
        }

        for dir in std::mem::take(&mut self.tmp_dirs) {
            if let Err(e) = self.run_best_effort(&format!("rm -rf {}", dir)) {
                debug!("Failed to remove {}: {}", dir, e);
            }
        }

        self.ssh.close();
        self.closed = true;
        Ok(())
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close packet capture: {}", e);
        }
    }
}
