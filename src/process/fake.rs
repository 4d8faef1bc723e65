//! Scripted capture host for tests.
//!
//! `FakeLabHost` answers ssh and scp invocations the way a capture host
//! would, from in-memory state: a remote filesystem, wireless interfaces
//! and a tcpdump that writes a fixed number of rotation segments.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{command_line, BackgroundProcess, ProcessIo, ProcessResult, ProcessRunner};
use crate::capture::channel_to_freq;

const NO_SUCH_DEVICE: &str = "command failed: No such device (-19)";

/// Connection-level failure every ssh invocation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Dns,
    Timeout,
    PermissionDenied,
    UnknownHost,
    Other,
}

impl Failure {
    fn stderr(&self) -> &'static str {
        match self {
            Failure::Dns => "ssh: Could not resolve hostname pcap-box: Name or service not known\n",
            Failure::Timeout => "ssh: connect to host pcap-box port 22: Connection timed out\n",
            Failure::PermissionDenied => "root@pcap-box: Permission denied (publickey).\n",
            Failure::UnknownHost => {
                "ssh: Could not resolve hostname pcap-box: nodename nor servname provided, or not known\n"
            }
            Failure::Other => "kex_exchange_identification: Connection closed by remote host\n",
        }
    }
}

#[derive(Debug, Clone)]
struct Interface {
    kind: String,
    channel: Option<u32>,
}

/// A tcpdump started on the fake host.
struct FakeCapture {
    /// Segment path without its rotation suffix.
    file: String,
    /// tcpdump `-W`: suffixes wrap after this many files.
    max_files: u32,
    /// Segments written so far.
    written: u32,
    alive: bool,
}

impl FakeCapture {
    /// Write the next segment, reusing suffixes after `max_files`.
    fn rotate(&mut self, files: &mut BTreeMap<String, String>) {
        let path = format!("{}{:02}", self.file, self.written % self.max_files);
        files.insert(path, format!("segment {}", self.written));
        self.written += 1;
    }
}

struct State {
    commands: Vec<String>,
    files: BTreeMap<String, String>,
    interfaces: HashMap<String, Interface>,
    broken_interfaces: HashSet<String>,
    pinned_interfaces: HashSet<String>,
    failure: Option<Failure>,
    listening_after: u32,
    greps: u32,
    segments: u32,
    segments_on_ls: u32,
    rotate_on_kill: bool,
    captures: HashMap<u32, FakeCapture>,
    next_pid: u32,
    tmp_dirs: Vec<String>,
    scan_output: String,
    ssh_runs: usize,
    last_ssh_argv: Option<Vec<String>>,
    spawned: Vec<Arc<AtomicBool>>,
    master_never_ready: bool,
    master_hanging: bool,
}

/// In-memory capture host behind the `ProcessRunner` seam.
pub struct FakeLabHost {
    state: Mutex<State>,
}

struct Output {
    stdout: String,
    stderr: String,
    status: i32,
    timed_out: bool,
}

impl Output {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: 0,
            timed_out: false,
        }
    }

    fn fail(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status,
            timed_out: false,
        }
    }
}

impl FakeLabHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                commands: Vec::new(),
                files: BTreeMap::new(),
                interfaces: HashMap::new(),
                broken_interfaces: HashSet::new(),
                pinned_interfaces: HashSet::new(),
                failure: None,
                listening_after: 1,
                greps: 0,
                segments: 3,
                segments_on_ls: 0,
                rotate_on_kill: false,
                captures: HashMap::new(),
                next_pid: 4000,
                tmp_dirs: Vec::new(),
                scan_output: String::new(),
                ssh_runs: 0,
                last_ssh_argv: None,
                spawned: Vec::new(),
                master_never_ready: false,
                master_hanging: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Every ssh invocation fails before reaching the remote shell.
    pub fn with_failure(self, failure: Failure) -> Self {
        self.state().failure = Some(failure);
        self
    }

    /// Master processes exit immediately without creating a socket.
    pub fn with_master_never_ready(self) -> Self {
        self.state().master_never_ready = true;
        self
    }

    /// Master processes stay up but never create a socket.
    pub fn with_master_hanging(self) -> Self {
        self.state().master_hanging = true;
        self
    }

    /// Creating this interface silently fails.
    pub fn with_broken_interface(self, iface: &str) -> Self {
        self.state().broken_interfaces.insert(iface.to_string());
        self
    }

    /// Number of rotation segments each tcpdump writes.
    pub fn with_segments(self, segments: u32) -> Self {
        self.state().segments = segments;
        self
    }

    /// tcpdump logs the listening marker on the n-th check; 0 means never.
    pub fn with_listening_after(self, greps: u32) -> Self {
        self.state().listening_after = greps;
        self
    }

    /// After the initial segments, each `ls` of a capture writes one more,
    /// up to `extra` in total.
    pub fn with_segments_on_ls(self, extra: u32) -> Self {
        self.state().segments_on_ls = extra;
        self
    }

    /// tcpdump writes one last segment while being killed.
    pub fn with_rotation_on_kill(self) -> Self {
        self.state().rotate_on_kill = true;
        self
    }

    /// Segments written so far by the tcpdump with `pid`.
    pub fn segments_written(&self, pid: u32) -> u32 {
        self.state()
            .captures
            .get(&pid)
            .map(|capture| capture.written)
            .unwrap_or_default()
    }

    pub fn with_scan_output(self, output: &str) -> Self {
        self.state().scan_output = output.to_string();
        self
    }

    /// Deleting this interface silently does nothing from now on.
    pub fn pin_interface(&self, iface: &str) {
        self.state().pinned_interfaces.insert(iface.to_string());
    }

    pub fn has_interface(&self, iface: &str) -> bool {
        self.state().interfaces.contains_key(iface)
    }

    pub fn put_remote_file(&self, path: &str, contents: &str) {
        self.state()
            .files
            .insert(path.to_string(), contents.to_string());
    }

    pub fn remote_file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn remote_files_containing(&self, needle: &str) -> Vec<String> {
        self.state()
            .files
            .keys()
            .filter(|path| path.contains(needle))
            .cloned()
            .collect()
    }

    /// Directories handed out by `mktemp -d`, oldest first.
    pub fn tmp_dirs(&self) -> Vec<String> {
        self.state().tmp_dirs.clone()
    }

    /// Remote commands with framing removed, plus `scp SRC DST` lines.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn ssh_run_count(&self) -> usize {
        self.state().ssh_runs
    }

    pub fn last_ssh_argv(&self) -> Option<Vec<String>> {
        self.state().last_ssh_argv.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state().spawned.len()
    }

    pub fn kill_spawned(&self) {
        for alive in &self.state().spawned {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn any_spawned_alive(&self) -> bool {
        self.state()
            .spawned
            .iter()
            .any(|alive| alive.load(Ordering::SeqCst))
    }

    fn run_ssh(&self, argv: &[String], io: &ProcessIo, timeout: Duration) -> Output {
        let mut state = self.state();
        state.ssh_runs += 1;
        state.last_ssh_argv = Some(argv.to_vec());

        if let Some(failure) = state.failure {
            return Output::fail(255, failure.stderr());
        }

        let mut remote = argv.last().map(String::as_str).unwrap_or_default();
        while let Some(rest) = remote.strip_prefix("export ") {
            remote = rest.split_once("; ").map(|(_, tail)| tail).unwrap_or_default();
        }

        let Some((token, command)) = remote
            .strip_prefix("echo \"CONNECTED: ")
            .and_then(|rest| rest.split_once("\"; "))
        else {
            return Output::fail(1, "missing connection marker\n");
        };

        state.commands.push(command.to_string());
        let mut output = state.execute_sequence(command, io, timeout);
        output.stdout = format!("CONNECTED: {}\n{}", token, output.stdout);
        output
    }

    fn run_scp(&self, argv: &[String]) -> Output {
        let mut state = self.state();
        if let Some(failure) = state.failure {
            return Output::fail(255, failure.stderr());
        }

        let (source, destination) = match argv {
            [.., source, destination] => (source.as_str(), destination.as_str()),
            _ => return Output::fail(1, "usage: scp source target\n"),
        };
        state.commands.push(format!("scp {} {}", source, destination));

        match (remote_part(source), remote_part(destination)) {
            (Some(path), None) => match state.files.get(path) {
                Some(contents) => match fs::write(destination, contents) {
                    Ok(()) => Output::ok(""),
                    Err(e) => Output::fail(1, format!("scp: {}: {}\n", destination, e)),
                },
                None => Output::fail(1, format!("scp: {}: No such file or directory\n", path)),
            },
            (None, Some(path)) => match fs::read_to_string(source) {
                Ok(contents) => {
                    state.files.insert(path.to_string(), contents);
                    Output::ok("")
                }
                Err(e) => Output::fail(1, format!("scp: {}: {}\n", source, e)),
            },
            _ => Output::fail(1, "scp: one side must be remote\n"),
        }
    }
}

impl State {
    /// Run `a; b; c`, with `sleep N` past `timeout` killing the sequence.
    fn execute_sequence(&mut self, command: &str, io: &ProcessIo, timeout: Duration) -> Output {
        if command.starts_with('(') {
            return self.execute(command, io);
        }

        let mut combined = Output::ok("");
        for part in command.split("; ") {
            if let Some(secs) = part
                .strip_prefix("sleep ")
                .and_then(|secs| secs.trim().parse::<u64>().ok())
            {
                if Duration::from_secs(secs) > timeout {
                    combined.status = -1;
                    combined.timed_out = true;
                    return combined;
                }
                combined.status = 0;
                continue;
            }

            let output = self.execute(part, io);
            combined.stdout.push_str(&output.stdout);
            combined.stderr.push_str(&output.stderr);
            combined.status = output.status;
        }
        combined
    }

    fn execute(&mut self, command: &str, io: &ProcessIo) -> Output {
        let words: Vec<&str> = command.split_whitespace().collect();

        if command.starts_with('(') && command.ends_with("& echo -n $!") {
            return Output::ok(self.allocate_pid().to_string());
        }

        match words.as_slice() {
            ["echo", ..] => Output::ok(format!("{}\n", command["echo".len()..].trim_start())),
            ["exit", code] => Output::fail(code.parse().unwrap_or(1), ""),
            ["cat"] => Output::ok(
                io.stdin
                    .as_ref()
                    .map(|data| String::from_utf8_lossy(data).into_owned())
                    .unwrap_or_default(),
            ),
            ["mktemp", "-d"] => {
                let dir = format!("/tmp/tmp.fake{}", self.tmp_dirs.len() + 1);
                self.tmp_dirs.push(dir.clone());
                Output::ok(format!("{}\n", dir))
            }
            ["tcpdump", ..] => self.tcpdump(&words),
            ["grep", ..] => {
                self.greps += 1;
                if self.listening_after > 0 && self.greps >= self.listening_after {
                    Output::ok("listening on mon, link-type IEEE802_11_RADIO, snapshot length 262144 bytes\n")
                } else {
                    Output::fail(1, "")
                }
            }
            ["ls", path] => {
                self.grow_capture(path);
                if self.files.contains_key(*path) {
                    Output::ok(format!("{}\n", path))
                } else {
                    Output::fail(
                        2,
                        format!("ls: cannot access '{}': No such file or directory\n", path),
                    )
                }
            }
            ["rm", "-rf", path] => {
                let dir = format!("{}/", path);
                self.files
                    .retain(|file, _| file != path && !file.starts_with(&dir));
                Output::ok("")
            }
            ["kill", pid] => {
                if let Some(capture) = pid
                    .parse::<u32>()
                    .ok()
                    .and_then(|pid| self.captures.get_mut(&pid))
                {
                    if capture.alive && self.rotate_on_kill {
                        capture.rotate(&mut self.files);
                    }
                    capture.alive = false;
                }
                Output::ok("")
            }
            ["iw", "dev", iface, rest @ ..] => self.iw_dev(iface, rest),
            ["iw", phy, "interface", "add", iface, "type", kind] if phy.starts_with("phy") => {
                if self.broken_interfaces.contains(*iface) {
                    return Output::fail(240, "command failed: Device or resource busy (-16)\n");
                }
                self.interfaces.insert(
                    iface.to_string(),
                    Interface {
                        kind: kind.to_string(),
                        channel: None,
                    },
                );
                Output::ok("")
            }
            ["ip", "link", "set", iface, "up"] => {
                if self.interfaces.contains_key(*iface) {
                    Output::ok("")
                } else {
                    Output::fail(1, format!("Cannot find device \"{}\"\n", iface))
                }
            }
            _ => Output::fail(127, format!("sh: {}: command not found\n", command)),
        }
    }

    fn grow_capture(&mut self, path: &str) {
        let Some(capture) = self
            .captures
            .values_mut()
            .find(|capture| capture.alive && path.starts_with(&capture.file))
        else {
            return;
        };
        if capture.written < self.segments + self.segments_on_ls {
            capture.rotate(&mut self.files);
        }
    }

    fn allocate_pid(&mut self) -> u32 {
        self.next_pid += 1;
        self.next_pid
    }

    fn tcpdump(&mut self, words: &[&str]) -> Output {
        let Some(file) = words
            .iter()
            .position(|w| *w == "-w")
            .and_then(|i| words.get(i + 1))
        else {
            return Output::fail(1, "tcpdump: no output file\n");
        };

        let max_files = words
            .iter()
            .position(|w| *w == "-W")
            .and_then(|i| words.get(i + 1))
            .and_then(|w| w.parse().ok())
            .unwrap_or(1);

        let mut capture = FakeCapture {
            file: file.to_string(),
            max_files,
            written: 0,
            alive: true,
        };
        for _ in 0..self.segments {
            capture.rotate(&mut self.files);
        }

        let pid = self.allocate_pid();
        self.captures.insert(pid, capture);
        self.greps = 0;
        Output::ok(format!("{}\n", pid))
    }

    fn iw_dev(&mut self, iface: &str, args: &[&str]) -> Output {
        if args == ["del"] {
            if self.pinned_interfaces.contains(iface) {
                return Output::ok("");
            }
            return match self.interfaces.remove(iface) {
                Some(_) => Output::ok(""),
                None => Output::fail(237, format!("{}\n", NO_SUCH_DEVICE)),
            };
        }

        if args == ["scan"] {
            return Output::ok(self.scan_output.clone());
        }

        let Some(interface) = self.interfaces.get_mut(iface) else {
            return Output::fail(237, format!("{}\n", NO_SUCH_DEVICE));
        };

        match args {
            ["info"] => {
                let mut info = format!("Interface {}\n\tifindex 5\n\ttype {}\n", iface, interface.kind);
                if let Some(channel) = interface.channel {
                    let freq = channel_to_freq(channel).unwrap_or_default();
                    info.push_str(&format!("\tchannel {} ({} MHz), width: 20 MHz\n", channel, freq));
                }
                Output::ok(info)
            }
            ["set", "channel", channel] => match channel.parse::<u32>() {
                Ok(channel) if channel_to_freq(channel).is_some() => {
                    interface.channel = Some(channel);
                    Output::ok("")
                }
                _ => Output::fail(234, "command failed: Invalid argument (-22)\n"),
            },
            ["set", "freq", control, _width, _center] => match control.parse::<u32>() {
                Ok(freq) => {
                    interface.channel = freq_to_channel(freq);
                    Output::ok("")
                }
                Err(_) => Output::fail(234, "command failed: Invalid argument (-22)\n"),
            },
            _ => Output::fail(1, "Usage: iw [options] command\n"),
        }
    }
}

fn freq_to_channel(freq: u32) -> Option<u32> {
    match freq {
        2484 => Some(14),
        2412..=2472 => Some((freq - 2407) / 5),
        5160..=5885 => Some((freq - 5000) / 5),
        _ => None,
    }
}

/// Path part of a `user@host:path` scp argument.
fn remote_part(arg: &str) -> Option<&str> {
    let (host, path) = arg.split_once(':')?;
    (host.contains('@') && !host.contains('/')).then_some(path)
}

impl ProcessRunner for FakeLabHost {
    fn run(&self, argv: &[String], io: &ProcessIo, timeout: Duration) -> io::Result<ProcessResult> {
        let output = match argv.first().map(String::as_str) {
            Some("ssh") => self.run_ssh(argv, io, timeout),
            Some("scp") => self.run_scp(argv),
            _ => return Err(io::Error::new(io::ErrorKind::NotFound, "unknown executable")),
        };

        if let Some(tee) = &io.stdout_tee {
            tee.lock().unwrap().write_all(output.stdout.as_bytes())?;
        }

        Ok(ProcessResult {
            command: command_line(argv),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_status: output.status,
            duration: Duration::ZERO,
            timed_out: output.timed_out,
        })
    }

    fn spawn(&self, argv: &[String]) -> io::Result<Box<dyn BackgroundProcess>> {
        let mut state = self.state();
        let control_path = argv
            .iter()
            .find_map(|arg| arg.strip_prefix("ControlPath="));

        let alive = if state.failure.is_some() || state.master_never_ready {
            false
        } else {
            if let (Some(path), false) = (control_path, state.master_hanging) {
                fs::write(path, "")?;
            }
            true
        };

        let alive = Arc::new(AtomicBool::new(alive));
        state.spawned.push(alive.clone());
        Ok(Box::new(FakeProcess {
            id: 1000 + state.spawned.len() as u32,
            alive,
        }))
    }
}

struct FakeProcess {
    id: u32,
    alive: Arc<AtomicBool>,
}

impl BackgroundProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
