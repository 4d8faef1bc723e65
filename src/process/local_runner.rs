//! std::process based runner.

use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{command_line, BackgroundProcess, ProcessIo, ProcessResult, ProcessRunner, SharedWriter};

/// How often a running child is polled for exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period between SIGTERM and SIGKILL when terminating.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    /// Create a new local runner.
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for LocalRunner {
    fn run(&self, argv: &[String], io: &ProcessIo, timeout: Duration) -> io::Result<ProcessResult> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let command = command_line(argv);
        debug!("Running: {}", command);

        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .stdin(if io.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(mut stdin), Some(data)) = (child.stdin.take(), io.stdin.clone()) {
            thread::spawn(move || {
                // A child that exits early closes the pipe; nothing to report.
                let _ = stdin.write_all(&data);
            });
        }

        let stdout_reader = spawn_reader(child.stdout.take(), io.stdout_tee.clone());
        let stderr_reader = spawn_reader(child.stderr.take(), io.stderr_tee.clone());

        let deadline = start + timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!("Command timed out after {:?}: {}", timeout, command);
                timed_out = true;
                let _ = child.kill();
                break child.wait()?;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        Ok(ProcessResult {
            command,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status: status.code().unwrap_or(-1),
            duration: start.elapsed(),
            timed_out,
        })
    }

    fn spawn(&self, argv: &[String]) -> io::Result<Box<dyn BackgroundProcess>> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        debug!("Spawning: {}", command_line(argv));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Box::new(LocalProcess { child }))
    }
}

/// Drain a child pipe on its own thread so neither pipe can fill up and stall the child.
fn spawn_reader<R>(source: Option<R>, tee: Option<SharedWriter>) -> thread::JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut captured = Vec::new();
        let Some(mut source) = source else {
            return captured;
        };

        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    captured.extend_from_slice(&buf[..n]);
                    if let Some(tee) = &tee {
                        if let Ok(mut writer) = tee.lock() {
                            let _ = writer.write_all(&buf[..n]);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        captured
    })
}

/// A background child process.
struct LocalProcess {
    child: Child,
}

impl LocalProcess {
    #[cfg(unix)]
    fn signal_terminate(&self) {
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {}
}

impl BackgroundProcess for LocalProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        if !self.is_alive() {
            return;
        }

        self.signal_terminate();
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if !self.is_alive() {
                return;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}
