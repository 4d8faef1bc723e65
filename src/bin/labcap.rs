//! labcap - drive a remote wireless capture host.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labcap::{Band, Config, LocalRunner, PacketCapture, RunOptions, SshConnection};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::EnvFilter;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "labcap")]
#[command(about = "Remote wireless packet capture over ssh", version)]
struct Cli {
    /// Config file (default: $LABCAP_CONFIG or /etc/labcap.conf)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on the capture host
    Run {
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Capture packets on one band until the duration passes or Ctrl+C
    Capture {
        /// Band to capture on (2G or 5G)
        #[arg(short, long)]
        band: Band,
        /// Primary channel
        #[arg(long)]
        channel: u32,
        /// Channel width in MHz
        #[arg(long, default_value_t = 20)]
        bandwidth: u32,
        /// Local directory for capture segments (default: log_path from config)
        #[arg(long)]
        log_path: Option<PathBuf>,
        /// File name stem for capture segments
        #[arg(long, default_value = "capture")]
        stem: String,
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Scan for networks
    Scan {
        /// Keep scanning until this SSID is seen
        #[arg(long)]
        ssid: Option<String>,
        /// Seconds to keep looking for the SSID
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if cli.log_file.is_some() {
        config.log_file = cli.log_file;
    }
    let _guard = init_logging(&config)?;

    tracing::debug!("labcap {} targeting {}", labcap::VERSION, config.hostname);

    match cli.command {
        Commands::Run { command } => run_command(&config, &command.join(" ")),
        Commands::Capture {
            band,
            channel,
            bandwidth,
            log_path,
            stem,
            duration,
        } => {
            let log_path = log_path.unwrap_or_else(|| config.log_path.clone());
            capture(
                &config,
                band,
                channel,
                bandwidth,
                &log_path,
                &stem,
                duration.map(Duration::from_secs),
            )?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Scan { ssid, timeout } => {
            scan(&config, ssid.as_deref(), Duration::from_secs(timeout))
        }
    }
}

/// Install the tracing subscriber, writing to `log_file` when configured.
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.tracing_filter()));

    let Some(log_file) = &config.log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
        return Ok(None);
    };

    let dir = log_file.parent().unwrap_or(Path::new("."));
    let name = log_file
        .file_name()
        .with_context(|| format!("Invalid log file {}", log_file.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(rolling::never(dir, name));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(non_blocking)
        .init();
    Ok(Some(guard))
}

fn run_command(config: &Config, command: &str) -> Result<ExitCode> {
    let ssh = SshConnection::new(config.connection_settings(), Arc::new(LocalRunner::new()));
    let result = ssh
        .run(command, &RunOptions::new().ignore_status())
        .with_context(|| format!("Failed to run '{}' on {}", command, config.hostname))?;
    ssh.close();

    io::stdout().write_all(result.stdout.as_bytes())?;
    io::stderr().write_all(result.stderr.as_bytes())?;

    Ok(ExitCode::from(u8::try_from(result.exit_status).unwrap_or(1)))
}

fn capture(
    config: &Config,
    band: Band,
    channel: u32,
    bandwidth: u32,
    log_path: &Path,
    stem: &str,
    duration: Option<Duration>,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            tracing::info!("Interrupt received, stopping capture");
            running.store(false, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;
    }

    let mut pcap = PacketCapture::new(config.connection_settings())
        .with_context(|| format!("Failed to set up capture host {}", config.hostname))?;

    if !pcap.configure_monitor_mode_with_bandwidth(band, channel, bandwidth) {
        pcap.close()?;
        bail!("Failed to tune {} to channel {} ({} MHz)", band, channel, bandwidth);
    }

    let Some(pid) = pcap.start_packet_capture(band, log_path, stem)? else {
        pcap.close()?;
        bail!("Packet capture on {} failed to start", band);
    };
    println!("capturing on {} channel {} (pid {}) into {}", band, channel, pid, log_path.display());

    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }

    pcap.stop_packet_capture(pid)
        .context("Failed to stop packet capture")?;
    pcap.close().context("Failed to clean up capture host")?;
    println!("capture stopped after {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}

fn scan(config: &Config, ssid: Option<&str>, timeout: Duration) -> Result<ExitCode> {
    let mut pcap = PacketCapture::new(config.connection_settings())
        .with_context(|| format!("Failed to set up capture host {}", config.hostname))?;

    let code = match ssid {
        Some(ssid) => {
            if pcap.start_scan_and_find_network(ssid, timeout)? {
                println!("found: {}", ssid);
                ExitCode::SUCCESS
            } else {
                eprintln!("error: {} not seen within {}s", ssid, timeout.as_secs());
                ExitCode::FAILURE
            }
        }
        None => {
            for result in pcap.get_wifi_scan_results()? {
                let signal = result
                    .signal_dbm
                    .map(|dbm| format!("{:.1} dBm", dbm))
                    .unwrap_or_else(|| "-".to_string());
                let freq = result
                    .frequency_mhz
                    .map(|mhz| mhz.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}  {:>5}  {:>10}  {}", result.bssid, freq, signal, result.ssid);
            }
            ExitCode::SUCCESS
        }
    };

    pcap.close()?;
    Ok(code)
}
