//! `netprobed` command line.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! netprobed start
//!
//! # Start the daemon (background/daemonized)
//! netprobed start -d
//!
//! # Start with an explicit config file
//! netprobed start --config /etc/netprobe/netprobed.toml
//!
//! # Stop the daemon
//! netprobed stop
//!
//! # Check daemon status
//! netprobed status
//!
//! # Enable debug logging
//! RUST_LOG=netprobed=debug netprobed start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::daemon::Daemon;

/// netprobe daemon - host connection tracker
#[derive(Parser, Debug)]
#[command(name = "netprobed", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to $XDG_CONFIG_HOME/netprobe/netprobed.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("netprobe")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("netprobed.pid")
}

/// Returns the path to the log file used when daemonized.
fn log_file_path() -> PathBuf {
    state_dir().join("netprobed.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Returns the daemon's PID if it is running, clearing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

/// Entry point of the `netprobed` binary.
pub fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'netprobed stop' to stop it first.");
                process::exit(1);
            }

            let config = DaemonConfig::load(config.as_deref()).context("Failed to load config")?;

            if daemon {
                // Must happen before the tokio runtime starts
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };

            println!("Stopping daemon (PID {pid})...");
            stop_daemon(pid)?;

            for _ in 0..50 {
                if !is_process_running(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }

            eprintln!("Daemon did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status { config } => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };

            println!("Daemon is running (PID {pid})");
            let config = DaemonConfig::load(config.as_deref()).unwrap_or_default();
            if config.socket_path.exists() {
                println!("Socket: {}", config.socket_path.display());
            }
            Ok(())
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("netprobed={level}").parse()?)
                .add_directive(format!("netprobe_core={level}").parse()?)
                .add_directive(format!("netprobe_protocol={level}").parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    init_logging(&config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        socket = %config.socket_path.display(),
        source = ?config.source.kind,
        "netprobe daemon starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let daemon = Daemon::new(config);
    match daemon.run(cancel_token).await {
        Ok(()) => {
            info!("netprobe daemon stopped");
            Ok(())
        }
        Err(e) if e.is_unsupported() => {
            // Degrade instead of failing the host's service manager
            warn!(reason = %e, "Connection tracking unavailable on this host, exiting");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon failed");
            Err(e.into())
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_start_flags() {
        let args = Args::try_parse_from(["netprobed", "start", "-d", "--config", "/etc/np.toml"])
            .unwrap();
        match args.command {
            Some(Command::Start { daemon, config }) => {
                assert!(daemon);
                assert_eq!(config, Some(PathBuf::from("/etc/np.toml")));
            }
            other => panic!("Expected Start, got {other:?}"),
        }
    }

    #[test]
    fn test_pid_file_under_state_dir() {
        assert!(pid_file_path().ends_with("netprobe/netprobed.pid"));
    }
}
