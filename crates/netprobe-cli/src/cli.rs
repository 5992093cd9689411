//! `netprobe` command line.
//!
//! # Usage
//!
//! ```text
//! netprobe connections                  # active + newly closed, as the debug client
//! netprobe --client-id ui connections   # same, with its own delivery cursor
//! netprobe net-maps --json              # raw active table
//! netprobe --client-id ui net-state     # delivery bookkeeping for "ui"
//! netprobe stats
//! netprobe ping --count 3
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::client::{ClientConfig, DaemonClient, DEFAULT_SOCKET_PATH};
use crate::output;

/// Environment variable naming the daemon socket.
pub const SOCKET_ENV: &str = "NETPROBE_SOCKET";

/// netprobe - query the connection tracking daemon
#[derive(Parser, Debug)]
#[command(name = "netprobe", version, about)]
struct Args {
    /// Daemon socket (defaults to $NETPROBE_SOCKET, then /tmp/netprobe.sock)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Identity used for delivery bookkeeping
    #[arg(short = 'c', long, global = true)]
    client_id: Option<String>,

    /// Print replies as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Retry the connection while the daemon starts up
    #[arg(long, global = true, default_value_t = 1)]
    connect_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Active connections plus closed ones not yet delivered to this client
    Connections,
    /// Raw dump of active connections
    NetMaps,
    /// Delivery state of a client
    NetState {
        /// Client to inspect (defaults to --client-id)
        target: Option<String>,
    },
    /// Tracker counters
    Stats,
    /// Check that the daemon answers
    Ping {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u64,
    },
}

fn socket_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(SOCKET_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode reply")?
    );
    Ok(())
}

/// Entry point of the `netprobe` binary.
pub fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    run(args)
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let config = ClientConfig {
        socket_path: socket_path(args.socket),
        client_id: args.client_id,
        connect_attempts: args.connect_attempts,
        ..Default::default()
    };

    let cancel_token = CancellationToken::new();
    let interrupt = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut client = DaemonClient::connect(&config, &cancel_token)
        .await
        .context("Is netprobed running? Try 'netprobed start'")?;
    debug!(client_id = client.client_id(), "Connected");

    match args.command {
        Command::Connections => {
            let list = client.get_connections().await?;
            if args.json {
                print_json(&list)?;
            } else {
                print!("{}", output::render_connections(&list, Utc::now()));
            }
        }
        Command::NetMaps => {
            let list = client.debug_net_maps().await?;
            if args.json {
                print_json(&list)?;
            } else {
                print!("{}", output::render_connections(&list, Utc::now()));
            }
        }
        Command::NetState { target } => {
            let info = client.debug_net_state(target).await?;
            if args.json {
                print_json(&info)?;
            } else {
                print!("{}", output::render_client_info(&info));
            }
        }
        Command::Stats => {
            let stats = client.get_stats().await?;
            if args.json {
                print_json(&stats)?;
            } else {
                print!("{}", output::render_stats(&stats));
            }
        }
        Command::Ping { count } => {
            for seq in 1..=count.max(1) {
                if cancel_token.is_cancelled() {
                    break;
                }
                let rtt = client.ping(seq).await?;
                println!("pong seq={seq} time={:.3}ms", rtt.as_secs_f64() * 1000.0);
                if seq < count {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    client.disconnect().await;
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
    fn test_global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["netprobe", "connections", "--client-id", "ui", "--json"]).unwrap();
        assert!(matches!(args.command, Command::Connections));
        assert_eq!(args.client_id.as_deref(), Some("ui"));
        assert!(args.json);
    }

    #[test]
    fn test_net_state_target() {
        let args = Args::try_parse_from(["netprobe", "net-state", "agent-7"]).unwrap();
        match args.command {
            Command::NetState { target } => assert_eq!(target.as_deref(), Some("agent-7")),
            other => panic!("Expected NetState, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_socket_wins() {
        assert_eq!(
            socket_path(Some(PathBuf::from("/run/np.sock"))),
            PathBuf::from("/run/np.sock")
        );
    }
}
