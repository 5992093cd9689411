//! netprobe client - library and query CLI for the netprobe daemon
//!
//! - `client` - `DaemonClient`, a handshaken request/response connection
//! - `output` - plain-text rendering of replies
//! - `cli` - the `netprobe` command line
//!
//! ```rust,ignore
//! use netprobe_cli::client::{ClientConfig, DaemonClient};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ClientConfig {
//!     client_id: Some("dashboard".to_string()),
//!     ..Default::default()
//! };
//! let mut client = DaemonClient::connect(&config, &CancellationToken::new()).await?;
//! let list = client.get_connections().await?;
//! println!("{} closed since last poll", list.closed().count());
//! ```

pub mod cli;
pub mod client;
pub mod error;
pub mod output;

pub use client::{ClientConfig, DaemonClient};
pub use error::{ClientError, Result};
