//! netprobe Protocol - Wire protocol for daemon communication
//!
//! This crate provides message types for communication between polling
//! clients and the daemon, and parsing for the raw JSON event feed that
//! external collectors push into the daemon.

pub mod message;
pub mod parse;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, ErrorCode, MessageType};
pub use parse::{parse_event_line, EventParseError, RawConnectionEvent};
pub use version::{ProtocolVersion, VersionError};
