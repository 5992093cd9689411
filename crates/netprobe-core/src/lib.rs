//! netprobe Core - Shared types for host connection tracking
//!
//! This crate provides the domain types shared between
//! the daemon (netprobed) and its clients (netprobe).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod client;
pub mod clock;
pub mod connection;
pub mod error;
pub mod view;

// Re-exports for convenience
pub use client::{ClientId, DEBUG_CLIENT_ID, MAX_CLIENT_ID_LEN};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{
    ConnectionEvent, ConnectionKey, ConnectionRecord, ConnectionStats, Direction, Protocol,
};
pub use error::{DomainError, DomainResult};
pub use view::{ClientDebugInfo, ConnectionList, TrackerStats};
