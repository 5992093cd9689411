//! netprobe Daemon - host connection tracker and multi-client delivery server
//!
//! This crate provides the core infrastructure for the netprobe daemon:
//! - `gate` - Host compatibility check, run once before anything is built
//! - `tracker` - Connection tracking actor (active table + closed-connection buffer)
//! - `source` - Event sources feeding the tracker (`/proc/net/tcp`, JSON lines)
//! - `server` - Unix socket server for client queries
//! - `heartbeat` - Periodic stats and process resource logging
//! - `introspection` - Localhost TCP stats endpoint
//! - `daemon` - Lifecycle wiring the pieces together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       netprobed daemon                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   EventSource   │────▶│        TrackerActor         │    │
//! │  │ (procnet/jsonl) │     │ ConnectionTable (active)    │    │
//! │  └─────────────────┘     │ DeliveryBuffer  (closed)    │    │
//! │                          └──────────────▲──────────────┘    │
//! │                                         │ TrackerHandle     │
//! │  ┌─────────────────┐     ┌──────────────┴──────────────┐    │
//! │  │  DaemonServer   │────▶│     ConnectionHandler       │    │
//! │  │ (Unix Socket)   │     │  (per client, own cursor)   │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy from CONTRIBUTING.md:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod cli;
pub mod config;
pub mod daemon;
pub mod gate;
pub mod heartbeat;
pub mod introspection;
pub mod server;
pub mod source;
pub mod tracker;
