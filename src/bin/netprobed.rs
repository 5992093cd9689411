//! netprobed - host connection tracker daemon
//!
//! Tracks the host's network connections and serves them to polling
//! clients over a Unix socket. See [`netprobed::cli`] for usage.

fn main() -> anyhow::Result<()> {
    netprobed::cli::main()
}
