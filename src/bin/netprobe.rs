//! netprobe - query the connection tracking daemon
//!
//! See `netprobe --help` and [`netprobe_cli::cli`].

fn main() -> anyhow::Result<()> {
    netprobe_cli::cli::main()
}
