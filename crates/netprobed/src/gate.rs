//! Host compatibility gate.
//!
//! Decides once, before the tracker is built, whether this host can run
//! connection tracking. The result is either a [`Supported`] token, which
//! [`Tracker::start`](crate::tracker::Tracker::start) requires, or an
//! [`Unsupported`] reason.
//!
//! # Panic-Free Guarantees
//!
//! This module follows CONTRIBUTING.md panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Unparseable versions are reported as unsupported, never unwrapped

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use sysinfo::System;
use thiserror::Error;
use tracing::debug;

/// Oldest kernel the tracker is known to work on.
pub const DEFAULT_MIN_KERNEL: KernelVersion = KernelVersion::new(4, 4, 0);

// ============================================================================
// Host Probe
// ============================================================================

/// Read-only view of the host facts the gate depends on.
pub trait HostProbe: Send + Sync {
    /// Operating system family, e.g. "linux".
    fn os(&self) -> String;

    /// Kernel release string, e.g. "5.15.0-91-generic".
    fn kernel_release(&self) -> Option<String>;
}

/// Probe backed by `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoProbe;

impl HostProbe for SysinfoProbe {
    fn os(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn kernel_release(&self) -> Option<String> {
        System::kernel_version()
    }
}

/// Probe returning fixed values.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub os: String,
    pub kernel_release: Option<String>,
}

impl StaticProbe {
    pub fn linux(release: &str) -> Self {
        Self {
            os: "linux".to_string(),
            kernel_release: Some(release.to_string()),
        }
    }
}

impl HostProbe for StaticProbe {
    fn os(&self) -> String {
        self.os.clone()
    }

    fn kernel_release(&self) -> Option<String> {
        self.kernel_release.clone()
    }
}

// ============================================================================
// Kernel Version
// ============================================================================

/// `major.minor.patch` kernel version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl PartialOrd for KernelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KernelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KernelVersion {
    type Err = String;

    /// Parses the leading numeric part of a release string.
    ///
    /// "5.15.0-91-generic" → 5.15.0, "4.4" → 4.4.0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let numeric: &str = s
            .trim()
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()
            .unwrap_or("");

        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let mut next = |required: bool| -> Result<u32, String> {
            match parts.next() {
                Some(p) => p.parse::<u32>().map_err(|e| format!("{s:?}: {e}")),
                None if required => Err(format!("{s:?}: missing version component")),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        Ok(Self::new(major, minor, patch))
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Proof that the compatibility gate passed.
#[derive(Debug, Clone)]
pub struct Supported {
    kernel: KernelVersion,
}

impl Supported {
    pub fn kernel(&self) -> KernelVersion {
        self.kernel
    }

    /// Bypasses the host check. Only for embedding the tracker where the
    /// caller already knows the event source does not need kernel support.
    pub fn assume(kernel: KernelVersion) -> Self {
        Self { kernel }
    }
}

/// Why the host cannot run the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct Unsupported {
    pub reason: String,
}

impl Unsupported {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Evaluates the host against the denylist and minimum version.
///
/// Pure with respect to the probe: calling it has no side effects.
pub fn check(
    probe: &dyn HostProbe,
    excluded_versions: &[String],
    min_kernel: KernelVersion,
) -> Result<Supported, Unsupported> {
    let os = probe.os();
    if os != "linux" {
        return Err(Unsupported::new(format!(
            "operating system {os:?} is not supported, connection tracking requires linux"
        )));
    }

    let release = probe
        .kernel_release()
        .ok_or_else(|| Unsupported::new("unable to determine kernel version"))?;

    let kernel: KernelVersion = release
        .parse()
        .map_err(|e| Unsupported::new(format!("unable to parse kernel version {e}")))?;

    debug!(release = %release, kernel = %kernel, "Evaluating kernel compatibility");

    for excluded in excluded_versions {
        let excluded = excluded.trim();
        let matches_parsed = excluded
            .parse::<KernelVersion>()
            .map(|v| v == kernel)
            .unwrap_or(false);
        if excluded == release || matches_parsed {
            return Err(Unsupported::new(format!(
                "kernel {release} is in the excluded version list ({excluded})"
            )));
        }
    }

    if kernel < min_kernel {
        return Err(Unsupported::new(format!(
            "kernel {kernel} is older than the minimum supported {min_kernel}"
        )));
    }

    Ok(Supported { kernel })
}

/// Contract-shaped wrapper around [`check`]: `(supported, reason)`.
pub fn is_supported(
    probe: &dyn HostProbe,
    excluded_versions: &[String],
    min_kernel: KernelVersion,
) -> (bool, String) {
    match check(probe, excluded_versions, min_kernel) {
        Ok(supported) => (true, format!("kernel {} supported", supported.kernel())),
        Err(unsupported) => (false, unsupported.reason),
    }
}
