//! Periodic daemon heartbeat.
//!
//! Every interval the daemon logs one line with its version, the tracker
//! counters, what changed since the previous beat and its own resident
//! memory and CPU. The line becomes a warning when the daemon is over its
//! resource limits or the tracker started losing data.
//!
//! # Panic-Free Guarantees
//!
//! All code follows CONTRIBUTING.md panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Uses pattern matching and `unwrap_or` for fallible operations

use std::fmt;
use std::process;
use std::time::Duration;

use netprobe_core::TrackerStats;
use sysinfo::{Pid, System};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tracker::TrackerHandle;

/// Resident memory above which the heartbeat warns (MB).
pub const MEMORY_LIMIT_MB: u64 = 256;

/// CPU usage above which the heartbeat warns (percent of one core).
pub const CPU_LIMIT_PERCENT: f32 = 80.0;

/// Resource limits checked on every beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub memory_mb: u64,
    pub cpu_percent: f32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            memory_mb: MEMORY_LIMIT_MB,
            cpu_percent: CPU_LIMIT_PERCENT,
        }
    }
}

/// Reason a beat is logged as a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    Memory,
    Cpu,
    /// The event queue overflowed since the previous beat.
    EventsLost,
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::EventsLost => "events_lost",
        })
    }
}

/// One heartbeat: tracker counters plus the daemon's own usage.
#[derive(Debug, Clone, PartialEq)]
pub struct Pulse {
    pub stats: TrackerStats,
    pub rss_mb: u64,
    pub cpu_percent: f32,
    /// Events discarded at the sink since the previous beat
    pub new_events_lost: u64,
    /// Closed connections clients missed since the previous beat
    pub new_client_drops: u64,
}

impl Pulse {
    /// Builds a pulse, diffing counters against the previous beat.
    pub fn new(
        stats: TrackerStats,
        previous: Option<&TrackerStats>,
        rss_bytes: u64,
        cpu_percent: f32,
    ) -> Self {
        let (lost_before, drops_before) = previous
            .map(|p| (p.events_lost, p.client_drops))
            .unwrap_or((0, 0));

        Self {
            new_events_lost: stats.events_lost.saturating_sub(lost_before),
            new_client_drops: stats.client_drops.saturating_sub(drops_before),
            rss_mb: rss_bytes / 1024 / 1024,
            cpu_percent,
            stats,
        }
    }

    pub fn alarms(&self, limits: &Limits) -> Vec<Alarm> {
        let mut alarms = Vec::new();
        if self.rss_mb > limits.memory_mb {
            alarms.push(Alarm::Memory);
        }
        if self.cpu_percent > limits.cpu_percent {
            alarms.push(Alarm::Cpu);
        }
        if self.new_events_lost > 0 {
            alarms.push(Alarm::EventsLost);
        }
        alarms
    }
}

/// Heartbeat state carried between beats.
struct Heartbeat {
    system: System,
    pid: Pid,
    limits: Limits,
    previous: Option<TrackerStats>,
}

impl Heartbeat {
    fn new(limits: Limits) -> Self {
        let mut heartbeat = Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
            limits,
            previous: None,
        };
        // CPU usage is relative to the previous refresh.
        heartbeat.sample_self();
        heartbeat
    }

    /// Resident bytes and CPU percent of this process.
    fn sample_self(&mut self) -> (u64, f32) {
        // Per-process refresh alone leaves cpu_usage at zero.
        self.system.refresh_all();
        self.system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0))
    }

    fn beat(&mut self, stats: TrackerStats) -> Pulse {
        let (rss_bytes, cpu_percent) = self.sample_self();
        let pulse = Pulse::new(stats, self.previous.as_ref(), rss_bytes, cpu_percent);
        self.previous = Some(pulse.stats.clone());
        pulse
    }
}

/// Spawns the heartbeat task.
///
/// Stops when `cancel_token` fires or the tracker goes away.
pub fn spawn_heartbeat_task(
    tracker: TrackerHandle,
    period: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut heartbeat = Heartbeat::new(Limits::default());
        let mut tick = interval_at(Instant::now() + period, period);

        info!(
            interval_secs = period.as_secs(),
            memory_limit_mb = heartbeat.limits.memory_mb,
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!("Heartbeat shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let stats = match tracker.get_stats().await {
                        Ok(stats) => stats,
                        Err(e) => {
                            debug!(error = %e, "Heartbeat stopping: tracker unavailable");
                            break;
                        }
                    };
                    let pulse = heartbeat.beat(stats);
                    log_pulse(&pulse, &pulse.alarms(&heartbeat.limits));
                }
            }
        }
    })
}

fn log_pulse(pulse: &Pulse, alarms: &[Alarm]) {
    let stats = &pulse.stats;
    let cpu_percent = format!("{:.1}", pulse.cpu_percent);
    let rate = format!("{:.1}", stats.ingestion_rate);

    if alarms.is_empty() {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            active = stats.active_connections,
            buffered = stats.buffered_closed,
            clients = stats.registered_clients,
            new_client_drops = pulse.new_client_drops,
            rate = %rate,
            rss_mb = pulse.rss_mb,
            cpu_percent = %cpu_percent,
            "Heartbeat"
        );
        return;
    }

    let alarms = alarms
        .iter()
        .map(Alarm::to_string)
        .collect::<Vec<_>>()
        .join(",");
    warn!(
        version = env!("CARGO_PKG_VERSION"),
        alarms = %alarms,
        active = stats.active_connections,
        buffered = stats.buffered_closed,
        clients = stats.registered_clients,
        new_events_lost = pulse.new_events_lost,
        new_client_drops = pulse.new_client_drops,
        rate = %rate,
        rss_mb = pulse.rss_mb,
        cpu_percent = %cpu_percent,
        "Heartbeat over limits"
    );
}
