//! `/proc/net/tcp` polling source.
//!
//! Reads the kernel's TCP socket tables on an interval and diffs established
//! sockets between scans: sockets that appear become `Open` events, sockets
//! that disappear become `Close` events. Direction is inferred from the set
//! of listening ports when a socket is first seen.
//!
//! The kernel tables carry no activity counters, so a quiet socket would
//! otherwise look idle to the tracker. Every `refresh_interval` the source
//! re-announces each socket still established.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procfs::net::TcpState;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netprobe_core::{ConnectionEvent, ConnectionKey, Direction, Protocol};

use super::{EventSink, EventSource, SourceError};

const SOURCE_NAME: &str = "procnet";

/// Established TCP sockets seen in one scan.
pub(crate) type Scan = HashMap<ConnectionKey, Direction>;

pub struct ProcNetSource {
    poll_interval: Duration,
    refresh_interval: Duration,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl ProcNetSource {
    pub fn new(poll_interval: Duration, refresh_interval: Duration) -> Self {
        Self {
            poll_interval,
            refresh_interval,
            cancel: None,
            task: None,
        }
    }
}

#[async_trait]
impl EventSource for ProcNetSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn attach(&mut self, sink: EventSink) -> Result<(), SourceError> {
        if self.task.is_some() {
            return Err(SourceError::AlreadyAttached(SOURCE_NAME));
        }

        // The first scan doubles as the permission check.
        let initial = scan_blocking().await.map_err(|reason| SourceError::Attach {
            source_name: SOURCE_NAME,
            reason,
        })?;

        let now = Utc::now();
        for event in diff(&Scan::new(), &initial, now) {
            sink.ingest(event);
        }
        info!(
            established = initial.len(),
            interval_ms = self.poll_interval.as_millis() as u64,
            refresh_secs = self.refresh_interval.as_secs(),
            "procnet source attached"
        );

        let cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(poll_loop(
            initial,
            sink,
            self.poll_interval,
            self.refresh_interval,
            cancel.clone(),
        )));
        self.cancel = Some(cancel);
        Ok(())
    }

    async fn detach(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
            debug!("procnet source detached");
        }
    }
}

async fn poll_loop(
    mut previous: Scan,
    sink: EventSink,
    poll_interval: Duration,
    refresh_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(poll_interval);
    let mut last_refresh = Instant::now();
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; the attach scan already covered it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = match scan_blocking().await {
            Ok(scan) => scan,
            Err(reason) => {
                warn!(reason = %reason, "Failed to read /proc/net/tcp, skipping scan");
                continue;
            }
        };

        let current = carry_forward(&previous, current);
        let now = Utc::now();
        let mut events = diff(&previous, &current, now);
        if last_refresh.elapsed() >= refresh_interval {
            let refreshed = refresh(&previous, &current, now);
            debug!(refreshed = refreshed.len(), "procnet refresh");
            events.extend(refreshed);
            last_refresh = Instant::now();
        }
        if !events.is_empty() {
            debug!(events = events.len(), established = current.len(), "procnet scan");
        }
        for event in events {
            sink.ingest(event);
        }

        if sink.is_closed() {
            debug!("Tracker gone, stopping procnet polling");
            break;
        }
        previous = current;
    }
}

async fn scan_blocking() -> Result<Scan, String> {
    tokio::task::spawn_blocking(scan)
        .await
        .map_err(|e| format!("scan task failed: {e}"))?
}

/// Reads both TCP tables and classifies established sockets.
fn scan() -> Result<Scan, String> {
    let netns = current_netns().unwrap_or(0);

    let mut entries: Vec<(SocketAddr, SocketAddr, TcpState)> = procfs::net::tcp()
        .map_err(|e| format!("/proc/net/tcp: {e}"))?
        .into_iter()
        .map(|e| (e.local_address, e.remote_address, e.state))
        .collect();

    // IPv6 may be disabled; that is not an error.
    match procfs::net::tcp6() {
        Ok(v6) => entries.extend(
            v6.into_iter()
                .map(|e| (e.local_address, e.remote_address, e.state)),
        ),
        Err(e) => debug!(error = %e, "/proc/net/tcp6 unavailable"),
    }

    Ok(classify(&entries, netns))
}

/// Builds the established-socket set, inferring direction from listeners.
pub(crate) fn classify(entries: &[(SocketAddr, SocketAddr, TcpState)], netns: u32) -> Scan {
    let listening: HashSet<u16> = entries
        .iter()
        .filter(|(_, _, state)| *state == TcpState::Listen)
        .map(|(local, _, _)| local.port())
        .collect();

    entries
        .iter()
        .filter(|(_, _, state)| *state == TcpState::Established)
        .map(|(local, remote, _)| {
            let key = ConnectionKey::new(*local, *remote, Protocol::Tcp, netns);
            let direction = if key.is_loopback() {
                Direction::Local
            } else if listening.contains(&local.port()) {
                Direction::Incoming
            } else {
                Direction::Outgoing
            };
            (key, direction)
        })
        .collect()
}

/// Events turning `previous` into `current`. Closes come first.
pub(crate) fn diff(previous: &Scan, current: &Scan, now: DateTime<Utc>) -> Vec<ConnectionEvent> {
    let closed = previous
        .keys()
        .filter(|key| !current.contains_key(key))
        .map(|key| ConnectionEvent::close(*key, now));

    let opened = current
        .iter()
        .filter(|(key, _)| !previous.contains_key(key))
        .map(|(key, direction)| ConnectionEvent::open(*key, *direction, now));

    closed.chain(opened).collect()
}

/// Keeps the direction a socket was first classified with.
///
/// Listeners come and go; a socket's direction does not.
pub(crate) fn carry_forward(previous: &Scan, mut current: Scan) -> Scan {
    for (key, direction) in current.iter_mut() {
        if let Some(first) = previous.get(key) {
            *direction = *first;
        }
    }
    current
}

/// Re-announces sockets established in both scans.
///
/// Re-sending `Open` moves the record's `last_update` forward without
/// touching its counters, and recreates the record if the tracker lost it.
pub(crate) fn refresh(previous: &Scan, current: &Scan, now: DateTime<Utc>) -> Vec<ConnectionEvent> {
    current
        .iter()
        .filter(|(key, _)| previous.contains_key(key))
        .map(|(key, direction)| ConnectionEvent::open(*key, *direction, now))
        .collect()
}

/// Inode of this process's network namespace, from `/proc/self/ns/net`.
fn current_netns() -> Option<u32> {
    let link = std::fs::read_link("/proc/self/ns/net").ok()?;
    parse_netns(&link.to_string_lossy())
}

/// Parses `net:[4026531840]`.
fn parse_netns(link: &str) -> Option<u32> {
    link.strip_prefix("net:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
