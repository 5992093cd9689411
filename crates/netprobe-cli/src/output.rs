//! Plain-text rendering of daemon replies.

use std::fmt::Write;

use chrono::{DateTime, Utc};
use netprobe_core::{ClientDebugInfo, ConnectionList, ConnectionRecord, TrackerStats};

/// Formats a byte count with a binary unit ("512B", "1.5K", "3.0M").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["K", "M", "G", "T", "P"];

    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1}{unit}")
}

/// Formats an age in seconds compactly ("45s", "12m", "3h", "2d").
pub fn format_age(secs: i64) -> String {
    if secs < 0 {
        "now".to_string()
    } else if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

fn connection_row(record: &ConnectionRecord, now: DateTime<Utc>) -> String {
    let state = if record.is_closed() { "closed" } else { "open" };
    let end = record.closed_at.unwrap_or(now);
    let age = format_age((end - record.first_seen).num_seconds());
    let pid = record
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{:<4} {:<22} {:<22} {:<9} {:<6} {:>7} {:>8} {:>8} {:>6}",
        record.key.protocol.to_string(),
        record.key.local(),
        record.key.remote(),
        record.direction.to_string(),
        state,
        pid,
        format_bytes(record.stats.bytes_sent),
        format_bytes(record.stats.bytes_received),
        age,
    )
}

/// Renders a connection list as a table, active rows first.
pub fn render_connections(list: &ConnectionList, now: DateTime<Utc>) -> String {
    let mut out = format!(
        "{:<4} {:<22} {:<22} {:<9} {:<6} {:>7} {:>8} {:>8} {:>6}\n",
        "PROTO", "LOCAL", "REMOTE", "DIRECTION", "STATE", "PID", "SENT", "RECV", "AGE"
    );

    for record in list.active().chain(list.closed()) {
        out.push_str(&connection_row(record, now));
        out.push('\n');
    }

    let _ = write!(
        out,
        "{} active, {} closed",
        list.active().count(),
        list.closed().count()
    );
    if list.dropped > 0 {
        let _ = write!(out, ", {} closed connections lost to buffer overflow", list.dropped);
    }
    out.push('\n');
    out
}

pub fn render_client_info(info: &ClientDebugInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "client:       {}", info.client_id);
    let _ = writeln!(out, "cursor:       {}", info.cursor);
    let _ = writeln!(out, "pending:      {}", info.pending);
    let _ = writeln!(
        out,
        "dropped:      {} total, {} unreported",
        info.dropped_total, info.dropped_unreported
    );
    let _ = writeln!(out, "polls:        {}", info.polls);
    let _ = writeln!(out, "registered:   {}", info.registered_at.to_rfc3339());
    let _ = writeln!(out, "idle:         {}", format_age(info.idle_secs));
    let _ = writeln!(out, "expires:      {}", if info.expires { "yes" } else { "no" });
    out
}

pub fn render_stats(stats: &TrackerStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "uptime:              {}", format_age(stats.uptime_secs));
    let _ = writeln!(out, "active connections:  {}", stats.active_connections);
    let _ = writeln!(
        out,
        "closed buffered:     {}/{}",
        stats.buffered_closed, stats.buffer_capacity
    );
    let _ = writeln!(out, "clients:             {}", stats.registered_clients);
    let _ = writeln!(
        out,
        "connections:         {} opened, {} closed, {} expired",
        stats.connections_opened, stats.connections_closed, stats.connections_expired
    );
    let _ = writeln!(
        out,
        "events:              {} ingested, {} rejected, {} lost",
        stats.events_ingested, stats.events_rejected, stats.events_lost
    );
    let _ = writeln!(out, "ingestion rate:      {:.1}/s", stats.ingestion_rate);
    let _ = writeln!(
        out,
        "evictions:           {} entries, {} client drops",
        stats.evicted_entries, stats.client_drops
    );
    let _ = writeln!(out, "clients expired:     {}", stats.clients_expired);
    out
}
