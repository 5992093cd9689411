//! Parsing the raw JSON event feed.
//!
//! External collectors write one flat JSON object per line. Field names
//! follow the usual kernel-tracer conventions (`saddr`/`sport`,
//! `daddr`/`dport`, `sent_bytes`...). Everything except the event type and
//! the 4-tuple is optional.

use chrono::{DateTime, TimeZone, Utc};
use netprobe_core::{ConnectionEvent, ConnectionKey, ConnectionStats, Direction, Protocol};
use serde::Deserialize;
use std::net::IpAddr;
use thiserror::Error;

/// Raw event line as written by an external collector.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConnectionEvent {
    /// "open", "update" or "close"
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub proto: Option<String>,
    pub saddr: String,
    pub sport: u16,
    pub daddr: String,
    pub dport: u16,
    #[serde(default)]
    pub netns: Option<u32>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub sent_bytes: Option<u64>,
    #[serde(default)]
    pub recv_bytes: Option<u64>,
    #[serde(default)]
    pub sent_packets: Option<u64>,
    #[serde(default)]
    pub recv_packets: Option<u64>,
    #[serde(default)]
    pub retransmits: Option<u32>,
    #[serde(default)]
    pub rtt: Option<u32>,
    #[serde(default)]
    pub rtt_var: Option<u32>,
    /// RFC 3339 timestamp
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Nanoseconds since the Unix epoch (used when `timestamp` is absent)
    #[serde(default)]
    pub timestamp_ns: Option<i64>,
}

/// Errors produced while turning a raw line into an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("unknown event type: {0:?}")]
    UnknownEventType(String),

    #[error("unknown protocol: {0:?}")]
    UnknownProtocol(String),

    #[error("unknown direction: {0:?}")]
    UnknownDirection(String),

    #[error("invalid {field} address: {value:?}")]
    InvalidAddress { field: &'static str, value: String },
}

impl RawConnectionEvent {
    /// Returns true if any counter field is present.
    fn has_stats(&self) -> bool {
        self.sent_bytes.is_some()
            || self.recv_bytes.is_some()
            || self.sent_packets.is_some()
            || self.recv_packets.is_some()
            || self.retransmits.is_some()
            || self.rtt.is_some()
            || self.rtt_var.is_some()
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.sent_bytes.unwrap_or(0),
            bytes_received: self.recv_bytes.unwrap_or(0),
            packets_sent: self.sent_packets.unwrap_or(0),
            packets_received: self.recv_packets.unwrap_or(0),
            retransmits: self.retransmits.unwrap_or(0),
            rtt_us: self.rtt.unwrap_or(0),
            rtt_var_us: self.rtt_var.unwrap_or(0),
        }
    }

    fn key(&self) -> Result<ConnectionKey, EventParseError> {
        let protocol = match self.proto.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("tcp") => Protocol::Tcp,
            Some("udp") => Protocol::Udp,
            Some(other) => return Err(EventParseError::UnknownProtocol(other.to_string())),
        };

        let laddr: IpAddr = self.saddr.parse().map_err(|_| EventParseError::InvalidAddress {
            field: "saddr",
            value: self.saddr.clone(),
        })?;
        let raddr: IpAddr = self.daddr.parse().map_err(|_| EventParseError::InvalidAddress {
            field: "daddr",
            value: self.daddr.clone(),
        })?;

        Ok(ConnectionKey {
            laddr,
            lport: self.sport,
            raddr,
            rport: self.dport,
            protocol,
            netns: self.netns.unwrap_or(0),
        })
    }

    fn direction(&self) -> Result<Direction, EventParseError> {
        match self.direction.as_deref() {
            None => Ok(Direction::Unknown),
            Some("incoming") | Some("in") => Ok(Direction::Incoming),
            Some("outgoing") | Some("out") => Ok(Direction::Outgoing),
            Some("local") => Ok(Direction::Local),
            Some("unknown") => Ok(Direction::Unknown),
            Some(other) => Err(EventParseError::UnknownDirection(other.to_string())),
        }
    }

    fn timestamp_or(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .or_else(|| self.timestamp_ns.map(|ns| Utc.timestamp_nanos(ns)))
            .unwrap_or(fallback)
    }

    /// Converts to a domain event. `now` is used when the line has no time.
    pub fn into_event(self, now: DateTime<Utc>) -> Result<ConnectionEvent, EventParseError> {
        let key = self.key()?;
        let timestamp = self.timestamp_or(now);

        match self.event_type.as_str() {
            "open" | "connect" | "accept" => Ok(ConnectionEvent::Open {
                key,
                direction: self.direction()?,
                pid: self.pid,
                container_id: self.container_id,
                timestamp,
            }),
            "update" | "stats" => Ok(ConnectionEvent::Update {
                key,
                stats: self.stats(),
                timestamp,
            }),
            "close" => Ok(ConnectionEvent::Close {
                key,
                stats: self.has_stats().then(|| self.stats()),
                timestamp,
            }),
            other => Err(EventParseError::UnknownEventType(other.to_string())),
        }
    }
}

/// Parses one line of the event feed.
pub fn parse_event_line(line: &str, now: DateTime<Utc>) -> Result<ConnectionEvent, EventParseError> {
    let raw: RawConnectionEvent =
        serde_json::from_str(line).map_err(|e| EventParseError::Json(e.to_string()))?;
    raw.into_event(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_open_line() {
        let now = Utc::now();
        let line = r#"{"type":"open","saddr":"10.0.0.5","sport":40000,"daddr":"93.184.216.34","dport":443,"pid":1234,"direction":"outgoing","netns":4026531840}"#;
        let event = parse_event_line(line, now).unwrap();
        match event {
            ConnectionEvent::Open {
                key,
                direction,
                pid,
                timestamp,
                ..
            } => {
                assert_eq!(key.lport, 40000);
                assert_eq!(key.rport, 443);
                assert_eq!(key.protocol, Protocol::Tcp);
                assert_eq!(key.netns, 4026531840);
                assert_eq!(direction, Direction::Outgoing);
                assert_eq!(pid, Some(1234));
                assert_eq!(timestamp, now);
            }
            other => panic!("Expected Open, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_close_with_counters() {
        let line = r#"{"type":"close","proto":"UDP","saddr":"::1","sport":53,"daddr":"::1","dport":5353,"sent_bytes":10,"recv_bytes":20,"timestamp_ns":1700000000000000000}"#;
        let event = parse_event_line(line, Utc::now()).unwrap();
        match event {
            ConnectionEvent::Close {
                key,
                stats,
                timestamp,
            } => {
                assert_eq!(key.protocol, Protocol::Udp);
                let stats = stats.unwrap();
                assert_eq!(stats.bytes_sent, 10);
                assert_eq!(stats.bytes_received, 20);
                assert_eq!(timestamp.timestamp(), 1_700_000_000);
            }
            other => panic!("Expected Close, got {other:?}"),
        }
    }

    #[test]
    fn test_close_without_counters_has_no_stats() {
        let line = r#"{"type":"close","saddr":"10.0.0.1","sport":1,"daddr":"10.0.0.2","dport":2}"#;
        match parse_event_line(line, Utc::now()).unwrap() {
            ConnectionEvent::Close { stats, .. } => assert!(stats.is_none()),
            other => panic!("Expected Close, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        let now = Utc::now();
        assert!(matches!(
            parse_event_line("not json", now),
            Err(EventParseError::Json(_))
        ));
        assert!(matches!(
            parse_event_line(
                r#"{"type":"bogus","saddr":"10.0.0.1","sport":1,"daddr":"10.0.0.2","dport":2}"#,
                now
            ),
            Err(EventParseError::UnknownEventType(_))
        ));
        assert!(matches!(
            parse_event_line(
                r#"{"type":"open","saddr":"nope","sport":1,"daddr":"10.0.0.2","dport":2}"#,
                now
            ),
            Err(EventParseError::InvalidAddress { field: "saddr", .. })
        ));
        assert!(matches!(
            parse_event_line(
                r#"{"type":"open","proto":"sctp","saddr":"10.0.0.1","sport":1,"daddr":"10.0.0.2","dport":2}"#,
                now
            ),
            Err(EventParseError::UnknownProtocol(_))
        ));
    }
}
