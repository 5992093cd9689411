//! JSON-lines event source.
//!
//! Reads one [`RawConnectionEvent`](netprobe_protocol::RawConnectionEvent)
//! per line from a file or FIFO written by an external collector. At end of
//! file the reader waits and keeps following the file, like `tail -f`. A
//! line is only parsed once its newline has arrived.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netprobe_protocol::parse_event_line;

use super::{EventSink, EventSource, SourceError};

const SOURCE_NAME: &str = "jsonl";

/// Delay before reading again after end of file
const FOLLOW_DELAY: Duration = Duration::from_millis(200);

/// Longest accepted event line (1 MiB)
const MAX_LINE_SIZE: usize = 1024 * 1024;

pub struct JsonLinesSource {
    path: PathBuf,
    malformed: Arc<AtomicU64>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            malformed: Arc::new(AtomicU64::new(0)),
            cancel: None,
            task: None,
        }
    }

    /// Lines that could not be parsed into events.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSource for JsonLinesSource {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn attach(&mut self, sink: EventSink) -> Result<(), SourceError> {
        if self.task.is_some() {
            return Err(SourceError::AlreadyAttached(SOURCE_NAME));
        }

        let file = File::open(&self.path).await.map_err(|e| SourceError::Attach {
            source_name: SOURCE_NAME,
            reason: format!("{}: {e}", self.path.display()),
        })?;
        info!(path = %self.path.display(), "jsonl source attached");

        let cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(read_loop(
            file,
            sink,
            Arc::clone(&self.malformed),
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
            debug!(malformed = self.malformed(), "jsonl source detached");
        }
    }
}

async fn read_loop(
    file: File,
    sink: EventSink,
    malformed: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(file);
    // Bytes of the current line; survives end of file until its newline arrives.
    let mut pending: Vec<u8> = Vec::new();
    let mut discarding = false;
    let mut line_no: u64 = 0;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut pending) => read,
        };

        match read {
            Ok(0) => {
                if sink.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(FOLLOW_DELAY) => {}
                }
            }
            Ok(_) if pending.last() != Some(&b'\n') => {
                // Writer is mid-line; wait for the rest.
                if pending.len() > MAX_LINE_SIZE {
                    malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(line = line_no + 1, size = pending.len(), "Event line too long, discarding");
                    pending.clear();
                    discarding = true;
                }
            }
            Ok(_) => {
                line_no += 1;
                if std::mem::take(&mut discarding) {
                    pending.clear();
                    continue;
                }
                ingest_line(&pending, line_no, &sink, &malformed);
                pending.clear();
            }
            Err(e) => {
                warn!(error = %e, "Failed to read event stream, stopping jsonl source");
                break;
            }
        }
    }
}

/// Parses one complete line and queues the event. Bad lines are counted.
fn ingest_line(raw: &[u8], line_no: u64, sink: &EventSink, malformed: &AtomicU64) {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(e) => {
            malformed.fetch_add(1, Ordering::Relaxed);
            warn!(line = line_no, error = %e, "Skipping event line that is not UTF-8");
            return;
        }
    };
    if line.is_empty() {
        return;
    }

    match parse_event_line(line, Utc::now()) {
        Ok(event) => {
            sink.ingest(event);
        }
        Err(e) => {
            malformed.fetch_add(1, Ordering::Relaxed);
            warn!(line = line_no, error = %e, "Skipping malformed event line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netprobe_core::ConnectionEvent;
    use std::io::Write;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_reads_events_and_counts_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"type":"open","saddr":"10.0.0.1","sport":5000,"daddr":"10.0.0.2","dport":443}}"#
        )
        .unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"type":"close","saddr":"10.0.0.1","sport":5000,"daddr":"10.0.0.2","dport":443}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx, Arc::new(AtomicU64::new(0)));
        let mut source = JsonLinesSource::new(file.path());
        source.attach(sink).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ConnectionEvent::Open { .. }));
        let second = rx.recv().await.unwrap();
        assert!(second.is_close());

        source.detach().await;
        assert_eq!(source.malformed(), 1);
    }

    const OPEN_LINE: &str =
        r#"{"type":"open","saddr":"10.0.0.1","sport":5000,"daddr":"10.0.0.2","dport":443}"#;
    const CLOSE_LINE: &str =
        r#"{"type":"close","saddr":"10.0.0.1","sport":5000,"daddr":"10.0.0.2","dport":443}"#;

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\xff\xfe garbage\n").unwrap();
        writeln!(file, "{OPEN_LINE}").unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx, Arc::new(AtomicU64::new(0)));
        let mut source = JsonLinesSource::new(file.path());
        source.attach(sink).await.unwrap();

        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event after a non-UTF-8 line")
            .unwrap();
        assert!(matches!(event, ConnectionEvent::Open { .. }));

        source.detach().await;
        assert_eq!(source.malformed(), 1);
    }

    #[tokio::test]
    async fn test_line_written_in_two_parts_is_one_event() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let (head, tail) = CLOSE_LINE.split_at(30);
        file.write_all(head.as_bytes()).unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx, Arc::new(AtomicU64::new(0)));
        let mut source = JsonLinesSource::new(file.path());
        source.attach(sink).await.unwrap();

        // Long enough for the reader to hit end of file at least once.
        tokio::time::sleep(FOLLOW_DELAY * 2).await;
        writeln!(file, "{tail}").unwrap();
        file.flush().unwrap();

        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("split line was not delivered")
            .unwrap();
        assert!(event.is_close());

        source.detach().await;
        assert_eq!(source.malformed(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_fails_attach() {
        let (tx, _rx) = mpsc::channel(8);
        let sink = EventSink::new(tx, Arc::new(AtomicU64::new(0)));
        let mut source = JsonLinesSource::new("/nonexistent/netprobe/events.jsonl");

        let err = source.attach(sink).await.unwrap_err();
        assert!(matches!(err, SourceError::Attach { source_name: "jsonl", .. }));
    }

    #[tokio::test]
    async fn test_double_attach_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let sink = EventSink::new(tx, Arc::new(AtomicU64::new(0)));
        let mut source = JsonLinesSource::new(file.path());

        source.attach(sink.clone()).await.unwrap();
        assert!(matches!(
            source.attach(sink).await,
            Err(SourceError::AlreadyAttached("jsonl"))
        ));
        source.detach().await;
    }
}
