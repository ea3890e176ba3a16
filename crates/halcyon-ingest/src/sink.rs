//! Append-only event sinks
//!
//! Every sink receives host-platform shaped envelopes
//! (`{time, index, sourcetype, source, event}`) and must be safe to share
//! between concurrently running collections.

use crate::config::{OutputSettings, SinkKind};
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_jsonlines::JsonLinesWriter;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// One line of output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event time, epoch seconds
    pub time: f64,
    pub index: String,
    pub sourcetype: String,
    pub source: String,
    pub event: Value,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Append `events` in order. Either all are accepted or an error is returned.
    async fn write(&self, events: Vec<Envelope>) -> Result<()>;

    /// Push buffered output to durable storage.
    async fn flush(&self) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// JSON Lines file opened in append mode.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Arc<Mutex<JsonLinesWriter<BufWriter<File>>>>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "Writing events to JSON Lines file");

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(JsonLinesWriter::new(BufWriter::new(file)))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn write(&self, events: Vec<Envelope>) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let mut writer = lock(&*writer);
            for event in &events {
                writer.write(event).map_err(|e| {
                    IngestError::sink(format!("cannot append to {}: {e}", path.display()))
                })?;
            }
            Ok::<(), IngestError>(())
        })
        .await
        .map_err(|e| IngestError::sink(format!("sink task failed: {e}")))?
    }

    async fn flush(&self) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || lock(&*writer).flush())
            .await
            .map_err(|e| IngestError::sink(format!("sink task failed: {e}")))?
            .map_err(|e| IngestError::sink(format!("flush failed: {e}")))
    }
}

/// Envelopes as JSON lines on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink {
    guard: Mutex<()>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordSink for StdoutSink {
    async fn write(&self, events: Vec<Envelope>) -> Result<()> {
        let mut lines = Vec::with_capacity(events.len());
        for event in &events {
            lines.push(serde_json::to_string(event)?);
        }

        let _guard = lock(&self.guard);
        let mut out = std::io::stdout().lock();
        for line in lines {
            writeln!(out, "{line}").map_err(|e| IngestError::sink(format!("stdout: {e}")))?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        std::io::stdout()
            .flush()
            .map_err(|e| IngestError::sink(format!("stdout: {e}")))
    }
}

/// Collects envelopes in memory; optionally refuses writes past a limit.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Envelope>>,
    capacity: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects any write that would take it past `accepted` events.
    pub fn failing_after(accepted: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            capacity: Some(accepted),
        }
    }

    pub fn events(&self) -> Vec<Envelope> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    /// Envelopes of one sourcetype, in write order.
    pub fn by_sourcetype(&self, sourcetype: &str) -> Vec<Envelope> {
        lock(&self.events)
            .iter()
            .filter(|e| e.sourcetype == sourcetype)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&self, events: Vec<Envelope>) -> Result<()> {
        let mut stored = lock(&self.events);
        if let Some(capacity) = self.capacity {
            if stored.len() + events.len() > capacity {
                return Err(IngestError::sink("memory sink is full"));
            }
        }
        stored.extend(events);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the sink selected in the output settings.
pub fn from_settings(output: &OutputSettings) -> Result<Arc<dyn RecordSink>> {
    Ok(match output.sink {
        SinkKind::Jsonl => Arc::new(JsonLinesSink::open(&output.path)?),
        SinkKind::Stdout => Arc::new(StdoutSink::new()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn envelope(n: u64) -> Envelope {
        Envelope {
            time: 1_700_000_000.5,
            index: "security_halcyon".into(),
            sourcetype: "halcyon:tag".into(),
            source: "halcyon_api:tags".into(),
            event: json!({"id": n}),
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("events.jsonl");

        let sink = JsonLinesSink::open(&path).unwrap();
        sink.write(vec![envelope(1), envelope(2)]).await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        let sink = JsonLinesSink::open(&path).unwrap();
        sink.write(vec![envelope(3)]).await.unwrap();
        sink.flush().await.unwrap();

        let lines: Vec<Envelope> = serde_jsonlines::json_lines::<Envelope, _>(&path)
            .unwrap()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].event, json!({"id": 3}));
        assert_eq!(lines[0].index, "security_halcyon");
    }

    #[tokio::test]
    async fn test_memory_sink_limit_rejects_whole_batch() {
        let sink = MemorySink::failing_after(2);
        sink.write(vec![envelope(1)]).await.unwrap();

        let err = sink.write(vec![envelope(2), envelope(3)]).await.unwrap_err();
        assert!(matches!(err, IngestError::SinkWrite(_)));
        assert_eq!(sink.len(), 1);
    }
}
