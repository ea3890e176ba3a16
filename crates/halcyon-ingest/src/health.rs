//! Per-object-type health accounting
//!
//! Completed runs arrive over a channel from the scheduler. For each run the
//! reporter updates that object type's counters, writes a
//! `halcyon:collector_status` or `halcyon:collector_error` event, and
//! persists a snapshot of all counters to `health.json`.

use crate::collector::{CollectionRun, RunError};
use crate::emitter::RecordEmitter;
use crate::error::{IngestError, Result};
use chrono::{DateTime, Utc};
use halcyon_common::fs::{read_json, write_json_atomic};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const STATUS_SOURCETYPE: &str = "halcyon:collector_status";
pub const ERROR_SOURCETYPE: &str = "halcyon:collector_error";
pub const COLLECTOR_SOURCE: &str = "halcyon_ingest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
}

/// Counters for one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObjectHealth {
    pub sourcetype: String,
    pub enabled: bool,
    pub state: RunState,
    pub last_outcome: Option<RunOutcome>,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub consecutive_failures: u32,
    pub records_ingested: u64,
    pub records_skipped: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<RunError>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub avg_latency_ms: Option<f64>,
    pub next_due_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    latency_samples: u64,
}

impl ObjectHealth {
    fn record(&mut self, run: &CollectionRun) {
        let finished = run.finished_at.unwrap_or_else(Utc::now);
        self.state = RunState::Idle;
        self.last_run_at = Some(finished);
        self.records_ingested += run.records_emitted;
        self.records_skipped += run.records_skipped;

        if let Some(latency) = run.mean_page_latency() {
            let ms = latency.as_millis() as u64;
            self.last_latency_ms = Some(ms);
            self.latency_samples += 1;
            let n = self.latency_samples as f64;
            let avg = self.avg_latency_ms.unwrap_or(0.0);
            self.avg_latency_ms = Some(avg + (ms as f64 - avg) / n);
        }

        match run.error {
            None => {
                self.last_outcome = Some(RunOutcome::Success);
                self.runs_succeeded += 1;
                self.consecutive_failures = 0;
                self.last_success_at = Some(finished);
            },
            Some(ref err) => {
                self.last_outcome = Some(RunOutcome::Failed);
                self.runs_failed += 1;
                self.consecutive_failures += 1;
                self.last_error = Some(err.clone());
                self.last_error_at = Some(finished);
            },
        }
    }
}

/// Serializable view of every object type's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub healthy: bool,
    pub object_types: BTreeMap<String, ObjectHealth>,
}

impl HealthReport {
    /// Last persisted report, if any.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        Ok(read_json(path)?)
    }

    /// Object types whose most recent run failed.
    pub fn failing(&self) -> impl Iterator<Item = (&String, &ObjectHealth)> {
        self.object_types
            .iter()
            .filter(|(_, h)| h.enabled && h.last_outcome == Some(RunOutcome::Failed))
    }
}

/// Shared health state fed by completed runs.
pub struct HealthReporter {
    entries: Mutex<BTreeMap<String, Arc<Mutex<ObjectHealth>>>>,
    emitter: Option<RecordEmitter>,
    snapshot_path: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl HealthReporter {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            emitter: None,
            snapshot_path: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Also write status/error events through `emitter`.
    pub fn with_emitter(mut self, emitter: RecordEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Also persist each snapshot to `path`.
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    fn entry(&self, object_type: &str) -> Arc<Mutex<ObjectHealth>> {
        lock(&self.entries)
            .entry(object_type.to_string())
            .or_default()
            .clone()
    }

    /// Make an object type known before its first run.
    pub fn register(&self, object_type: &str, sourcetype: &str, enabled: bool) {
        let entry = self.entry(object_type);
        let mut health = lock(&entry);
        health.sourcetype = sourcetype.to_string();
        health.enabled = enabled;
    }

    pub fn mark_running(&self, object_type: &str) {
        lock(&self.entry(object_type)).state = RunState::Running;
    }

    pub fn set_next_due(&self, object_type: &str, at: DateTime<Utc>) {
        lock(&self.entry(object_type)).next_due_at = Some(at);
    }

    /// Fold one completed run into the counters.
    pub fn record(&self, run: &CollectionRun) {
        let entry = self.entry(&run.object_type);
        let mut health = lock(&entry);
        if health.sourcetype.is_empty() {
            health.sourcetype = run.sourcetype.clone();
            health.enabled = true;
        }
        health.record(run);
    }

    pub fn snapshot(&self) -> HealthReport {
        let entries: Vec<(String, Arc<Mutex<ObjectHealth>>)> = lock(&self.entries)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let object_types: BTreeMap<String, ObjectHealth> = entries
            .into_iter()
            .map(|(name, entry)| {
                let health = lock(&entry).clone();
                (name, health)
            })
            .collect();

        let healthy = !object_types
            .values()
            .any(|h| h.enabled && h.last_outcome == Some(RunOutcome::Failed));

        HealthReport {
            generated_at: Utc::now(),
            healthy,
            object_types,
        }
    }

    /// No enabled object type whose latest completed run failed.
    pub fn is_healthy(&self) -> bool {
        self.snapshot().healthy
    }

    /// Record `run`, emit its status event and persist the snapshot.
    ///
    /// Event and snapshot failures are logged; they never affect collection.
    pub async fn observe(&self, run: &CollectionRun) {
        self.record(run);

        if let Some(ref emitter) = self.emitter {
            if let Err(e) = emit_run_event(emitter, run).await {
                warn!(object_type = %run.object_type, error = %e, "Cannot write collector event");
            }
        }

        if let Err(e) = self.persist().await {
            warn!(error = %e, "Cannot persist health snapshot");
        }
    }

    /// Write the current snapshot to the configured path.
    pub async fn persist(&self) -> Result<()> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let report = self.snapshot();
        let path = path.clone();

        tokio::task::spawn_blocking(move || write_json_atomic(&path, &report))
            .await
            .map_err(|e| IngestError::checkpoint(format!("health write task failed: {e}")))??;
        debug!("Health snapshot persisted");
        Ok(())
    }

    /// Consume completed runs until every sender is dropped.
    pub async fn consume(self: Arc<Self>, mut runs: mpsc::Receiver<CollectionRun>) {
        while let Some(run) = runs.recv().await {
            self.observe(&run).await;
        }
        debug!("Health channel closed");
    }
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}

async fn emit_run_event(emitter: &RecordEmitter, run: &CollectionRun) -> Result<()> {
    let time = run.finished_at.unwrap_or_else(Utc::now);
    let base = json!({
        "collector": run.object_type,
        "sourcetype": run.sourcetype,
        "run_id": run.run_id,
        "started_at": run.started_at,
        "finished_at": run.finished_at,
        "pages": run.pages,
        "records_fetched": run.records_fetched,
        "wrote": run.records_emitted,
        "skipped": run.records_skipped,
        "truncated": run.truncated,
        "api_latency_ms": run.api_latency.as_millis() as u64,
    });

    match run.error {
        None => emitter.emit_internal(STATUS_SOURCETYPE, COLLECTOR_SOURCE, time, base).await,
        Some(ref err) => {
            let mut event = base;
            event["error_kind"] = json!(err.kind);
            event["error"] = json!(err.message);
            emitter
                .emit_internal(ERROR_SOURCETYPE, COLLECTOR_SOURCE, time, event)
                .await
        },
    }
}
