//! One collection run for one object type
//!
//! A run reads the checkpoint, pages through the API from that position,
//! normalizes and emits each page, and commits the advanced checkpoint only
//! after the last page has been written. Any error, cancellation or deadline
//! ends the run without a commit, so the next run starts again from the
//! previous checkpoint.

use crate::checkpoint::{Checkpoint, CheckpointStore, RecentIds};
use crate::client::HalcyonClient;
use crate::emitter::{normalize, record_id, scalar_string, RecordEmitter};
use crate::error::{IngestError, Result};
use crate::keyed::KeyedMutex;
use crate::object_types::{CursorKind, ObjectTypeSpec};
use chrono::{DateTime, SecondsFormat, Utc};
use halcyon_common::time::parse_timestamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Stable label from [`IngestError::kind`]
    pub kind: String,
    pub message: String,
}

impl From<&IngestError> for RunError {
    fn from(err: &IngestError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome and counters of a single run.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionRun {
    pub run_id: Uuid,
    pub object_type: String,
    pub sourcetype: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_fetched: u64,
    pub records_emitted: u64,
    /// Duplicates and records that failed normalization
    pub records_skipped: u64,
    pub normalization_errors: u64,
    pub pages: u32,
    /// Page cap reached before the API ran out of pages
    pub truncated: bool,
    /// Sum of request latencies
    #[serde(serialize_with = "serialize_millis")]
    pub api_latency: Duration,
    pub error: Option<RunError>,
}

impl CollectionRun {
    fn start(spec: &ObjectTypeSpec) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            object_type: spec.name.clone(),
            sourcetype: spec.sourcetype.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            records_fetched: 0,
            records_emitted: 0,
            records_skipped: 0,
            normalization_errors: 0,
            pages: 0,
            truncated: false,
            api_latency: Duration::ZERO,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Mean latency per fetched page.
    pub fn mean_page_latency(&self) -> Option<Duration> {
        (self.pages > 0).then(|| self.api_latency / self.pages)
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Query parameters that resume collection after `checkpoint`.
pub fn incremental_filter(spec: &ObjectTypeSpec, checkpoint: &Checkpoint) -> Vec<(String, String)> {
    match (spec.cursor.kind, &checkpoint.cursor_value) {
        (CursorKind::Snapshot, _) | (_, None) => Vec::new(),
        (_, Some(value)) if spec.cursor.param.is_empty() => {
            warn!(object_type = %spec.name, cursor = %value, "Cursor parameter not configured, collecting everything");
            Vec::new()
        },
        (_, Some(value)) => vec![(spec.cursor.param.clone(), value.clone())],
    }
}

/// Runs collections against shared client, checkpoint store and emitter.
pub struct Collector {
    client: Arc<HalcyonClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    emitter: RecordEmitter,
    run_locks: KeyedMutex,
    run_timeout: Duration,
    recent_id_capacity: usize,
}

impl Collector {
    pub fn new(
        client: Arc<HalcyonClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        emitter: RecordEmitter,
        run_timeout: Duration,
        recent_id_capacity: usize,
    ) -> Self {
        Self {
            client,
            checkpoints,
            emitter,
            run_locks: KeyedMutex::new(),
            run_timeout,
            recent_id_capacity,
        }
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn emitter(&self) -> &RecordEmitter {
        &self.emitter
    }

    /// Collect `spec` once. Never returns an error: failures are recorded in
    /// the returned run.
    #[instrument(skip_all, fields(object_type = %spec.name))]
    pub async fn run(&self, spec: &ObjectTypeSpec, cancel: &CancellationToken) -> CollectionRun {
        // one run per object type at a time
        let _guard = self.run_locks.lock(&spec.name).await;

        let mut run = CollectionRun::start(spec);
        let outcome = tokio::time::timeout(self.run_timeout, self.collect(spec, cancel, &mut run))
            .await
            .unwrap_or_else(|_| Err(IngestError::Timeout(self.run_timeout)));

        run.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                info!(
                    run_id = %run.run_id,
                    pages = run.pages,
                    fetched = run.records_fetched,
                    emitted = run.records_emitted,
                    skipped = run.records_skipped,
                    truncated = run.truncated,
                    "Collection succeeded"
                );
            },
            Err(ref err) => {
                warn!(
                    run_id = %run.run_id,
                    pages = run.pages,
                    emitted = run.records_emitted,
                    kind = err.kind(),
                    error = %err,
                    "Collection failed, checkpoint unchanged"
                );
                run.error = Some(RunError::from(err));
            },
        }
        run
    }

    async fn collect(
        &self,
        spec: &ObjectTypeSpec,
        cancel: &CancellationToken,
        run: &mut CollectionRun,
    ) -> Result<()> {
        let checkpoint = self.checkpoints.get(&spec.name).await?;
        let filter = incremental_filter(spec, &checkpoint);
        let incremental = spec.cursor.kind != CursorKind::Snapshot;

        let mut recent = RecentIds::from_checkpoint(&checkpoint, self.recent_id_capacity);
        let mut cursor_value = checkpoint.cursor_value.clone();
        let mut high_water = checkpoint.high_water_time;

        let mut pages = self.client.paginate(spec, filter);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                page = pages.next_page() => page?,
            };
            let Some(page) = next else { break };

            run.pages += 1;
            run.api_latency += page.latency;
            run.records_fetched += page.records.len() as u64;

            let collected_at = Utc::now();
            let mut batch = Vec::with_capacity(page.records.len());

            for raw in page.records {
                let id = record_id(&raw, spec.id_fields);
                if incremental {
                    if let Some(ref id) = id {
                        if recent.contains(id) {
                            run.records_skipped += 1;
                            continue;
                        }
                    }
                }

                match spec.cursor.kind {
                    CursorKind::Id => {
                        if let Some(value) = raw.get(&spec.cursor.field).and_then(scalar_string) {
                            cursor_value = Some(value);
                        }
                    },
                    CursorKind::Timestamp => {
                        if let Some(ts) = raw.get(&spec.cursor.field).and_then(parse_timestamp) {
                            high_water = Some(high_water.map_or(ts, |hw| hw.max(ts)));
                        }
                    },
                    CursorKind::Snapshot => {},
                }

                match normalize(spec, raw, collected_at) {
                    Ok(record) => {
                        if incremental {
                            if let Some(id) = id {
                                recent.insert(id);
                            }
                        }
                        batch.push(record);
                    },
                    Err(err) => {
                        run.records_skipped += 1;
                        run.normalization_errors += 1;
                        warn!(error = %err, record_id = ?id, "Skipping record");
                    },
                }
            }

            // a failed write aborts the run before the commit below
            let emitted = batch.len() as u64;
            self.emitter.emit_batch(batch).await?;
            run.records_emitted += emitted;
        }

        run.truncated = pages.truncated();

        if spec.cursor.kind == CursorKind::Timestamp {
            cursor_value = high_water
                .map(|hw| hw.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                .or(cursor_value);
        }

        let next = Checkpoint {
            object_type: spec.name.clone(),
            cursor_value,
            high_water_time: high_water,
            recent_ids: if incremental { recent.into_vec() } else { Vec::new() },
            last_run_time: Some(Utc::now()),
        };
        self.checkpoints.commit(&next).await
    }
}
