//! Durable per-object-type cursors
//!
//! A checkpoint is committed only after every record of a run has been
//! written to the sink, so a crash anywhere before the commit makes the next
//! run re-fetch from the previous position.

use crate::error::{IngestError, Result};
use crate::keyed::KeyedMutex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use halcyon_common::fs::{read_json, sanitize_file_stem, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Saved position of one object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Checkpoint {
    pub object_type: String,
    /// Last id (id cursors) or RFC 3339 time (timestamp cursors) collected
    pub cursor_value: Option<String>,
    /// Newest record time seen so far
    pub high_water_time: Option<DateTime<Utc>>,
    /// Most recent record ids, oldest first, for de-duplication
    pub recent_ids: Vec<String>,
    pub last_run_time: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            ..Default::default()
        }
    }
}

/// Bounded insertion-ordered id set used while a run is in flight.
#[derive(Debug, Clone)]
pub struct RecentIds {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn from_checkpoint(checkpoint: &Checkpoint, capacity: usize) -> Self {
        let mut ids = Self {
            order: VecDeque::with_capacity(capacity.min(checkpoint.recent_ids.len() + 1)),
            members: HashSet::new(),
            capacity,
        };
        for id in &checkpoint.recent_ids {
            ids.insert(id.clone());
        }
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Add `id`, evicting the oldest entry once full. Returns `false` if it
    /// was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.capacity == 0 || self.members.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn into_vec(self) -> Vec<String> {
        self.order.into()
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Saved checkpoint, or an empty one if the type was never committed.
    async fn get(&self, object_type: &str) -> Result<Checkpoint>;

    /// Durably replace the checkpoint for `checkpoint.object_type`.
    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// One JSON file per object type under `<state_dir>/checkpoints/`.
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: KeyedMutex,
}

impl FileCheckpointStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("checkpoints"),
            locks: KeyedMutex::new(),
        }
    }

    pub fn path_for(&self, object_type: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_file_stem(object_type)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, object_type: &str) -> Result<Checkpoint> {
        let _guard = self.locks.lock(object_type).await;
        let path = self.path_for(object_type);

        let loaded = tokio::task::spawn_blocking({
            let path = path.clone();
            move || read_json::<Checkpoint>(&path)
        })
        .await
        .map_err(|e| IngestError::checkpoint(format!("checkpoint read task failed: {e}")))?;

        match loaded {
            Ok(Some(mut checkpoint)) => {
                checkpoint.object_type = object_type.to_string();
                Ok(checkpoint)
            },
            Ok(None) => Ok(Checkpoint::new(object_type)),
            Err(e) => {
                warn!(
                    object_type,
                    path = %path.display(),
                    error = %e,
                    "Unreadable checkpoint, starting from scratch"
                );
                Ok(Checkpoint::new(object_type))
            },
        }
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _guard = self.locks.lock(&checkpoint.object_type).await;
        let path = self.path_for(&checkpoint.object_type);

        let written = tokio::task::spawn_blocking({
            let path = path.clone();
            let checkpoint = checkpoint.clone();
            move || write_json_atomic(&path, &checkpoint)
        })
        .await
        .map_err(|e| IngestError::checkpoint(format!("checkpoint write task failed: {e}")))?;

        written.map_err(|e| {
            IngestError::checkpoint(format!("cannot write {}: {e}", path.display()))
        })?;

        debug!(
            object_type = %checkpoint.object_type,
            cursor = ?checkpoint.cursor_value,
            "Checkpoint committed"
        );
        Ok(())
    }
}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Checkpoint>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, object_type: &str) -> Result<Checkpoint> {
        Ok(self
            .entries()
            .get(object_type)
            .cloned()
            .unwrap_or_else(|| Checkpoint::new(object_type)))
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.entries()
            .insert(checkpoint.object_type.clone(), checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let mut checkpoint = Checkpoint::new("alerts");
        checkpoint.recent_ids = vec!["a".into(), "b".into()];

        let mut ids = RecentIds::from_checkpoint(&checkpoint, 3);
        assert!(ids.contains("a"));
        assert!(!ids.insert("b".into()));
        assert!(ids.insert("c".into()));
        assert!(ids.insert("d".into()));

        assert!(!ids.contains("a"));
        assert_eq!(ids.into_vec(), vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        let empty = store.get("alerts").await.unwrap();
        assert_eq!(empty, Checkpoint::new("alerts"));

        let mut checkpoint = Checkpoint::new("alerts");
        checkpoint.cursor_value = Some("a-100".into());
        checkpoint.recent_ids = vec!["a-99".into(), "a-100".into()];
        checkpoint.last_run_time = Some(Utc::now());
        store.commit(&checkpoint).await.unwrap();

        // a fresh store sees the committed state
        let reopened = FileCheckpointStore::new(dir.path());
        assert_eq!(reopened.get("alerts").await.unwrap(), checkpoint);
        assert!(reopened.path_for("alerts").exists());
        assert!(!reopened
            .path_for("alerts")
            .with_extension("json.tmp")
            .exists());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let path = store.path_for("devices");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        assert_eq!(
            store.get("devices").await.unwrap(),
            Checkpoint::new("devices")
        );
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        let mut checkpoint = Checkpoint::new("jobs");
        checkpoint.cursor_value = Some("j-1".into());
        store.commit(&checkpoint).await.unwrap();
        assert_eq!(store.get("jobs").await.unwrap(), checkpoint);
        assert!(store.get("tags").await.unwrap().cursor_value.is_none());
    }
}
