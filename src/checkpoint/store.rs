//! Durable checkpoint of result records.
//!
//! The checkpoint is a JSON array of result records sorted ascending by id.
//! Every save replaces the whole file, and the on-disk file is only ever
//! written while the store's lock is held.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::record::{FailureKind, ResultRecord};
use crate::dataset::ItemId;
use crate::error::CheckpointError;
use crate::metrics::MetricsCollector;

/// Identifier-keyed set of result records.
///
/// Backed by a `BTreeMap`, so iteration is always in ascending id order.
/// At most one record exists per id; inserting again overwrites.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointSet {
    records: BTreeMap<ItemId, ResultRecord>,
}

impl CheckpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from raw JSON records, skipping entries without a usable id.
    ///
    /// Returns the set and the number of skipped entries. Later duplicates win.
    pub fn from_values(values: Vec<Value>) -> (Self, usize) {
        let mut set = Self::new();
        let mut skipped = 0;
        for value in values {
            match ResultRecord::from_value(value) {
                Some(record) => {
                    set.insert(record);
                }
                None => skipped += 1,
            }
        }
        (set, skipped)
    }

    /// Inserts a record, returning the record it replaced.
    pub fn insert(&mut self, record: ResultRecord) -> Option<ResultRecord> {
        self.records.insert(record.id.clone(), record)
    }

    pub fn get(&self, id: &ItemId) -> Option<&ResultRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.records.contains_key(id)
    }

    /// Whether `id` has a record that counts as done.
    pub fn is_resolved(&self, id: &ItemId, retry_failed: bool) -> bool {
        self.records
            .get(id)
            .is_some_and(|r| r.is_resolved(retry_failed))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &ResultRecord> {
        self.records.values()
    }

    pub fn success_count(&self) -> usize {
        self.iter().filter(|r| r.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.iter().filter(|r| r.is_failure()).count()
    }

    /// Failure counts per kind, only for kinds that occur.
    pub fn failures_by_kind(&self) -> BTreeMap<FailureKind, usize> {
        let mut counts = BTreeMap::new();
        for failure in self.iter().filter_map(ResultRecord::failure_ref) {
            *counts.entry(failure.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Sorted copy of all records.
    pub fn to_sorted_vec(&self) -> Vec<ResultRecord> {
        self.records.values().cloned().collect()
    }
}

/// Loads a checkpoint file.
///
/// Never fails: a missing or empty file yields an empty set, and an
/// unreadable or corrupt file is logged and also yields an empty set.
pub fn load(path: &Path) -> CheckpointSet {
    if !path.exists() {
        debug!(path = %path.display(), "No existing checkpoint");
        return CheckpointSet::new();
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read checkpoint, starting fresh");
            return CheckpointSet::new();
        }
    };

    if content.trim().is_empty() {
        return CheckpointSet::new();
    }

    let values = match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(values)) => values,
        Ok(_) => {
            warn!(path = %path.display(), "Checkpoint is not a JSON array, starting fresh");
            return CheckpointSet::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not decode checkpoint, starting fresh");
            return CheckpointSet::new();
        }
    };

    let (set, skipped) = CheckpointSet::from_values(values);
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "Ignored checkpoint entries without a usable id");
    }
    info!(path = %path.display(), records = set.len(), "Loaded existing results");
    set
}

/// Writes the full set to `path`, sorted by id, replacing the previous file.
///
/// The parent directory is created if needed. The content goes to a sibling
/// temporary file first and is renamed over the destination.
pub async fn save(path: &Path, set: &CheckpointSet) -> Result<(), CheckpointError> {
    let write_err = |source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let records: Vec<&ResultRecord> = set.iter().collect();
    let body = serde_json::to_string_pretty(&records)?;

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, body).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)?;

    MetricsCollector::new().record_checkpoint_save();
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

struct StoreState {
    set: CheckpointSet,
    since_last_save: usize,
    saves: usize,
}

/// Concurrency-safe checkpoint shared by all workers of a run.
///
/// Every update and every save happens inside one async mutex, so a save
/// always writes a consistent snapshot and never races another save.
pub struct CheckpointStore {
    path: PathBuf,
    save_interval: usize,
    state: Mutex<StoreState>,
}

impl CheckpointStore {
    /// Wraps an already loaded set. `save_interval` of zero is treated as one.
    pub fn new(path: impl Into<PathBuf>, set: CheckpointSet, save_interval: usize) -> Self {
        Self {
            path: path.into(),
            save_interval: save_interval.max(1),
            state: Mutex::new(StoreState {
                set,
                since_last_save: 0,
                saves: 0,
            }),
        }
    }

    /// Loads the checkpoint at `path` and wraps it.
    pub fn open(path: impl Into<PathBuf>, save_interval: usize) -> Self {
        let path = path.into();
        let set = load(&path);
        Self::new(path, set, save_interval)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts one completed record.
    ///
    /// When the number of completions since the last save reaches the save
    /// interval, the checkpoint is written before the lock is released. A
    /// failed periodic save is logged and attempted again on the next completion.
    pub async fn upsert(&self, record: ResultRecord) {
        let mut state = self.state.lock().await;
        state.set.insert(record);
        state.since_last_save += 1;

        if state.since_last_save >= self.save_interval {
            match save(&self.path, &state.set).await {
                Ok(()) => {
                    state.since_last_save = 0;
                    state.saves += 1;
                    info!(
                        path = %self.path.display(),
                        records = state.set.len(),
                        "Checkpoint saved"
                    );
                }
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Periodic checkpoint save failed");
                }
            }
        }
    }

    /// Inserts several records without triggering a periodic save.
    pub async fn insert_many(&self, records: impl IntoIterator<Item = ResultRecord>) {
        let mut state = self.state.lock().await;
        for record in records {
            state.set.insert(record);
            state.since_last_save += 1;
        }
    }

    /// Writes the checkpoint now, regardless of the interval.
    pub async fn flush(&self) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        save(&self.path, &state.set).await?;
        state.since_last_save = 0;
        state.saves += 1;
        info!(
            path = %self.path.display(),
            records = state.set.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Sorted copy of the current records.
    pub async fn snapshot_sorted(&self) -> Vec<ResultRecord> {
        self.state.lock().await.set.to_sorted_vec()
    }

    /// Copy of the current set.
    pub async fn snapshot(&self) -> CheckpointSet {
        self.state.lock().await.set.clone()
    }

    /// Number of successful saves performed through this store.
    pub async fn saves(&self) -> usize {
        self.state.lock().await.saves
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.set.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.set.is_empty()
    }
}
