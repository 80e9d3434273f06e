use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{RunAccession, SampleStatus};
use crate::error::PipelineError;
use crate::store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub status: SampleStatus,
    pub timestamp: String,
    pub attempt_count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    samples: BTreeMap<String, CheckpointRecord>,
    #[serde(default)]
    last_settled_batch_index: Option<u64>,
}

/// Durable sample-id → status map shared by every worker of a run.
///
/// `set` buffers in memory; `flush` snapshots the whole map to a temp file in
/// the checkpoint's directory and atomically renames it over the previous
/// snapshot, so readers never observe a partial write.
#[derive(Debug)]
pub struct CheckpointStore {
    path: Utf8PathBuf,
    inner: Mutex<CheckpointFile>,
}

impl CheckpointStore {
    /// Open an existing checkpoint or start an empty one. An unreadable or
    /// unparsable snapshot is fatal; resuming past it would guess at state.
    pub fn load_or_create(path: &Utf8Path) -> Result<Self, PipelineError> {
        let state = if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path()).map_err(|err| {
                PipelineError::CorruptCheckpoint {
                    path: path.as_std_path().to_path_buf(),
                    message: err.to_string(),
                }
            })?;
            serde_json::from_str(&content).map_err(|err| PipelineError::CorruptCheckpoint {
                path: path.as_std_path().to_path_buf(),
                message: err.to_string(),
            })?
        } else {
            CheckpointFile::default()
        };

        Ok(Self {
            path: path.to_owned(),
            inner: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn get(&self, id: &RunAccession) -> Option<CheckpointRecord> {
        let state = self.inner.lock().expect("checkpoint lock poisoned");
        state.samples.get(id.as_str()).cloned()
    }

    /// Record a status transition. Entering Downloading counts an attempt;
    /// requeueing to Pending resets the counter.
    pub fn set(&self, id: &RunAccession, status: SampleStatus) {
        let mut state = self.inner.lock().expect("checkpoint lock poisoned");
        let previous_attempts = state
            .samples
            .get(id.as_str())
            .map(|record| record.attempt_count)
            .unwrap_or(0);
        let attempt_count = match status {
            SampleStatus::Downloading => previous_attempts + 1,
            SampleStatus::Pending => 0,
            _ => previous_attempts,
        };
        state.samples.insert(
            id.as_str().to_string(),
            CheckpointRecord {
                status,
                timestamp: chrono::Utc::now().to_rfc3339(),
                attempt_count,
            },
        );
    }

    pub fn last_settled_batch_index(&self) -> Option<u64> {
        let state = self.inner.lock().expect("checkpoint lock poisoned");
        state.last_settled_batch_index
    }

    pub fn set_last_settled_batch_index(&self, index: u64) {
        let mut state = self.inner.lock().expect("checkpoint lock poisoned");
        state.last_settled_batch_index = Some(index);
    }

    /// Requeue every non-terminal sample as Pending and return their ids.
    /// Used on resume and on interrupt so a later run treats them as
    /// not-yet-attempted instead of permanently failed.
    pub fn requeue_in_flight(&self) -> Vec<RunAccession> {
        let mut state = self.inner.lock().expect("checkpoint lock poisoned");
        let mut requeued = Vec::new();
        for (id, record) in state.samples.iter_mut() {
            if !record.status.is_terminal() && record.status != SampleStatus::Pending {
                record.status = SampleStatus::Pending;
                record.timestamp = chrono::Utc::now().to_rfc3339();
                record.attempt_count = 0;
                if let Ok(accession) = id.parse() {
                    requeued.push(accession);
                }
            }
        }
        requeued
    }

    pub fn snapshot(&self) -> BTreeMap<String, CheckpointRecord> {
        let state = self.inner.lock().expect("checkpoint lock poisoned");
        state.samples.clone()
    }

    /// Durable atomic snapshot of the full map.
    pub fn flush(&self) -> Result<(), PipelineError> {
        let state = self.inner.lock().expect("checkpoint lock poisoned");
        store::write_json_atomic(&self.path, &*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(dir: &tempfile::TempDir) -> CheckpointStore {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("checkpoint.json")).unwrap();
        CheckpointStore::load_or_create(&path).unwrap()
    }

    #[test]
    fn attempt_count_tracks_download_entries() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = temp_store(&dir);
        let id: RunAccession = "SRR000001".parse().unwrap();

        checkpoint.set(&id, SampleStatus::Downloading);
        checkpoint.set(&id, SampleStatus::Downloading);
        assert_eq!(checkpoint.get(&id).unwrap().attempt_count, 2);

        checkpoint.set(&id, SampleStatus::Converting);
        assert_eq!(checkpoint.get(&id).unwrap().attempt_count, 2);

        checkpoint.set(&id, SampleStatus::Pending);
        assert_eq!(checkpoint.get(&id).unwrap().attempt_count, 0);
    }

    #[test]
    fn requeue_leaves_terminal_statuses_alone() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = temp_store(&dir);
        let downloading: RunAccession = "SRR000001".parse().unwrap();
        let cleaned: RunAccession = "SRR000002".parse().unwrap();
        let failed: RunAccession = "SRR000003".parse().unwrap();

        checkpoint.set(&downloading, SampleStatus::Downloading);
        checkpoint.set(&cleaned, SampleStatus::Cleaned);
        checkpoint.set(&failed, SampleStatus::Failed("network".to_string()));

        let requeued = checkpoint.requeue_in_flight();
        assert_eq!(requeued, vec![downloading.clone()]);
        assert_eq!(
            checkpoint.get(&downloading).unwrap().status,
            SampleStatus::Pending
        );
        assert_eq!(
            checkpoint.get(&cleaned).unwrap().status,
            SampleStatus::Cleaned
        );
    }
}
