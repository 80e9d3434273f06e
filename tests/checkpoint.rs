use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use cardioseq::checkpoint::CheckpointStore;
use cardioseq::domain::{RunAccession, SampleStatus};
use cardioseq::error::PipelineError;

fn checkpoint_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join("checkpoint.json")).unwrap()
}

#[test]
fn flush_then_reload_round_trips_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint_path(&dir);

    let checkpoint = CheckpointStore::load_or_create(&path).unwrap();
    let cleaned: RunAccession = "SRR000001".parse().unwrap();
    let failed: RunAccession = "SRR000002".parse().unwrap();
    checkpoint.set(&cleaned, SampleStatus::Cleaned);
    checkpoint.set(&failed, SampleStatus::Failed("timeout".to_string()));
    checkpoint.set_last_settled_batch_index(4);
    checkpoint.flush().unwrap();

    let reloaded = CheckpointStore::load_or_create(&path).unwrap();
    assert_eq!(reloaded.get(&cleaned).unwrap().status, SampleStatus::Cleaned);
    assert_eq!(
        reloaded.get(&failed).unwrap().status,
        SampleStatus::Failed("timeout".to_string())
    );
    assert_eq!(reloaded.last_settled_batch_index(), Some(4));
}

#[test]
fn corrupt_snapshot_is_refused_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint_path(&dir);
    fs::write(path.as_std_path(), b"{\"samples\": {\"SRR0").unwrap();

    let err = CheckpointStore::load_or_create(&path).unwrap_err();
    assert_matches!(err, PipelineError::CorruptCheckpoint { .. });
}

#[test]
fn interrupted_flush_leaves_prior_snapshot_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint_path(&dir);

    let checkpoint = CheckpointStore::load_or_create(&path).unwrap();
    let id: RunAccession = "SRR000001".parse().unwrap();
    checkpoint.set(&id, SampleStatus::Cleaned);
    checkpoint.flush().unwrap();

    // A crash mid-flush leaves bytes only in the temp file; the rename never
    // happened, so readers still see the previous snapshot.
    let tmp = path.with_extension("tmp");
    fs::write(tmp.as_std_path(), b"{\"samples\": {\"SRR0").unwrap();

    let reloaded = CheckpointStore::load_or_create(&path).unwrap();
    assert_eq!(reloaded.get(&id).unwrap().status, SampleStatus::Cleaned);
}

#[test]
fn fresh_store_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = CheckpointStore::load_or_create(&checkpoint_path(&dir)).unwrap();
    let id: RunAccession = "SRR000001".parse().unwrap();
    assert!(checkpoint.get(&id).is_none());
    assert_eq!(checkpoint.last_settled_batch_index(), None);
}
