use std::fs;

use chrono::DateTime;
use serde::Serialize;

use crate::checkpoint::CheckpointStore;
use crate::error::PipelineError;
use crate::metadata::MetadataFetchState;
use crate::store::RunLayout;

/// Read-side view of a run. Computed purely from the persisted files; the
/// monitor is never a source of truth.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub running: bool,
    pub completed_count: usize,
    pub total_count: usize,
    pub percent: f64,
    pub eta_secs: Option<u64>,
}

/// Status of the batch pipeline, derived from the checkpoint file.
pub fn pipeline_status(layout: &RunLayout) -> Result<RunStatus, PipelineError> {
    let checkpoint_path = layout.checkpoint_path();
    let (completed, total, eta_secs) = if checkpoint_path.as_std_path().exists() {
        let checkpoint = CheckpointStore::load_or_create(&checkpoint_path)?;
        let samples = checkpoint.snapshot();
        let total = samples.len();
        let terminal: Vec<&str> = samples
            .iter()
            .filter(|(_, record)| record.status.is_terminal())
            .map(|(_, record)| record.timestamp.as_str())
            .collect();
        let eta = rate_based_eta(&terminal, total - terminal.len());
        (terminal.len(), total, eta)
    } else {
        (0, 0, None)
    };

    Ok(RunStatus {
        running: process_alive(layout),
        completed_count: completed,
        total_count: total,
        percent: percent(completed, total),
        eta_secs,
    })
}

/// Status of the metadata fetch, derived from the partial-state file.
pub fn metadata_status(layout: &RunLayout) -> Result<RunStatus, PipelineError> {
    let state_path = layout.metadata_state_path();
    let (completed, total, eta_secs) = if state_path.as_std_path().exists() {
        let state = MetadataFetchState::load_or_create(&state_path)?;
        let completed = state.records.len();
        let settled = completed + state.deferred.len();
        let total = state.targets.len().max(settled);
        let timestamps: Vec<String> = state
            .records
            .values()
            .filter_map(|record| {
                record
                    .get("fetched_at")
                    .and_then(|value| value.as_str())
                    .map(str::to_string)
            })
            .collect();
        let refs: Vec<&str> = timestamps.iter().map(String::as_str).collect();
        (completed, total, rate_based_eta(&refs, total - settled))
    } else {
        (0, 0, None)
    };

    Ok(RunStatus {
        running: process_alive(layout),
        completed_count: completed,
        total_count: total,
        percent: percent(completed, total),
        eta_secs,
    })
}

fn percent(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    completed as f64 / total as f64 * 100.0
}

/// Average seconds per completed item from the observed timestamp span,
/// multiplied by the remaining count.
fn rate_based_eta(terminal_timestamps: &[&str], remaining: usize) -> Option<u64> {
    if remaining == 0 || terminal_timestamps.len() < 2 {
        return None;
    }
    let mut parsed: Vec<_> = terminal_timestamps
        .iter()
        .filter_map(|value| DateTime::parse_from_rfc3339(value).ok())
        .collect();
    if parsed.len() < 2 {
        return None;
    }
    parsed.sort();
    let span = (*parsed.last().unwrap() - *parsed.first().unwrap())
        .num_seconds()
        .max(0) as f64;
    let per_item = span / (parsed.len() - 1) as f64;
    Some((per_item * remaining as f64).round() as u64)
}

/// A stale marker left by a killed process must not read as running.
fn process_alive(layout: &RunLayout) -> bool {
    let pid_path = layout.pid_path();
    let Ok(content) = fs::read_to_string(pid_path.as_std_path()) else {
        return false;
    };
    let Ok(pid) = content.trim().parse::<u32>() else {
        return false;
    };
    if cfg!(target_os = "linux") {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::domain::{RunAccession, SampleStatus};

    #[test]
    fn empty_layout_reports_idle() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());

        let status = pipeline_status(&layout).unwrap();
        assert!(!status.running);
        assert_eq!(status.total_count, 0);
        assert_eq!(status.percent, 0.0);
        assert!(status.eta_secs.is_none());
    }

    #[test]
    fn pipeline_status_counts_terminal_records() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());

        let checkpoint = CheckpointStore::load_or_create(&layout.checkpoint_path()).unwrap();
        let cleaned: RunAccession = "SRR000001".parse().unwrap();
        let pending: RunAccession = "SRR000002".parse().unwrap();
        checkpoint.set(&cleaned, SampleStatus::Cleaned);
        checkpoint.set(&pending, SampleStatus::Pending);
        checkpoint.flush().unwrap();

        let status = pipeline_status(&layout).unwrap();
        assert_eq!(status.completed_count, 1);
        assert_eq!(status.total_count, 2);
        assert_eq!(status.percent, 50.0);
    }

    #[test]
    fn metadata_status_uses_persisted_target_set() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());

        let mut state = MetadataFetchState::default();
        for n in 1..=8 {
            state.targets.insert(format!("SRR{n:06}"));
        }
        state
            .records
            .insert("SRR000001".to_string(), serde_json::json!({"runs": 1}));
        state.deferred.insert("SRR000002".to_string());
        crate::store::write_json_atomic(&layout.metadata_state_path(), &state).unwrap();

        let status = metadata_status(&layout).unwrap();
        assert_eq!(status.completed_count, 1);
        assert_eq!(status.total_count, 8);
        assert_eq!(status.percent, 12.5);
    }

    #[test]
    fn eta_needs_at_least_two_observations() {
        assert_eq!(rate_based_eta(&["2026-08-05T10:00:00+00:00"], 5), None);
        let eta = rate_based_eta(
            &["2026-08-05T10:00:00+00:00", "2026-08-05T10:00:10+00:00"],
            6,
        );
        assert_eq!(eta, Some(60));
    }
}
