use std::collections::BTreeMap;
use std::fs;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::domain::SampleStatus;
use crate::error::PipelineError;
use crate::scheduler::BatchResultFile;
use crate::store::RunLayout;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSummary {
    pub disease: String,
    pub status: SampleStatus,
    pub timestamp: String,
    pub attempt_count: u32,
    pub fastq_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiseaseStats {
    pub samples: usize,
    pub cleaned: usize,
    pub failed: usize,
    pub fastq_bytes: u64,
}

/// Idempotent merge of all batch result files: same accumulated inputs, same
/// bytes out. Maps are ordered so serialization is stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub batches: Vec<u64>,
    pub total_samples: usize,
    pub cleaned: usize,
    pub failed: usize,
    pub by_disease: BTreeMap<String, DiseaseStats>,
    pub samples: BTreeMap<String, SampleSummary>,
}

/// Read every batch result file under the results directory (read-only) and
/// merge them, de-duplicating by sample id and keeping the most recent
/// terminal status by timestamp.
pub fn merge(layout: &RunLayout) -> Result<Summary, PipelineError> {
    let results_dir = layout.results_dir();
    let mut batch_files: Vec<(u64, BatchResultFile)> = Vec::new();

    if results_dir.as_std_path().exists() {
        let entries = fs::read_dir(results_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(index) = parse_batch_index(&name) else {
                continue;
            };
            let content = fs::read_to_string(entry.path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let file: BatchResultFile = serde_json::from_str(&content)
                .map_err(|err| PipelineError::Filesystem(format!("{name}: {err}")))?;
            batch_files.push((index, file));
        }
    }

    batch_files.sort_by_key(|(index, _)| *index);

    let mut samples: BTreeMap<String, SampleSummary> = BTreeMap::new();
    for (_, file) in &batch_files {
        for outcome in &file.outcomes {
            let candidate = SampleSummary {
                disease: outcome.disease.clone(),
                status: outcome.status.clone(),
                timestamp: outcome.timestamp.clone(),
                attempt_count: outcome.attempt_count,
                fastq_bytes: outcome.fastq_bytes,
            };
            match samples.get(outcome.id.as_str()) {
                Some(existing) if !is_newer(&candidate.timestamp, &existing.timestamp) => {}
                _ => {
                    samples.insert(outcome.id.as_str().to_string(), candidate);
                }
            }
        }
    }

    let mut by_disease: BTreeMap<String, DiseaseStats> = BTreeMap::new();
    let mut cleaned = 0;
    let mut failed = 0;
    for summary in samples.values() {
        let stats = by_disease.entry(summary.disease.clone()).or_default();
        stats.samples += 1;
        stats.fastq_bytes += summary.fastq_bytes;
        match summary.status {
            SampleStatus::Cleaned => {
                stats.cleaned += 1;
                cleaned += 1;
            }
            _ => {
                stats.failed += 1;
                failed += 1;
            }
        }
    }

    Ok(Summary {
        batches: batch_files.iter().map(|(index, _)| *index).collect(),
        total_samples: samples.len(),
        cleaned,
        failed,
        by_disease,
        samples,
    })
}

fn parse_batch_index(name: &str) -> Option<u64> {
    name.strip_prefix("batch_")?
        .strip_suffix("_results.json")?
        .parse()
        .ok()
}

fn is_newer(candidate: &str, existing: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(candidate),
        DateTime::parse_from_rfc3339(existing),
    ) {
        (Ok(candidate), Ok(existing)) => candidate > existing,
        _ => candidate > existing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_batch_file_names() {
        assert_eq!(parse_batch_index("batch_0_results.json"), Some(0));
        assert_eq!(parse_batch_index("batch_17_results.json"), Some(17));
        assert_eq!(parse_batch_index("processing_summary.json"), None);
        assert_eq!(parse_batch_index("batch_x_results.json"), None);
    }

    #[test]
    fn newer_timestamp_comparison() {
        assert!(is_newer(
            "2026-08-05T10:00:00+00:00",
            "2026-08-05T09:00:00+00:00"
        ));
        assert!(!is_newer(
            "2026-08-05T09:00:00+00:00",
            "2026-08-05T09:00:00+00:00"
        ));
    }
}
