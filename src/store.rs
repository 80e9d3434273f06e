use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::RunAccession;
use crate::error::PipelineError;

/// Directory layout of one pipeline data root.
///
/// Everything the pipeline persists lives under this root: per-sample scratch
/// trees, permanent QC reports, batch result files, the checkpoint, the
/// metadata partial-state file, and the liveness marker.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: Utf8PathBuf,
}

impl RunLayout {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn sra_dir(&self, id: &RunAccession) -> Utf8PathBuf {
        self.root.join("sra").join(id.as_str())
    }

    pub fn fastq_dir(&self, id: &RunAccession) -> Utf8PathBuf {
        self.root.join("fastq").join(id.as_str())
    }

    pub fn qc_scratch_dir(&self, id: &RunAccession) -> Utf8PathBuf {
        self.root.join("qc_scratch").join(id.as_str())
    }

    pub fn qc_report_dir(&self, disease: &str, id: &RunAccession) -> Utf8PathBuf {
        self.root.join("qc").join(disease).join(id.as_str())
    }

    pub fn results_dir(&self) -> Utf8PathBuf {
        self.root.join("results")
    }

    pub fn batch_results_path(&self, batch_index: u64) -> Utf8PathBuf {
        self.results_dir()
            .join(format!("batch_{batch_index}_results.json"))
    }

    pub fn summary_path(&self) -> Utf8PathBuf {
        self.results_dir().join("processing_summary.json")
    }

    pub fn checkpoint_path(&self) -> Utf8PathBuf {
        self.root.join("checkpoint.json")
    }

    pub fn metadata_state_path(&self) -> Utf8PathBuf {
        self.root.join("metadata").join("metadata_partial.json")
    }

    pub fn pid_path(&self) -> Utf8PathBuf {
        self.root.join("cardioseq.pid")
    }

    pub fn ensure_root(&self) -> Result<(), PipelineError> {
        for dir in [
            self.root.clone(),
            self.root.join("sra"),
            self.root.join("fastq"),
            self.root.join("qc_scratch"),
            self.root.join("qc"),
            self.results_dir(),
            self.root.join("metadata"),
        ] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Remove the scratch trees of one sample. Partial downloads left by an
    /// interrupted run are swept here before the sample is re-admitted.
    pub fn remove_sample_scratch(&self, id: &RunAccession) -> Result<(), PipelineError> {
        for dir in [
            self.sra_dir(id),
            self.fastq_dir(id),
            self.qc_scratch_dir(id),
        ] {
            remove_dir_all_if_exists(dir.as_std_path())?;
        }
        Ok(())
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content).map_err(|err| map_write_error(err))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), PipelineError> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(dest).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    for entry in walk_dir(source)? {
        let relative = entry
            .strip_prefix(source)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            }
            fs::copy(&entry, &target).map_err(|err| map_write_error(err))?;
        }
    }
    Ok(())
}

pub fn remove_dir_all_if_exists(path: &Path) -> Result<(), PipelineError> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

pub fn dir_size_bytes(path: &Path) -> Result<u64, PipelineError> {
    if !path.exists() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in walk_dir(path)? {
        if entry.is_file() {
            let meta =
                fs::metadata(&entry).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            total += meta.len();
        }
    }
    Ok(total)
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

// ENOSPC is fatal to the whole run, unlike other filesystem errors.
fn map_write_error(err: std::io::Error) -> PipelineError {
    if err.raw_os_error() == Some(28) {
        PipelineError::DiskFull(err.to_string())
    } else {
        PipelineError::Filesystem(err.to_string())
    }
}
