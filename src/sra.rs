use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::domain::RunAccession;
use crate::error::PipelineError;

/// Quality metrics lifted from a FastQC report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QcMetrics {
    pub filename: String,
    pub total_sequences: u64,
    pub sequence_length: String,
    pub gc_content: f64,
}

/// External SRA toolchain seam. The three methods correspond to the
/// Downloading, Converting, and QcRunning steps of a sample's lifecycle.
pub trait SraToolchain: Send + Sync {
    /// Download the `.sra` archive for a run and return its path.
    fn prefetch(&self, id: &RunAccession, dest_dir: &Path) -> Result<PathBuf, PipelineError>;

    /// Convert a downloaded `.sra` archive into split FASTQ files.
    fn fasterq_dump(
        &self,
        id: &RunAccession,
        sra_path: &Path,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError>;

    /// Run FastQC over the FASTQ files and return per-file metrics.
    fn fastqc(
        &self,
        fastq_files: &[PathBuf],
        out_dir: &Path,
    ) -> Result<Vec<QcMetrics>, PipelineError>;
}

pub struct SystemSraToolchain {
    prefetch: Option<PathBuf>,
    fasterq_dump: Option<PathBuf>,
    fastqc: Option<PathBuf>,
    step_timeout: Duration,
}

impl SystemSraToolchain {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            prefetch: find_in_path("prefetch"),
            fasterq_dump: find_in_path("fasterq-dump"),
            fastqc: find_in_path("fastqc"),
            step_timeout,
        }
    }

    /// Fail fast before a run rather than on the first sample.
    pub fn verify_tools(&self) -> Result<(), PipelineError> {
        for (name, path) in [
            ("prefetch", &self.prefetch),
            ("fasterq-dump", &self.fasterq_dump),
            ("fastqc", &self.fastqc),
        ] {
            if path.is_none() {
                return Err(PipelineError::MissingTool(name.to_string()));
            }
        }
        Ok(())
    }

    fn require(&self, name: &str, path: &Option<PathBuf>) -> Result<PathBuf, PipelineError> {
        path.clone()
            .ok_or_else(|| PipelineError::MissingTool(name.to_string()))
    }

    fn run_tool(&self, name: &str, program: &Path, args: &[String]) -> Result<(), PipelineError> {
        let mut stderr_file = tempfile::tempfile()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let stderr_handle = stderr_file
            .try_clone()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|err| PipelineError::ToolExit {
                tool: format!("{name}: {err}"),
                code: -1,
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() >= self.step_timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(PipelineError::ToolTimeout {
                            tool: name.to_string(),
                            secs: self.step_timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    return Err(PipelineError::Filesystem(err.to_string()));
                }
            }
        };

        if status.success() {
            return Ok(());
        }

        let mut stderr = String::new();
        let _ = stderr_file.seek(SeekFrom::Start(0));
        let _ = stderr_file.read_to_string(&mut stderr);
        let code = status.code().unwrap_or(-1);
        if is_network_failure(&stderr) {
            return Err(PipelineError::TransientNetwork(format!(
                "{name}: {}",
                stderr.trim()
            )));
        }
        Err(PipelineError::ToolExit {
            tool: name.to_string(),
            code,
        })
    }
}

impl SraToolchain for SystemSraToolchain {
    fn prefetch(&self, id: &RunAccession, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
        let prefetch = self.require("prefetch", &self.prefetch)?;
        fs::create_dir_all(dest_dir).map_err(|err| PipelineError::Filesystem(err.to_string()))?;

        let args = vec![
            id.as_str().to_string(),
            "--output-directory".to_string(),
            dest_dir.to_string_lossy().to_string(),
            "--max-size".to_string(),
            "100G".to_string(),
        ];
        self.run_tool("prefetch", &prefetch, &args)?;

        find_first_ext(dest_dir, "sra").ok_or_else(|| {
            PipelineError::Filesystem(format!(
                "prefetch did not produce an .sra file for {}",
                id.as_str()
            ))
        })
    }

    fn fasterq_dump(
        &self,
        id: &RunAccession,
        sra_path: &Path,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let fasterq = self.require("fasterq-dump", &self.fasterq_dump)?;
        fs::create_dir_all(out_dir).map_err(|err| PipelineError::Filesystem(err.to_string()))?;

        let args = vec![
            sra_path.to_string_lossy().to_string(),
            "--split-files".to_string(),
            "--outdir".to_string(),
            out_dir.to_string_lossy().to_string(),
        ];
        self.run_tool("fasterq-dump", &fasterq, &args)?;

        let fastq_files = find_exts(out_dir, "fastq");
        if fastq_files.is_empty() {
            return Err(PipelineError::Filesystem(format!(
                "fasterq-dump produced no FASTQ files for {}",
                id.as_str()
            )));
        }
        Ok(fastq_files)
    }

    fn fastqc(
        &self,
        fastq_files: &[PathBuf],
        out_dir: &Path,
    ) -> Result<Vec<QcMetrics>, PipelineError> {
        let fastqc = self.require("fastqc", &self.fastqc)?;
        fs::create_dir_all(out_dir).map_err(|err| PipelineError::Filesystem(err.to_string()))?;

        let mut args = vec![
            "--outdir".to_string(),
            out_dir.to_string_lossy().to_string(),
            "--extract".to_string(),
            "--quiet".to_string(),
        ];
        args.extend(
            fastq_files
                .iter()
                .map(|path| path.to_string_lossy().to_string()),
        );
        self.run_tool("fastqc", &fastqc, &args)?;

        Ok(fastq_files
            .iter()
            .map(|path| extract_fastqc_metrics(path, out_dir))
            .collect())
    }
}

/// Pull the headline numbers out of `fastqc_data.txt`. Missing reports yield
/// zeroed metrics rather than failing the sample after QC already ran.
pub fn extract_fastqc_metrics(fastq_file: &Path, qc_dir: &Path) -> QcMetrics {
    let filename = fastq_file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = fastq_file
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut metrics = QcMetrics {
        filename,
        ..QcMetrics::default()
    };

    let data_path = qc_dir.join(format!("{stem}_fastqc")).join("fastqc_data.txt");
    let Ok(content) = fs::read_to_string(&data_path) else {
        return metrics;
    };

    for line in content.lines() {
        if let Some(value) = line.strip_prefix("Total Sequences\t") {
            metrics.total_sequences = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("Sequence length\t") {
            metrics.sequence_length = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("%GC\t") {
            metrics.gc_content = value.trim().parse().unwrap_or(0.0);
        }
    }
    metrics
}

fn is_network_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "timeout",
        "timed out",
        "connection",
        "network",
        "temporarily unavailable",
        "reset by peer",
        "could not resolve",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let candidate = path.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn find_first_ext(root: &Path, ext: &str) -> Option<PathBuf> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if has_ext(&path, ext) {
                return Some(path);
            }
        }
    }
    None
}

fn find_exts(root: &Path, ext: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        if let Ok(entries) = fs::read_dir(&path) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if has_ext(&path, ext) {
                    out.push(path);
                }
            }
        }
    }
    out.sort();
    out
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_stderr() {
        assert!(is_network_failure("err: connection reset by peer"));
        assert!(is_network_failure("transfer Timed Out"));
        assert!(!is_network_failure("invalid argument --split-filez"));
    }

    #[test]
    fn extracts_metrics_from_fastqc_data() {
        let dir = tempfile::tempdir().unwrap();
        let fastq = dir.path().join("SRR000001_1.fastq");
        let report_dir = dir.path().join("SRR000001_1_fastqc");
        fs::create_dir_all(&report_dir).unwrap();
        fs::write(
            report_dir.join("fastqc_data.txt"),
            "##FastQC\t0.12.1\nTotal Sequences\t123456\nSequence length\t35-151\n%GC\t41\n",
        )
        .unwrap();

        let metrics = extract_fastqc_metrics(&fastq, dir.path());
        assert_eq!(metrics.total_sequences, 123_456);
        assert_eq!(metrics.sequence_length, "35-151");
        assert_eq!(metrics.gc_content, 41.0);
        assert_eq!(metrics.filename, "SRR000001_1.fastq");
    }

    #[test]
    fn missing_report_yields_default_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let fastq = dir.path().join("SRR000002_1.fastq");
        let metrics = extract_fastqc_metrics(&fastq, dir.path());
        assert_eq!(metrics.total_sequences, 0);
    }
}
