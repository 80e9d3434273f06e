use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::checkpoint::CheckpointStore;
use crate::domain::{RunAccession, Sample, SampleStatus};
use crate::error::PipelineError;
use crate::quota::DiskQuotaGuard;
use crate::sra::{QcMetrics, SraToolchain};
use crate::store::{self, RunLayout};

/// Terminal outcome of one sample, as recorded in the batch result file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleOutcome {
    pub id: RunAccession,
    pub disease: String,
    pub status: SampleStatus,
    pub timestamp: String,
    pub attempt_count: u32,
    #[serde(default)]
    pub fastq_bytes: u64,
    #[serde(default)]
    pub metrics: Vec<QcMetrics>,
}

pub enum WorkerExit {
    Terminal(SampleOutcome),
    Interrupted,
}

/// Drives one sample through
/// `Pending → Downloading → Converting → QcRunning → Cleaning → Cleaned`.
///
/// The caller reserves the sample's footprint before `process` is entered;
/// the worker owns the paired release, performed exactly once at the terminal
/// transition. Every transition is flushed to the checkpoint before the next
/// step begins.
pub struct SampleWorker<'a> {
    toolchain: &'a dyn SraToolchain,
    layout: &'a RunLayout,
    checkpoint: &'a CheckpointStore,
    quota: &'a DiskQuotaGuard,
    max_retries: u32,
    retry_backoff: Backoff,
    cancel: &'a AtomicBool,
}

impl<'a> SampleWorker<'a> {
    pub fn new(
        toolchain: &'a dyn SraToolchain,
        layout: &'a RunLayout,
        checkpoint: &'a CheckpointStore,
        quota: &'a DiskQuotaGuard,
        max_retries: u32,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            toolchain,
            layout,
            checkpoint,
            quota,
            max_retries,
            retry_backoff: Backoff::transient(),
            cancel,
        }
    }

    /// Record a terminal failure for a sample whose footprint exceeds the
    /// whole ceiling; it could never be admitted, so nothing was reserved.
    pub fn fail_oversize(&self, sample: &Sample) -> SampleOutcome {
        warn!(
            id = %sample.id,
            footprint = sample.estimated_footprint_bytes,
            ceiling = self.quota.ceiling_bytes(),
            "sample footprint exceeds disk ceiling"
        );
        let status = SampleStatus::Failed("quota:footprint_exceeds_ceiling".to_string());
        self.record(&sample.id, status.clone());
        self.outcome(sample, status)
    }

    /// Process a sample whose footprint is already reserved against the quota.
    pub fn process(&self, sample: &Sample) -> WorkerExit {
        let id = &sample.id;

        // Partial downloads from a previous interrupted run are swept before
        // the sample re-enters Downloading.
        if let Err(err) = self.layout.remove_sample_scratch(id) {
            return self.fail(sample, &err);
        }

        if self.cancelled() {
            return self.interrupt(sample);
        }

        // Downloading, with bounded in-place retries on network errors.
        let sra_path = match self.with_transient_retries(sample, SampleStatus::Downloading, || {
            self.toolchain
                .prefetch(id, self.layout.sra_dir(id).as_std_path())
        }) {
            Ok(Some(path)) => path,
            Ok(None) => return self.interrupt(sample),
            Err(err) => return self.fail(sample, &err),
        };

        if self.cancelled() {
            return self.interrupt(sample);
        }

        // Converting.
        let fastq_files = match self.with_transient_retries(sample, SampleStatus::Converting, || {
            self.toolchain
                .fasterq_dump(id, &sra_path, self.layout.fastq_dir(id).as_std_path())
        }) {
            Ok(Some(files)) => files,
            Ok(None) => return self.interrupt(sample),
            Err(err) => return self.fail(sample, &err),
        };

        if self.cancelled() {
            return self.interrupt(sample);
        }

        // QC. Tool failures here are terminal; only download/convert retry.
        self.record(id, SampleStatus::QcRunning);
        let fastq_bytes = store::dir_size_bytes(self.layout.fastq_dir(id).as_std_path())
            .unwrap_or(0);
        let metrics = match self
            .toolchain
            .fastqc(&fastq_files, self.layout.qc_scratch_dir(id).as_std_path())
        {
            Ok(metrics) => metrics,
            Err(err) => return self.fail(sample, &err),
        };

        if self.cancelled() {
            return self.interrupt(sample);
        }

        // Cleaning: keep the QC reports, drop the raw data.
        self.record(id, SampleStatus::Cleaning);
        if let Err(err) = self.clean(sample) {
            return self.fail(sample, &err);
        }

        self.record(id, SampleStatus::Cleaned);
        self.quota.release(sample.estimated_footprint_bytes);
        info!(id = %id, "sample cleaned");

        let mut outcome = self.outcome(sample, SampleStatus::Cleaned);
        outcome.fastq_bytes = fastq_bytes;
        outcome.metrics = metrics;
        WorkerExit::Terminal(outcome)
    }

    fn with_transient_retries<T>(
        &self,
        sample: &Sample,
        status: SampleStatus,
        mut step: impl FnMut() -> Result<T, PipelineError>,
    ) -> Result<Option<T>, PipelineError> {
        let mut retries = 0u32;
        loop {
            self.record(&sample.id, status.clone());
            match step() {
                Ok(value) => return Ok(Some(value)),
                Err(err) if err.is_transient() && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        id = %sample.id,
                        retry = retries,
                        max = self.max_retries,
                        "transient failure, backing off: {err}"
                    );
                    std::thread::sleep(self.retry_backoff.delay(retries));
                    if self.cancelled() {
                        return Ok(None);
                    }
                }
                Err(err) if err.is_transient() => {
                    return Err(PipelineError::TransientNetwork(format!(
                        "retries exhausted: {err}"
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn clean(&self, sample: &Sample) -> Result<(), PipelineError> {
        let scratch_qc = self.layout.qc_scratch_dir(&sample.id);
        if scratch_qc.as_std_path().exists() {
            let report_dir = self.layout.qc_report_dir(&sample.disease, &sample.id);
            store::copy_dir_recursive(scratch_qc.as_std_path(), report_dir.as_std_path())?;
        }
        self.layout.remove_sample_scratch(&sample.id)
    }

    fn fail(&self, sample: &Sample, err: &PipelineError) -> WorkerExit {
        warn!(id = %sample.id, "sample failed: {err}");
        let status = SampleStatus::Failed(err.failure_reason());
        self.record(&sample.id, status.clone());
        let _ = self.layout.remove_sample_scratch(&sample.id);
        self.quota.release(sample.estimated_footprint_bytes);
        WorkerExit::Terminal(self.outcome(sample, status))
    }

    /// Cancellation leaves the sample Pending so a resume retries it from
    /// scratch rather than treating it as permanently failed.
    fn interrupt(&self, sample: &Sample) -> WorkerExit {
        info!(id = %sample.id, "interrupted, requeueing as pending");
        self.record(&sample.id, SampleStatus::Pending);
        let _ = self.layout.remove_sample_scratch(&sample.id);
        self.quota.release(sample.estimated_footprint_bytes);
        WorkerExit::Interrupted
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn record(&self, id: &RunAccession, status: SampleStatus) {
        self.checkpoint.set(id, status);
        if let Err(err) = self.checkpoint.flush() {
            warn!("checkpoint flush failed: {err}");
        }
    }

    fn outcome(&self, sample: &Sample, status: SampleStatus) -> SampleOutcome {
        let record = self.checkpoint.get(&sample.id);
        SampleOutcome {
            id: sample.id.clone(),
            disease: sample.disease.clone(),
            status,
            timestamp: record
                .as_ref()
                .map(|record| record.timestamp.clone())
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
            attempt_count: record.map(|record| record.attempt_count).unwrap_or(0),
            fastq_bytes: 0,
            metrics: Vec::new(),
        }
    }
}
