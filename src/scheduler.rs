use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::domain::{Batch, BatchState, Sample, SampleStatus};
use crate::error::PipelineError;
use crate::quota::DiskQuotaGuard;
use crate::sra::SraToolchain;
use crate::store::{self, RunLayout};
use crate::worker::{SampleOutcome, SampleWorker, WorkerExit};

/// One batch's persisted result document, consumed by the aggregator and
/// monitoring tooling only.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResultFile {
    pub batch_index: u64,
    pub settled_at: String,
    pub outcomes: Vec<SampleOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub index: u64,
    pub cleaned: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub batches: Vec<BatchReport>,
    pub total_cleaned: usize,
    pub total_failed: usize,
    pub interrupted: bool,
}

/// Drives batches strictly in index order, admitting samples first-come-
/// first-served under both the worker-slot bound and the disk quota.
pub struct BatchScheduler<'a> {
    toolchain: &'a dyn SraToolchain,
    layout: &'a RunLayout,
    checkpoint: &'a CheckpointStore,
    quota: &'a DiskQuotaGuard,
    max_parallel: usize,
    max_retries: u32,
    cancel: &'a AtomicBool,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(
        toolchain: &'a dyn SraToolchain,
        layout: &'a RunLayout,
        checkpoint: &'a CheckpointStore,
        quota: &'a DiskQuotaGuard,
        max_parallel: usize,
        max_retries: u32,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            toolchain,
            layout,
            checkpoint,
            quota,
            max_parallel: max_parallel.max(1),
            max_retries,
            cancel,
        }
    }

    /// Split the backlog into fixed-size batches preserving input order; the
    /// last batch may be smaller.
    pub fn plan(backlog: &[Sample], batch_size: usize) -> Vec<Batch> {
        Self::plan_from(backlog, batch_size, 0)
    }

    pub fn plan_from(backlog: &[Sample], batch_size: usize, start_index: u64) -> Vec<Batch> {
        let batch_size = batch_size.max(1);
        backlog
            .chunks(batch_size)
            .enumerate()
            .map(|(offset, chunk)| Batch::new(start_index + offset as u64, chunk.to_vec()))
            .collect()
    }

    /// Re-plan after an interruption: Cleaned samples are dropped, samples
    /// left in a non-terminal status are requeued as Pending, Failed samples
    /// stay in the plan, and batch numbering continues after the last
    /// settled batch.
    pub fn resume(
        &self,
        backlog: &[Sample],
        batch_size: usize,
    ) -> Result<Vec<Batch>, PipelineError> {
        let requeued = self.checkpoint.requeue_in_flight();
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued interrupted samples");
        }
        self.checkpoint.flush()?;

        let remainder: Vec<Sample> = backlog
            .iter()
            .filter(|sample| {
                !matches!(
                    self.checkpoint.get(&sample.id).map(|record| record.status),
                    Some(SampleStatus::Cleaned)
                )
            })
            .cloned()
            .collect();

        let start_index = self
            .checkpoint
            .last_settled_batch_index()
            .map(|index| index + 1)
            .unwrap_or(0);
        Ok(Self::plan_from(&remainder, batch_size, start_index))
    }

    /// Run the plan to completion or interruption. Batch N+1 never starts
    /// before batch N settles; a settled batch's index is flushed to the
    /// checkpoint before the next batch begins.
    pub fn run(&self, plan: Vec<Batch>) -> Result<RunReport, PipelineError> {
        let mut report = RunReport {
            batches: Vec::new(),
            total_cleaned: 0,
            total_failed: 0,
            interrupted: false,
        };

        for mut batch in plan {
            if self.cancel.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }

            batch.state = BatchState::Running;
            info!(
                batch = batch.index,
                size = batch.members.len(),
                "batch started"
            );

            let (outcomes, interrupted) = self.run_batch(&batch);
            if interrupted {
                report.interrupted = true;
                self.checkpoint.flush()?;
                break;
            }

            batch.state = BatchState::Settled;
            let cleaned = outcomes
                .iter()
                .filter(|outcome| outcome.status == SampleStatus::Cleaned)
                .count();
            let failed = outcomes.len() - cleaned;

            let result_file = BatchResultFile {
                batch_index: batch.index,
                settled_at: chrono::Utc::now().to_rfc3339(),
                outcomes,
            };
            store::write_json_atomic(&self.layout.batch_results_path(batch.index), &result_file)?;

            self.checkpoint.set_last_settled_batch_index(batch.index);
            self.checkpoint.flush()?;

            info!(batch = batch.index, cleaned, failed, "batch settled");
            report.total_cleaned += cleaned;
            report.total_failed += failed;
            report.batches.push(BatchReport {
                index: batch.index,
                cleaned,
                failed,
            });
        }

        Ok(report)
    }

    /// Drive one batch with bounded parallelism. Returns the terminal
    /// outcomes and whether the batch was interrupted before settling.
    fn run_batch(&self, batch: &Batch) -> (Vec<SampleOutcome>, bool) {
        let worker = SampleWorker::new(
            self.toolchain,
            self.layout,
            self.checkpoint,
            self.quota,
            self.max_retries,
            self.cancel,
        );

        let outcomes: Mutex<Vec<SampleOutcome>> = Mutex::new(Vec::new());
        let interrupted = AtomicBool::new(false);
        let active = Mutex::new(0usize);
        let slot_freed = Condvar::new();

        std::thread::scope(|scope| {
            for sample in &batch.members {
                if self.cancel.load(Ordering::SeqCst) {
                    interrupted.store(true, Ordering::SeqCst);
                    break;
                }

                if !self.quota.can_ever_fit(sample.estimated_footprint_bytes) {
                    let outcome = worker.fail_oversize(sample);
                    outcomes.lock().expect("outcome lock poisoned").push(outcome);
                    continue;
                }

                // Admission: a free worker slot first, then the quota
                // reservation, both in backlog order.
                {
                    let mut count = active.lock().expect("slot lock poisoned");
                    while *count >= self.max_parallel {
                        count = slot_freed
                            .wait(count)
                            .expect("slot lock poisoned");
                    }
                    *count += 1;
                }

                if !self
                    .quota
                    .reserve_blocking(sample.estimated_footprint_bytes, self.cancel)
                {
                    // Cancelled while waiting for headroom.
                    let mut count = active.lock().expect("slot lock poisoned");
                    *count -= 1;
                    interrupted.store(true, Ordering::SeqCst);
                    break;
                }

                let worker = &worker;
                let outcomes = &outcomes;
                let interrupted = &interrupted;
                let active = &active;
                let slot_freed = &slot_freed;
                scope.spawn(move || {
                    match worker.process(sample) {
                        WorkerExit::Terminal(outcome) => {
                            outcomes.lock().expect("outcome lock poisoned").push(outcome);
                        }
                        WorkerExit::Interrupted => {
                            interrupted.store(true, Ordering::SeqCst);
                        }
                    }
                    let mut count = active.lock().expect("slot lock poisoned");
                    *count -= 1;
                    drop(count);
                    slot_freed.notify_all();
                });
            }
        });

        let outcomes = outcomes.into_inner().expect("outcome lock poisoned");
        (outcomes, interrupted.load(Ordering::SeqCst))
    }
}
