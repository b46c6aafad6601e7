//! Worker-thread batch backend.
//!
//! Calls accumulate on the scheduling thread. A batch is handed to a
//! dedicated worker once `max_batch_calls` calls are pending or the facade
//! flushes. The worker runs the batch, queues the result and raises the work
//! signal; the scheduling thread applies it on its next `do_work`.
//!
//! Each submitted batch leaves a [`BatchDescriptor`] behind. Descriptors are
//! the host-side staging records of the cross-boundary call and are only
//! released by [`cleanup`](BatchedBackend::cleanup), never while the run is
//! live. A descriptor is two words, so a run holds one per submitted batch
//! and nothing per call.
//!
//! Batches submitted before a [`discard_in_flight`](BatchedBackend::discard_in_flight)
//! are skipped by the worker if it has not started them yet.

use std::collections::HashSet;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};

use super::completion::{run_batch, CompletedQueue};
use super::{work_channel, BatchedBackend, BatchedCall, FlushReport, WorkNotifier, WorkSignal};
use crate::backend_failure;
use crate::error::{ArbiterError, ArbiterResult};
use crate::extern_meta::config::BatchConfig;

const BACKEND_ID: &str = "threaded";

/// Staging record kept for every submitted batch until cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub batch: u64,
    pub calls: usize,
}

struct BatchJob {
    id: u64,
    generation: u64,
    calls: Vec<BatchedCall>,
}

/// Batched-call backend running batches on its own thread.
pub struct ThreadedBatchBackend {
    config: BatchConfig,
    declared: HashSet<String>,
    pending: Vec<BatchedCall>,
    next_batch: u64,
    submit_tx: Option<Sender<BatchJob>>,
    worker: Option<JoinHandle<()>>,
    completed: CompletedQueue,
    notifier: WorkNotifier,
    signal: WorkSignal,
    descriptors: Vec<BatchDescriptor>,
}

impl ThreadedBatchBackend {
    pub fn new(config: BatchConfig) -> ArbiterResult<Self> {
        let (notifier, signal) = work_channel();
        let completed = CompletedQueue::default();
        let (submit_tx, submit_rx) = channel::unbounded::<BatchJob>();

        let worker = {
            let completed = completed.clone();
            let notifier = notifier.clone();
            std::thread::Builder::new()
                .name(config.worker_name.clone())
                .spawn(move || worker_loop(submit_rx, completed, notifier))
                .map_err(ArbiterError::WorkerSpawn)?
        };

        tracing::info!(
            worker = %config.worker_name,
            max_batch_calls = config.max_batch_calls,
            funcs = config.declared_funcs.len(),
            "threaded batch backend started"
        );

        Ok(Self {
            declared: config.declared_funcs.iter().cloned().collect(),
            config,
            pending: Vec::new(),
            next_batch: 0,
            submit_tx: Some(submit_tx),
            worker: Some(worker),
            completed,
            notifier,
            signal,
            descriptors: Vec::new(),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Calls queued but not yet handed to the worker
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Batches finished by the worker and not yet applied
    pub fn completed_batches(&self) -> usize {
        self.completed.len()
    }

    /// Batches handed to the worker so far
    pub fn submitted_batches(&self) -> u64 {
        self.next_batch
    }

    /// Staging records still held
    pub fn descriptors(&self) -> &[BatchDescriptor] {
        &self.descriptors
    }

    pub fn is_shut_down(&self) -> bool {
        self.submit_tx.is_none()
    }

    fn submit_pending(&mut self) -> ArbiterResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self.submit_tx.as_ref().ok_or(ArbiterError::BackendShutdown)?;

        let calls = std::mem::take(&mut self.pending);
        let id = self.next_batch;
        self.next_batch += 1;

        self.descriptors.push(BatchDescriptor {
            batch: id,
            calls: calls.len(),
        });

        let job = BatchJob {
            id,
            generation: self.completed.generation(),
            calls,
        };
        tracing::debug!(batch = id, calls = job.calls.len(), "submitting batch");

        tx.send(job)
            .map_err(|_| backend_failure!(BACKEND_ID, id, "worker thread is gone"))
    }
}

fn worker_loop(jobs: Receiver<BatchJob>, completed: CompletedQueue, notifier: WorkNotifier) {
    for job in jobs.iter() {
        if job.generation != completed.generation() {
            tracing::debug!(batch = job.id, "skipping discarded batch");
            continue;
        }
        let batch = run_batch(job.id, job.calls);
        let id = batch.id;
        if completed.push(batch, job.generation) {
            notifier.notify();
            tracing::trace!(batch = id, "batch completed");
        }
    }
    tracing::debug!("batch worker exiting");
}

impl BatchedBackend for ThreadedBatchBackend {
    fn backend_id(&self) -> &str {
        BACKEND_ID
    }

    fn declares_func(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    fn signal_source(&self) -> WorkSignal {
        self.signal.clone()
    }

    fn enqueue(&mut self, call: BatchedCall) -> ArbiterResult<()> {
        if self.is_shut_down() {
            return Err(ArbiterError::BackendShutdown);
        }
        self.pending.push(call);
        if self.pending.len() >= self.config.max_batch_calls {
            self.submit_pending()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> ArbiterResult<FlushReport> {
        if !self.is_shut_down() {
            self.submit_pending()?;
        }
        self.completed
            .apply_ready(BACKEND_ID, &self.signal, &self.notifier)
    }

    fn discard_in_flight(&mut self) {
        let pending = self.pending.len();
        self.pending.clear();
        let completed = self.completed.discard();
        self.signal.clear();
        tracing::info!(pending, completed, "discarded in-flight batches");
    }

    fn cleanup(&mut self) {
        // Closing the channel lets the worker finish its queue and exit.
        self.submit_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("batch worker panicked before cleanup");
            }
        }

        let undrained = self.completed.discard();
        self.pending.clear();
        self.signal.clear();

        if !self.descriptors.is_empty() || undrained > 0 {
            tracing::info!(
                descriptors = self.descriptors.len(),
                undrained,
                "released batch staging records"
            );
        }
        self.descriptors.clear();
    }
}

impl Drop for ThreadedBatchBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}
