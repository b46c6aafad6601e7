//! Dummy batched backend for unit testing.
//!
//! Everything happens on the calling thread. A test decides when the pending
//! calls become a finished batch, either directly with
//! [`DummyBatchedBackend::complete_pending`] or by setting a batch threshold
//! before handing the backend to the facade. Failures are injected with
//! [`DummyBatchedBackend::fail_next_batch`] or per batch id. Signal and
//! ordering behaviour is fully deterministic.
//!
//! ```rust,ignore
//! let mut backend = DummyBatchedBackend::new(["gemm"]);
//! backend.enqueue(BatchedCall::new("gemm", || Ok(())))?;
//! backend.complete_pending();
//! assert!(backend.signal_source().is_ready());
//! ```

use std::collections::HashSet;

use super::completion::{run_batch, CompletedBatch, CompletedQueue};
use super::{work_channel, BatchedBackend, BatchedCall, FlushReport, WorkNotifier, WorkSignal};
use crate::error::{ArbiterError, ArbiterResult};

/// Call counters for assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DummyBatchedStats {
    pub enqueue_count: usize,
    pub batches_completed: usize,
    pub signals_raised: usize,
    pub flush_count: usize,
    pub discard_count: usize,
    pub cleanup_count: usize,
}

#[derive(Debug)]
pub struct DummyBatchedBackend {
    declared: HashSet<String>,
    pending: Vec<BatchedCall>,
    next_batch: u64,
    completed: CompletedQueue,
    notifier: WorkNotifier,
    signal: WorkSignal,
    fail_next: Option<String>,
    failing_batches: HashSet<u64>,
    batch_threshold: Option<usize>,
    shut_down: bool,
    stats: DummyBatchedStats,
}

impl DummyBatchedBackend {
    pub fn new<I, S>(funcs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (notifier, signal) = work_channel();
        Self {
            declared: funcs.into_iter().map(Into::into).collect(),
            pending: Vec::new(),
            next_batch: 0,
            completed: CompletedQueue::default(),
            notifier,
            signal,
            fail_next: None,
            failing_batches: HashSet::new(),
            batch_threshold: None,
            shut_down: false,
            stats: DummyBatchedStats::default(),
        }
    }

    /// Complete a batch synchronously whenever `calls` are pending.
    pub fn with_batch_threshold(mut self, calls: usize) -> Self {
        self.batch_threshold = Some(calls.max(1));
        self
    }

    /// Make the batch with this id fail when it completes.
    pub fn with_failing_batch(mut self, batch: u64) -> Self {
        self.failing_batches.insert(batch);
        self
    }

    pub fn stats(&self) -> &DummyBatchedStats {
        &self.stats
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_batches(&self) -> usize {
        self.completed.len()
    }

    /// Make the next completed batch fail with `reason`.
    pub fn fail_next_batch(&mut self, reason: impl Into<String>) {
        self.fail_next = Some(reason.into());
    }

    /// Run all pending calls as one batch and raise the signal.
    ///
    /// Returns the batch id, or `None` when nothing was pending.
    pub fn complete_pending(&mut self) -> Option<u64> {
        if self.pending.is_empty() {
            return None;
        }
        let calls = std::mem::take(&mut self.pending);
        let id = self.next_batch;
        self.next_batch += 1;

        let reason = self.fail_next.take().or_else(|| {
            self.failing_batches
                .remove(&id)
                .then(|| format!("injected failure in batch {}", id))
        });
        let batch = match reason {
            Some(reason) => CompletedBatch::failed(id, calls.len(), reason),
            None => run_batch(id, calls),
        };

        if self.completed.push(batch, self.completed.generation()) {
            self.stats.batches_completed += 1;
            if self.notifier.notify() {
                self.stats.signals_raised += 1;
            }
        }
        Some(id)
    }
}

impl BatchedBackend for DummyBatchedBackend {
    fn backend_id(&self) -> &str {
        "dummy"
    }

    fn declares_func(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    fn signal_source(&self) -> WorkSignal {
        self.signal.clone()
    }

    fn enqueue(&mut self, call: BatchedCall) -> ArbiterResult<()> {
        if self.shut_down {
            return Err(ArbiterError::BackendShutdown);
        }
        self.stats.enqueue_count += 1;
        self.pending.push(call);
        if self
            .batch_threshold
            .is_some_and(|threshold| self.pending.len() >= threshold)
        {
            self.complete_pending();
        }
        Ok(())
    }

    /// Applies completed batches only; pending calls stay pending until
    /// the test completes them.
    fn flush(&mut self) -> ArbiterResult<FlushReport> {
        self.stats.flush_count += 1;
        self.completed
            .apply_ready("dummy", &self.signal, &self.notifier)
    }

    fn discard_in_flight(&mut self) {
        self.stats.discard_count += 1;
        self.pending.clear();
        self.completed.discard();
        self.signal.clear();
    }

    fn cleanup(&mut self) {
        if self.shut_down {
            return;
        }
        self.stats.cleanup_count += 1;
        self.shut_down = true;
        self.pending.clear();
        self.completed.discard();
        self.signal.clear();
    }
}
