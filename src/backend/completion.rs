//! Batch execution and the completed-batch queue shared by the backends.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{BatchedCall, CallCompletion, FlushReport, WorkNotifier, WorkSignal};
use crate::backend_failure;
use crate::error::ArbiterResult;

/// A batch whose device work has finished.
pub(crate) struct CompletedBatch {
    pub id: u64,
    pub calls: usize,
    /// Completions in enqueue order, or the reason the batch failed
    pub outcome: Result<Vec<CallCompletion>, String>,
}

impl CompletedBatch {
    pub fn failed(id: u64, calls: usize, reason: impl Into<String>) -> Self {
        Self {
            id,
            calls,
            outcome: Err(reason.into()),
        }
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("call panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("call panicked: {}", msg)
    } else {
        "call panicked".to_string()
    }
}

/// Run every call of a batch in order. The first failure stops the batch.
///
/// A panicking call fails its batch like an error return does, so the
/// running thread survives and the result still reaches the queue.
pub(crate) fn run_batch(id: u64, calls: Vec<BatchedCall>) -> CompletedBatch {
    let total = calls.len();
    let mut completions = Vec::with_capacity(total);

    for call in calls {
        let (name, work, completion) = call.into_parts();
        let result = panic::catch_unwind(AssertUnwindSafe(work))
            .unwrap_or_else(|payload| Err(panic_reason(payload)));
        if let Err(reason) = result {
            tracing::warn!(batch = id, call = %name, %reason, "batched call failed");
            return CompletedBatch::failed(id, total, format!("{}: {}", name, reason));
        }
        if let Some(completion) = completion {
            completions.push(completion);
        }
    }

    CompletedBatch {
        id,
        calls: total,
        outcome: Ok(completions),
    }
}

struct QueueState {
    generation: u64,
    batches: VecDeque<CompletedBatch>,
}

/// Completed batches waiting for the scheduling thread.
///
/// Batches are tagged with the generation they were submitted under;
/// [`discard`](Self::discard) bumps the generation so anything still running
/// is dropped when it lands.
#[derive(Clone)]
pub(crate) struct CompletedQueue {
    state: Arc<Mutex<QueueState>>,
}

impl Default for CompletedQueue {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                generation: 0,
                batches: VecDeque::new(),
            })),
        }
    }
}

impl fmt::Debug for CompletedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletedQueue")
            .field("generation", &state.generation)
            .field("batches", &state.batches.len())
            .finish()
    }
}

impl CompletedQueue {
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Queue a batch submitted under `generation`. Stale batches are dropped
    /// and `false` is returned.
    pub fn push(&self, batch: CompletedBatch, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::debug!(batch = batch.id, "dropping result of discarded batch");
            return false;
        }
        state.batches.push_back(batch);
        true
    }

    /// Drop everything queued and invalidate in-flight batches.
    pub fn discard(&self) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let dropped = state.batches.len();
        state.batches.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().batches.len()
    }

    fn pop(&self) -> Option<CompletedBatch> {
        self.state.lock().batches.pop_front()
    }

    /// Apply completed batches oldest first.
    ///
    /// The signal is cleared before the queue is read, so a batch landing
    /// mid-drain leaves a token behind rather than being missed. On a failed
    /// batch the drain stops and, if later batches are queued, the signal is
    /// raised again for them.
    pub fn apply_ready(
        &self,
        backend_id: &str,
        signal: &WorkSignal,
        notifier: &WorkNotifier,
    ) -> ArbiterResult<FlushReport> {
        signal.clear();
        let mut report = FlushReport::default();

        while let Some(batch) = self.pop() {
            match batch.outcome {
                Ok(completions) => {
                    for completion in completions {
                        completion();
                    }
                    report.batches_applied += 1;
                    report.calls_applied += batch.calls;
                }
                Err(reason) => {
                    if self.len() > 0 {
                        notifier.notify();
                    }
                    return Err(backend_failure!(backend_id, batch.id, reason));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::work_channel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_call(name: &str, counter: &Arc<AtomicUsize>) -> BatchedCall {
        let counter = Arc::clone(counter);
        BatchedCall::new(name, || Ok(())).on_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_run_batch_success() {
        let applied = Arc::new(AtomicUsize::new(0));
        let batch = run_batch(
            0,
            vec![counting_call("a", &applied), counting_call("b", &applied)],
        );
        assert_eq!(batch.calls, 2);
        let completions = batch.outcome.ok().unwrap();
        assert_eq!(completions.len(), 2);
        // Completions are deferred until applied
        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_batch_stops_at_first_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_after = Arc::clone(&ran);
        let batch = run_batch(
            4,
            vec![
                BatchedCall::new("gemm", || Err("bad shape".to_string())),
                BatchedCall::new("axpy", move || {
                    ran_after.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            ],
        );
        assert_eq!(batch.outcome.err().unwrap(), "gemm: bad shape");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_batch_turns_panic_into_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_after = Arc::clone(&ran);
        let batch = run_batch(
            7,
            vec![
                BatchedCall::new("trsm", || panic!("singular matrix")),
                BatchedCall::new("axpy", move || {
                    ran_after.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            ],
        );
        assert_eq!(batch.calls, 2);
        assert_eq!(
            batch.outcome.err().unwrap(),
            "trsm: call panicked: singular matrix"
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stale_generation_dropped() {
        let queue = CompletedQueue::default();
        let gen = queue.generation();
        queue.discard();
        assert!(!queue.push(run_batch(0, vec![]), gen));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_apply_ready_reports() {
        let (notifier, signal) = work_channel();
        let queue = CompletedQueue::default();
        let applied = Arc::new(AtomicUsize::new(0));
        let gen = queue.generation();

        queue.push(run_batch(0, vec![counting_call("a", &applied)]), gen);
        queue.push(run_batch(1, vec![counting_call("b", &applied)]), gen);
        notifier.notify();

        let report = queue.apply_ready("test", &signal, &notifier).unwrap();
        assert_eq!(report.batches_applied, 2);
        assert_eq!(report.calls_applied, 2);
        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert!(!signal.is_ready());
    }

    #[test]
    fn test_failure_rearms_signal_for_later_batches() {
        let (notifier, signal) = work_channel();
        let queue = CompletedQueue::default();
        let gen = queue.generation();

        queue.push(CompletedBatch::failed(0, 1, "boom"), gen);
        queue.push(run_batch(1, vec![]), gen);

        let err = queue.apply_ready("test", &signal, &notifier).unwrap_err();
        assert!(err.is_fatal_to_batch());
        assert_eq!(queue.len(), 1);
        assert!(signal.is_ready());
    }
}
