//! Batched-call backend capability.
//!
//! A backend accumulates device instructions issued by the VM and defers the
//! expensive cross-boundary call until it is flushed or its own threshold is
//! reached. Completion is reported only through the [`WorkSignal`]; results
//! are applied on the scheduling thread when the facade flushes.

pub mod completion;
pub mod dummy;
pub mod signal;
pub mod threaded;

pub use dummy::{DummyBatchedBackend, DummyBatchedStats};
pub use signal::{work_channel, WorkNotifier, WorkSignal};
pub use threaded::{BatchDescriptor, ThreadedBatchBackend};

use std::fmt;

use crate::error::ArbiterResult;

/// Device-side work of one call. An `Err` fails the whole batch.
pub type CallWork = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// Host-side continuation run by `do_work` once the call's batch completed.
pub type CallCompletion = Box<dyn FnOnce() + Send + 'static>;

/// One instruction queued for batched execution.
pub struct BatchedCall {
    name: String,
    work: CallWork,
    completion: Option<CallCompletion>,
}

impl BatchedCall {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Box::new(work),
            completion: None,
        }
    }

    /// Attach the host-side step that applies this call's result.
    pub fn on_complete<F>(mut self, completion: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (String, CallWork, Option<CallCompletion>) {
        (self.name, self.work, self.completion)
    }
}

impl fmt::Debug for BatchedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchedCall")
            .field("name", &self.name)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

/// What a flush applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batches_applied: usize,
    pub calls_applied: usize,
}

/// Capability contract between the facade and a batched-call backend.
pub trait BatchedBackend: Send {
    /// Backend identifier for logs and stats
    fn backend_id(&self) -> &str;

    /// Whether this backend has a device implementation of `name`
    fn declares_func(&self, name: &str) -> bool;

    /// Signal raised whenever a completed batch is waiting to be applied
    fn signal_source(&self) -> WorkSignal;

    /// Queue one call. May start a batch if the backend's threshold is hit.
    fn enqueue(&mut self, call: BatchedCall) -> ArbiterResult<()>;

    /// Start any partial batch and apply every batch that has completed,
    /// oldest first. Never waits for in-flight work.
    fn flush(&mut self) -> ArbiterResult<FlushReport>;

    /// Drop pending, in-flight and completed batches without applying them.
    fn discard_in_flight(&mut self);

    /// Release ancillary allocations. Idempotent.
    fn cleanup(&mut self);
}
