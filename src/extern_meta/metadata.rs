//! The ExternMetadata facade
//!
//! One instance per VM run. It owns the slab pool and at most one batched-call
//! backend, and presents the same contract whether or not a backend exists:
//! without one, `has_func` is false, `get` misses, `put` drops the slab,
//! `work_available` is `None` and `do_work` succeeds without doing anything.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::config::{BackendSelection, ExternConfig, PoolConfig, PoolPolicy};
use super::stats::ExternStats;
use crate::backend::{BatchedBackend, BatchedCall, ThreadedBatchBackend, WorkSignal};
use crate::device::{Device, Memory};
use crate::error::{ArbiterError, ArbiterResult};
use crate::pool::SlabPool;

#[derive(Debug, Default)]
struct RunCounters {
    calls_submitted: u64,
    batches_applied: u64,
    calls_applied: u64,
    flush_failures: u64,
}

/// Device-execution arbitration for one VM run.
///
/// `get`, `put`, `has_func` and `work_available` take `&self` and may be
/// called from parallel dispatch workers. Everything that drives the backend
/// takes `&mut self` and belongs to the scheduling thread.
pub struct ExternMetadata {
    pool: SlabPool,
    policy: PoolPolicy,
    backend: Mutex<Option<Box<dyn BatchedBackend>>>,
    backend_id: Option<String>,
    counters: RunCounters,
    unpooled_puts: AtomicU64,
    aborted: bool,
    cleaned_up: bool,
}

impl std::fmt::Debug for ExternMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternMetadata")
            .field("backend", &self.backend_id)
            .field("policy", &self.policy)
            .field("pool", &self.pool)
            .field("aborted", &self.aborted)
            .field("cleaned_up", &self.cleaned_up)
            .finish()
    }
}

impl ExternMetadata {
    /// Start a run from `config`, spawning the backend it selects.
    pub fn new(config: ExternConfig) -> ArbiterResult<Self> {
        config.validate()?;
        let backend: Option<Box<dyn BatchedBackend>> = match config.backend {
            BackendSelection::None => None,
            BackendSelection::Batched(batch) => Some(Box::new(ThreadedBatchBackend::new(batch)?)),
        };
        Ok(Self::assemble(config.pool, backend))
    }

    /// Host-only run
    pub fn without_backend() -> Self {
        Self::assemble(ExternConfig::no_backend().pool, None)
    }

    /// Run over a caller-supplied backend.
    pub fn with_backend(pool: PoolConfig, backend: Box<dyn BatchedBackend>) -> Self {
        Self::assemble(pool, Some(backend))
    }

    fn assemble(pool: PoolConfig, backend: Option<Box<dyn BatchedBackend>>) -> Self {
        let backend_id = backend.as_ref().map(|b| b.backend_id().to_string());
        tracing::info!(
            backend = backend_id.as_deref().unwrap_or("none"),
            policy = ?pool.policy,
            max_slabs_per_class = pool.max_slabs_per_class,
            "extern metadata initialized"
        );

        Self {
            pool: SlabPool::with_max_slabs_per_class(pool.max_slabs_per_class),
            policy: pool.policy,
            backend: Mutex::new(backend),
            backend_id,
            counters: RunCounters::default(),
            unpooled_puts: AtomicU64::new(0),
            aborted: false,
            cleaned_up: false,
        }
    }

    /// Identifier of the configured backend
    pub fn backend_id(&self) -> Option<&str> {
        self.backend_id.as_deref()
    }

    pub fn pool_policy(&self) -> PoolPolicy {
        self.policy
    }

    /// The slab pool, for seeding at run start and draining at run end
    pub fn pool(&self) -> &SlabPool {
        &self.pool
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    /// Whether the backend has a device implementation of `name`.
    pub fn has_func(&self, name: &str) -> bool {
        self.backend
            .lock()
            .as_ref()
            .is_some_and(|backend| backend.declares_func(name))
    }

    /// Signal to wait on before calling [`do_work`](Self::do_work).
    ///
    /// `None` means "never ready"; see [`WorkSignal::or_never`].
    pub fn work_available(&self) -> Option<WorkSignal> {
        self.backend
            .lock()
            .as_ref()
            .map(|backend| backend.signal_source())
    }

    /// Apply the results of every completed batch, oldest first.
    ///
    /// Never waits for in-flight work. A failed batch is reported as
    /// [`ArbiterError::BackendFailure`]; the run may continue.
    pub fn do_work(&mut self) -> ArbiterResult<()> {
        let Some(backend) = self.backend.get_mut().as_mut() else {
            return Ok(());
        };

        match backend.flush() {
            Ok(report) => {
                self.counters.batches_applied += report.batches_applied as u64;
                self.counters.calls_applied += report.calls_applied as u64;
                if report.batches_applied > 0 {
                    tracing::debug!(
                        batches = report.batches_applied,
                        calls = report.calls_applied,
                        "applied completed batches"
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.counters.flush_failures += 1;
                tracing::warn!(error = %e, "batch failed");
                Err(e)
            }
        }
    }

    /// Lease a pooled slab of exactly `size` bytes on `device`.
    ///
    /// A miss, including every call on a device the pool does not back, is
    /// the non-fatal [`ArbiterError::NotAvailable`].
    pub fn get(&self, device: Device, size: usize) -> ArbiterResult<Memory> {
        if !self.policy.covers(device) {
            return Err(ArbiterError::NotAvailable { device, size });
        }
        self.pool.lease(device, size)
    }

    /// Give a slab back for reuse under `(device, size)`.
    ///
    /// When the pool does not back `device` the slab is dropped. Slabs the
    /// pool rejects are dropped too; the pool counts and logs them.
    pub fn put(&self, device: Device, mem: Memory, size: usize) {
        if !self.policy.covers(device) {
            self.unpooled_puts.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%device, size, "put on unpooled device");
            return;
        }
        if let Err(rejected) = self.pool.release(device, mem, size) {
            match rejected.misuse() {
                Some(err) => tracing::debug!(error = %err, "put rejected"),
                None => tracing::debug!(slab = %rejected.memory, reason = ?rejected.reason, "slab not pooled"),
            }
        }
    }

    /// Queue one instruction for batched execution.
    ///
    /// Without a backend this is [`ArbiterError::NoBackend`] and the caller
    /// takes the host path.
    pub fn submit(&mut self, call: BatchedCall) -> ArbiterResult<()> {
        let Some(backend) = self.backend.get_mut().as_mut() else {
            return Err(if self.cleaned_up && self.backend_id.is_some() {
                ArbiterError::BackendShutdown
            } else {
                ArbiterError::NoBackend
            });
        };
        tracing::trace!(call = call.name(), "submitting call");
        backend.enqueue(call)?;
        self.counters.calls_submitted += 1;
        Ok(())
    }

    /// Cancel the run: drop every pending and in-flight batch unapplied,
    /// then clean up.
    pub fn abort(&mut self) {
        if self.cleaned_up {
            return;
        }
        if let Some(backend) = self.backend.get_mut().as_mut() {
            backend.discard_in_flight();
        }
        self.aborted = true;
        tracing::info!("run aborted, in-flight batches discarded");
        self.cleanup();
    }

    /// Release the backend's ancillary resources. Idempotent.
    ///
    /// Pooled slabs stay in the pool; [`SlabPool::drain`] hands them back.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        if let Some(mut backend) = self.backend.get_mut().take() {
            backend.cleanup();
        }
        tracing::info!(
            backend = self.backend_id.as_deref().unwrap_or("none"),
            calls_applied = self.counters.calls_applied,
            pooled_slabs = self.pool.len(),
            "extern metadata cleaned up"
        );
    }

    pub fn stats(&self) -> ExternStats {
        ExternStats {
            backend: self.backend_id.clone(),
            pool_policy: self.policy,
            pool: self.pool.stats(),
            calls_submitted: self.counters.calls_submitted,
            batches_applied: self.counters.batches_applied,
            calls_applied: self.counters.calls_applied,
            flush_failures: self.counters.flush_failures,
            unpooled_puts: self.unpooled_puts.load(Ordering::Relaxed),
            aborted: self.aborted,
            cleaned_up: self.cleaned_up,
        }
    }
}

impl Drop for ExternMetadata {
    fn drop(&mut self) {
        self.cleanup();
    }
}
