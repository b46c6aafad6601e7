//! Run statistics for the facade
//!
//! - [`ExternStats`] - snapshot of one run, serializable for reports

use serde::Serialize;

use super::config::PoolPolicy;
use crate::pool::PoolStats;

/// Snapshot of an [`ExternMetadata`](super::ExternMetadata) run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternStats {
    /// Identifier of the backend, `None` for host-only runs
    pub backend: Option<String>,

    /// Which devices the pool backs
    pub pool_policy: PoolPolicy,

    /// Slab pool counters
    pub pool: PoolStats,

    /// Calls handed to the backend
    pub calls_submitted: u64,

    /// Batches applied by DoWork
    pub batches_applied: u64,

    /// Calls whose results were applied by DoWork
    pub calls_applied: u64,

    /// DoWork calls that surfaced a failed batch
    pub flush_failures: u64,

    /// Slabs Put for a device the pool does not back
    pub unpooled_puts: u64,

    /// Whether the run was aborted
    pub aborted: bool,

    /// Whether Cleanup has run
    pub cleaned_up: bool,
}

impl ExternStats {
    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Calls submitted but not yet applied
    pub fn calls_outstanding(&self) -> u64 {
        self.calls_submitted.saturating_sub(self.calls_applied)
    }
}
