//! Per-device slab pooling.
//!
//! Leased device memory is recycled through exact size classes keyed by
//! `(Device, size)`. There is no splitting or coalescing: a class either has a
//! free slab of exactly the requested size or the lease misses with
//! [`ArbiterError::NotAvailable`](crate::error::ArbiterError::NotAvailable)
//! and the caller allocates through its own path.

pub mod slab_pool;
pub mod stats;

pub use slab_pool::{RejectReason, RejectedSlab, SlabClass, SlabPool};
pub use stats::PoolStats;
