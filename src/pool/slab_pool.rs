//! Exact size-class slab pool.
//!
//! # Strategy
//!
//! - One LIFO bucket per `(device, size)` class
//! - Lease pops from the bucket or misses, it never allocates
//! - Release pushes back only if the slab's own tags match the class and the
//!   bucket is below its cap; otherwise the slab is handed back untouched
//!
//! # Thread Safety
//!
//! The class map sits behind an `RwLock` and every bucket behind its own
//! `Mutex`, so leases on different classes never contend. Counters are
//! atomics. `SlabPool` is `Send + Sync`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::device::{Device, Memory};
use crate::error::{ArbiterError, ArbiterResult};

use super::stats::PoolStats;

/// Default number of free slabs kept per class.
pub const DEFAULT_MAX_SLABS_PER_CLASS: usize = 16;

/// Pool key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlabClass {
    pub device: Device,
    pub size: usize,
}

impl SlabClass {
    pub fn new(device: Device, size: usize) -> Self {
        Self { device, size }
    }

    /// Class a slab's own tags put it in
    pub fn of(mem: &Memory) -> Self {
        Self::new(mem.device(), mem.size())
    }
}

impl fmt::Display for SlabClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}B", self.device, self.size)
    }
}

/// Why a release was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The slab's tags disagree with the class it was filed under
    ClassMismatch { filed_under: SlabClass, tagged: SlabClass },
    /// The class already holds its maximum number of free slabs
    ClassFull { capacity: usize },
}

/// A slab the pool refused, returned to the caller so it can be freed.
#[derive(Debug)]
pub struct RejectedSlab {
    pub memory: Memory,
    pub reason: RejectReason,
}

impl RejectedSlab {
    /// The contract violation behind this rejection, if it was one
    pub fn misuse(&self) -> Option<ArbiterError> {
        match &self.reason {
            RejectReason::ClassMismatch {
                filed_under,
                tagged,
            } => Some(ArbiterError::Misuse(format!(
                "slab {} tagged {} released under {}",
                self.memory.ptr(),
                tagged,
                filed_under
            ))),
            RejectReason::ClassFull { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    releases: AtomicU64,
    misuse_rejections: AtomicU64,
    overflow_rejections: AtomicU64,
    reused_bytes: AtomicU64,
}

/// Free-list cache of device slabs.
#[derive(Debug)]
pub struct SlabPool {
    classes: RwLock<HashMap<SlabClass, Mutex<Vec<Memory>>>>,
    max_slabs_per_class: usize,
    counters: PoolCounters,
}

impl Default for SlabPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabPool {
    pub fn new() -> Self {
        Self::with_max_slabs_per_class(DEFAULT_MAX_SLABS_PER_CLASS)
    }

    pub fn with_max_slabs_per_class(max: usize) -> Self {
        Self {
            classes: RwLock::new(HashMap::new()),
            max_slabs_per_class: max,
            counters: PoolCounters::default(),
        }
    }

    pub fn max_slabs_per_class(&self) -> usize {
        self.max_slabs_per_class
    }

    /// Take a free slab of exactly `size` bytes on `device`.
    ///
    /// A miss is the non-fatal [`ArbiterError::NotAvailable`].
    pub fn lease(&self, device: Device, size: usize) -> ArbiterResult<Memory> {
        let class = SlabClass::new(device, size);
        let slab = {
            let classes = self.classes.read();
            classes.get(&class).and_then(|bucket| bucket.lock().pop())
        };

        match slab {
            Some(mem) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .reused_bytes
                    .fetch_add(size as u64, Ordering::Relaxed);
                tracing::trace!(%class, slab = %mem.ptr(), "slab leased from pool");
                Ok(mem)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%class, "slab pool miss");
                Err(ArbiterError::NotAvailable { device, size })
            }
        }
    }

    /// File `mem` under `(device, size)` for reuse.
    ///
    /// Slabs whose tags do not match the class, or that would overflow the
    /// class, are handed back in [`RejectedSlab`]. The pool is unchanged in
    /// that case.
    pub fn release(&self, device: Device, mem: Memory, size: usize) -> Result<(), RejectedSlab> {
        let class = SlabClass::new(device, size);
        let tagged = SlabClass::of(&mem);
        if tagged != class {
            self.counters
                .misuse_rejections
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                filed_under = %class,
                %tagged,
                "slab released under the wrong class, dropping it from the pool"
            );
            return Err(RejectedSlab {
                memory: mem,
                reason: RejectReason::ClassMismatch {
                    filed_under: class,
                    tagged,
                },
            });
        }

        {
            let classes = self.classes.read();
            if let Some(bucket) = classes.get(&class) {
                return self.push_bounded(class, bucket, mem);
            }
        }

        let mut classes = self.classes.write();
        let bucket = classes.entry(class).or_default();
        self.push_bounded(class, bucket, mem)
    }

    fn push_bounded(
        &self,
        class: SlabClass,
        bucket: &Mutex<Vec<Memory>>,
        mem: Memory,
    ) -> Result<(), RejectedSlab> {
        let mut slabs = bucket.lock();
        if slabs.len() >= self.max_slabs_per_class {
            self.counters
                .overflow_rejections
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%class, capacity = self.max_slabs_per_class, "slab class full");
            return Err(RejectedSlab {
                memory: mem,
                reason: RejectReason::ClassFull {
                    capacity: self.max_slabs_per_class,
                },
            });
        }

        slabs.push(mem);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pre-populate a class. Returns whatever did not fit.
    pub fn seed<I>(&self, device: Device, size: usize, slabs: I) -> Vec<RejectedSlab>
    where
        I: IntoIterator<Item = Memory>,
    {
        slabs
            .into_iter()
            .filter_map(|mem| self.release(device, mem, size).err())
            .collect()
    }

    /// Empty every class, handing all free slabs back for deallocation.
    pub fn drain(&self) -> Vec<Memory> {
        let mut classes = self.classes.write();
        let drained: Vec<Memory> = classes
            .drain()
            .flat_map(|(_, bucket)| bucket.into_inner())
            .collect();
        if !drained.is_empty() {
            tracing::debug!(slabs = drained.len(), "slab pool drained");
        }
        drained
    }

    /// Number of free slabs in one class
    pub fn class_len(&self, device: Device, size: usize) -> usize {
        self.classes
            .read()
            .get(&SlabClass::new(device, size))
            .map(|bucket| bucket.lock().len())
            .unwrap_or(0)
    }

    /// Number of free slabs across all classes
    pub fn len(&self) -> usize {
        self.classes
            .read()
            .values()
            .map(|bucket| bucket.lock().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes held by free slabs
    pub fn pooled_bytes(&self) -> usize {
        self.classes
            .read()
            .iter()
            .map(|(class, bucket)| class.size * bucket.lock().len())
            .sum()
    }

    pub fn stats(&self) -> PoolStats {
        let (pooled_slabs, pooled_bytes, classes) = {
            let classes = self.classes.read();
            let mut slabs = 0usize;
            let mut bytes = 0usize;
            for (class, bucket) in classes.iter() {
                let n = bucket.lock().len();
                slabs += n;
                bytes += class.size * n;
            }
            (slabs, bytes, classes.len())
        };

        PoolStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            misuse_rejections: self.counters.misuse_rejections.load(Ordering::Relaxed),
            overflow_rejections: self.counters.overflow_rejections.load(Ordering::Relaxed),
            reused_bytes: self.counters.reused_bytes.load(Ordering::Relaxed),
            pooled_slabs,
            pooled_bytes,
            classes,
        }
    }
}
