//! Pool statistics.

use std::fmt;

use serde::Serialize;

/// Snapshot of slab pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Leases served from the pool
    pub hits: u64,
    /// Leases that found the class empty
    pub misses: u64,
    /// Slabs admitted back into the pool
    pub releases: u64,
    /// Releases refused because the slab's tags disagreed with the class
    pub misuse_rejections: u64,
    /// Releases refused because the class was full
    pub overflow_rejections: u64,
    /// Bytes handed out from the pool instead of freshly allocated
    pub reused_bytes: u64,
    /// Free slabs currently held
    pub pooled_slabs: usize,
    /// Bytes held by free slabs
    pub pooled_bytes: usize,
    /// Number of distinct (device, size) classes seen
    pub classes: usize,
}

impl PoolStats {
    /// Percentage of leases served from the pool
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolStats: hits={} misses={} ({}%), reused={}KB, pooled={} slabs ({}KB), rejected={} misuse/{} full",
            self.hits,
            self.misses,
            self.hit_rate_percent() as u32,
            self.reused_bytes / 1024,
            self.pooled_slabs,
            self.pooled_bytes / 1024,
            self.misuse_rejections,
            self.overflow_rejections,
        )
    }
}
