//! Run-scoped facade the VM holds: slab pool plus optional batched backend

pub mod config;
pub mod metadata;
pub mod stats;

pub use config::{
    BackendSelection, BatchConfig, ExternConfig, PoolConfig, PoolPolicy, DEFAULT_BLAS_FUNCS,
    DEVICE_BACKEND_BUILD,
};
pub use metadata::ExternMetadata;
pub use stats::ExternStats;
