//! device-arbiter - device execution arbitration for a tensor-graph VM
//!
//! Sits between the VM's scheduling loop and zero or more compute
//! accelerators. It recycles device memory slabs, batches device-side
//! linear-algebra calls behind a pluggable backend, and tells the scheduler
//! through a [`WorkSignal`] when finished batches are ready to apply.
//!
//! Everything goes through one [`ExternMetadata`] per run, which behaves the
//! same whether or not a backend is configured.

pub mod backend;
pub mod device;
pub mod error;
pub mod extern_meta;
pub mod logging;
pub mod pool;

pub use backend::{BatchedBackend, BatchedCall, FlushReport, WorkSignal};
pub use device::{Device, DevicePtr, Memory};
pub use error::{ArbiterError, ArbiterResult, ErrorCategory};
pub use extern_meta::{
    BatchConfig, ExternConfig, ExternMetadata, ExternStats, PoolPolicy, DEVICE_BACKEND_BUILD,
};
pub use pool::{PoolStats, SlabPool};
