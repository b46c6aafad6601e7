//! Shared fixtures for the integration tests
//!
//! ```ignore
//! mod common;
//! use common::{dummy_meta, slab, D1};
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use device_arbiter::backend::DummyBatchedBackend;
use device_arbiter::extern_meta::PoolConfig;
use device_arbiter::{BatchedCall, Device, DevicePtr, ExternMetadata, Memory, WorkSignal};

pub use serial_test::serial;

pub const D0: Device = Device::Accelerator(0);
pub const D1: Device = Device::Accelerator(1);

/// How long a test waits for the threaded worker
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(5);

pub fn slab(device: Device, addr: u64, size: usize) -> Memory {
    Memory::new(device, DevicePtr(addr), size)
}

/// Facade over a dummy backend with pooling on for every device
pub fn dummy_meta(funcs: &[&str]) -> ExternMetadata {
    ExternMetadata::with_backend(
        PoolConfig::for_backend(true),
        Box::new(DummyBatchedBackend::new(funcs.iter().copied())),
    )
}

/// Ordered record of completions that ran
#[derive(Clone, Default)]
pub struct CompletionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CompletionLog {
    /// A no-op call that records `tag` when applied
    pub fn call(&self, op: &str, tag: impl Into<String>) -> BatchedCall {
        let entries = Arc::clone(&self.entries);
        let tag = tag.into();
        BatchedCall::new(op, || Ok(())).on_complete(move || {
            entries.lock().unwrap().push(tag);
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Counts device-side executions
#[derive(Clone, Default)]
pub struct ExecCounter(Arc<AtomicUsize>);

impl ExecCounter {
    pub fn call(&self, op: &str) -> BatchedCall {
        let counter = Arc::clone(&self.0);
        BatchedCall::new(op, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wait for the signal, panicking on timeout
pub fn expect_signal(signal: &WorkSignal) {
    assert!(
        signal.wait_timeout(WORKER_TIMEOUT),
        "work signal did not fire within {:?}",
        WORKER_TIMEOUT
    );
}
