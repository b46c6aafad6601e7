//! Host-only runs: the facade contract with no backend configured

mod common;

use std::time::Duration;

use common::{slab, D0, D1};
use crossbeam::channel::{self, select};
use device_arbiter::{ArbiterError, BatchedCall, Device, ExternConfig, ExternMetadata, PoolPolicy};

#[test]
fn test_has_func_is_always_false() {
    let meta = ExternMetadata::without_backend();
    for name in ["gemm", "gemv", "axpy", "", "anything"] {
        assert!(!meta.has_func(name), "has_func({:?})", name);
    }
}

#[test]
fn test_get_is_always_not_available() {
    let meta = ExternMetadata::without_backend();
    for (device, size) in [(D0, 1024), (D1, 0), (Device::Host, 4096)] {
        let err = meta.get(device, size).unwrap_err();
        assert!(err.is_not_available());
        assert!(matches!(err, ArbiterError::NotAvailable { device: d, size: s } if d == device && s == size));
    }
}

#[test]
fn test_put_is_a_no_op() {
    let meta = ExternMetadata::without_backend();
    meta.put(D1, slab(D1, 0x1000, 1024), 1024);

    // Nothing was pooled, so the slab cannot come back
    assert!(meta.get(D1, 1024).is_err());
    assert!(meta.pool().is_empty());
    assert_eq!(meta.stats().pool.releases, 0);
}

#[test]
fn test_work_available_is_none_and_select_never_fires() {
    let meta = ExternMetadata::without_backend();
    assert!(meta.work_available().is_none());

    let work = device_arbiter::WorkSignal::or_never(meta.work_available().as_ref());
    let timeout = channel::after(Duration::from_millis(20));
    select! {
        recv(work) -> _ => panic!("missing signal must never fire"),
        recv(timeout) -> _ => {}
    }
}

#[test]
fn test_do_work_is_no_op_success() {
    let mut meta = ExternMetadata::without_backend();
    for _ in 0..3 {
        meta.do_work().unwrap();
    }
    assert_eq!(meta.stats().batches_applied, 0);
}

#[test]
fn test_submit_reports_no_backend() {
    let mut meta = ExternMetadata::without_backend();
    let err = meta.submit(BatchedCall::new("gemm", || Ok(()))).unwrap_err();
    assert!(matches!(err, ArbiterError::NoBackend));
    assert!(err.is_not_available());
}

#[test]
fn test_cleanup_is_idempotent() {
    let mut meta = ExternMetadata::without_backend();
    meta.cleanup();
    meta.cleanup();
    assert!(meta.is_cleaned_up());

    // Still safe to call everything afterwards
    assert!(!meta.has_func("gemm"));
    assert!(meta.do_work().is_ok());
    assert!(meta.get(D0, 8).is_err());
}

#[test]
fn test_no_backend_config_matches_without_backend() {
    let meta = ExternMetadata::new(ExternConfig::no_backend()).unwrap();
    let stats = meta.stats();
    assert!(!stats.has_backend());
    assert_eq!(stats.pool_policy, PoolPolicy::Disabled);
}
