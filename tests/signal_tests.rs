//! Work signal and DoWork semantics over the deterministic dummy backend

mod common;

use common::CompletionLog;
use device_arbiter::backend::DummyBatchedBackend;
use device_arbiter::extern_meta::PoolConfig;
use device_arbiter::{ArbiterError, ErrorCategory, ExternMetadata};

fn meta_with(backend: DummyBatchedBackend) -> ExternMetadata {
    ExternMetadata::with_backend(PoolConfig::for_backend(true), Box::new(backend))
}

#[test]
fn test_no_signal_before_a_batch_completes() {
    let mut meta = meta_with(DummyBatchedBackend::new(["gemm"]).with_batch_threshold(3));
    let log = CompletionLog::default();
    let signal = meta.work_available().unwrap();

    meta.submit(log.call("gemm", "a")).unwrap();
    meta.submit(log.call("gemm", "b")).unwrap();
    assert!(!signal.is_ready());

    // Nothing completed: DoWork is a no-op
    meta.do_work().unwrap();
    assert_eq!(log.len(), 0);
    assert_eq!(meta.stats().batches_applied, 0);
}

#[test]
fn test_one_signal_per_completed_batch_at_most() {
    let mut meta = meta_with(DummyBatchedBackend::new(["gemm"]).with_batch_threshold(1));
    let log = CompletionLog::default();
    let signal = meta.work_available().unwrap();

    for i in 0..4 {
        meta.submit(log.call("gemm", i.to_string())).unwrap();
    }

    // Four batches completed, the signal coalesced into a single token
    assert!(signal.try_take());
    assert!(!signal.try_take());

    meta.do_work().unwrap();
    assert_eq!(log.entries(), vec!["0", "1", "2", "3"]);
    assert_eq!(meta.stats().batches_applied, 4);
    assert!(!signal.is_ready());
}

#[test]
fn test_do_work_applies_in_enqueue_order_across_batches() {
    let mut meta = meta_with(DummyBatchedBackend::new(["axpy"]).with_batch_threshold(2));
    let log = CompletionLog::default();

    for tag in ["x0", "x1", "x2", "x3", "x4", "x5"] {
        meta.submit(log.call("axpy", tag)).unwrap();
    }
    meta.do_work().unwrap();

    assert_eq!(log.entries(), vec!["x0", "x1", "x2", "x3", "x4", "x5"]);
    let stats = meta.stats();
    assert_eq!(stats.batches_applied, 3);
    assert_eq!(stats.calls_applied, 6);
    assert_eq!(stats.calls_outstanding(), 0);
}

#[test]
fn test_extra_wakeup_is_harmless() {
    let mut meta = meta_with(DummyBatchedBackend::new(["dot"]).with_batch_threshold(1));
    let log = CompletionLog::default();
    meta.submit(log.call("dot", "only")).unwrap();

    meta.do_work().unwrap();
    meta.do_work().unwrap();
    assert_eq!(log.entries(), vec!["only"]);
}

#[test]
fn test_failed_batch_surfaces_and_later_batches_survive() {
    let backend = DummyBatchedBackend::new(["gemm"])
        .with_batch_threshold(1)
        .with_failing_batch(0);
    let mut meta = meta_with(backend);
    let log = CompletionLog::default();
    let signal = meta.work_available().unwrap();

    meta.submit(log.call("gemm", "lost")).unwrap();
    meta.submit(log.call("gemm", "kept")).unwrap();

    let err = meta.do_work().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Backend);
    assert!(matches!(err, ArbiterError::BackendFailure { batch: 0, .. }));
    assert!(log.entries().is_empty());

    // The surviving batch re-armed the signal
    assert!(signal.try_take());
    meta.do_work().unwrap();
    assert_eq!(log.entries(), vec!["kept"]);
    assert_eq!(meta.stats().flush_failures, 1);
}

#[test]
fn test_abort_discards_completed_results() {
    let mut meta = meta_with(DummyBatchedBackend::new(["gemm"]).with_batch_threshold(1));
    let log = CompletionLog::default();
    let signal = meta.work_available().unwrap();

    meta.submit(log.call("gemm", "a")).unwrap();
    meta.submit(log.call("gemm", "b")).unwrap();
    meta.abort();

    assert!(!signal.is_ready());
    meta.do_work().unwrap();
    assert!(log.entries().is_empty());

    let stats = meta.stats();
    assert!(stats.aborted);
    assert!(stats.cleaned_up);
}

#[test]
fn test_signal_goes_quiet_after_cleanup() {
    let mut meta = meta_with(DummyBatchedBackend::new(["gemm"]).with_batch_threshold(1));
    let log = CompletionLog::default();
    let signal = meta.work_available().unwrap();
    meta.submit(log.call("gemm", "a")).unwrap();

    meta.cleanup();
    meta.cleanup();

    // Still connected, never ready
    assert!(!signal.is_ready());
    assert!(!signal.wait_timeout(std::time::Duration::from_millis(10)));
    assert!(meta.work_available().is_none());
    assert!(matches!(
        meta.submit(log.call("gemm", "late")),
        Err(ArbiterError::BackendShutdown)
    ));
}
