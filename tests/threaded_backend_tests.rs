//! End-to-end runs over the threaded batch backend

mod common;

use std::time::Duration;

use common::{expect_signal, slab, CompletionLog, ExecCounter, D0};
use crossbeam::channel::{self, select};
use device_arbiter::{
    ArbiterError, BatchConfig, BatchedCall, Device, ExternConfig, ExternMetadata, Memory,
    WorkSignal,
};

fn threaded(max_batch_calls: usize) -> ExternMetadata {
    ExternMetadata::new(ExternConfig::batched(
        BatchConfig::default().with_max_batch_calls(max_batch_calls),
    ))
    .expect("threaded backend should start")
}

#[test]
fn test_declared_funcs_and_pool_enabled() {
    let meta = threaded(8);
    assert_eq!(meta.backend_id(), Some("threaded"));
    assert!(meta.has_func("gemm"));
    assert!(meta.has_func("nrm2"));
    assert!(!meta.has_func("softmax"));

    meta.put(D0, slab(D0, 0x40, 256), 256);
    assert!(meta.get(D0, 256).is_ok());
}

#[test]
fn test_full_batch_runs_and_applies_in_order() {
    let mut meta = threaded(4);
    let log = CompletionLog::default();
    let signal = meta.work_available().unwrap();

    for i in 0..4 {
        meta.submit(log.call("gemm", format!("c{}", i))).unwrap();
    }
    expect_signal(&signal);
    meta.do_work().unwrap();

    assert_eq!(log.entries(), vec!["c0", "c1", "c2", "c3"]);
    assert_eq!(meta.stats().calls_applied, 4);
}

#[test]
fn test_do_work_pushes_partial_batch_without_waiting() {
    let mut meta = threaded(64);
    let exec = ExecCounter::default();
    let signal = meta.work_available().unwrap();

    meta.submit(exec.call("axpy")).unwrap();
    meta.submit(exec.call("axpy")).unwrap();

    // Below the threshold: this DoWork submits the batch and returns at once
    meta.do_work().unwrap();
    if meta.stats().calls_applied < 2 {
        expect_signal(&signal);
        meta.do_work().unwrap();
    }

    assert_eq!(exec.get(), 2);
    assert_eq!(meta.stats().calls_applied, 2);
}

#[test]
fn test_scheduler_loop_recycles_slabs() {
    const CALLS: usize = 32;
    const SIZE: usize = 4096;

    let mut meta = threaded(8);
    let work = WorkSignal::or_never(meta.work_available().as_ref());
    let (done_tx, done_rx) = channel::unbounded::<Memory>();
    let deadline = channel::after(Duration::from_secs(10));

    let mut fresh = 0u64;
    for i in 0..CALLS {
        let mem = meta.get(D0, SIZE).unwrap_or_else(|_| {
            fresh += 1;
            slab(D0, fresh * 0x10000, SIZE)
        });
        let tx = done_tx.clone();
        meta.submit(
            BatchedCall::new("gemm", || Ok(())).on_complete(move || {
                tx.send(mem).unwrap();
            }),
        )
        .unwrap();

        // Hand back whatever has completed so far
        if i % 8 == 7 {
            select! {
                recv(work) -> _ => meta.do_work().unwrap(),
                recv(deadline) -> _ => panic!("batch never completed"),
            }
            for mem in done_rx.try_iter() {
                meta.put(D0, mem, SIZE);
            }
        }
    }

    while meta.stats().calls_outstanding() > 0 {
        select! {
            recv(work) -> _ => meta.do_work().unwrap(),
            recv(deadline) -> _ => panic!("outstanding calls never completed"),
        }
    }
    for mem in done_rx.try_iter() {
        meta.put(D0, mem, SIZE);
    }

    let stats = meta.stats();
    assert_eq!(stats.calls_applied, CALLS as u64);
    assert!(stats.pool.hits > 0, "completed slabs should be reused");
    assert_eq!(stats.pool.hits + fresh, CALLS as u64);
    assert_eq!(meta.pool().class_len(D0, SIZE) as u64, fresh);
}

#[test]
fn test_device_failure_is_fatal_to_batch_only() {
    let mut meta = threaded(2);
    let log = CompletionLog::default();
    let signal = meta.work_available().unwrap();

    meta.submit(BatchedCall::new("gemm", || Err("illegal address".to_string())))
        .unwrap();
    meta.submit(log.call("gemm", "same-batch")).unwrap();
    expect_signal(&signal);

    let err = meta.do_work().unwrap_err();
    assert!(err.is_fatal_to_batch());
    assert!(err.to_string().contains("illegal address"));
    assert!(log.entries().is_empty());

    // The run continues
    meta.submit(log.call("gemm", "next-1")).unwrap();
    meta.submit(log.call("gemm", "next-2")).unwrap();
    expect_signal(&signal);
    meta.do_work().unwrap();
    assert_eq!(log.entries(), vec!["next-1", "next-2"]);
}

#[test]
fn test_abort_drops_in_flight_work() {
    let mut meta = threaded(1);
    let log = CompletionLog::default();
    let exec = ExecCounter::default();
    let (release_tx, release_rx) = channel::bounded::<()>(0);

    // First call blocks the worker until released
    meta.submit(BatchedCall::new("gemm", move || {
        let _ = release_rx.recv_timeout(Duration::from_secs(5));
        Ok(())
    }))
    .unwrap();
    for _ in 0..3 {
        meta.submit(exec.call("gemm")).unwrap();
    }
    meta.submit(log.call("gemm", "in-flight")).unwrap();

    let unblock = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        let _ = release_tx.send(());
    });
    meta.abort();
    unblock.join().unwrap();

    meta.do_work().unwrap();
    assert!(log.entries().is_empty());
    assert_eq!(exec.get(), 0, "queued batches must not run after abort");
    assert!(meta.stats().aborted);
}

#[test]
fn test_panicking_call_does_not_stall_the_run() {
    let mut meta = threaded(1);
    let log = CompletionLog::default();
    let signal = meta.work_available().unwrap();

    meta.submit(BatchedCall::new("gemm", || panic!("kernel fault")))
        .unwrap();
    expect_signal(&signal);
    let err = meta.do_work().unwrap_err();
    assert!(err.is_fatal_to_batch());

    meta.submit(log.call("gemm", "after")).unwrap();
    expect_signal(&signal);
    meta.do_work().unwrap();
    assert_eq!(log.entries(), vec!["after"]);
    assert_eq!(meta.stats().flush_failures, 1);
}

#[test]
fn test_cleanup_releases_backend_once() {
    let mut meta = threaded(4);
    meta.submit(BatchedCall::new("dot", || Ok(()))).unwrap();
    meta.cleanup();
    meta.cleanup();

    assert!(meta.is_cleaned_up());
    assert!(!meta.has_func("dot"));
    assert!(matches!(
        meta.submit(BatchedCall::new("dot", || Ok(()))),
        Err(ArbiterError::BackendShutdown)
    ));
}

#[test]
fn test_drop_without_cleanup_joins_worker() {
    let exec = ExecCounter::default();
    {
        let mut meta = threaded(1);
        meta.submit(exec.call("scal")).unwrap();
    }
    // Cleanup on drop lets the worker finish its queue before joining
    assert_eq!(exec.get(), 1);
}

#[test]
fn test_host_and_accelerator_slabs_are_separate_classes() {
    let meta = threaded(4);
    meta.put(Device::Host, slab(Device::Host, 0x10, 64), 64);
    assert!(meta.get(D0, 64).is_err());
    assert!(meta.get(Device::Host, 64).is_ok());
}
