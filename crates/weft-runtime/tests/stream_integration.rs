//! Integration tests for execution stream lifecycle and scheduling.

mod common;

use common::with_runtime;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use weft_runtime::{
    ExecutionStream, FifoPool, Pool, RuntimeError, SchedConfig, SchedPredef, SchedState,
    Scheduler, StreamState, Tasklet, TaskletState, Ult, UltState,
};

#[test]
fn test_uninitialized_calls_return_errors() {
    let _guard = common::TEST_LOCK.lock();
    assert_eq!(weft_runtime::yield_now(), Err(RuntimeError::Uninitialized));
    assert_eq!(
        ExecutionStream::current().err(),
        Some(RuntimeError::Uninitialized)
    );
    assert_eq!(
        ExecutionStream::create(None).err(),
        Some(RuntimeError::Uninitialized)
    );
    assert!(!weft_runtime::is_initialized());
}

#[test]
fn test_init_binds_primary_to_calling_thread() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        assert!(primary.is_primary());
        assert_eq!(primary.state(), StreamState::Ready);
        assert_eq!(weft_runtime::num_streams().unwrap(), 1);
        assert_eq!(
            ExecutionStream::current_rank().unwrap(),
            primary.rank()
        );
    });
}

#[test]
fn test_stream_lifecycle() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        assert_eq!(stream.state(), StreamState::Created);
        assert_eq!(weft_runtime::num_streams().unwrap(), 2);

        stream.start().unwrap();
        // A second start loses the CAS and is a silent no-op.
        stream.start().unwrap();

        stream.join().unwrap();
        assert_eq!(stream.state(), StreamState::Terminated);
        stream.free().unwrap();
        assert_eq!(weft_runtime::num_streams().unwrap(), 1);
    });
}

/// N streams x M ULTs, each yielding around a locked counter update.
#[test]
fn test_shared_counter_across_streams() {
    with_runtime(|| {
        const NUM_STREAMS: usize = 4;
        const NUM_ULTS: usize = 4;

        let primary = ExecutionStream::current().unwrap();
        let mut streams = vec![primary.clone()];
        for _ in 1..NUM_STREAMS {
            streams.push(ExecutionStream::create(None).unwrap());
        }

        let counter = Arc::new(Mutex::new(0usize));
        let mut ults = Vec::new();
        for stream in &streams {
            let pool = stream.main_pools()[0].clone();
            for _ in 0..NUM_ULTS {
                let counter = counter.clone();
                let ult = Ult::create(&pool, move || {
                    weft_runtime::yield_now().unwrap();
                    *counter.lock() += 1;
                    weft_runtime::yield_now().unwrap();
                })
                .unwrap();
                ults.push(ult);
            }
        }

        // Run the primary's own units.
        weft_runtime::yield_now().unwrap();

        for stream in &streams[1..] {
            stream.join().unwrap();
        }

        assert_eq!(*counter.lock(), NUM_STREAMS * NUM_ULTS);
        for ult in &ults {
            assert_eq!(ult.state(), UltState::Terminated);
            assert!(!ult.failed());
        }
        for stream in &streams[1..] {
            assert_eq!(stream.state(), StreamState::Terminated);
            stream.free().unwrap();
        }
    });
}

/// Cancelling a busy stream terminates it without draining.
#[test]
fn test_cancel_while_running() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        let pool = stream.main_pools()[0].clone();

        // A unit that yields forever keeps the scheduler busy.
        let ult = Ult::create(&pool, || loop {
            weft_runtime::yield_now().unwrap();
        })
        .unwrap();

        while stream.state() != StreamState::Running {
            std::thread::yield_now();
        }
        stream.cancel().unwrap();
        stream.join().unwrap();
        assert_eq!(stream.state(), StreamState::Terminated);

        // Cancelling the stream does not terminate its units: the unit is
        // parked READY in the pool, never to run again.
        assert_eq!(ult.state(), UltState::Ready);
        stream.free().unwrap();
    });
}

/// Joining a stream that was never started terminates it by CAS, with
/// no kernel thread involved.
#[test]
fn test_join_created_stream() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        stream.join().unwrap();
        assert_eq!(stream.state(), StreamState::Terminated);
        stream.free().unwrap();
    });
}

#[test]
fn test_exit_self_from_ult() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        let pool = stream.main_pools()[0].clone();
        let reached = Arc::new(AtomicBool::new(false));
        let r = reached.clone();
        Ult::create(&pool, move || {
            r.store(true, Ordering::SeqCst);
            ExecutionStream::exit_self().unwrap();
        })
        .unwrap();

        while stream.state() != StreamState::Terminated {
            std::thread::yield_now();
        }
        assert!(reached.load(Ordering::SeqCst));
        stream.join().unwrap();
        stream.free().unwrap();
    });
}

/// A ULT terminating itself with `exit` stops at its next hand-off; the
/// rest of its body never runs.
#[test]
fn test_ult_exit_terminates_unit() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let pool = primary.main_pools()[0].clone();

        let progress = Arc::new(AtomicUsize::new(0));
        let p = progress.clone();
        let ult = Ult::create(&pool, move || {
            p.store(1, Ordering::SeqCst);
            weft_runtime::exit().unwrap();
            p.store(2, Ordering::SeqCst);
        })
        .unwrap();

        weft_runtime::yield_now().unwrap();
        assert_eq!(ult.state(), UltState::Terminated);
        assert!(!ult.failed());
        assert_eq!(progress.load(Ordering::SeqCst), 1);

        // Exiting is only for dispatched ULTs.
        assert!(matches!(
            weft_runtime::exit(),
            Err(RuntimeError::InvalidUnit(_))
        ));
    });
}

#[test]
fn test_forbidden_stream_operations() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        assert!(matches!(
            primary.join(),
            Err(RuntimeError::InvalidStream(_))
        ));
        assert!(matches!(
            primary.cancel(),
            Err(RuntimeError::InvalidStream(_))
        ));
        assert!(matches!(
            primary.free(),
            Err(RuntimeError::InvalidStream(_))
        ));
        // The primary's main context cannot exit its stream either.
        assert!(matches!(
            ExecutionStream::exit_self(),
            Err(RuntimeError::InvalidStream(_))
        ));

        // A thread outside the runtime gets an error, not an abort.
        let result = std::thread::spawn(weft_runtime::yield_now)
            .join()
            .unwrap();
        assert!(matches!(result, Err(RuntimeError::InvalidStream(_))));
    });
}

/// Replacing the main scheduler discards the previous one and installs
/// the new one at the bottom of the stack for the next start.
#[test]
fn test_set_main_sched_replaces_previous() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        let old = stream.main_sched().unwrap();

        let pool: Arc<dyn Pool> = FifoPool::new();
        let new_sched = Scheduler::basic(
            SchedPredef::Basic,
            vec![pool.clone()],
            SchedConfig::default(),
        );
        stream.set_main_sched(&new_sched).unwrap();
        assert_eq!(old.state(), SchedState::Terminated);
        assert!(Arc::ptr_eq(&stream.main_sched().unwrap(), &new_sched));

        // The new scheduler drives the stream once a unit arrives.
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        Ult::create(&pool, move || d.store(true, Ordering::SeqCst)).unwrap();
        while !done.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        stream.join().unwrap();
        stream.free().unwrap();
    });
}

/// Stream teardown frees an automatic (runtime-provided) main scheduler
/// but leaves a caller-owned one alive for reuse.
#[test]
fn test_automatic_scheduler_freed_on_teardown() {
    with_runtime(|| {
        // `create(None)` materializes a runtime-owned default scheduler.
        let stream = ExecutionStream::create(None).unwrap();
        let auto_sched = stream.main_sched().unwrap();
        assert!(auto_sched.is_automatic());
        stream.join().unwrap();
        stream.free().unwrap();
        assert_eq!(auto_sched.state(), SchedState::Terminated);

        // A caller-provided scheduler outlives its stream.
        let pool: Arc<dyn Pool> = FifoPool::new();
        let owned = Scheduler::basic(
            SchedPredef::Basic,
            vec![pool.clone()],
            SchedConfig::default(),
        );
        assert!(!owned.is_automatic());
        let stream = ExecutionStream::create(Some(owned.clone())).unwrap();
        stream.join().unwrap();
        stream.free().unwrap();
        assert_eq!(owned.state(), SchedState::Ready);
    });
}

#[test]
fn test_name_and_rank() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        assert!(stream.name().is_none());
        stream.set_name("io-stream");
        assert_eq!(stream.name().as_deref(), Some("io-stream"));

        let old_rank = stream.rank();
        stream.set_rank(old_rank + 100).unwrap();
        assert_eq!(stream.rank(), old_rank + 100);

        // The registry stayed consistent across the re-rank.
        stream.join().unwrap();
        stream.free().unwrap();
    });
}

#[test]
fn test_ult_panic_is_contained() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let pool = primary.main_pools()[0].clone();
        let ult = Ult::create(&pool, || panic!("unit failure")).unwrap();
        let after = Ult::create(&pool, || {}).unwrap();

        weft_runtime::yield_now().unwrap();
        assert_eq!(ult.state(), UltState::Terminated);
        assert!(ult.failed());
        // The stream survived and kept scheduling.
        assert_eq!(after.state(), UltState::Terminated);
        assert!(!after.failed());
    });
}

#[test]
fn test_join_ult_from_another_ult() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let pool = primary.main_pools()[0].clone();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let worker = Ult::create(&pool, move || {
            weft_runtime::yield_now().unwrap();
            o.lock().push("worker");
        })
        .unwrap();

        let o = order.clone();
        let w = worker.clone();
        Ult::create(&pool, move || {
            w.join().unwrap();
            o.lock().push("joiner");
        })
        .unwrap();

        weft_runtime::yield_now().unwrap();
        assert_eq!(*order.lock(), vec!["worker", "joiner"]);
    });
}

#[test]
fn test_join_ult_from_external_thread() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        let pool = stream.main_pools()[0].clone();
        let ult = Ult::create(&pool, || {
            weft_runtime::yield_now().unwrap();
        })
        .unwrap();

        let u = ult.clone();
        let joiner = std::thread::spawn(move || u.join());
        joiner.join().unwrap().unwrap();
        assert_eq!(ult.state(), UltState::Terminated);

        stream.join().unwrap();
        stream.free().unwrap();
    });
}

#[test]
fn test_cancelled_unit_never_runs() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let pool = primary.main_pools()[0].clone();
        let ran = Arc::new(AtomicBool::new(false));

        let r = ran.clone();
        let ult = Ult::create(&pool, move || r.store(true, Ordering::SeqCst)).unwrap();
        ult.cancel();

        let r = ran.clone();
        let tasklet = Tasklet::create(&pool, move || r.store(true, Ordering::SeqCst)).unwrap();
        tasklet.cancel();

        weft_runtime::yield_now().unwrap();
        assert_eq!(ult.state(), UltState::Terminated);
        assert_eq!(tasklet.state(), TaskletState::Terminated);
        assert!(!ran.load(Ordering::SeqCst));
    });
}

#[test]
fn test_tasklet_runs_to_completion() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        let pool = stream.main_pools()[0].clone();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let tasklet = Tasklet::create(&pool, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        tasklet.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tasklet.state(), TaskletState::Terminated);
        assert!(tasklet.last_stream().is_some());

        stream.join().unwrap();
        stream.free().unwrap();
    });
}
