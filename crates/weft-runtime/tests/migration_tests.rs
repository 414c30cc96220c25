//! Integration tests for ULT migration, blocking, and resumption.

mod common;

use common::with_runtime;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft_runtime::{
    ExecutionStream, FifoPool, Pool, RuntimeError, SchedConfig, SchedPredef, StreamState, Ult,
    UltAttrs, UltState,
};

fn stream_over(pool: &Arc<dyn Pool>) -> Arc<ExecutionStream> {
    ExecutionStream::create_with_sched(
        SchedPredef::Basic,
        vec![pool.clone()],
        SchedConfig::default(),
    )
    .unwrap()
}

/// A yielding ULT migrated from E1's pool to E2's pool runs on E2 from
/// the next dispatch on, E1 never re-pops it, and E1's in-flight migration
/// counter returns to zero. E2 is lazily started by the migration.
#[test]
fn test_migrate_between_streams() {
    with_runtime(|| {
        let p1: Arc<dyn Pool> = FifoPool::new();
        let p2: Arc<dyn Pool> = FifoPool::new();
        let e1 = stream_over(&p1);
        let e2 = stream_over(&p2);
        let e1_rank = e1.rank();
        let e2_rank = e2.rank();

        let ranks = Arc::new(Mutex::new(Vec::new()));
        let r = ranks.clone();
        // Creation auto-starts E1; E2 stays CREATED.
        let ult = Ult::create(&p1, move || loop {
            r.lock().push(ExecutionStream::current_rank().unwrap());
            weft_runtime::yield_now().unwrap();
        })
        .unwrap();

        while ranks.lock().len() < 3 {
            std::thread::yield_now();
        }
        assert_eq!(e2.state(), StreamState::Created);

        weft_runtime::migrate_to(&ult, &p2).unwrap();
        while !ranks.lock().contains(&e2_rank) {
            std::thread::yield_now();
        }

        ult.cancel();
        ult.join().unwrap();
        assert_eq!(p1.inflight_migrations(), 0);

        // Once on E2, never on E1 again.
        let observed = ranks.lock().clone();
        let first_on_e2 = observed.iter().position(|&r| r == e2_rank).unwrap();
        assert!(observed[..first_on_e2].iter().all(|&r| r == e1_rank));
        assert!(observed[first_on_e2..].iter().all(|&r| r == e2_rank));
        assert!(Arc::ptr_eq(&ult.last_stream().unwrap(), &e2));

        for stream in [&e1, &e2] {
            stream.join().unwrap();
            stream.free().unwrap();
        }
    });
}

/// Requesting the same migration twice counts once on the source pool,
/// and carrying it out clears only the migration request.
#[test]
fn test_repeated_migration_request_counts_once() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let source = primary.main_pools()[0].clone();
        let p2: Arc<dyn Pool> = FifoPool::new();
        let e2 = stream_over(&p2);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let ult = Ult::create(&source, move || loop {
            h.fetch_add(1, Ordering::SeqCst);
            weft_runtime::yield_now().unwrap();
        })
        .unwrap();

        weft_runtime::migrate_to(&ult, &p2).unwrap();
        weft_runtime::migrate_to(&ult, &p2).unwrap();
        assert_eq!(source.inflight_migrations(), 1);

        // The primary dispatch observes the request and hands the unit
        // over without running it; E2 is started lazily.
        weft_runtime::yield_now().unwrap();
        assert_eq!(source.inflight_migrations(), 0);

        while hits.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        ult.cancel();
        ult.join().unwrap();
        assert_eq!(ult.state(), UltState::Terminated);

        e2.join().unwrap();
        e2.free().unwrap();
    });
}

/// Migrating to a pool with no consumer leaves the unit parked there until
/// a stream adopts the pool.
#[test]
fn test_migrate_to_unbound_pool_orphans_unit() {
    with_runtime(|| {
        let p1: Arc<dyn Pool> = FifoPool::new();
        let e1 = stream_over(&p1);
        let parking: Arc<dyn Pool> = FifoPool::new();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let ult = Ult::create(&p1, move || loop {
            h.fetch_add(1, Ordering::SeqCst);
            weft_runtime::yield_now().unwrap();
        })
        .unwrap();

        while hits.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        weft_runtime::migrate_to(&ult, &parking).unwrap();
        while parking.is_empty() {
            std::thread::yield_now();
        }

        let stalled_at = hits.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), stalled_at);

        // Adoption: a new stream over the parked pool runs the unit again.
        let e2 = stream_over(&parking);
        e2.start().unwrap();
        while hits.load(Ordering::SeqCst) == stalled_at {
            std::thread::yield_now();
        }

        ult.cancel();
        ult.join().unwrap();
        for stream in [&e1, &e2] {
            stream.join().unwrap();
            stream.free().unwrap();
        }
    });
}

#[test]
fn test_migration_callback_runs_on_handoff() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let source = primary.main_pools()[0].clone();
        let p2: Arc<dyn Pool> = FifoPool::new();
        let e2 = stream_over(&p2);

        let notified = Arc::new(AtomicBool::new(false));
        let n = notified.clone();
        let attrs = UltAttrs::new().on_migration(move |_| n.store(true, Ordering::SeqCst));
        let ult = Ult::create_with_attrs(
            &source,
            || loop {
                weft_runtime::yield_now().unwrap();
            },
            attrs,
        )
        .unwrap();

        weft_runtime::migrate_to(&ult, &p2).unwrap();
        assert!(!notified.load(Ordering::SeqCst));
        weft_runtime::yield_now().unwrap();
        assert!(notified.load(Ordering::SeqCst));

        ult.cancel();
        ult.join().unwrap();
        e2.join().unwrap();
        e2.free().unwrap();
    });
}

#[test]
fn test_migrate_errors() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let pool = primary.main_pools()[0].clone();
        let target: Arc<dyn Pool> = FifoPool::new();

        let ult = Ult::create(&pool, || {}).unwrap();
        weft_runtime::yield_now().unwrap();
        assert_eq!(ult.state(), UltState::Terminated);
        assert!(matches!(
            weft_runtime::migrate_to(&ult, &target),
            Err(RuntimeError::InvalidUnit(_))
        ));
    });
}

#[test]
fn test_block_and_resume() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let pool = primary.main_pools()[0].clone();

        let progress = Arc::new(AtomicUsize::new(0));
        let p = progress.clone();
        let ult = Ult::create(&pool, move || {
            p.store(1, Ordering::SeqCst);
            weft_runtime::block().unwrap();
            p.store(2, Ordering::SeqCst);
        })
        .unwrap();

        weft_runtime::yield_now().unwrap();
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(ult.state(), UltState::Blocked);

        ult.resume().unwrap();
        weft_runtime::yield_now().unwrap();
        assert_eq!(progress.load(Ordering::SeqCst), 2);
        assert_eq!(ult.state(), UltState::Terminated);

        assert!(matches!(ult.resume(), Err(RuntimeError::InvalidUnit(_))));
    });
}
