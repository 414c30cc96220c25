//! Integration tests for nested schedulers hosted by work units.

mod common;

use common::with_runtime;
use parking_lot::Mutex;
use std::sync::Arc;
use weft_runtime::{
    ExecutionStream, FifoPool, Pool, RuntimeError, SchedConfig, SchedKind, SchedPredef,
    SchedState, Scheduler, Tasklet, TaskletState, Ult, UltState,
};

/// A ULT hosting a scheduler over one pool of three tasklets runs them
/// all exactly once, then the primary scheduler resumes with its stack
/// back to one entry.
#[test]
fn test_ult_hosted_nested_scheduler() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let main_pool = primary.main_pools()[0].clone();

        let nested_pool: Arc<dyn Pool> = FifoPool::new();
        let nested = Scheduler::basic(
            SchedPredef::Basic,
            vec![nested_pool.clone()],
            SchedConfig::default(),
        );

        let runs = Arc::new(Mutex::new(Vec::new()));
        let mut tasklets = Vec::new();
        for i in 0..3 {
            let runs = runs.clone();
            tasklets.push(Tasklet::create(&nested_pool, move || runs.lock().push(i)).unwrap());
        }

        let host = Ult::create_sched(&main_pool, nested.clone()).unwrap();
        weft_runtime::yield_now().unwrap();

        assert_eq!(*runs.lock(), vec![0, 1, 2]);
        for tasklet in &tasklets {
            assert_eq!(tasklet.state(), TaskletState::Terminated);
        }
        assert_eq!(host.state(), UltState::Terminated);
        assert_eq!(nested.state(), SchedState::Stopped);
        assert_eq!(nested.kind(), SchedKind::Ult);
        assert_eq!(primary.num_scheds(), 1);
    });
}

#[test]
fn test_tasklet_hosted_nested_scheduler() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let main_pool = primary.main_pools()[0].clone();

        let nested_pool: Arc<dyn Pool> = FifoPool::new();
        let nested = Scheduler::basic(
            SchedPredef::Basic,
            vec![nested_pool.clone()],
            SchedConfig::default(),
        );

        let runs = Arc::new(Mutex::new(0usize));
        for _ in 0..2 {
            let runs = runs.clone();
            Tasklet::create(&nested_pool, move || *runs.lock() += 1).unwrap();
        }

        let host = Tasklet::create_sched(&main_pool, nested.clone()).unwrap();
        weft_runtime::yield_now().unwrap();

        assert_eq!(*runs.lock(), 2);
        assert_eq!(host.state(), TaskletState::Terminated);
        assert_eq!(nested.state(), SchedState::Stopped);
        assert_eq!(nested.kind(), SchedKind::Tasklet);
        assert_eq!(primary.num_scheds(), 1);
    });
}

/// A nested scheduler can itself dispatch ULTs; yields inside the nested
/// scheduler return to it, not to the primary scheduler.
#[test]
fn test_nested_scheduler_dispatches_ults() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let main_pool = primary.main_pools()[0].clone();

        let nested_pool: Arc<dyn Pool> = FifoPool::new();
        let nested = Scheduler::basic(
            SchedPredef::Basic,
            vec![nested_pool.clone()],
            SchedConfig::default(),
        );

        let trace = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let trace = trace.clone();
            Ult::create(&nested_pool, move || {
                trace.lock().push(format!("{name}:1"));
                weft_runtime::yield_now().unwrap();
                trace.lock().push(format!("{name}:2"));
            })
            .unwrap();
        }

        let host = Ult::create_sched(&main_pool, nested).unwrap();
        weft_runtime::yield_now().unwrap();

        assert_eq!(*trace.lock(), vec!["a:1", "b:1", "a:2", "b:2"]);
        assert_eq!(host.state(), UltState::Terminated);
        assert_eq!(primary.num_scheds(), 1);
    });
}

/// A tasklet may not terminate its stream; the call fails and the
/// tasklet completes normally.
#[test]
fn test_tasklet_cannot_exit_stream() {
    with_runtime(|| {
        let stream = ExecutionStream::create(None).unwrap();
        let pool = stream.main_pools()[0].clone();

        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        let tasklet = Tasklet::create(&pool, move || {
            *r.lock() = Some(ExecutionStream::exit_self());
        })
        .unwrap();

        tasklet.join().unwrap();
        assert!(matches!(
            *result.lock(),
            Some(Err(RuntimeError::InvalidStream(_)))
        ));
        assert_eq!(tasklet.state(), TaskletState::Terminated);
        assert!(!tasklet.failed());

        stream.join().unwrap();
        stream.free().unwrap();
    });
}

#[test]
fn test_tasklet_cannot_yield() {
    with_runtime(|| {
        let primary = ExecutionStream::current().unwrap();
        let pool = primary.main_pools()[0].clone();

        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        let tasklet = Tasklet::create(&pool, move || {
            *r.lock() = Some(weft_runtime::yield_now());
        })
        .unwrap();

        weft_runtime::yield_now().unwrap();
        assert_eq!(tasklet.state(), TaskletState::Terminated);
        assert!(matches!(
            *result.lock(),
            Some(Err(RuntimeError::InvalidUnit(_)))
        ));
    });
}
