//! Tasklets: stackless, run-to-completion work units.
//!
//! A tasklet never suspends: its body runs inline on the dispatching
//! scheduler's stack and must not rely on any per-ULT thread-local state.

use crate::error::{Result, RuntimeError};
use crate::local;
use crate::pool::{self, Pool};
use crate::request::{RequestWord, TASK_REQ_CANCEL};
use crate::sched::Scheduler;
use crate::stream::ExecutionStream;
use crate::ult;
use crate::unit::{TaskletId, WorkUnit};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// State of a tasklet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskletState {
    /// Sitting in a pool, waiting to be dispatched.
    Ready = 0,
    /// Currently executing inline on some stream.
    Running = 1,
    /// Finished; joiners have been notified.
    Terminated = 2,
}

impl TaskletState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => TaskletState::Ready,
            1 => TaskletState::Running,
            2 => TaskletState::Terminated,
            _ => unreachable!("invalid tasklet state {v}"),
        }
    }
}

/// A stackless work unit.
pub struct Tasklet {
    id: TaskletId,
    state: AtomicU32,
    pub(crate) request: RequestWord,
    failed: AtomicBool,

    body: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    pool: Mutex<Option<Weak<dyn Pool>>>,
    last_stream: Mutex<Option<Weak<ExecutionStream>>>,
    /// Scheduler hosted by this unit, pushed on its stream at dispatch.
    hosted: Mutex<Option<Arc<Scheduler>>>,

    completion: Mutex<bool>,
    completion_cv: Condvar,
}

impl Tasklet {
    /// Create a tasklet running `body` and push it into `pool`, starting
    /// the pool's consumer stream if it has never run.
    pub fn create<F>(pool: &Arc<dyn Pool>, body: F) -> Result<Arc<Tasklet>>
    where
        F: FnOnce() + Send + 'static,
    {
        let tasklet = Self::detached(body);
        tasklet.bind_pool(pool);
        pool::push_and_autostart(pool, WorkUnit::Tasklet(tasklet.clone()));
        Ok(tasklet)
    }

    /// Create a tasklet that hosts `sched`: dispatching the unit pushes
    /// the scheduler onto the dispatching stream and runs its selection
    /// loop inline.
    pub fn create_sched(pool: &Arc<dyn Pool>, sched: Arc<Scheduler>) -> Result<Arc<Tasklet>> {
        let body = {
            let sched = sched.clone();
            move || sched.run()
        };
        let tasklet = Self::detached(body);
        *tasklet.hosted.lock() = Some(sched.clone());
        sched.set_kind(crate::sched::SchedKind::Tasklet);
        tasklet.bind_pool(pool);
        pool::push_and_autostart(pool, WorkUnit::Tasklet(tasklet.clone()));
        Ok(tasklet)
    }

    /// Build a tasklet that is not in any pool yet.
    pub(crate) fn detached<F>(body: F) -> Arc<Tasklet>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Tasklet {
            id: TaskletId::next(),
            state: AtomicU32::new(TaskletState::Ready as u32),
            request: RequestWord::new(),
            failed: AtomicBool::new(false),
            body: Mutex::new(Some(Box::new(body))),
            pool: Mutex::new(None),
            last_stream: Mutex::new(None),
            hosted: Mutex::new(None),
            completion: Mutex::new(false),
            completion_cv: Condvar::new(),
        })
    }

    /// Unique id of this unit.
    pub fn id(&self) -> TaskletId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TaskletState {
        TaskletState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Whether the unit's body panicked.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Request cancellation; honored at the unit's next dispatch.
    pub fn cancel(&self) {
        self.request.set(TASK_REQ_CANCEL);
    }

    /// Block until the tasklet terminates. Yields when called from a ULT,
    /// waits on the completion signal from an external thread.
    pub fn join(self: &Arc<Self>) -> Result<()> {
        if let Some(current) = local::current_tasklet() {
            if Arc::ptr_eq(&current, self) {
                return Err(RuntimeError::InvalidUnit("a unit cannot join itself"));
            }
        }
        loop {
            if self.state() == TaskletState::Terminated {
                return Ok(());
            }
            if ult::yield_now().is_err() {
                let mut done = self.completion.lock();
                while !*done {
                    self.completion_cv.wait(&mut done);
                }
                return Ok(());
            }
        }
    }

    /// The tasklet currently dispatched on this kernel thread, if any.
    pub fn current() -> Option<Arc<Tasklet>> {
        local::current_tasklet()
    }

    /// The stream this unit last ran on, if any.
    pub fn last_stream(&self) -> Option<Arc<ExecutionStream>> {
        self.last_stream.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_state(&self, state: TaskletState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn take_body(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.body.lock().take()
    }

    pub(crate) fn hosted_sched(&self) -> Option<Arc<Scheduler>> {
        self.hosted.lock().clone()
    }

    pub(crate) fn bind_pool(&self, pool: &Arc<dyn Pool>) {
        *self.pool.lock() = Some(Arc::downgrade(pool));
    }

    pub(crate) fn set_last_stream(&self, stream: &Arc<ExecutionStream>) {
        *self.last_stream.lock() = Some(Arc::downgrade(stream));
    }

    /// Finish the unit: mark it TERMINATED and wake joiners. Idempotent.
    pub(crate) fn finalize(&self) {
        self.set_state(TaskletState::Terminated);
        *self.body.lock() = None;
        *self.hosted.lock() = None;
        *self.pool.lock() = None;

        let mut done = self.completion.lock();
        *done = true;
        self.completion_cv.notify_all();
    }
}

impl std::fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasklet")
            .field("id", &self.id.as_u64())
            .field("state", &self.state())
            .field("request", &self.request)
            .field("failed", &self.failed())
            .finish()
    }
}
