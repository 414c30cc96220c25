//! Schedulers: pluggable unit-selection policies over a set of pools.
//!
//! A scheduler's `run` is executed either directly on its stream's kernel
//! stack (main schedulers) or on the stack of a hosting work unit (nested
//! schedulers). The selection policy is pluggable through [`SchedPolicy`];
//! the runtime ships [`BasicPolicy`], a round-robin sweep over the
//! scheduler's pools.

use crate::error::{Result, RuntimeError};
use crate::local;
use crate::pool::{FifoPool, Pool};
use crate::request::{RequestWord, SCHED_REQ_EXIT, SCHED_REQ_FINISH};
use crate::ult::Ult;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use weft_context::Context;

/// State of a scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum SchedState {
    /// Constructed, not yet running.
    Ready = 0,
    /// Its `run` is on some stream's call chain.
    Running = 1,
    /// Popped from a stream's scheduler stack after a nested run.
    Stopped = 2,
    /// Its `run` returned at the stream's loop level, or it was discarded.
    Terminated = 3,
}

impl SchedState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => SchedState::Ready,
            1 => SchedState::Running,
            2 => SchedState::Stopped,
            3 => SchedState::Terminated,
            _ => unreachable!("invalid scheduler state {v}"),
        }
    }
}

/// What kind of unit hosts the scheduler's `run`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum SchedKind {
    /// Hosted by a ULT (all main schedulers are this kind).
    Ult = 0,
    /// Hosted by a tasklet.
    Tasklet = 1,
}

/// Predefined scheduler flavors for [`Scheduler::basic`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedPredef {
    /// The runtime's default policy (currently [`SchedPredef::Basic`]).
    Default,
    /// Round-robin sweep over the pools.
    Basic,
}

/// Scheduler construction parameters.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Dispatch count between event checks during a sweep.
    pub event_freq: u32,
    /// Whether the runtime frees the scheduler on stream teardown.
    pub automatic: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            event_freq: 16,
            automatic: false,
        }
    }
}

/// A unit-selection policy.
///
/// `run` must repeatedly select units from `sched`'s pools, dispatch them
/// through the current stream's `run_unit`, and call `check_events` at the
/// cadence set by the scheduler config. It must stop immediately once EXIT
/// has been posted, drain its pools first when FINISH has been posted, and
/// return when a selection sweep finds no work (the stream loop re-enters
/// it).
pub trait SchedPolicy: Send + Sync {
    /// Execute the selection loop on the current stream.
    fn run(&self, sched: &Arc<Scheduler>);
}

/// A pluggable scheduler bound to one or more pools.
pub struct Scheduler {
    state: AtomicU32,
    kind: AtomicU32,
    automatic: AtomicBool,
    pub(crate) request: RequestWord,
    pools: Vec<Arc<dyn Pool>>,
    policy: Box<dyn SchedPolicy>,
    event_freq: u32,

    /// Hosting ULT; `None` for main schedulers, which run directly on
    /// their stream's kernel stack.
    thread: Mutex<Option<Weak<Ult>>>,

    /// Where this scheduler's `run` is suspended: the save slot below for
    /// main schedulers, the hosting unit's context for nested ones.
    ctx: AtomicPtr<Context>,
    /// Save area used when this scheduler runs as a main scheduler.
    own_slot: UnsafeCell<Context>,
}

// SAFETY: `own_slot` and the pointer in `ctx` are only used by the kernel
// thread whose stream currently has this scheduler on its stack; the
// remaining fields are atomic or lock-protected.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    /// Create a scheduler with a predefined policy. An empty `pools`
    /// creates one private FIFO pool automatically.
    pub fn basic(
        predef: SchedPredef,
        pools: Vec<Arc<dyn Pool>>,
        config: SchedConfig,
    ) -> Arc<Scheduler> {
        let policy: Box<dyn SchedPolicy> = match predef {
            SchedPredef::Default | SchedPredef::Basic => Box::new(BasicPolicy),
        };
        Self::with_policy(policy, pools, config)
    }

    /// Create a scheduler with a caller-provided policy.
    pub fn with_policy(
        policy: Box<dyn SchedPolicy>,
        mut pools: Vec<Arc<dyn Pool>>,
        config: SchedConfig,
    ) -> Arc<Scheduler> {
        if pools.is_empty() {
            let private: Arc<dyn Pool> = FifoPool::new();
            pools.push(private);
        }
        Arc::new(Scheduler {
            state: AtomicU32::new(SchedState::Ready as u32),
            kind: AtomicU32::new(SchedKind::Ult as u32),
            automatic: AtomicBool::new(config.automatic),
            request: RequestWord::new(),
            pools,
            policy,
            event_freq: config.event_freq.max(1),
            thread: Mutex::new(None),
            ctx: AtomicPtr::new(std::ptr::null_mut()),
            own_slot: UnsafeCell::new(Context::new()),
        })
    }

    /// Execute the scheduler's selection loop on the current stream.
    pub fn run(self: &Arc<Self>) {
        self.policy.run(self);
    }

    /// Current state.
    pub fn state(&self) -> SchedState {
        SchedState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// What kind of unit hosts this scheduler.
    pub fn kind(&self) -> SchedKind {
        match self.kind.load(Ordering::Acquire) {
            0 => SchedKind::Ult,
            _ => SchedKind::Tasklet,
        }
    }

    /// The pools this scheduler selects from.
    pub fn pools(&self) -> &[Arc<dyn Pool>] {
        &self.pools
    }

    /// Whether every pool is empty.
    pub fn pools_empty(&self) -> bool {
        self.pools.iter().all(|p| p.is_empty())
    }

    /// Dispatch count between event checks.
    pub fn event_freq(&self) -> u32 {
        self.event_freq
    }

    /// Post a soft stop: `run` drains its pools, then returns.
    pub fn finish(&self) {
        self.request.set(SCHED_REQ_FINISH);
    }

    /// Post a hard stop: `run` returns at the next observation point.
    pub fn exit(&self) {
        self.request.set(SCHED_REQ_EXIT);
    }

    /// Whether the runtime frees this scheduler on stream teardown.
    pub fn is_automatic(&self) -> bool {
        self.automatic.load(Ordering::Acquire)
    }

    /// The ULT hosting this scheduler's `run`, if any.
    pub fn thread(&self) -> Option<Arc<Ult>> {
        self.thread.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Mark the scheduler discarded. The allocation is freed when the last
    /// handle drops.
    pub fn discard(&self) {
        self.set_state(SchedState::Terminated);
        *self.thread.lock() = None;
    }

    pub(crate) fn set_state(&self, state: SchedState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub(crate) fn set_kind(&self, kind: SchedKind) {
        self.kind.store(kind as u32, Ordering::Release);
    }

    pub(crate) fn set_automatic(&self, automatic: bool) {
        self.automatic.store(automatic, Ordering::Release);
    }

    pub(crate) fn set_thread(&self, ult: Option<&Arc<Ult>>) {
        *self.thread.lock() = ult.map(Arc::downgrade);
    }

    /// Inherit the hosting-ULT slot from the scheduler below on the stack
    /// (tasklet-hosted nesting).
    pub(crate) fn inherit_thread_from(&self, parent: &Scheduler) {
        *self.thread.lock() = parent.thread.lock().clone();
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.load(Ordering::Acquire)
    }

    pub(crate) fn set_ctx_ptr(&self, ctx: *mut Context) {
        self.ctx.store(ctx, Ordering::Release);
    }

    /// Point the scheduler at its own save slot (main-scheduler mode).
    pub(crate) fn use_own_slot(&self) {
        self.ctx.store(self.own_slot.get(), Ordering::Release);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("kind", &self.kind())
            .field("num_pools", &self.pools.len())
            .field("automatic", &self.is_automatic())
            .field("request", &self.request)
            .finish()
    }
}

/// Round-robin sweep over the scheduler's pools: one unit per pool per
/// sweep, an event check every `event_freq` dispatches and at the end of
/// every sweep.
pub struct BasicPolicy;

impl SchedPolicy for BasicPolicy {
    fn run(&self, sched: &Arc<Scheduler>) {
        let Some(stream) = local::current_stream() else {
            log::error!("scheduler run outside any stream");
            return;
        };
        let mut dispatched: u32 = 0;
        loop {
            let mut ran = false;
            for pool in sched.pools() {
                if let Some(unit) = pool.pop() {
                    if let Err(err) = stream.run_unit(&unit, pool) {
                        log::error!("dispatch failed on stream {}: {}", stream.rank(), err);
                    }
                    ran = true;
                    dispatched += 1;
                    if dispatched % sched.event_freq() == 0 {
                        stream.check_events(sched);
                    }
                }
            }
            stream.check_events(sched);

            let request = sched.request.load();
            if request & SCHED_REQ_EXIT != 0 {
                break;
            }
            if request & SCHED_REQ_FINISH != 0 && sched.pools_empty() {
                break;
            }
            if !ran {
                // Drained; the stream loop decides whether to re-enter.
                break;
            }
        }
    }
}

/// Convenience used by public stream operations that take an optional
/// scheduler: materialize the default when none was given. Runtime-created
/// schedulers are automatic, so stream teardown frees them.
pub(crate) fn default_sched() -> Arc<Scheduler> {
    Scheduler::basic(
        SchedPredef::Default,
        Vec::new(),
        SchedConfig {
            automatic: true,
            ..SchedConfig::default()
        },
    )
}

/// Validate that a scheduler is still usable as a main scheduler.
pub(crate) fn check_usable(sched: &Arc<Scheduler>) -> Result<()> {
    match sched.state() {
        SchedState::Terminated => Err(RuntimeError::InvalidSched("scheduler was discarded")),
        _ => Ok(()),
    }
}
