//! User-level threads: stackful, yieldable, migratable work units.
//!
//! A ULT owns a stack and a saved context. Its only suspension points are
//! an explicit [`yield_now`], a blocking primitive built on [`block`], and
//! the terminating return of its body. The entry trampoline marks the unit
//! TERMINATE when the body returns; the dispatcher decides the unit's fate
//! at every switch-back by inspecting its request word.

use crate::config::MIN_STACK_SIZE;
use crate::error::{Result, RuntimeError};
use crate::local;
use crate::pool::{self, Pool};
use crate::registry;
use crate::request::{RequestWord, ULT_REQ_BLOCK, ULT_REQ_CANCEL, ULT_REQ_EXIT, ULT_REQ_TERMINATE};
use crate::sched::{SchedKind, Scheduler};
use crate::stream::ExecutionStream;
use crate::unit::{UltId, WorkUnit};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use weft_context::{context_switch, Context, ContextStack};

/// State of a ULT.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum UltState {
    /// Sitting in a pool, waiting to be dispatched.
    Ready = 0,
    /// Currently executing on some stream.
    Running = 1,
    /// Out of every pool, waiting for another agent to resume it.
    Blocked = 2,
    /// Finished; joiners have been notified.
    Terminated = 3,
}

impl UltState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => UltState::Ready,
            1 => UltState::Running,
            2 => UltState::Blocked,
            3 => UltState::Terminated,
            _ => unreachable!("invalid ULT state {v}"),
        }
    }
}

type MigrationCallback = Box<dyn Fn(&Arc<Ult>) + Send + Sync>;

/// Creation attributes for a ULT.
#[derive(Default)]
pub struct UltAttrs {
    stack_size: Option<usize>,
    migration_callback: Option<MigrationCallback>,
}

impl UltAttrs {
    /// Attributes with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a specific stack size in bytes (clamped to a small minimum).
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Register a callback invoked when the unit is migrated. The callback
    /// runs under the unit's own lock and must not mutate the same unit's
    /// attributes or request another migration of it.
    pub fn on_migration<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<Ult>) + Send + Sync + 'static,
    {
        self.migration_callback = Some(Box::new(callback));
        self
    }
}

/// Attribute state guarded by the unit's lock: mutation of attributes and
/// extraction of the migration-request argument both go through it.
pub(crate) struct AttrState {
    pub(crate) migration_callback: Option<MigrationCallback>,
    pub(crate) migrate_target: Option<Arc<dyn Pool>>,
}

/// A stackful user-level thread.
pub struct Ult {
    id: UltId,
    state: AtomicU32,
    pub(crate) request: RequestWord,
    failed: AtomicBool,

    /// Saved register set; touched only by the kernel thread dispatching
    /// this unit.
    ctx: UnsafeCell<Context>,
    /// Backing stack; present from creation until termination.
    stack: Mutex<Option<ContextStack>>,
    body: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Raw `Arc<Ult>` lent to the entry trampoline; reclaimed exactly once
    /// at termination.
    entry_arg: AtomicUsize,

    attrs: Mutex<AttrState>,
    pool: Mutex<Option<Weak<dyn Pool>>>,
    last_stream: Mutex<Option<Weak<ExecutionStream>>>,
    /// Scheduler hosted by this unit, pushed on its stream at dispatch.
    hosted: Mutex<Option<Arc<Scheduler>>>,

    completion: Mutex<bool>,
    completion_cv: Condvar,
}

// SAFETY: `ctx` and the stack it points into are only accessed by the
// kernel thread currently dispatching this unit — a RUNNING ULT is current
// on exactly one stream, and a suspended one is touched by nobody until its
// next dispatch. Every other field is atomic or lock-protected.
unsafe impl Send for Ult {}
unsafe impl Sync for Ult {}

impl Ult {
    /// Create a ULT running `body` and push it into `pool`, starting the
    /// pool's consumer stream if it has never run.
    pub fn create<F>(pool: &Arc<dyn Pool>, body: F) -> Result<Arc<Ult>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::create_with_attrs(pool, body, UltAttrs::new())
    }

    /// Create a ULT with explicit attributes.
    pub fn create_with_attrs<F>(pool: &Arc<dyn Pool>, body: F, attrs: UltAttrs) -> Result<Arc<Ult>>
    where
        F: FnOnce() + Send + 'static,
    {
        let ult = Self::build(Box::new(body), attrs)?;
        ult.bind_pool(pool);
        pool::push_and_autostart(pool, WorkUnit::Ult(ult.clone()));
        Ok(ult)
    }

    /// Create a ULT that hosts `sched`: dispatching the unit pushes the
    /// scheduler onto the dispatching stream and runs its selection loop
    /// on the unit's stack.
    pub fn create_sched(pool: &Arc<dyn Pool>, sched: Arc<Scheduler>) -> Result<Arc<Ult>> {
        let body = {
            let sched = sched.clone();
            move || sched.run()
        };
        let ult = Self::build(Box::new(body), UltAttrs::new())?;
        *ult.hosted.lock() = Some(sched.clone());
        sched.set_kind(SchedKind::Ult);
        sched.set_thread(Some(&ult));
        ult.bind_pool(pool);
        pool::push_and_autostart(pool, WorkUnit::Ult(ult.clone()));
        Ok(ult)
    }

    /// Allocate the unit, its stack and its suspended context. The unit is
    /// not yet in any pool.
    fn build(body: Box<dyn FnOnce() + Send>, attrs: UltAttrs) -> Result<Arc<Ult>> {
        let global = registry::global()?;
        let stack_size = attrs
            .stack_size
            .unwrap_or(global.config().default_stack_size)
            .max(MIN_STACK_SIZE);
        let mut stack = global.stack_pool().acquire(stack_size);
        let stack_top = stack.top();

        let ult = Arc::new(Ult {
            id: UltId::next(),
            state: AtomicU32::new(UltState::Ready as u32),
            request: RequestWord::new(),
            failed: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::new()),
            stack: Mutex::new(None),
            body: Mutex::new(Some(body)),
            entry_arg: AtomicUsize::new(0),
            attrs: Mutex::new(AttrState {
                migration_callback: attrs.migration_callback,
                migrate_target: None,
            }),
            pool: Mutex::new(None),
            last_stream: Mutex::new(None),
            hosted: Mutex::new(None),
            completion: Mutex::new(false),
            completion_cv: Condvar::new(),
        });

        // Lend a counted reference to the context; terminate reclaims it.
        let arg = Arc::into_raw(ult.clone()) as usize;
        ult.entry_arg.store(arg, Ordering::Release);
        // SAFETY: the stack buffer's address is stable (heap allocation)
        // and the Ult, with it the context, lives at a stable Arc address.
        unsafe { (*ult.ctx.get()).init(ult_entry, arg, stack_top, std::ptr::null()) };
        *ult.stack.lock() = Some(stack);

        Ok(ult)
    }

    /// Unique id of this unit.
    pub fn id(&self) -> UltId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> UltState {
        UltState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Whether the unit's body panicked.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Request cancellation; honored at the unit's next dispatch.
    pub fn cancel(&self) {
        self.request.set(ULT_REQ_CANCEL);
    }

    /// Block until the unit terminates. Yields when called from a ULT,
    /// waits on the completion signal from an external thread.
    pub fn join(self: &Arc<Self>) -> Result<()> {
        if let Some(current) = local::current_ult() {
            if Arc::ptr_eq(&current, self) {
                return Err(RuntimeError::InvalidUnit("a unit cannot join itself"));
            }
        }
        loop {
            if self.state() == UltState::Terminated {
                return Ok(());
            }
            if yield_now().is_err() {
                let mut done = self.completion.lock();
                while !*done {
                    self.completion_cv.wait(&mut done);
                }
                return Ok(());
            }
        }
    }

    /// Re-push a blocked unit into its pool so it can run again.
    pub fn resume(self: &Arc<Self>) -> Result<()> {
        if self.state() != UltState::Blocked {
            return Err(RuntimeError::InvalidUnit("unit is not blocked"));
        }
        let pool = self
            .pool_upgrade()
            .ok_or(RuntimeError::InvalidPool("unit has no pool"))?;
        self.set_state(UltState::Ready);
        pool::push_and_autostart(&pool, WorkUnit::Ult(self.clone()));
        Ok(())
    }

    /// The ULT currently dispatched on this kernel thread, if any.
    pub fn current() -> Option<Arc<Ult>> {
        local::current_ult()
    }

    /// The stream this unit last ran on, if any.
    pub fn last_stream(&self) -> Option<Arc<ExecutionStream>> {
        self.last_stream.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_state(&self, state: UltState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    pub(crate) fn hosted_sched(&self) -> Option<Arc<Scheduler>> {
        self.hosted.lock().clone()
    }

    pub(crate) fn bind_pool(&self, pool: &Arc<dyn Pool>) {
        *self.pool.lock() = Some(Arc::downgrade(pool));
    }

    pub(crate) fn pool_upgrade(&self) -> Option<Arc<dyn Pool>> {
        self.pool.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_last_stream(&self, stream: &Arc<ExecutionStream>) {
        *self.last_stream.lock() = Some(Arc::downgrade(stream));
    }

    pub(crate) fn attr_state(&self) -> MutexGuard<'_, AttrState> {
        self.attrs.lock()
    }

    /// Finish the unit: mark it TERMINATED, release its stack and the
    /// trampoline's lent reference, and wake joiners. Idempotent.
    pub(crate) fn finalize(&self) {
        self.set_state(UltState::Terminated);
        *self.body.lock() = None;
        *self.hosted.lock() = None;
        *self.pool.lock() = None;

        let raw = self.entry_arg.swap(0, Ordering::AcqRel);
        if raw != 0 {
            // SAFETY: this is the pointer produced by Arc::into_raw at
            // creation, reclaimed exactly once (the swap above).
            unsafe { drop(Arc::from_raw(raw as *const Ult)) };
        }
        if let Some(stack) = self.stack.lock().take() {
            if let Ok(global) = registry::global() {
                global.stack_pool().release(stack);
            }
        }

        let mut done = self.completion.lock();
        *done = true;
        self.completion_cv.notify_all();
    }
}

impl std::fmt::Debug for Ult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ult")
            .field("id", &self.id.as_u64())
            .field("state", &self.state())
            .field("request", &self.request)
            .field("failed", &self.failed())
            .finish()
    }
}

/// Entry trampoline for every ULT context. Borrows the unit through the
/// lent reference (never drops it — `finalize` owns that), runs the body
/// with a panic guard, and marks the unit TERMINATE. The fallthrough to
/// the link context happens in the context primitive.
extern "C" fn ult_entry(arg: usize) {
    let ult = unsafe { &*(arg as *const Ult) };
    let body = ult.body.lock().take();
    if let Some(body) = body {
        if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
            ult.mark_failed();
            log::error!("ULT {} panicked; terminating the unit", ult.id.as_u64());
        }
    }
    ult.request.set(ULT_REQ_TERMINATE);
}

/// Yield the calling ULT back to its stream's top scheduler.
///
/// The dispatcher re-pushes the unit into its pool unless a terminating or
/// blocking request is pending. Called from the primary stream's main
/// context (no dispatched unit), this instead runs one scheduling pass of
/// the primary's main scheduler and returns when it drains.
pub fn yield_now() -> Result<()> {
    if !registry::is_initialized() {
        return Err(RuntimeError::Uninitialized);
    }
    let stream = local::current_stream()
        .ok_or(RuntimeError::InvalidStream("calling thread is not bound to a stream"))?;
    if local::current_tasklet().is_some() {
        return Err(RuntimeError::InvalidUnit("tasklets cannot yield"));
    }
    match local::current_ult() {
        Some(ult) => {
            let sched = stream
                .top_sched()
                .ok_or(RuntimeError::InvalidSched("stream has no active scheduler"))?;
            let to = sched.ctx_ptr();
            let from = ult.ctx_ptr();
            // SAFETY: `from` is the context of the unit running right here
            // and `to` is the scheduler context this dispatch came from,
            // suspended in run_unit. No lock is held across the switch.
            unsafe { context_switch(from, to) };
            Ok(())
        }
        None if stream.is_primary() => {
            stream.schedule_pass();
            Ok(())
        }
        None => Err(RuntimeError::InvalidUnit("no dispatched unit to yield")),
    }
}

/// Block the calling ULT: it leaves every pool until another agent calls
/// [`Ult::resume`] on it.
pub fn block() -> Result<()> {
    let ult = local::current_ult().ok_or(RuntimeError::InvalidUnit("only a ULT can block"))?;
    ult.request.set(ULT_REQ_BLOCK);
    ult.set_state(UltState::Blocked);
    yield_now()
}

/// Terminate the calling ULT at its next hand-off. Does not return to the
/// caller's body on success.
pub fn exit() -> Result<()> {
    let ult = local::current_ult().ok_or(RuntimeError::InvalidUnit("only a ULT can exit"))?;
    ult.request.set(ULT_REQ_EXIT);
    yield_now()
}
