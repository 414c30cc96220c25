//! Execution streams: kernel-thread-bound drivers of the scheduling loop.
//!
//! Each stream owns a stack of schedulers. The bottom entry is the main
//! scheduler, run directly on the stream's kernel stack; nested schedulers
//! are pushed during the dispatch of a hosting unit and popped when it
//! returns control. The primary stream runs on the thread that initialized
//! the runtime and is driven by yields from that thread's main context;
//! secondary streams spawn their own kernel thread.

use crate::error::{Result, RuntimeError};
use crate::local;
use crate::migrate;
use crate::pool::Pool;
use crate::registry;
use crate::request::{
    RequestWord, STREAM_REQ_CANCEL, STREAM_REQ_EXIT, STREAM_REQ_JOIN, TASK_REQ_CANCEL,
    ULT_REQ_BLOCK, ULT_REQ_CANCEL, ULT_REQ_EXIT, ULT_REQ_MIGRATE, ULT_REQ_ORPHAN,
    ULT_REQ_TERMINATE,
};
use crate::sched::{self, SchedKind, SchedState, Scheduler};
use crate::tasklet::{Tasklet, TaskletState};
use crate::ult::{self, Ult, UltState};
use crate::unit::WorkUnit;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use weft_context::context_switch;

/// State of an execution stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamState {
    /// Created, kernel thread not yet started.
    Created = 0,
    /// Started; between scheduling passes.
    Ready = 1,
    /// A scheduler's run is on its call chain.
    Running = 2,
    /// The loop has been left; the kernel thread is gone or going.
    Terminated = 3,
}

impl StreamState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => StreamState::Created,
            1 => StreamState::Ready,
            2 => StreamState::Running,
            3 => StreamState::Terminated,
            _ => unreachable!("invalid stream state {v}"),
        }
    }
}

/// Kind of an execution stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamType {
    /// The stream bound to the thread that initialized the runtime.
    /// Exactly one exists; it cannot be freed, joined or cancelled.
    Primary,
    /// A stream with its own kernel thread.
    Secondary,
}

/// A kernel-thread-bound execution stream.
pub struct ExecutionStream {
    rank: AtomicU64,
    xtype: StreamType,
    state: AtomicU32,
    pub(crate) request: RequestWord,

    /// Scheduler stack; index 0 is the main scheduler, the top is the one
    /// whose run is currently on the call chain. Mutated only by the
    /// stream's own kernel thread.
    scheds: Mutex<Vec<Arc<Scheduler>>>,
    main_sched: Mutex<Option<Arc<Scheduler>>>,
    name: Mutex<Option<String>>,

    /// Serializes nested-scheduler teardown against migration and
    /// consumer-binding readers of the top scheduler's state.
    top_sched_lock: Mutex<()>,

    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionStream {
    fn new(rank: u64, xtype: StreamType) -> Self {
        ExecutionStream {
            rank: AtomicU64::new(rank),
            xtype,
            state: AtomicU32::new(StreamState::Created as u32),
            request: RequestWord::new(),
            scheds: Mutex::new(Vec::new()),
            main_sched: Mutex::new(None),
            name: Mutex::new(None),
            top_sched_lock: Mutex::new(()),
            join_handle: Mutex::new(None),
        }
    }

    /// Create a secondary stream. With no scheduler given, a default
    /// scheduler with one private FIFO pool is created.
    pub fn create(sched: Option<Arc<Scheduler>>) -> Result<Arc<ExecutionStream>> {
        let sched = sched.unwrap_or_else(sched::default_sched);
        Self::create_internal(StreamType::Secondary, sched)
    }

    /// Create a secondary stream with a predefined scheduler over `pools`.
    pub fn create_with_sched(
        predef: crate::sched::SchedPredef,
        pools: Vec<Arc<dyn Pool>>,
        config: crate::sched::SchedConfig,
    ) -> Result<Arc<ExecutionStream>> {
        Self::create_internal(StreamType::Secondary, Scheduler::basic(predef, pools, config))
    }

    /// Create and start the primary stream on the calling thread. Called
    /// once, from runtime initialization.
    pub(crate) fn create_primary() -> Result<Arc<ExecutionStream>> {
        let sched = sched::default_sched();
        Self::create_internal(StreamType::Primary, sched)
    }

    fn create_internal(xtype: StreamType, sched: Arc<Scheduler>) -> Result<Arc<ExecutionStream>> {
        let global = registry::global()?;
        let stream = Arc::new(Self::new(global.new_rank(), xtype));
        global.add_created(&stream);
        if let Err(err) = stream.set_main_sched(&sched) {
            global.remove(&stream);
            return Err(err);
        }
        Ok(stream)
    }

    /// Start the stream: CAS CREATED → READY (silently a no-op if lost),
    /// push the main scheduler, and for a secondary spawn its kernel
    /// thread. The primary begins scheduling on its next yield instead.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let global = registry::global()?;
        if self
            .cas_state(StreamState::Created, StreamState::Ready)
            .is_err()
        {
            return Ok(());
        }
        let main = self
            .main_sched
            .lock()
            .clone()
            .ok_or(RuntimeError::InvalidSched("stream has no main scheduler"))?;
        sched::check_usable(&main)?;
        main.use_own_slot();
        main.set_state(SchedState::Ready);
        self.push_sched(&main);
        global.move_to_active(self);

        if self.is_primary() {
            local::set_stream(self.clone());
        } else {
            let stream = self.clone();
            let handle = thread::Builder::new()
                .name(format!("weft-es-{}", self.rank()))
                .spawn(move || stream.launch_main_sched())
                .map_err(|_| RuntimeError::Mem)?;
            *self.join_handle.lock() = Some(handle);
        }
        Ok(())
    }

    /// Kernel-thread entry of a secondary stream.
    fn launch_main_sched(self: Arc<Self>) {
        local::set_stream(self.clone());
        if let Ok(global) = registry::global() {
            if global.config().set_affinity {
                let cores = core_affinity::get_core_ids().unwrap_or_default();
                if !cores.is_empty() {
                    let core = cores[self.rank() as usize % cores.len()];
                    if !core_affinity::set_for_current(core) {
                        log::warn!("[ES{}] failed to set CPU affinity", self.rank());
                    }
                }
            }
        }
        self.run_loop();
    }

    /// The outer scheduling loop of a secondary stream.
    fn run_loop(self: &Arc<Self>) {
        log::debug!("[ES{}] start", self.rank());
        loop {
            self.schedule_pass();

            let request = self.request.load();
            // Exit and cancel terminate regardless of remaining work.
            if request & (STREAM_REQ_EXIT | STREAM_REQ_CANCEL) != 0 {
                break;
            }
            // Join terminates after the pass has drained the pools.
            if request & STREAM_REQ_JOIN != 0 {
                break;
            }
            if self.main_pools_empty() {
                thread::sleep(Duration::from_micros(100));
            }
        }
        self.set_state(StreamState::Terminated);
        if let Ok(global) = registry::global() {
            global.move_to_deads(self);
        }
        local::clear();
        log::debug!("[ES{}] end", self.rank());
    }

    /// One scheduling pass: run the main scheduler until it drains or
    /// stops. Also the unit of work behind a main-context yield on the
    /// primary stream.
    pub(crate) fn schedule_pass(self: &Arc<Self>) {
        let main = self.main_sched.lock().clone();
        let Some(main) = main else { return };
        self.set_state(StreamState::Running);
        main.set_state(SchedState::Running);
        main.run();
        main.set_state(SchedState::Terminated);
        self.set_state(StreamState::Ready);
    }

    /// Execute one unit popped from `pool` on this stream. Intended for
    /// scheduler policies; the caller must be running on this stream.
    pub fn run_unit(self: &Arc<Self>, unit: &WorkUnit, pool: &Arc<dyn Pool>) -> Result<()> {
        debug_assert!(pool
            .consumer()
            .map_or(true, |consumer| Arc::ptr_eq(&consumer, self)));
        match unit {
            WorkUnit::Ult(u) => self.schedule_ult(u),
            WorkUnit::Tasklet(t) => self.schedule_tasklet(t),
        }
    }

    /// Process pending stream requests on behalf of a running scheduler.
    /// Called periodically from scheduler policies.
    pub fn check_events(&self, sched: &Arc<Scheduler>) {
        let request = self.request.load();
        if request & STREAM_REQ_JOIN != 0 {
            sched.finish();
        }
        if request & (STREAM_REQ_EXIT | STREAM_REQ_CANCEL) != 0 {
            sched.exit();
        }
    }

    fn schedule_ult(self: &Arc<Self>, ult: &Arc<Ult>) -> Result<()> {
        let request = ult.request.load();
        if request & (ULT_REQ_CANCEL | ULT_REQ_EXIT) != 0 {
            self.terminate_ult(ult);
            return Ok(());
        }
        if request & ULT_REQ_MIGRATE != 0 {
            return migrate::execute(self, ult);
        }
        if request & ULT_REQ_ORPHAN != 0 {
            // Being dispatched again means a live consumer adopted it.
            ult.request.clear(ULT_REQ_ORPHAN);
        }

        let sched = self
            .top_sched()
            .ok_or(RuntimeError::InvalidSched("stream has no active scheduler"))?;
        let sched_ctx = sched.ctx_ptr();

        let prev = local::swap_units(Some(ult.clone()), None);

        // The unit hands control back to *this* dispatch on yield or
        // completion, whichever scheduler it was dispatched from.
        unsafe { (*ult.ctx_ptr()).set_link(sched_ctx) };

        let nested = ult.hosted_sched();
        if let Some(ns) = &nested {
            ns.set_ctx_ptr(ult.ctx_ptr());
            for pool in ns.pools() {
                if let Err(err) = pool.set_consumer(self) {
                    log::warn!(
                        "[ES{}] nested scheduler pool binding: {}",
                        self.rank(),
                        err
                    );
                }
            }
            self.push_sched(ns);
            ns.set_state(SchedState::Running);
        }

        ult.set_last_stream(self);
        ult.set_state(UltState::Running);
        log::trace!("[ES{}] ULT {} switch in", self.rank(), ult.id().as_u64());
        // SAFETY: `sched_ctx` is where the dispatching scheduler suspends
        // and the unit's context and stack are owned by the unit, which the
        // surrounding Arcs keep alive across the switch. No lock is held.
        unsafe { context_switch(sched_ctx, ult.ctx_ptr()) };

        // The scheduler continues here. The unit (and with it the stream)
        // is re-read: it may have been rebound while it ran.
        let ult = local::current_ult().unwrap_or_else(|| ult.clone());
        let stream = ult.last_stream().unwrap_or_else(|| self.clone());
        log::trace!("[ES{}] ULT {} switch out", stream.rank(), ult.id().as_u64());

        if let Some(ns) = ult.hosted_sched() {
            stream.pop_sched_stopped(&ns);
        }

        let request = ult.request.load();
        if request & (ULT_REQ_TERMINATE | ULT_REQ_CANCEL | ULT_REQ_EXIT) != 0 {
            stream.terminate_ult(&ult);
        } else if request & ULT_REQ_BLOCK != 0 {
            // Leave the unit out of every pool; the agent that blocked it
            // re-pushes it on resume.
            ult.request.clear(ULT_REQ_BLOCK);
        } else {
            ult.set_state(UltState::Ready);
            match ult.pool_upgrade() {
                Some(pool) => pool.push(WorkUnit::Ult(ult.clone())),
                None => {
                    log::warn!("ULT {} lost its pool; terminating", ult.id().as_u64());
                    ult.mark_failed();
                    stream.terminate_ult(&ult);
                }
            }
        }

        local::swap_units(prev.0, prev.1);
        Ok(())
    }

    fn schedule_tasklet(self: &Arc<Self>, tasklet: &Arc<Tasklet>) -> Result<()> {
        if tasklet.request.any(TASK_REQ_CANCEL) {
            tasklet.finalize();
            return Ok(());
        }

        let prev = local::swap_units(None, Some(tasklet.clone()));
        tasklet.set_state(TaskletState::Running);
        tasklet.set_last_stream(self);

        let nested = tasklet.hosted_sched();
        if let Some(ns) = &nested {
            // A tasklet has no context of its own: the nested scheduler
            // keeps dispatching from the current scheduler's context and
            // inherits its hosting-ULT slot.
            if let Some(top) = self.top_sched() {
                ns.set_ctx_ptr(top.ctx_ptr());
                ns.inherit_thread_from(&top);
            }
            for pool in ns.pools() {
                if let Err(err) = pool.set_consumer(self) {
                    log::warn!(
                        "[ES{}] nested scheduler pool binding: {}",
                        self.rank(),
                        err
                    );
                }
            }
            self.push_sched(ns);
            ns.set_state(SchedState::Running);
        }

        log::trace!("[ES{}] tasklet {} start", self.rank(), tasklet.id().as_u64());
        if let Some(body) = tasklet.take_body() {
            if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
                tasklet.mark_failed();
                log::error!(
                    "tasklet {} panicked; terminating the unit",
                    tasklet.id().as_u64()
                );
            }
        }
        log::trace!("[ES{}] tasklet {} end", self.rank(), tasklet.id().as_u64());

        if let Some(ns) = nested {
            self.pop_sched_stopped(&ns);
        }
        tasklet.finalize();
        local::swap_units(prev.0, prev.1);
        Ok(())
    }

    fn terminate_ult(self: &Arc<Self>, ult: &Arc<Ult>) {
        log::trace!("[ES{}] ULT {} terminated", self.rank(), ult.id().as_u64());
        ult.finalize();
    }

    /// Request that the stream terminate once its pools are drained, wait
    /// for it, and reap its kernel thread.
    ///
    /// Forbidden for the caller's own stream and for the primary. A stream
    /// that was never started is moved straight to TERMINATED.
    pub fn join(self: &Arc<Self>) -> Result<()> {
        if self.is_primary() {
            return Err(RuntimeError::InvalidStream("the primary stream cannot be joined"));
        }
        if let Some(current) = local::current_stream() {
            if Arc::ptr_eq(&current, self) {
                return Err(RuntimeError::InvalidStream("a stream cannot join itself"));
            }
        }
        let global = registry::global()?;

        if self.state() == StreamState::Created
            && self
                .cas_state(StreamState::Created, StreamState::Terminated)
                .is_ok()
        {
            // Never started: there is no kernel thread to wait for.
            global.move_to_deads(self);
            return Ok(());
        }

        self.request.set(STREAM_REQ_JOIN);
        while self.state() != StreamState::Terminated {
            if ult::yield_now().is_err() {
                thread::yield_now();
            }
        }
        if let Some(handle) = self.join_handle.lock().take() {
            handle
                .join()
                .map_err(|_| RuntimeError::InvalidStream("stream thread panicked"))?;
        }
        Ok(())
    }

    /// Request cancellation: the stream terminates at its next observation
    /// point regardless of remaining work.
    pub fn cancel(&self) -> Result<()> {
        if self.is_primary() {
            return Err(RuntimeError::InvalidStream("the primary stream cannot be cancelled"));
        }
        self.request.set(STREAM_REQ_CANCEL);
        Ok(())
    }

    /// Release the stream: join it if it still runs, then drop it from the
    /// registry. The handle itself is freed when the last `Arc` goes.
    pub fn free(self: &Arc<Self>) -> Result<()> {
        if self.is_primary() {
            return Err(RuntimeError::InvalidStream("the primary stream cannot be freed"));
        }
        if let Some(current) = local::current_stream() {
            if Arc::ptr_eq(&current, self) {
                return Err(RuntimeError::InvalidStream("a stream cannot free itself"));
            }
        }
        let global = registry::global()?;
        if self.state() != StreamState::Terminated {
            self.join()?;
        }
        // Teardown frees only runtime-owned schedulers; a caller-provided
        // one stays usable through the caller's handle.
        if let Some(main) = self.main_sched.lock().take() {
            if main.is_automatic() {
                main.discard();
            }
        }
        global.remove(self);
        Ok(())
    }

    /// Terminate the calling stream from one of its ULTs. Never returns to
    /// the calling unit on success; forbidden from a tasklet and on the
    /// primary stream.
    pub fn exit_self() -> Result<()> {
        if !registry::is_initialized() {
            return Err(RuntimeError::Uninitialized);
        }
        let stream = local::current_stream()
            .ok_or(RuntimeError::InvalidStream("calling thread is not bound to a stream"))?;
        if local::current_tasklet().is_some() {
            return Err(RuntimeError::InvalidStream("tasklets cannot terminate their stream"));
        }
        if stream.is_primary() {
            return Err(RuntimeError::InvalidStream("the primary stream cannot exit"));
        }
        stream.request.set(STREAM_REQ_EXIT);
        while stream.state() != StreamState::Terminated {
            ult::yield_now()?;
        }
        Ok(())
    }

    /// The stream bound to the calling kernel thread.
    pub fn current() -> Result<Arc<ExecutionStream>> {
        if !registry::is_initialized() {
            return Err(RuntimeError::Uninitialized);
        }
        local::current_stream()
            .ok_or(RuntimeError::InvalidStream("calling thread is not bound to a stream"))
    }

    /// Rank of the stream bound to the calling kernel thread.
    pub fn current_rank() -> Result<u64> {
        Ok(Self::current()?.rank())
    }

    /// This stream's rank.
    pub fn rank(&self) -> u64 {
        self.rank.load(Ordering::Acquire)
    }

    /// Re-rank the stream, re-keying it in the global registry.
    pub fn set_rank(self: &Arc<Self>, rank: u64) -> Result<()> {
        registry::global()?.rebind_rank(self, rank);
        Ok(())
    }

    pub(crate) fn store_rank(&self, rank: u64) {
        self.rank.store(rank, Ordering::Release);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        StreamState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Whether this is the primary stream.
    pub fn is_primary(&self) -> bool {
        self.xtype == StreamType::Primary
    }

    /// The stream's kind.
    pub fn stream_type(&self) -> StreamType {
        self.xtype
    }

    /// Set a human-readable label.
    pub fn set_name(&self, name: &str) {
        *self.name.lock() = Some(name.to_owned());
    }

    /// The stream's label, if one was set.
    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    /// Replace the main scheduler. Valid only while the stream is CREATED
    /// or READY; the previous main scheduler is discarded exactly once and
    /// the new one sits at the bottom of the stack on next start.
    pub fn set_main_sched(self: &Arc<Self>, sched: &Arc<Scheduler>) -> Result<()> {
        match self.state() {
            StreamState::Created | StreamState::Ready => {}
            _ => {
                return Err(RuntimeError::StreamState(
                    "main scheduler can only change before the stream runs",
                ))
            }
        }
        sched::check_usable(sched)?;
        for pool in sched.pools() {
            pool.set_consumer(self)?;
        }
        let previous = {
            let mut main = self.main_sched.lock();
            let previous = main.take();
            *main = Some(sched.clone());
            previous
        };
        if let Some(old) = previous {
            // The old scheduler is on the stack iff the stream started.
            if self.state() == StreamState::Ready {
                self.pop_sched();
            }
            // A replaced main scheduler is freed exactly once here,
            // automatic or not; only end-of-life teardown is gated.
            old.discard();
        }
        sched.set_kind(SchedKind::Ult);
        if self.is_primary() {
            // Restart so the new scheduler lands at the bottom of the
            // stack; the primary's main scheduler is always runtime-owned.
            sched.set_automatic(true);
            self.state
                .store(StreamState::Created as u32, Ordering::Release);
            self.start()?;
        }
        Ok(())
    }

    /// The current main scheduler.
    pub fn main_sched(&self) -> Option<Arc<Scheduler>> {
        self.main_sched.lock().clone()
    }

    /// The pools of the main scheduler.
    pub fn main_pools(&self) -> Vec<Arc<dyn Pool>> {
        self.main_sched
            .lock()
            .as_ref()
            .map(|s| s.pools().to_vec())
            .unwrap_or_default()
    }

    /// Depth of the scheduler stack.
    pub fn num_scheds(&self) -> usize {
        self.scheds.lock().len()
    }

    pub(crate) fn push_sched(&self, sched: &Arc<Scheduler>) {
        self.scheds.lock().push(sched.clone());
    }

    pub(crate) fn pop_sched(&self) -> Option<Arc<Scheduler>> {
        self.scheds.lock().pop()
    }

    /// Pop a nested scheduler and mark it STOPPED, under the top-of-stack
    /// lock so concurrent readers of the top scheduler's state see either
    /// the running scheduler or the stopped one, never a torn in-between.
    pub(crate) fn pop_sched_stopped(&self, expected: &Arc<Scheduler>) {
        let _guard = self.top_sched_lock.lock();
        if let Some(popped) = self.scheds.lock().pop() {
            debug_assert!(Arc::ptr_eq(&popped, expected));
            popped.set_state(SchedState::Stopped);
        }
    }

    pub(crate) fn top_sched(&self) -> Option<Arc<Scheduler>> {
        self.scheds.lock().last().cloned()
    }

    /// Whether this stream no longer schedules its pools, observed under
    /// the top-of-stack lock. Used when rebinding a pool's consumer.
    pub(crate) fn consumer_released(&self) -> bool {
        let _guard = self.top_sched_lock.lock();
        match self.state() {
            StreamState::Created | StreamState::Terminated => true,
            _ => match self.top_sched() {
                None => true,
                Some(top) => matches!(top.state(), SchedState::Stopped | SchedState::Terminated),
            },
        }
    }

    fn main_pools_empty(&self) -> bool {
        self.main_sched
            .lock()
            .as_ref()
            .map(|s| s.pools_empty())
            .unwrap_or(true)
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u32, Ordering::Release);
    }

    fn cas_state(&self, from: StreamState, to: StreamState) -> std::result::Result<(), ()> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ())
    }
}

impl PartialEq for ExecutionStream {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for ExecutionStream {}

impl std::fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("rank", &self.rank())
            .field("type", &self.xtype)
            .field("state", &self.state())
            .field("request", &self.request)
            .field("num_scheds", &self.num_scheds())
            .field("name", &*self.name.lock())
            .finish()
    }
}
