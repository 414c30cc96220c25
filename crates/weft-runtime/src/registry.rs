//! The process-wide runtime singleton: stream registry, rank generation,
//! configuration, and the init/finalize entry points.
//!
//! Streams live in one of three lifecycle buckets — created, active,
//! deads — keyed by rank. The registry owns the stream handles; everything
//! else holds weak or borrowed references, which keeps the
//! stream ↔ scheduler ↔ unit cycle from leaking.

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::local;
use crate::stack_pool::StackPool;
use crate::stream::{ExecutionStream, StreamState};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default-size stacks kept for reuse.
const MAX_POOLED_STACKS: usize = 64;

#[derive(Default)]
struct Buckets {
    created: FxHashMap<u64, Arc<ExecutionStream>>,
    active: FxHashMap<u64, Arc<ExecutionStream>>,
    deads: FxHashMap<u64, Arc<ExecutionStream>>,
}

impl Buckets {
    fn take(&mut self, rank: u64) -> Option<Arc<ExecutionStream>> {
        self.created
            .remove(&rank)
            .or_else(|| self.active.remove(&rank))
            .or_else(|| self.deads.remove(&rank))
    }
}

pub(crate) struct Global {
    config: RuntimeConfig,
    stack_pool: StackPool,
    streams: Mutex<Buckets>,
    next_rank: AtomicU64,
    primary: Mutex<Option<Arc<ExecutionStream>>>,
}

impl Global {
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn stack_pool(&self) -> &StackPool {
        &self.stack_pool
    }

    /// Next rank from the process-global monotonic counter.
    pub(crate) fn new_rank(&self) -> u64 {
        self.next_rank.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_created(&self, stream: &Arc<ExecutionStream>) {
        self.streams
            .lock()
            .created
            .insert(stream.rank(), stream.clone());
    }

    pub(crate) fn move_to_active(&self, stream: &Arc<ExecutionStream>) {
        let mut buckets = self.streams.lock();
        buckets.take(stream.rank());
        buckets.active.insert(stream.rank(), stream.clone());
    }

    pub(crate) fn move_to_deads(&self, stream: &Arc<ExecutionStream>) {
        let mut buckets = self.streams.lock();
        buckets.take(stream.rank());
        buckets.deads.insert(stream.rank(), stream.clone());
    }

    pub(crate) fn remove(&self, stream: &Arc<ExecutionStream>) {
        self.streams.lock().take(stream.rank());
    }

    /// Re-key a stream under a caller-chosen rank. The caller is
    /// responsible for rank uniqueness.
    pub(crate) fn rebind_rank(&self, stream: &Arc<ExecutionStream>, rank: u64) {
        let mut buckets = self.streams.lock();
        let old = stream.rank();
        stream.store_rank(rank);
        if buckets.created.remove(&old).is_some() {
            buckets.created.insert(rank, stream.clone());
        } else if buckets.active.remove(&old).is_some() {
            buckets.active.insert(rank, stream.clone());
        } else if buckets.deads.remove(&old).is_some() {
            buckets.deads.insert(rank, stream.clone());
        }
    }

    /// Streams that exist from the user's point of view (not yet dead).
    fn num_alive(&self) -> usize {
        let buckets = self.streams.lock();
        buckets.created.len() + buckets.active.len()
    }

    fn non_primary_alive(&self) -> bool {
        let buckets = self.streams.lock();
        buckets
            .created
            .values()
            .chain(buckets.active.values())
            .any(|s| !s.is_primary())
    }
}

static GLOBAL: RwLock<Option<Arc<Global>>> = RwLock::new(None);

/// Initialize the runtime with configuration from the environment and
/// bind the primary stream to the calling thread.
pub fn init() -> Result<()> {
    init_with_config(RuntimeConfig::from_env())
}

/// Initialize the runtime with an explicit configuration.
pub fn init_with_config(config: RuntimeConfig) -> Result<()> {
    {
        let mut slot = GLOBAL.write();
        if slot.is_some() {
            return Err(RuntimeError::StreamState("runtime already initialized"));
        }
        let stack_pool = StackPool::new(config.default_stack_size, MAX_POOLED_STACKS);
        *slot = Some(Arc::new(Global {
            config,
            stack_pool,
            streams: Mutex::new(Buckets::default()),
            next_rank: AtomicU64::new(0),
            primary: Mutex::new(None),
        }));
    }

    match ExecutionStream::create_primary() {
        Ok(primary) => {
            let global = global()?;
            *global.primary.lock() = Some(primary);
            log::debug!("runtime initialized");
            Ok(())
        }
        Err(err) => {
            *GLOBAL.write() = None;
            Err(err)
        }
    }
}

/// Tear the runtime down. Must run on the primary stream's thread, outside
/// any work unit, after every secondary stream has been joined and freed.
/// Remaining work on the primary is drained first.
pub fn finalize() -> Result<()> {
    let global = global()?;
    let primary = global
        .primary
        .lock()
        .clone()
        .ok_or(RuntimeError::Uninitialized)?;
    match local::current_stream() {
        Some(current) if Arc::ptr_eq(&current, &primary) => {}
        _ => {
            return Err(RuntimeError::InvalidStream(
                "finalize must run on the primary stream's thread",
            ))
        }
    }
    if local::current_ult().is_some() || local::current_tasklet().is_some() {
        return Err(RuntimeError::InvalidStream("finalize cannot run from a work unit"));
    }

    primary.schedule_pass();

    if global.non_primary_alive() {
        return Err(RuntimeError::StreamState(
            "secondary streams still exist; join and free them first",
        ));
    }

    primary.set_state(StreamState::Terminated);
    if let Some(main) = primary.main_sched() {
        if main.is_automatic() {
            main.discard();
        }
    }
    global.remove(&primary);
    local::clear();
    *GLOBAL.write() = None;
    log::debug!("runtime finalized");
    Ok(())
}

/// Whether the runtime is initialized.
pub fn is_initialized() -> bool {
    GLOBAL.read().is_some()
}

/// Number of existing streams (created or active, dead ones excluded).
pub fn num_streams() -> Result<usize> {
    Ok(global()?.num_alive())
}

pub(crate) fn global() -> Result<Arc<Global>> {
    GLOBAL.read().clone().ok_or(RuntimeError::Uninitialized)
}
