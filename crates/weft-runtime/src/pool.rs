//! Pools of ready work units.
//!
//! A pool is a queue with a single *consumer*: the one execution stream
//! authorized to pop from it. Anyone — any stream, migration, or an
//! external thread — may push. The queueing discipline is pluggable; the
//! runtime ships a FIFO default and assumes nothing beyond the contract
//! below.

use crate::error::{Result, RuntimeError};
use crate::stream::{ExecutionStream, StreamState};
use crate::unit::WorkUnit;
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Contract every pool implementation must honor.
///
/// `pop` may only be called by the pool's consumer stream; `push` is open
/// to all. The in-flight migration counter tracks ULTs that have a pending
/// migration request naming this pool as their *source*.
pub trait Pool: Send + Sync {
    /// Add a ready unit. Callable from any thread.
    fn push(&self, unit: WorkUnit);

    /// Remove the next unit, or `None` if the pool is empty. Only the
    /// consumer stream may call this.
    fn pop(&self) -> Option<WorkUnit>;

    /// Number of queued units.
    fn len(&self) -> usize;

    /// Whether the pool is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The stream currently authorized to pop, if any.
    fn consumer(&self) -> Option<Arc<ExecutionStream>>;

    /// Bind `stream` as the consumer.
    ///
    /// Binding is write-once per activation: rebinding succeeds only once
    /// the previous consumer no longer schedules this pool, and fails with
    /// [`RuntimeError::ConsumerConflict`] otherwise.
    fn set_consumer(&self, stream: &Arc<ExecutionStream>) -> Result<()>;

    /// Note a migration request that will move a unit out of this pool.
    fn inc_inflight_migrations(&self);

    /// Note a completed migration out of this pool.
    fn dec_inflight_migrations(&self);

    /// Number of migration requests not yet carried out.
    fn inflight_migrations(&self) -> usize;
}

/// The default FIFO pool.
///
/// Backed by a concurrent injector queue, so cross-stream pushes (unit
/// creation, migration hand-off) need no lock on the hot path.
pub struct FifoPool {
    queue: Injector<WorkUnit>,
    consumer: Mutex<Option<Weak<ExecutionStream>>>,
    inflight_migrations: AtomicUsize,
}

impl FifoPool {
    /// Create an empty pool with no consumer.
    pub fn new() -> Arc<Self> {
        Arc::new(FifoPool {
            queue: Injector::new(),
            consumer: Mutex::new(None),
            inflight_migrations: AtomicUsize::new(0),
        })
    }
}

impl Pool for FifoPool {
    fn push(&self, unit: WorkUnit) {
        self.queue.push(unit);
    }

    fn pop(&self) -> Option<WorkUnit> {
        loop {
            match self.queue.steal() {
                Steal::Success(unit) => return Some(unit),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn consumer(&self) -> Option<Arc<ExecutionStream>> {
        self.consumer.lock().as_ref().and_then(Weak::upgrade)
    }

    fn set_consumer(&self, stream: &Arc<ExecutionStream>) -> Result<()> {
        let mut slot = self.consumer.lock();
        match slot.as_ref().and_then(Weak::upgrade) {
            None => {
                *slot = Some(Arc::downgrade(stream));
                Ok(())
            }
            Some(current) if Arc::ptr_eq(&current, stream) => Ok(()),
            Some(current) => {
                if current.consumer_released() {
                    *slot = Some(Arc::downgrade(stream));
                    Ok(())
                } else {
                    Err(RuntimeError::ConsumerConflict)
                }
            }
        }
    }

    fn inc_inflight_migrations(&self) {
        self.inflight_migrations.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_inflight_migrations(&self) {
        self.inflight_migrations.fetch_sub(1, Ordering::AcqRel);
    }

    fn inflight_migrations(&self) -> usize {
        self.inflight_migrations.load(Ordering::Acquire)
    }
}

/// Push a unit and lazily start the pool's consumer stream if it has never
/// run. This is how units pushed to a stream created-but-never-started get
/// their stream going.
pub(crate) fn push_and_autostart(pool: &Arc<dyn Pool>, unit: WorkUnit) {
    pool.push(unit);
    if let Some(consumer) = pool.consumer() {
        if consumer.state() == StreamState::Created {
            // A racing start elsewhere makes this a silent no-op.
            if let Err(err) = consumer.start() {
                log::warn!(
                    "auto-start of stream {} failed: {}",
                    consumer.rank(),
                    err
                );
            }
        }
    }
}
