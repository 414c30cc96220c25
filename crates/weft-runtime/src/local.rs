//! Per-kernel-thread runtime state: the current execution stream and the
//! currently dispatched ULT or tasklet.
//!
//! Set on stream entry and cleared on stream exit. The dispatcher saves
//! and restores the (ULT, tasklet) pair around every dispatch so nesting
//! works. No borrow of this state is ever held across a context switch;
//! accessors clone out what they need.

use crate::stream::ExecutionStream;
use crate::tasklet::Tasklet;
use crate::ult::Ult;
use std::cell::RefCell;
use std::sync::Arc;

struct LocalState {
    stream: Arc<ExecutionStream>,
    ult: Option<Arc<Ult>>,
    tasklet: Option<Arc<Tasklet>>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalState>> = const { RefCell::new(None) };
}

/// Bind this kernel thread to `stream`.
pub(crate) fn set_stream(stream: Arc<ExecutionStream>) {
    LOCAL.with(|slot| {
        *slot.borrow_mut() = Some(LocalState {
            stream,
            ult: None,
            tasklet: None,
        });
    });
}

/// Clear all per-thread state (stream exit).
pub(crate) fn clear() {
    LOCAL.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

/// The execution stream bound to this kernel thread, if any.
pub(crate) fn current_stream() -> Option<Arc<ExecutionStream>> {
    LOCAL.with(|slot| slot.borrow().as_ref().map(|s| s.stream.clone()))
}

/// The ULT currently dispatched on this kernel thread, if any.
pub(crate) fn current_ult() -> Option<Arc<Ult>> {
    LOCAL.with(|slot| slot.borrow().as_ref().and_then(|s| s.ult.clone()))
}

/// The tasklet currently dispatched on this kernel thread, if any.
pub(crate) fn current_tasklet() -> Option<Arc<Tasklet>> {
    LOCAL.with(|slot| slot.borrow().as_ref().and_then(|s| s.tasklet.clone()))
}

/// Install a new (ULT, tasklet) pair and return the previous one.
///
/// Returns `(None, None)` when the thread is not bound to a stream; the
/// matching restore is then a no-op.
pub(crate) fn swap_units(
    ult: Option<Arc<Ult>>,
    tasklet: Option<Arc<Tasklet>>,
) -> (Option<Arc<Ult>>, Option<Arc<Tasklet>>) {
    LOCAL.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(state) => {
                let prev_ult = std::mem::replace(&mut state.ult, ult);
                let prev_tasklet = std::mem::replace(&mut state.tasklet, tasklet);
                (prev_ult, prev_tasklet)
            }
            None => (None, None),
        }
    })
}
