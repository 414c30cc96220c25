//! Work units: the tagged variant a pool stores and a scheduler dispatches.

use crate::tasklet::Tasklet;
use crate::ult::Ult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a ULT.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UltId(u64);

static NEXT_ULT_ID: AtomicU64 = AtomicU64::new(1);

impl UltId {
    pub(crate) fn next() -> Self {
        UltId(NEXT_ULT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Unique identifier for a tasklet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskletId(u64);

static NEXT_TASKLET_ID: AtomicU64 = AtomicU64::new(1);

impl TaskletId {
    pub(crate) fn next() -> Self {
        TaskletId(NEXT_TASKLET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Kind of a work unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// A stackful, yieldable user-level thread.
    Ult,
    /// A stackless, run-to-completion tasklet.
    Tasklet,
}

/// A schedulable work unit: either a ULT or a tasklet.
///
/// Cloning is cheap (reference-counted); a unit may sit in at most one
/// pool at a time, but any number of handles to it may exist.
#[derive(Clone)]
pub enum WorkUnit {
    /// A user-level thread.
    Ult(Arc<Ult>),
    /// A tasklet.
    Tasklet(Arc<Tasklet>),
}

impl WorkUnit {
    /// Which variant this unit is.
    pub fn kind(&self) -> UnitKind {
        match self {
            WorkUnit::Ult(_) => UnitKind::Ult,
            WorkUnit::Tasklet(_) => UnitKind::Tasklet,
        }
    }

    /// The ULT behind this unit, if it is one.
    pub fn ult(&self) -> Option<&Arc<Ult>> {
        match self {
            WorkUnit::Ult(u) => Some(u),
            WorkUnit::Tasklet(_) => None,
        }
    }

    /// The tasklet behind this unit, if it is one.
    pub fn tasklet(&self) -> Option<&Arc<Tasklet>> {
        match self {
            WorkUnit::Tasklet(t) => Some(t),
            WorkUnit::Ult(_) => None,
        }
    }
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkUnit::Ult(u) => write!(f, "WorkUnit::Ult({})", u.id().as_u64()),
            WorkUnit::Tasklet(t) => write!(f, "WorkUnit::Tasklet({})", t.id().as_u64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = UltId::next();
        let b = UltId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }
}
