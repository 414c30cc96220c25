//! Request words: the atomic bit vocabulary through which external agents
//! deliver control requests to streams and work units.
//!
//! Setting a bit is a hint that becomes effective no later than the next
//! observation point (scheduler entry, dispatcher entry, post-switch).
//! Honoring a request clears only that request's bit.

use std::sync::atomic::{AtomicU32, Ordering};

// Execution stream requests.
pub(crate) const STREAM_REQ_JOIN: u32 = 1 << 0;
pub(crate) const STREAM_REQ_EXIT: u32 = 1 << 1;
pub(crate) const STREAM_REQ_CANCEL: u32 = 1 << 2;
// Reserved for the event queue.
#[allow(dead_code)]
pub(crate) const STREAM_REQ_STOP: u32 = 1 << 3;

// ULT requests.
pub(crate) const ULT_REQ_TERMINATE: u32 = 1 << 0;
pub(crate) const ULT_REQ_CANCEL: u32 = 1 << 1;
pub(crate) const ULT_REQ_EXIT: u32 = 1 << 2;
pub(crate) const ULT_REQ_MIGRATE: u32 = 1 << 3;
pub(crate) const ULT_REQ_BLOCK: u32 = 1 << 4;
pub(crate) const ULT_REQ_ORPHAN: u32 = 1 << 5;

// Tasklet requests.
pub(crate) const TASK_REQ_CANCEL: u32 = 1 << 0;

// Scheduler requests.
pub(crate) const SCHED_REQ_FINISH: u32 = 1 << 0;
pub(crate) const SCHED_REQ_EXIT: u32 = 1 << 1;

/// An OR-able bag of request bits with acquire-release semantics.
pub(crate) struct RequestWord(AtomicU32);

impl RequestWord {
    pub(crate) const fn new() -> Self {
        RequestWord(AtomicU32::new(0))
    }

    /// OR `bits` into the word. Idempotent.
    pub(crate) fn set(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    /// Clear exactly `bits`, leaving all others intact.
    pub(crate) fn clear(&self, bits: u32) {
        self.0.fetch_and(!bits, Ordering::AcqRel);
    }

    pub(crate) fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn any(&self, bits: u32) -> bool {
        self.load() & bits != 0
    }
}

impl std::fmt::Debug for RequestWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_idempotent() {
        let word = RequestWord::new();
        word.set(ULT_REQ_CANCEL);
        word.set(ULT_REQ_CANCEL);
        assert_eq!(word.load(), ULT_REQ_CANCEL);
    }

    #[test]
    fn test_clear_leaves_other_bits() {
        let word = RequestWord::new();
        word.set(ULT_REQ_CANCEL | ULT_REQ_MIGRATE | ULT_REQ_BLOCK);
        word.clear(ULT_REQ_MIGRATE);
        assert_eq!(word.load(), ULT_REQ_CANCEL | ULT_REQ_BLOCK);
        assert!(word.any(ULT_REQ_CANCEL));
        assert!(!word.any(ULT_REQ_MIGRATE));
    }
}
