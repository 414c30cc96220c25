//! Shared helpers for runtime integration tests.
//!
//! The runtime is a process-wide singleton whose primary stream is bound
//! to the initializing thread, so tests that own it are serialized.

use parking_lot::Mutex;

pub static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` with an initialized runtime owned by the calling thread.
#[allow(dead_code)]
pub fn with_runtime<F: FnOnce()>(f: F) {
    let _guard = TEST_LOCK.lock();
    weft_runtime::init().unwrap();
    f();
    weft_runtime::finalize().unwrap();
}
