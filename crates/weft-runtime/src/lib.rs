//! weft — core scheduling substrate of a user-level threading runtime.
//!
//! The runtime multiplexes two kinds of work units over kernel-thread-bound
//! **execution streams**:
//! - **ULTs** ([`Ult`]): stackful user-level threads that can yield, block,
//!   and migrate between streams
//! - **tasklets** ([`Tasklet`]): stackless units that run to completion
//!
//! Each stream drives a stack of **schedulers** ([`Scheduler`]), each
//! selecting units from **pools** ([`Pool`]) it owns. Scheduling is purely
//! cooperative: control moves at yields, blocking points, and unit
//! completion. External agents steer streams and units through atomic
//! request bits (join, cancel, exit, migrate) honored at the next
//! cooperative checkpoint.
//!
//! The thread that calls [`init`] becomes the **primary** stream; its units
//! run during yields from that thread. Secondary streams own their kernel
//! thread and start either explicitly or when a unit is pushed to one of
//! their pools.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use weft_runtime::{ExecutionStream, Ult};
//!
//! weft_runtime::init().unwrap();
//!
//! // A secondary stream with a default scheduler and one FIFO pool.
//! let stream = ExecutionStream::create(None).unwrap();
//! let pool = stream.main_pools()[0].clone();
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! let c = counter.clone();
//! let ult = Ult::create(&pool, move || {
//!     weft_runtime::yield_now().unwrap();
//!     c.fetch_add(1, Ordering::SeqCst);
//! })
//! .unwrap();
//!
//! ult.join().unwrap();
//! assert_eq!(counter.load(Ordering::SeqCst), 1);
//!
//! stream.join().unwrap();
//! stream.free().unwrap();
//! weft_runtime::finalize().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
mod local;
pub mod migrate;
pub mod pool;
mod registry;
mod request;
pub mod sched;
mod stack_pool;
pub mod stream;
pub mod tasklet;
pub mod ult;
pub mod unit;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use migrate::migrate_to;
pub use pool::{FifoPool, Pool};
pub use registry::{finalize, init, init_with_config, is_initialized, num_streams};
pub use sched::{BasicPolicy, SchedConfig, SchedKind, SchedPolicy, SchedPredef, SchedState, Scheduler};
pub use stream::{ExecutionStream, StreamState, StreamType};
pub use tasklet::{Tasklet, TaskletState};
pub use ult::{block, exit, yield_now, Ult, UltAttrs, UltState};
pub use unit::{TaskletId, UltId, UnitKind, WorkUnit};
