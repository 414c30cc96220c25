//! Execution context primitive for the weft runtime.
//!
//! This crate provides the minimum machinery on which cooperative stackful
//! scheduling is built:
//! - [`Context`]: a saved callee-saved register set for one suspended
//!   execution context
//! - [`context_switch`]: save the current context and resume another
//! - [`ContextStack`]: an owned, 16-byte-aligned stack backing a context
//!
//! A freshly initialized context runs `entry(arg)` on its own stack. When
//! `entry` returns, execution resumes the context stored in the `link` cell
//! at that moment — the link is re-pointable between runs with
//! [`Context::set_link`], so the same context body can hand control back to
//! different schedulers across dispatches.
//!
//! Only callee-saved state is switched (including the floating-point
//! control registers); everything caller-saved is dead across a
//! `context_switch` call by the C ABI.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod arch;
mod stack;

pub use arch::{context_switch, Context};
pub use stack::ContextStack;
