//! Architecture backends for the context primitive.

#[cfg(all(target_arch = "x86_64", unix))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", unix))]
pub use self::x86_64::{context_switch, Context};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{context_switch, Context};

#[cfg(not(any(all(target_arch = "x86_64", unix), target_arch = "aarch64")))]
compile_error!("weft-context supports x86_64 (System V) and aarch64 targets only");
