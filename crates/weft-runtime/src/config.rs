//! Runtime configuration.

/// Default stack size for a ULT (64KB).
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Smallest stack the runtime will allocate for a ULT.
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Configuration recognized at runtime initialization.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size in bytes for ULTs that do not request one explicitly.
    pub default_stack_size: usize,
    /// Whether secondary streams pin their kernel thread to a core
    /// (rank modulo the number of available cores).
    pub set_affinity: bool,
    /// Number of execution streams the surrounding layer is expected to
    /// create. The core only records it; stream creation is explicit.
    pub num_streams: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            set_affinity: false,
            num_streams: num_cpus::get(),
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from the environment:
    /// `WEFT_STACK_SIZE` (bytes), `WEFT_SET_AFFINITY` (`1`/`true`),
    /// `WEFT_NUM_STREAMS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_stack_size = std::env::var("WEFT_STACK_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(|n: usize| n.max(MIN_STACK_SIZE))
            .unwrap_or(defaults.default_stack_size);

        let set_affinity = std::env::var("WEFT_SET_AFFINITY")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.set_affinity);

        let num_streams = std::env::var("WEFT_NUM_STREAMS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(defaults.num_streams);

        Self {
            default_stack_size,
            set_affinity,
            num_streams,
        }
    }
}
