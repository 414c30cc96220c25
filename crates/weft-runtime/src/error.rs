//! Error taxonomy for the runtime.

/// Errors returned by runtime operations.
///
/// All public operations report failure through this enum; nothing in the
/// runtime unwinds across the API boundary. Failed operations leave state
/// unchanged apart from a logged failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// The runtime has not been initialized (or has been finalized).
    #[error("runtime is not initialized")]
    Uninitialized,

    /// The target or calling execution stream is invalid for this
    /// operation: wrong thread, forbidden primary target, or a forbidden
    /// self-target.
    #[error("invalid execution stream: {0}")]
    InvalidStream(&'static str),

    /// The target work unit is invalid for this operation.
    #[error("invalid work unit: {0}")]
    InvalidUnit(&'static str),

    /// The target pool is invalid for this operation.
    #[error("invalid pool: {0}")]
    InvalidPool(&'static str),

    /// The target scheduler is invalid for this operation.
    #[error("invalid scheduler: {0}")]
    InvalidSched(&'static str),

    /// The operation is not valid in the stream's current state.
    #[error("invalid stream state: {0}")]
    StreamState(&'static str),

    /// A memory or kernel resource allocation failed.
    #[error("resource allocation failed")]
    Mem,

    /// The pool is already bound to a different consumer stream that is
    /// still scheduling it.
    #[error("pool is already bound to another consumer")]
    ConsumerConflict,
}

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            RuntimeError::Uninitialized.to_string(),
            "runtime is not initialized"
        );
        assert_eq!(
            RuntimeError::InvalidStream("no current stream").to_string(),
            "invalid execution stream: no current stream"
        );
        assert_eq!(
            RuntimeError::ConsumerConflict.to_string(),
            "pool is already bound to another consumer"
        );
    }
}
