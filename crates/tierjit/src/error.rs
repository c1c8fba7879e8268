//! Error types for the tiered dispatcher.

use crate::types::{MethodId, Tier};

/// Errors surfaced to the caller of [`Dispatcher::execute_method`].
///
/// Collaborator failures are reported as strings, the same shape the
/// collaborator traits return them in.
///
/// [`Dispatcher::execute_method`]: crate::dispatch::Dispatcher::execute_method
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The compiler rejected the method. The request was rolled back, so the
    /// next invocation may try the same tier again.
    #[error("compilation of {method} at {tier} failed: {reason}")]
    CompilationFailed {
        method: MethodId,
        tier: Tier,
        reason: String,
    },

    /// Running a compiled artifact failed.
    #[error("execution of compiled {method} failed: {reason}")]
    ExecutionFailed { method: MethodId, reason: String },

    /// The interpreter failed.
    #[error("interpretation of {method} failed: {reason}")]
    InterpretationFailed { method: MethodId, reason: String },
}

/// Configuration the dispatcher refuses to start with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} threshold must be positive")]
    ZeroThreshold(Tier),

    #[error("background compilation needs at least one compile worker")]
    NoCompileWorkers,

    #[error("shard count must be a non-zero power of two, got {0}")]
    InvalidShardCount(usize),
}
