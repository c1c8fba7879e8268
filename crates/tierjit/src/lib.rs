//! Tiered execution dispatcher.
//!
//! Decides, for every method invocation, whether to interpret the method or
//! run a compiled artifact, and promotes methods to higher compilation tiers
//! as their invocation counts cross configured thresholds.
//!
//! # Architecture
//!
//! ```text
//! invocation
//!   └── counter        : per-method invocation counts (sharded, atomic)
//!         └── policy   : count + request state -> {None, CompileL1, CompileL2}
//!               └── cache           : request gate, published artifacts
//!                     ├── compiler_thread: optional background workers
//!                     └── dispatch  : execute artifact or interpret
//! ```
//!
//! The interpreter, the executor and the compilers are supplied by the host
//! through [`ExecutionEngine`] and [`TierCompiler`].
//!
//! # Guarantees
//!
//! - Each (method, tier) pair is compiled at most once, however many threads
//!   cross a threshold at the same time. A failed compilation releases its
//!   request so a later invocation can retry.
//! - A method's tier only moves forward: a published L2 artifact is never
//!   replaced by L1.
//! - Compilers, executors and interpreters run without any dispatcher lock
//!   held.

pub mod cache;
pub mod compiler_thread;
pub mod counter;
pub mod dispatch;
pub mod error;
pub mod policy;
mod shard;
pub mod types;

// Re-exports for convenience
pub use cache::{CompilationCache, CompiledMethod, TierState};
pub use compiler_thread::{CompilationRequest, CompilerPool};
pub use counter::UsageCounter;
pub use dispatch::{Dispatcher, ExecutionEngine, TierCompiler};
pub use error::{ConfigError, DispatchError};
pub use policy::TierPolicy;
pub use types::{
    CompilationMode, Decision, DispatchMetrics, MethodId, MethodTier, MetricsSnapshot, Tier,
    TierConfig,
};

#[cfg(test)]
mod tests;
