//! Tiered dispatch.
//!
//! Provides the collaborator traits (`TierCompiler`, `ExecutionEngine`) and
//! the `Dispatcher` that ties the usage counter, the tier policy and the
//! compilation cache together. A dispatcher is an explicit instance owned by
//! the host and shared by reference; there is no process-wide state.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};

use crate::cache::CompilationCache;
use crate::compiler_thread::{CompilationRequest, CompilerPool};
use crate::counter::UsageCounter;
use crate::error::{ConfigError, DispatchError};
use crate::policy::TierPolicy;
use crate::types::{CompilationMode, DispatchMetrics, MethodId, MethodTier, Tier, TierConfig};

/// Compiler collaborator: turns a method into an artifact at a tier.
///
/// May be slow and is called without any dispatcher lock held. The
/// dispatcher guarantees at most one call per (method, tier) unless an
/// earlier call for that pair failed.
pub trait TierCompiler: Send + Sync + 'static {
    type Artifact: Send + Sync + 'static;

    fn compile(&self, method: MethodId, tier: Tier) -> Result<Self::Artifact, String>;
}

/// Execution collaborator: runs compiled artifacts or interprets methods.
pub trait ExecutionEngine {
    type Artifact;
    type Output;

    /// Run a compiled artifact.
    fn execute(&self, artifact: &Self::Artifact) -> Result<Self::Output, String>;

    /// Run a method without compiling it.
    fn interpret(&self, method: MethodId) -> Result<Self::Output, String>;
}

/// State shared between dispatching threads and background compiler threads.
struct DispatchCore<C: TierCompiler> {
    policy: TierPolicy,
    counter: UsageCounter,
    cache: CompilationCache<C::Artifact>,
    compiler: C,
    metrics: DispatchMetrics,
}

impl<C: TierCompiler> DispatchCore<C> {
    /// Compile a method whose request this caller holds and publish the
    /// artifact. On failure, or if the compiler panics, the request is
    /// released so a later invocation can retry.
    fn compile_and_publish(&self, method: MethodId, tier: Tier) -> Result<(), DispatchError> {
        let request = HeldRequest::new(self, method, tier);
        match self.compiler.compile(method, tier) {
            Ok(artifact) => {
                request.complete();
                self.metrics.record_compilation(tier);
                if self.cache.publish(&method, tier, artifact) {
                    info!(%method, %tier, "compiled method");
                } else {
                    self.metrics
                        .superseded_publishes
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(%method, %tier, "artifact superseded by a higher tier");
                }
                Ok(())
            }
            Err(reason) => {
                drop(request);
                self.metrics
                    .compilation_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(%method, %tier, %reason, "compilation failed");
                Err(DispatchError::CompilationFailed {
                    method,
                    tier,
                    reason,
                })
            }
        }
    }
}

/// A granted compilation request. Released on drop unless completed, so
/// neither an error nor an unwinding compiler strands the method.
struct HeldRequest<'a, C: TierCompiler> {
    core: &'a DispatchCore<C>,
    method: MethodId,
    tier: Tier,
    completed: bool,
}

impl<'a, C: TierCompiler> HeldRequest<'a, C> {
    fn new(core: &'a DispatchCore<C>, method: MethodId, tier: Tier) -> Self {
        Self {
            core,
            method,
            tier,
            completed: false,
        }
    }

    /// The artifact is about to be published; keep the request bit.
    fn complete(mut self) {
        self.completed = true;
    }
}

impl<C: TierCompiler> Drop for HeldRequest<'_, C> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.core.cache.release(&self.method, self.tier);
        if std::thread::panicking() {
            self.core
                .metrics
                .compilation_failures
                .fetch_add(1, Ordering::Relaxed);
            error!(method = %self.method, tier = %self.tier, "compiler panicked");
        }
    }
}

/// Decides, per invocation, whether to interpret a method or execute its
/// compiled artifact, and triggers compilation when a method gets hot.
pub struct Dispatcher<C, E>
where
    C: TierCompiler,
    E: ExecutionEngine<Artifact = C::Artifact>,
{
    core: Arc<DispatchCore<C>>,
    engine: E,
    config: TierConfig,
    /// Background compiler threads (background mode only).
    pool: Option<CompilerPool>,
}

impl<C, E> Dispatcher<C, E>
where
    C: TierCompiler,
    E: ExecutionEngine<Artifact = C::Artifact>,
{
    /// Create a dispatcher with the default configuration
    /// (L1 at 20 invocations, L2 at 900, synchronous compilation).
    pub fn new(compiler: C, engine: E) -> Self {
        Self::build(TierConfig::default(), compiler, engine)
    }

    /// Create a dispatcher with a specific configuration.
    ///
    /// Inverted thresholds are accepted: with `l1_threshold >= l2_threshold`
    /// methods go straight to L2.
    pub fn with_config(config: TierConfig, compiler: C, engine: E) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.has_inverted_thresholds() {
            warn!(
                l1_threshold = config.l1_threshold,
                l2_threshold = config.l2_threshold,
                "L1 threshold is not below L2 threshold; L1 compilation will be skipped"
            );
        }
        Ok(Self::build(config, compiler, engine))
    }

    fn build(config: TierConfig, compiler: C, engine: E) -> Self {
        let core = Arc::new(DispatchCore {
            policy: TierPolicy::from_config(&config),
            counter: UsageCounter::with_shards(config.shards),
            cache: CompilationCache::with_shards(config.shards),
            compiler,
            metrics: DispatchMetrics::new(),
        });

        let pool = match config.compilation_mode {
            CompilationMode::Synchronous => None,
            CompilationMode::Background => {
                let worker_core = Arc::clone(&core);
                Some(CompilerPool::start(
                    config.compile_workers,
                    move |request: CompilationRequest| {
                        // Nobody is waiting on the result; failures were
                        // already logged and counted.
                        let _ = worker_core.compile_and_publish(request.method, request.tier);
                    },
                ))
            }
        };

        Self {
            core,
            engine,
            config,
            pool,
        }
    }

    /// Dispatch one invocation of `method`.
    ///
    /// Counts the invocation, requests compilation if the policy says so and
    /// this caller wins the request, then executes the published artifact or
    /// falls back to the interpreter. In synchronous mode a compiler error is
    /// returned to this caller instead of running the method.
    pub fn execute_method(&self, method: MethodId) -> Result<E::Output, DispatchError> {
        let core = &*self.core;
        let count = core.counter.increment(&method);
        let state = core.cache.tier_state(&method);
        let decision = core
            .policy
            .decide(count, state.l1_requested, state.l2_requested);

        if let Some(tier) = decision.tier() {
            self.request_compilation(method, tier, count)?;
        }

        match core.cache.lookup(&method) {
            Some(compiled) => {
                core.metrics.executions.fetch_add(1, Ordering::Relaxed);
                self.engine
                    .execute(compiled.artifact())
                    .map_err(|reason| DispatchError::ExecutionFailed { method, reason })
            }
            None => {
                core.metrics.interpretations.fetch_add(1, Ordering::Relaxed);
                self.engine
                    .interpret(method)
                    .map_err(|reason| DispatchError::InterpretationFailed { method, reason })
            }
        }
    }

    fn request_compilation(
        &self,
        method: MethodId,
        tier: Tier,
        count: u64,
    ) -> Result<(), DispatchError> {
        let core = &*self.core;
        if !core.cache.mark_requested(&method, tier) {
            core.metrics.requests_denied.fetch_add(1, Ordering::Relaxed);
            debug!(%method, %tier, count, "compilation already requested");
            return Ok(());
        }

        debug!(%method, %tier, count, "promoting method");
        if let Some(pool) = &self.pool {
            if pool.send(CompilationRequest { method, tier }) {
                core.metrics.requests_queued.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            warn!(%method, %tier, "compiler pool unavailable, compiling inline");
        }
        core.compile_and_publish(method, tier)
    }

    /// Current execution state of a method.
    pub fn method_tier(&self, method: MethodId) -> MethodTier {
        MethodTier::from(self.core.cache.tier_of(&method))
    }

    /// Invocations of `method` dispatched so far.
    pub fn usage_count(&self, method: MethodId) -> u64 {
        self.core.counter.get(&method)
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn policy(&self) -> TierPolicy {
        self.core.policy
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.core.metrics
    }

    pub fn counter(&self) -> &UsageCounter {
        &self.core.counter
    }

    pub fn cache(&self) -> &CompilationCache<C::Artifact> {
        &self.core.cache
    }

    pub fn compiler(&self) -> &C {
        &self.core.compiler
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Compilation requests waiting for a background worker (0 in
    /// synchronous mode).
    pub fn pending_compilations(&self) -> usize {
        self.pool.as_ref().map(CompilerPool::queued).unwrap_or(0)
    }
}

impl<C, E> std::fmt::Debug for Dispatcher<C, E>
where
    C: TierCompiler,
    E: ExecutionEngine<Artifact = C::Artifact>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("methods", &self.core.counter.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
mod tests {
    use super::*;

    /// Compiler that returns the tier it was asked for.
    struct TierEcho;

    impl TierCompiler for TierEcho {
        type Artifact = Tier;

        fn compile(&self, _method: MethodId, tier: Tier) -> Result<Tier, String> {
            Ok(tier)
        }
    }

    /// Engine that reports which path ran.
    struct PathEngine;

    impl ExecutionEngine for PathEngine {
        type Artifact = Tier;
        type Output = Option<Tier>;

        fn execute(&self, artifact: &Tier) -> Result<Option<Tier>, String> {
            Ok(Some(*artifact))
        }

        fn interpret(&self, _method: MethodId) -> Result<Option<Tier>, String> {
            Ok(None)
        }
    }

    fn small_dispatcher() -> Dispatcher<TierEcho, PathEngine> {
        Dispatcher::with_config(TierConfig::with_thresholds(3, 6), TierEcho, PathEngine)
            .expect("valid config")
    }

    #[test]
    fn test_interprets_until_l1_threshold() {
        let dispatcher = small_dispatcher();
        let m = MethodId(1);

        assert_eq!(dispatcher.execute_method(m), Ok(None));
        assert_eq!(dispatcher.execute_method(m), Ok(None));
        assert_eq!(dispatcher.method_tier(m), MethodTier::Interpreted);
        // Third call compiles L1 and already runs it.
        assert_eq!(dispatcher.execute_method(m), Ok(Some(Tier::L1)));
        assert_eq!(dispatcher.method_tier(m), MethodTier::L1Compiled);
    }

    #[test]
    fn test_promotes_to_l2() {
        let dispatcher = small_dispatcher();
        let m = MethodId(1);

        let paths: Vec<_> = (0..8)
            .map(|_| dispatcher.execute_method(m).expect("dispatch"))
            .collect();
        assert_eq!(
            paths,
            vec![
                None,
                None,
                Some(Tier::L1),
                Some(Tier::L1),
                Some(Tier::L1),
                Some(Tier::L2),
                Some(Tier::L2),
                Some(Tier::L2),
            ]
        );
        assert_eq!(dispatcher.usage_count(m), 8);

        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.interpretations, 2);
        assert_eq!(snapshot.executions, 6);
        assert_eq!(snapshot.l1_compilations, 1);
        assert_eq!(snapshot.l2_compilations, 1);
    }

    #[test]
    fn test_methods_are_independent() {
        let dispatcher = small_dispatcher();
        let hot = MethodId(1);
        let cold = MethodId(2);

        for _ in 0..6 {
            dispatcher.execute_method(hot).expect("dispatch");
        }
        assert_eq!(dispatcher.method_tier(hot), MethodTier::L2Compiled);
        assert_eq!(dispatcher.method_tier(cold), MethodTier::Interpreted);
        assert_eq!(dispatcher.usage_count(cold), 0);
        assert_eq!(dispatcher.execute_method(cold), Ok(None));
        assert_eq!(dispatcher.usage_count(cold), 1);
    }

    #[test]
    fn test_inverted_thresholds_skip_l1() {
        let dispatcher =
            Dispatcher::with_config(TierConfig::with_thresholds(5, 2), TierEcho, PathEngine)
                .expect("inverted thresholds are accepted");
        let m = MethodId(1);

        assert_eq!(dispatcher.execute_method(m), Ok(None));
        assert_eq!(dispatcher.execute_method(m), Ok(Some(Tier::L2)));
        for _ in 0..5 {
            assert_eq!(dispatcher.execute_method(m), Ok(Some(Tier::L2)));
        }
        assert_eq!(dispatcher.metrics().snapshot().l1_compilations, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result =
            Dispatcher::with_config(TierConfig::with_thresholds(0, 5), TierEcho, PathEngine);
        assert!(matches!(result, Err(ConfigError::ZeroThreshold(Tier::L1))));
    }

    #[test]
    fn test_default_dispatcher_uses_default_thresholds() {
        let dispatcher = Dispatcher::new(TierEcho, PathEngine);
        assert_eq!(dispatcher.policy(), TierPolicy::default());
        assert_eq!(dispatcher.pending_compilations(), 0);
    }
}
