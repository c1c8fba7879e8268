//! Shared test helpers for dispatcher tests.
//!
//! `RecordingCompiler` logs every compile call (before doing any work, so
//! overlapping calls are visible) and can be told to sleep, fail or panic.
//! `RecordingEngine` reports which path an invocation took.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::dispatch::{Dispatcher, ExecutionEngine, TierCompiler};
use crate::types::{MethodId, MethodTier, Tier, TierConfig};

/// Artifact produced by [`RecordingCompiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestArtifact {
    pub method: MethodId,
    pub tier: Tier,
}

/// Which primitive served an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Path {
    Interpreted,
    Executed(Tier),
}

/// One call into the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileCall {
    pub method: MethodId,
    pub tier: Tier,
    pub thread: Option<String>,
}

#[derive(Debug, Default)]
pub struct RecordingCompiler {
    calls: Mutex<Vec<CompileCall>>,
    delay: Option<Duration>,
    failures_left: Mutex<FxHashMap<(MethodId, Tier), u32>>,
    panics_left: Mutex<FxHashMap<(MethodId, Tier), u32>>,
}

impl RecordingCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every compile call.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next `times` compilations of `method` at `tier`.
    pub fn failing(self, method: MethodId, tier: Tier, times: u32) -> Self {
        self.failures_left
            .lock()
            .unwrap()
            .insert((method, tier), times);
        self
    }

    /// Panic inside the next `times` compilations of `method` at `tier`.
    pub fn panicking(self, method: MethodId, tier: Tier, times: u32) -> Self {
        self.panics_left
            .lock()
            .unwrap()
            .insert((method, tier), times);
        self
    }

    pub fn calls(&self) -> Vec<CompileCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn compile_count(&self, method: MethodId, tier: Tier) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method && call.tier == tier)
            .count()
    }
}

impl TierCompiler for RecordingCompiler {
    type Artifact = TestArtifact;

    fn compile(&self, method: MethodId, tier: Tier) -> Result<TestArtifact, String> {
        self.calls.lock().unwrap().push(CompileCall {
            method,
            tier,
            thread: thread::current().name().map(str::to_owned),
        });

        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        let should_panic = {
            let mut panics = self.panics_left.lock().unwrap();
            match panics.get_mut(&(method, tier)) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_panic {
            panic!("injected panic for {method} at {tier}");
        }

        let mut failures = self.failures_left.lock().unwrap();
        if let Some(left) = failures.get_mut(&(method, tier))
            && *left > 0
        {
            *left -= 1;
            return Err(format!("injected failure for {method} at {tier}"));
        }
        Ok(TestArtifact { method, tier })
    }
}

#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub interpreted: AtomicU64,
    pub executed: AtomicU64,
}

impl ExecutionEngine for RecordingEngine {
    type Artifact = TestArtifact;
    type Output = Path;

    fn execute(&self, artifact: &TestArtifact) -> Result<Path, String> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(Path::Executed(artifact.tier))
    }

    fn interpret(&self, _method: MethodId) -> Result<Path, String> {
        self.interpreted.fetch_add(1, Ordering::Relaxed);
        Ok(Path::Interpreted)
    }
}

pub type TestDispatcher = Dispatcher<RecordingCompiler, RecordingEngine>;

pub fn make_dispatcher(config: TierConfig, compiler: RecordingCompiler) -> TestDispatcher {
    Dispatcher::with_config(config, compiler, RecordingEngine::default())
        .expect("test config should be valid")
}

/// Poll until `method` reaches `tier` or `timeout` passes.
pub fn wait_for_tier(
    dispatcher: &TestDispatcher,
    method: MethodId,
    tier: MethodTier,
    timeout: Duration,
) -> bool {
    wait_until(timeout, || dispatcher.method_tier(method) >= tier)
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Rank of a path, for monotonicity checks.
pub fn path_rank(path: Path) -> u8 {
    match path {
        Path::Interpreted => 0,
        Path::Executed(Tier::L1) => 1,
        Path::Executed(Tier::L2) => 2,
    }
}
