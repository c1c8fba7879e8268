//! End-to-end promotion scenarios in synchronous mode.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use super::test_helpers::{Path, RecordingCompiler, make_dispatcher};
use crate::dispatch::{Dispatcher, ExecutionEngine};
use crate::error::DispatchError;
use crate::types::{MethodId, MethodTier, Tier, TierConfig};

const M: MethodId = MethodId(0xC0DE);

#[test]
fn test_default_thresholds_full_lifecycle() {
    let dispatcher = make_dispatcher(TierConfig::default(), RecordingCompiler::new());

    for call in 1..=19 {
        assert_eq!(
            dispatcher.execute_method(M),
            Ok(Path::Interpreted),
            "call {call} should interpret"
        );
    }
    assert!(dispatcher.compiler().calls().is_empty());

    // Call 20 compiles L1 exactly once.
    dispatcher.execute_method(M).expect("call 20");
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L1), 1);
    assert_eq!(dispatcher.method_tier(M), MethodTier::L1Compiled);

    for call in 21..900 {
        assert_eq!(
            dispatcher.execute_method(M),
            Ok(Path::Executed(Tier::L1)),
            "call {call} should run the L1 artifact"
        );
    }
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L2), 0);

    // Call 900 compiles L2 exactly once.
    dispatcher.execute_method(M).expect("call 900");
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L2), 1);
    assert_eq!(dispatcher.method_tier(M), MethodTier::L2Compiled);

    for call in 901..=2_000 {
        assert_eq!(
            dispatcher.execute_method(M),
            Ok(Path::Executed(Tier::L2)),
            "call {call} should run the L2 artifact"
        );
    }

    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L1), 1);
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L2), 1);
    assert_eq!(dispatcher.usage_count(M), 2_000);

    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.interpretations, 19);
    assert_eq!(snapshot.executions, 1_981);
    assert_eq!(snapshot.invocations(), 2_000);
    assert_eq!(snapshot.requests_denied, 0);
}

#[test]
fn test_l1_failure_surfaces_and_retries() {
    let compiler = RecordingCompiler::new().failing(M, Tier::L1, 1);
    let dispatcher = make_dispatcher(TierConfig::with_thresholds(3, 10), compiler);

    dispatcher.execute_method(M).expect("call 1");
    dispatcher.execute_method(M).expect("call 2");

    let err = dispatcher
        .execute_method(M)
        .expect_err("call 3 should surface the compiler error");
    assert!(matches!(
        err,
        DispatchError::CompilationFailed {
            method: M,
            tier: Tier::L1,
            ..
        }
    ));
    assert_eq!(dispatcher.method_tier(M), MethodTier::Interpreted);
    assert!(!dispatcher.cache().tier_state(&M).l1_requested);

    // The request was rolled back, so the next call retries L1.
    assert_eq!(dispatcher.execute_method(M), Ok(Path::Executed(Tier::L1)));
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L1), 2);
    assert_eq!(dispatcher.metrics().snapshot().compilation_failures, 1);
}

#[test]
fn test_compiler_panic_releases_request() {
    let compiler = RecordingCompiler::new().panicking(M, Tier::L1, 1);
    let dispatcher = make_dispatcher(TierConfig::with_thresholds(2, 1_000), compiler);

    assert_eq!(dispatcher.execute_method(M), Ok(Path::Interpreted));
    let unwound = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.execute_method(M)));
    assert!(unwound.is_err());

    // The panicking call ran neither primitive and left nothing requested.
    assert_eq!(dispatcher.engine().interpreted.load(Ordering::Relaxed), 1);
    assert_eq!(dispatcher.engine().executed.load(Ordering::Relaxed), 0);
    assert!(!dispatcher.cache().tier_state(&M).l1_requested);
    assert_eq!(dispatcher.metrics().snapshot().compilation_failures, 1);

    assert_eq!(dispatcher.execute_method(M), Ok(Path::Executed(Tier::L1)));
    assert_eq!(dispatcher.method_tier(M), MethodTier::L1Compiled);
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L1), 2);
}

#[test]
fn test_l2_failure_keeps_l1_artifact() {
    let compiler = RecordingCompiler::new().failing(M, Tier::L2, 1);
    let dispatcher = make_dispatcher(TierConfig::with_thresholds(2, 4), compiler);

    for _ in 0..3 {
        dispatcher.execute_method(M).expect("warm up");
    }
    assert_eq!(dispatcher.method_tier(M), MethodTier::L1Compiled);

    assert!(dispatcher.execute_method(M).is_err());
    assert_eq!(dispatcher.method_tier(M), MethodTier::L1Compiled);

    assert_eq!(dispatcher.execute_method(M), Ok(Path::Executed(Tier::L2)));
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L1), 1);
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L2), 2);
}

#[test]
fn test_method_can_skip_l1() {
    // L1 keeps failing until the method is hot enough for L2.
    let compiler = RecordingCompiler::new().failing(M, Tier::L1, u32::MAX);
    let dispatcher = make_dispatcher(TierConfig::with_thresholds(2, 4), compiler);

    assert_eq!(dispatcher.execute_method(M), Ok(Path::Interpreted));
    assert!(dispatcher.execute_method(M).is_err());
    assert!(dispatcher.execute_method(M).is_err());
    assert_eq!(dispatcher.execute_method(M), Ok(Path::Executed(Tier::L2)));
    assert_eq!(dispatcher.execute_method(M), Ok(Path::Executed(Tier::L2)));

    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L1), 2);
    assert_eq!(dispatcher.compiler().compile_count(M, Tier::L2), 1);
    assert_eq!(dispatcher.method_tier(M), MethodTier::L2Compiled);
}

#[test]
fn test_tier_never_moves_backwards() {
    let dispatcher = make_dispatcher(TierConfig::with_thresholds(2, 4), RecordingCompiler::new());

    for _ in 0..10 {
        dispatcher.execute_method(M).expect("dispatch");
    }
    assert_eq!(dispatcher.method_tier(M), MethodTier::L2Compiled);

    // A stray L1 artifact arriving late must not replace L2.
    let artifact = super::test_helpers::TestArtifact {
        method: M,
        tier: Tier::L1,
    };
    assert!(!dispatcher.cache().publish(&M, Tier::L1, artifact));
    assert_eq!(dispatcher.method_tier(M), MethodTier::L2Compiled);
    assert_eq!(dispatcher.execute_method(M), Ok(Path::Executed(Tier::L2)));
}

/// Engine whose primitives always fail.
struct BrokenEngine;

impl ExecutionEngine for BrokenEngine {
    type Artifact = super::test_helpers::TestArtifact;
    type Output = ();

    fn execute(&self, _artifact: &Self::Artifact) -> Result<(), String> {
        Err("segfault in compiled code".to_string())
    }

    fn interpret(&self, _method: MethodId) -> Result<(), String> {
        Err("interpreter trap".to_string())
    }
}

#[test]
fn test_engine_errors_propagate() {
    let dispatcher = Dispatcher::with_config(
        TierConfig::with_thresholds(2, 100),
        RecordingCompiler::new(),
        BrokenEngine,
    )
    .expect("valid config");

    assert_eq!(
        dispatcher.execute_method(M),
        Err(DispatchError::InterpretationFailed {
            method: M,
            reason: "interpreter trap".to_string(),
        })
    );
    assert_eq!(
        dispatcher.execute_method(M),
        Err(DispatchError::ExecutionFailed {
            method: M,
            reason: "segfault in compiled code".to_string(),
        })
    );
    // Execution failures do not undo compilation.
    assert_eq!(dispatcher.method_tier(M), MethodTier::L1Compiled);
}
