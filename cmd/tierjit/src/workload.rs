//! Simulated collaborators and the multi-threaded workload runner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use eyre::WrapErr;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;
use tierjit::{
    DispatchError, Dispatcher, ExecutionEngine, MethodId, MethodTier, MetricsSnapshot, Tier,
    TierCompiler, TierConfig,
};
use tracing::{debug, info, warn};

use crate::cli::Options;

/// Speedup of compiled code over the interpreter, per tier.
fn speedup(tier: Tier) -> u64 {
    match tier {
        Tier::L1 => 4,
        Tier::L2 => 16,
    }
}

/// Artifact produced by [`SimulatedCompiler`].
#[derive(Debug, Clone, Copy)]
pub struct SimArtifact {
    pub method: MethodId,
    pub tier: Tier,
}

/// Compiler that sleeps to simulate compile time and optionally fails.
#[derive(Debug)]
pub struct SimulatedCompiler {
    delay: Duration,
    fail_every: Option<u64>,
    attempts: AtomicU64,
}

impl SimulatedCompiler {
    pub fn new(delay: Duration, fail_every: Option<u64>) -> Self {
        Self {
            delay,
            fail_every: fail_every.filter(|n| *n > 0),
            attempts: AtomicU64::new(0),
        }
    }
}

impl TierCompiler for SimulatedCompiler {
    type Artifact = SimArtifact;

    fn compile(&self, method: MethodId, tier: Tier) -> Result<SimArtifact, String> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = match tier {
            Tier::L1 => self.delay,
            Tier::L2 => self.delay * 4,
        };
        thread::sleep(delay);

        if let Some(n) = self.fail_every
            && attempt % n == 0
        {
            return Err(format!("simulated compiler failure on attempt {attempt}"));
        }
        Ok(SimArtifact { method, tier })
    }
}

/// Engine that burns CPU in proportion to the tier it runs at.
#[derive(Debug)]
pub struct SimulatedEngine {
    work: u64,
}

impl SimulatedEngine {
    pub fn new(work: u64) -> Self {
        Self { work }
    }
}

fn spin(method: MethodId, iterations: u64) -> u64 {
    let mut acc = method.0;
    for i in 0..iterations {
        acc = acc.rotate_left(5) ^ i;
    }
    std::hint::black_box(acc)
}

impl ExecutionEngine for SimulatedEngine {
    type Artifact = SimArtifact;
    type Output = u64;

    fn execute(&self, artifact: &SimArtifact) -> Result<u64, String> {
        Ok(spin(artifact.method, self.work / speedup(artifact.tier)))
    }

    fn interpret(&self, method: MethodId) -> Result<u64, String> {
        Ok(spin(method, self.work))
    }
}

/// How many methods ended the run at each tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub interpreted: u64,
    pub l1_compiled: u64,
    pub l2_compiled: u64,
}

/// Result of a workload run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub config: TierConfig,
    pub threads: usize,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub elapsed_ms: u128,
    pub metrics: MetricsSnapshot,
    pub tiers: TierCounts,
}

impl WorkloadReport {
    pub fn print(&self) {
        println!(
            "{} calls on {} threads in {} ms ({} failed)",
            self.total_calls, self.threads, self.elapsed_ms, self.failed_calls
        );
        println!(
            "interpreted: {:>10}   executed: {:>10}",
            self.metrics.interpretations, self.metrics.executions
        );
        println!(
            "compiled L1: {:>10}   compiled L2: {:>7}   failures: {}   denied: {}   superseded: {}",
            self.metrics.l1_compilations,
            self.metrics.l2_compilations,
            self.metrics.compilation_failures,
            self.metrics.requests_denied,
            self.metrics.superseded_publishes
        );
        println!(
            "methods interpreted: {}   at L1: {}   at L2: {}",
            self.tiers.interpreted, self.tiers.l1_compiled, self.tiers.l2_compiled
        );
    }
}

/// Draw a method id skewed towards low ids.
fn pick_method(rng: &mut StdRng, methods: u64) -> MethodId {
    let upper = rng.gen_range(0..methods);
    MethodId(rng.gen_range(0..=upper))
}

/// Run the workload described by `opts` and collect a report.
pub fn run(opts: &Options) -> eyre::Result<WorkloadReport> {
    eyre::ensure!(opts.threads > 0, "--threads must be positive");
    eyre::ensure!(opts.methods > 0, "--methods must be positive");
    let total_calls = u64::try_from(opts.threads)
        .ok()
        .and_then(|threads| opts.calls_per_thread.checked_mul(threads))
        .ok_or_else(|| eyre::eyre!("--threads times --calls-per-thread overflows u64"))?;

    let config = opts.tier_config();
    let compiler = SimulatedCompiler::new(
        Duration::from_millis(opts.compile_delay_ms),
        opts.fail_every,
    );
    let dispatcher = Dispatcher::with_config(config.clone(), compiler, SimulatedEngine::new(opts.work))
        .wrap_err("invalid tiering configuration")?;

    info!(
        threads = opts.threads,
        methods = opts.methods,
        calls_per_thread = opts.calls_per_thread,
        mode = ?config.compilation_mode,
        "starting workload"
    );

    let failed_calls = AtomicU64::new(0);
    let start = Instant::now();
    thread::scope(|s| {
        for index in 0..opts.threads {
            let dispatcher = &dispatcher;
            let failed_calls = &failed_calls;
            let seed = opts.seed.wrapping_add(index as u64);
            thread::Builder::new()
                .name(format!("caller-{index}"))
                .spawn_scoped(s, move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..opts.calls_per_thread {
                        let method = pick_method(&mut rng, opts.methods);
                        if let Err(err) = dispatcher.execute_method(method) {
                            failed_calls.fetch_add(1, Ordering::Relaxed);
                            match err {
                                DispatchError::CompilationFailed { .. } => {
                                    debug!(%err, "call failed")
                                }
                                _ => warn!(%err, "call failed"),
                            }
                        }
                    }
                })
                .wrap_err("failed to spawn caller thread")?;
        }
        Ok::<_, eyre::Report>(())
    })?;
    let elapsed = start.elapsed();

    let mut tiers = TierCounts::default();
    for raw in 0..opts.methods {
        match dispatcher.method_tier(MethodId(raw)) {
            MethodTier::Interpreted => tiers.interpreted += 1,
            MethodTier::L1Compiled => tiers.l1_compiled += 1,
            MethodTier::L2Compiled => tiers.l2_compiled += 1,
        }
    }

    let report = WorkloadReport {
        config,
        threads: opts.threads,
        total_calls,
        failed_calls: failed_calls.load(Ordering::Relaxed),
        elapsed_ms: elapsed.as_millis(),
        metrics: dispatcher.metrics().snapshot(),
        tiers,
    };
    info!(
        elapsed_ms = report.elapsed_ms,
        pending = dispatcher.pending_compilations(),
        "workload finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CLI;
    use clap::Parser;

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["tierjit"];
        argv.extend_from_slice(args);
        CLI::try_parse_from(argv).expect("valid args").opts
    }

    #[test]
    fn test_small_synchronous_run() {
        let opts = options(&[
            "--threads",
            "4",
            "--methods",
            "8",
            "--calls-per-thread",
            "2000",
            "--compile-delay-ms",
            "0",
            "--work",
            "10",
        ]);
        let report = run(&opts).expect("workload runs");

        assert_eq!(report.total_calls, 8_000);
        assert_eq!(report.metrics.invocations(), 8_000);
        assert_eq!(report.failed_calls, 0);
        // Method 0 is the hottest by construction.
        assert!(report.tiers.l2_compiled >= 1);
        assert_eq!(
            report.tiers.interpreted + report.tiers.l1_compiled + report.tiers.l2_compiled,
            8
        );
    }

    #[test]
    fn test_failures_are_reported_not_fatal() {
        let opts = options(&[
            "--threads",
            "2",
            "--methods",
            "4",
            "--calls-per-thread",
            "500",
            "--compile-delay-ms",
            "0",
            "--fail-every",
            "2",
            "--l1-threshold",
            "5",
            "--l2-threshold",
            "50",
        ]);
        let report = run(&opts).expect("workload runs");

        assert_eq!(report.failed_calls, report.metrics.compilation_failures);
        assert!(report.metrics.compilation_failures >= 1);
        assert_eq!(
            report.metrics.invocations() + report.failed_calls,
            report.total_calls
        );
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let opts = options(&["--shards", "3"]);
        assert!(run(&opts).is_err());
    }

    #[test]
    fn test_call_total_overflow_is_an_error() {
        let opts = options(&["--threads", "4", "--calls-per-thread", &u64::MAX.to_string()]);
        let err = run(&opts).expect_err("call total overflows");
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_report_serializes() {
        let opts = options(&[
            "--threads",
            "1",
            "--methods",
            "2",
            "--calls-per-thread",
            "50",
            "--compile-delay-ms",
            "0",
        ]);
        let report = run(&opts).expect("workload runs");
        let json = serde_json::to_value(&report).expect("report serializes");
        assert_eq!(json["total_calls"], 50);
        assert_eq!(json["config"]["compilation_mode"], "synchronous");
    }
}
