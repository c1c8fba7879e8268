use std::{fmt::Display, str::FromStr};

use clap::Parser as ClapParser;
use tierjit::{CompilationMode, TierConfig};
use tracing::Level;

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "tierjit",
    author = "tierjit contributors",
    version,
    about = "Drive the tiered dispatcher with a simulated multi-threaded workload"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "threads",
        default_value_t = 8,
        value_name = "THREADS",
        help = "Number of caller threads.",
        help_heading = "Workload options",
        env = "TIERJIT_THREADS"
    )]
    pub threads: usize,
    #[arg(
        long = "methods",
        default_value_t = 64,
        value_name = "METHODS",
        help = "Number of distinct methods invoked.",
        long_help = "Method ids are drawn with a skew towards low ids, so a few methods get hot and most stay cold.",
        help_heading = "Workload options",
        env = "TIERJIT_METHODS"
    )]
    pub methods: u64,
    #[arg(
        long = "calls-per-thread",
        default_value_t = 20_000,
        value_name = "CALLS",
        help = "Invocations issued by each caller thread.",
        help_heading = "Workload options",
        env = "TIERJIT_CALLS_PER_THREAD"
    )]
    pub calls_per_thread: u64,
    #[arg(
        long = "seed",
        default_value_t = 0x7153,
        value_name = "SEED",
        help = "Seed for the method id generator.",
        help_heading = "Workload options"
    )]
    pub seed: u64,
    #[arg(
        long = "work",
        default_value_t = 200,
        value_name = "ITERATIONS",
        help = "Busy-loop iterations per interpreted call.",
        long_help = "Compiled calls run this many iterations divided by the tier speedup (4x for L1, 16x for L2).",
        help_heading = "Workload options"
    )]
    pub work: u64,
    #[arg(
        long = "l1-threshold",
        default_value_t = tierjit::types::DEFAULT_L1_THRESHOLD,
        value_name = "COUNT",
        help = "Invocations before a method is compiled at L1.",
        help_heading = "Tiering options",
        env = "TIERJIT_L1_THRESHOLD"
    )]
    pub l1_threshold: u64,
    #[arg(
        long = "l2-threshold",
        default_value_t = tierjit::types::DEFAULT_L2_THRESHOLD,
        value_name = "COUNT",
        help = "Invocations before a method is compiled at L2.",
        help_heading = "Tiering options",
        env = "TIERJIT_L2_THRESHOLD"
    )]
    pub l2_threshold: u64,
    #[arg(
        long = "background",
        action = clap::ArgAction::SetTrue,
        help = "Compile on background worker threads instead of inline.",
        help_heading = "Tiering options",
        env = "TIERJIT_BACKGROUND"
    )]
    pub background: bool,
    #[arg(
        long = "compile-workers",
        default_value_t = 2,
        value_name = "WORKERS",
        help = "Compiler threads used with --background.",
        help_heading = "Tiering options",
        env = "TIERJIT_COMPILE_WORKERS"
    )]
    pub compile_workers: usize,
    #[arg(
        long = "shards",
        default_value_t = tierjit::types::DEFAULT_SHARDS,
        value_name = "SHARDS",
        help = "Shards in the counter and cache maps (power of two).",
        help_heading = "Tiering options"
    )]
    pub shards: usize,
    #[arg(
        long = "compile-delay-ms",
        default_value_t = 2,
        value_name = "MILLIS",
        help = "Simulated L1 compile time. L2 takes four times as long.",
        help_heading = "Simulation options"
    )]
    pub compile_delay_ms: u64,
    #[arg(
        long = "fail-every",
        value_name = "N",
        help = "Make every Nth compilation attempt fail.",
        help_heading = "Simulation options"
    )]
    pub fail_every: Option<u64>,
    #[arg(
        long = "json",
        action = clap::ArgAction::SetTrue,
        help = "Print the report as JSON.",
        help_heading = "Output options"
    )]
    pub json: bool,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "TIERJIT_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Output options"
    )]
    pub log_level: Level,
    #[arg(
        long = "log.color",
        default_value_t = LogColor::Auto,
        help = "Output logs with ANSI color codes.",
        long_help = "Possible values: auto, always, never",
        help_heading = "Output options",
        env = "TIERJIT_LOG_COLOR"
    )]
    pub log_color: LogColor,
}

impl Options {
    /// Dispatcher configuration selected by the tiering flags.
    pub fn tier_config(&self) -> TierConfig {
        TierConfig {
            l1_threshold: self.l1_threshold,
            l2_threshold: self.l2_threshold,
            compilation_mode: if self.background {
                CompilationMode::Background
            } else {
                CompilationMode::Synchronous
            },
            compile_workers: self.compile_workers,
            shards: self.shards,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum LogColor {
    #[default]
    Auto,
    Always,
    Never,
}

impl Display for LogColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogColor::Auto => write!(f, "auto"),
            LogColor::Always => write!(f, "always"),
            LogColor::Never => write!(f, "never"),
        }
    }
}

impl FromStr for LogColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(LogColor::Auto),
            "always" => Ok(LogColor::Always),
            "never" => Ok(LogColor::Never),
            _ => Err(format!(
                "Invalid log color '{}'. Expected: auto, always, or never",
                s
            )),
        }
    }
}
