use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "iso26262-gate",
    version,
    about = "Quality-regression gate for the local ISO 26262 extraction engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture an immutable before/after quality bundle for one run phase.
    Capture(CaptureArgs),
    /// Compare a run's before and after captures under a threshold policy.
    Compare(CompareArgs),
    /// Inspect persisted gate state for a run.
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CapturePhase {
    Before,
    After,
}

impl CapturePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CaptureMode {
    Lite,
    Full,
}

impl CaptureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lite => "lite",
            Self::Full => "full",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExpectedStatus {
    Pass,
    Warn,
    Fail,
}

impl ExpectedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CaptureArgs {
    #[arg(long, value_enum)]
    pub phase: CapturePhase,

    #[arg(long, value_enum, default_value_t = CaptureMode::Lite)]
    pub mode: CaptureMode,

    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long, default_value_t = false)]
    pub resume: bool,

    #[arg(long, default_value_t = false)]
    pub override_blocked: bool,

    #[arg(long, default_value_t = false)]
    pub allow_rebuild: bool,

    #[arg(long, default_value = ".cache/iso26262-gate")]
    pub output_root: PathBuf,

    #[arg(long, default_value = ".cache/iso26262")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "iso26262")]
    pub engine_bin: PathBuf,

    #[arg(long)]
    pub engine_build_dir: Option<PathBuf>,

    #[arg(long)]
    pub query_manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub thresholds: Option<PathBuf>,

    #[arg(long, default_value_t = 3)]
    pub bench_repetitions: usize,

    #[arg(long, default_value_t = 1)]
    pub warmup_passes: usize,

    #[arg(long, default_value_t = 2)]
    pub timed_passes: usize,

    #[arg(long, default_value_t = 96)]
    pub lexical_k: usize,

    #[arg(long, default_value_t = 96)]
    pub semantic_k: usize,

    #[arg(long, default_value_t = 60)]
    pub rrf_k: u32,

    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long, default_value = ".cache/iso26262-gate")]
    pub output_root: PathBuf,

    #[arg(long)]
    pub thresholds: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub expect_status: Option<ExpectedStatus>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/iso26262-gate")]
    pub output_root: PathBuf,

    #[arg(long)]
    pub run_id: Option<String>,
}
