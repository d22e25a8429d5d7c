use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub mod capture;
pub mod compare;
pub mod status;

/// Directory layout for one gate run under `<output-root>/runs/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub output_root: PathBuf,
    pub run_id: String,
}

impl RunPaths {
    pub fn new(output_root: &Path, run_id: &str) -> Self {
        Self {
            output_root: output_root.to_path_buf(),
            run_id: run_id.to_string(),
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.output_root.join("runs").join(&self.run_id)
    }

    pub fn decision_log(&self) -> PathBuf {
        self.run_dir().join("decision_log.ndjson")
    }

    pub fn phase_dir(&self, phase: &str) -> PathBuf {
        self.run_dir().join(phase)
    }

    pub fn run_state(&self, phase: &str) -> PathBuf {
        self.phase_dir(phase).join("run_state.json")
    }

    pub fn work_dir(&self, phase: &str) -> PathBuf {
        self.phase_dir(phase).join("work")
    }

    pub fn work_cache_root(&self, phase: &str) -> PathBuf {
        self.work_dir(phase).join("cache")
    }

    pub fn capture_manifest(&self, phase: &str) -> PathBuf {
        self.phase_dir(phase).join("capture_manifest.json")
    }

    pub fn benchmark_report(&self, phase: &str) -> PathBuf {
        self.phase_dir(phase).join("benchmark_report.json")
    }

    pub fn query_snapshot(&self, phase: &str, mode: &str) -> PathBuf {
        self.phase_dir(phase).join(format!("query_snapshot_{mode}.ndjson"))
    }

    pub fn compare_dir(&self) -> PathBuf {
        self.run_dir().join("compare")
    }
}

/// Lexically-latest run directory under `<output-root>/runs/`. Run ids embed
/// a compact UTC timestamp, so lexical order is creation order.
pub fn latest_run_id(output_root: &Path) -> Result<String> {
    let runs_root = output_root.join("runs");
    if !runs_root.exists() {
        bail!("no runs recorded under {}", runs_root.display());
    }

    let mut run_ids: Vec<String> = std::fs::read_dir(&runs_root)
        .with_context(|| format!("failed to read {}", runs_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();

    run_ids.sort();
    run_ids
        .pop()
        .with_context(|| format!("no run directories under {}", runs_root.display()))
}
