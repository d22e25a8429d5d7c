use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

/// Adapter over the external `iso26262` extraction engine. Every invocation
/// is a blocking child process run to completion; a non-zero exit surfaces
/// the engine's trimmed stderr in the error message.
#[derive(Debug, Clone)]
pub struct EngineCli {
    bin: PathBuf,
    cache_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Full,
    MissingOrStale,
}

impl RefreshMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::MissingOrStale => "missing-or-stale",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub retrieval_mode: String,
    pub lexical_k: usize,
    pub semantic_k: usize,
    pub rrf_k: u32,
    pub timeout_ms: u64,
    pub limit: usize,
    pub part_filter: Option<u32>,
    pub chunk_type_filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    pub returned: usize,
    pub results: Vec<QueryResult>,
    pub retrieval: RetrievalMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResult {
    pub chunk_id: String,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub citation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalMetadata {
    pub query_duration_ms: f64,
    pub lexical_candidate_count: u64,
    pub semantic_candidate_count: u64,
    pub fused_candidate_count: u64,
    pub fallback_used: bool,
}

impl EngineCli {
    pub fn new(bin: PathBuf, cache_root: PathBuf) -> Self {
        Self { bin, cache_root }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    pub fn with_cache_root(&self, cache_root: PathBuf) -> Self {
        Self { bin: self.bin.clone(), cache_root }
    }

    /// Dotted version extracted from the engine's `--version` line. Also
    /// serves as the preflight "engine is runnable" probe.
    pub fn engine_version(&self) -> Result<String> {
        let stdout = self.run_capture(&["--version".to_string()])?;
        let pattern = Regex::new(r"(\d+\.\d+\.\d+)").context("failed to compile version regex")?;
        let Some(captures) = pattern.captures(&stdout) else {
            bail!("engine --version output has no dotted version: {}", stdout.trim());
        };
        Ok(captures[1].to_string())
    }

    pub fn ingest(&self) -> Result<()> {
        self.run_capture(&[
            "ingest".to_string(),
            "--cache-root".to_string(),
            self.cache_root.display().to_string(),
        ])?;
        Ok(())
    }

    pub fn embed(&self, refresh_mode: RefreshMode) -> Result<()> {
        // Pin the model lockfile under the working copy so capture can pick
        // it up for provenance regardless of the engine's cwd default.
        let lock_path = self
            .cache_root
            .join("manifests")
            .join("semantic_model_config.lock.json");
        self.run_capture(&[
            "embed".to_string(),
            "--cache-root".to_string(),
            self.cache_root.display().to_string(),
            "--refresh-mode".to_string(),
            refresh_mode.as_str().to_string(),
            "--semantic-model-lock-path".to_string(),
            lock_path.display().to_string(),
        ])?;
        Ok(())
    }

    pub fn validate(&self, quality_report_path: &Path) -> Result<()> {
        self.run_capture(&[
            "validate".to_string(),
            "--cache-root".to_string(),
            self.cache_root.display().to_string(),
            "--quality-report-path".to_string(),
            quality_report_path.display().to_string(),
        ])?;
        Ok(())
    }

    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let mut args = vec![
            "query".to_string(),
            "--cache-root".to_string(),
            self.cache_root.display().to_string(),
            "--query".to_string(),
            request.query.clone(),
            "--retrieval-mode".to_string(),
            request.retrieval_mode.clone(),
            "--lexical-k".to_string(),
            request.lexical_k.to_string(),
            "--semantic-k".to_string(),
            request.semantic_k.to_string(),
            "--rrf-k".to_string(),
            request.rrf_k.to_string(),
            "--timeout-ms".to_string(),
            request.timeout_ms.to_string(),
            "--limit".to_string(),
            request.limit.to_string(),
            "--json".to_string(),
        ];

        if let Some(part) = request.part_filter {
            args.push("--part".to_string());
            args.push(part.to_string());
        }
        if let Some(chunk_type) = request.chunk_type_filter.as_deref() {
            args.push("--type".to_string());
            args.push(chunk_type.to_string());
        }

        let stdout = self.run_capture(&args)?;
        serde_json::from_str(&stdout).with_context(|| {
            format!("failed to parse engine query response for '{}'", request.query)
        })
    }

    fn run_capture(&self, args: &[String]) -> Result<String> {
        debug!(bin = %self.bin.display(), args = ?args, "invoking engine");

        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .with_context(|| format!("failed to launch engine binary: {}", self.bin.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let subcommand = args.first().map(String::as_str).unwrap_or("<none>");
            bail!(
                "engine {} exited with {}: {}",
                subcommand,
                output.status,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout).context("engine emitted non-utf8 stdout")
    }
}

/// Strip per-invocation noise (timings, candidate tallies) so two responses to
/// the same query can be compared for determinism.
pub fn normalized_response_fingerprint(response: &QueryResponse) -> String {
    let ids: Vec<&str> = response
        .results
        .iter()
        .map(|result| result.chunk_id.as_str())
        .collect();
    format!(
        "returned={};fallback={};ids={}",
        response.returned,
        response.retrieval.fallback_used,
        ids.join(",")
    )
}
