use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::metrics::NumericStats;
use crate::util::{append_ndjson_line, now_utc_string, read_json, read_ndjson, sha256_bytes};

pub const CAPTURE_MANIFEST_VERSION: u32 = 1;
pub const THRESHOLD_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Threshold policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub schema_version: u32,
    pub hard: HardLimits,
    pub soft: SoftLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardLimits {
    pub max_new_failed_checks: usize,
    pub max_hybrid_ndcg10_drop: f64,
    pub max_exact_top1_hit_rate_drop: f64,
    pub max_citation_parity_top1_drop: f64,
    pub min_determinism_topk_overlap: f64,
    pub min_top1_expected_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftLimits {
    pub max_semantic_ndcg10_drop: f64,
    pub max_recall50_drop: f64,
    pub max_no_result_rate_increase: f64,
    pub max_timeout_rate_increase: f64,
    pub max_fallback_rate_increase: f64,
    pub min_mean_jaccard_top10: f64,
    pub min_top1_same_rate: f64,
    pub bench_p95_abs_floor_ms: f64,
    pub bench_p95_rel_floor_pct: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            schema_version: THRESHOLD_SCHEMA_VERSION,
            hard: HardLimits {
                max_new_failed_checks: 0,
                max_hybrid_ndcg10_drop: 0.02,
                max_exact_top1_hit_rate_drop: 0.02,
                max_citation_parity_top1_drop: 0.02,
                min_determinism_topk_overlap: 1.0,
                min_top1_expected_hit_rate: 0.90,
            },
            soft: SoftLimits {
                max_semantic_ndcg10_drop: 0.02,
                max_recall50_drop: 0.03,
                max_no_result_rate_increase: 0.02,
                max_timeout_rate_increase: 0.02,
                max_fallback_rate_increase: 0.05,
                min_mean_jaccard_top10: 0.80,
                min_top1_same_rate: 0.90,
                bench_p95_abs_floor_ms: 5.0,
                bench_p95_rel_floor_pct: 10.0,
            },
        }
    }
}

/// Where a loaded policy came from, recorded in the drift report for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyProvenance {
    pub source: String,
    pub sha256: String,
}

pub struct LoadedPolicy {
    pub policy: ThresholdPolicy,
    pub provenance: PolicyProvenance,
}

/// A missing policy file falls back to built-in defaults; a present but
/// unparseable file is a configuration error.
pub fn load_threshold_policy(path: Option<&Path>) -> Result<LoadedPolicy> {
    let Some(path) = path else {
        let policy = ThresholdPolicy::default();
        let canonical = serde_json::to_vec(&policy)
            .context("failed to serialize built-in threshold defaults")?;
        return Ok(LoadedPolicy {
            policy,
            provenance: PolicyProvenance {
                source: "builtin-defaults".to_string(),
                sha256: sha256_bytes(&canonical),
            },
        });
    };

    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read threshold policy: {}", path.display()))?;
    let policy: ThresholdPolicy = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse threshold policy: {}", path.display()))?;

    if policy.schema_version != THRESHOLD_SCHEMA_VERSION {
        bail!(
            "unsupported threshold policy schema_version {} in {} (expected {})",
            policy.schema_version,
            path.display(),
            THRESHOLD_SCHEMA_VERSION
        );
    }

    Ok(LoadedPolicy {
        provenance: PolicyProvenance {
            source: path.display().to_string(),
            sha256: sha256_bytes(&raw),
        },
        policy,
    })
}

// ---------------------------------------------------------------------------
// Decision log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_id: u64,
    pub recorded_at: String,
    pub run_id: String,
    pub phase: Option<String>,
    pub step: Option<String>,
    pub action: String,
    pub reason: String,
}

/// Append-only decision trail for a run. Ids must strictly increase; a
/// regression means the log was edited or two writers raced, both of which
/// invalidate the audit trail.
pub fn load_decision_log(path: &Path) -> Result<Vec<DecisionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let records: Vec<DecisionRecord> = read_ndjson(path)?;
    let mut previous_id: Option<u64> = None;
    for (index, record) in records.iter().enumerate() {
        if let Some(previous) = previous_id
            && record.decision_id <= previous
        {
            bail!(
                "decision log {} line {}: decision_id {} does not increase past {}",
                path.display(),
                index + 1,
                record.decision_id,
                previous
            );
        }
        previous_id = Some(record.decision_id);
    }

    Ok(records)
}

pub fn append_decision(
    path: &Path,
    run_id: &str,
    phase: Option<&str>,
    step: Option<&str>,
    action: &str,
    reason: &str,
) -> Result<DecisionRecord> {
    let existing = load_decision_log(path)?;
    let next_id = existing.last().map(|record| record.decision_id + 1).unwrap_or(1);

    let record = DecisionRecord {
        decision_id: next_id,
        recorded_at: now_utc_string(),
        run_id: run_id.to_string(),
        phase: phase.map(str::to_string),
        step: step.map(str::to_string),
        action: action.to_string(),
        reason: reason.to_string(),
    };
    append_ndjson_line(path, &record)?;

    Ok(record)
}

// ---------------------------------------------------------------------------
// Query manifest (gate input, engine eval-manifest shape)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source: String,
    pub queries: Vec<QueryCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCase {
    pub query_id: String,
    pub query_text: String,
    #[serde(default)]
    pub expected_chunk_ids: Vec<String>,
    #[serde(default)]
    pub must_hit_top1: bool,
    #[serde(default)]
    pub part_filter: Option<u32>,
    #[serde(default)]
    pub chunk_type_filter: Option<String>,
}

pub fn load_query_manifest(path: &Path) -> Result<QueryManifest> {
    let mut manifest: QueryManifest = read_json(path)?;
    if manifest.queries.is_empty() {
        bail!("query manifest {} contains no queries", path.display());
    }

    manifest
        .queries
        .sort_by(|a, b| a.query_id.cmp(&b.query_id));
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Query snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCandidateCounts {
    pub lexical: u64,
    pub semantic: u64,
    pub fused: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHit {
    pub chunk_id: String,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySnapshotRecord {
    pub query_id: String,
    pub status: String,
    pub returned: usize,
    pub fallback_used: bool,
    pub timed_out: bool,
    pub candidate_counts: SnapshotCandidateCounts,
    pub top_k: Vec<SnapshotHit>,
    pub top1_chunk_id: Option<String>,
    pub top1_reference: Option<String>,
    pub expected_chunk_ids: Vec<String>,
    pub must_hit_top1: bool,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Benchmark report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkScope {
    pub profile: String,
    pub lexical_k: usize,
    pub semantic_k: usize,
    pub rrf_k: u32,
    pub limit: usize,
    pub timeout_ms: u64,
    pub query_count: usize,
    pub warmup_passes: usize,
    pub timed_passes: usize,
    pub repetition_index: usize,
    pub repetition_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkEnvironment {
    pub os: String,
    pub arch: String,
    pub engine_version: String,
    pub captured_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeSummary {
    pub mode: String,
    pub expected_timed_queries: usize,
    pub completed_timed_queries: usize,
    pub timed_failure_count: usize,
    pub failure_rate: f64,
    pub latency_ms: NumericStats,
    pub wall_ms: NumericStats,
    pub returned: NumericStats,
    pub lexical_candidates: NumericStats,
    pub semantic_candidates: NumericStats,
    pub fused_candidates: NumericStats,
    pub fallback_used_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkFailure {
    pub mode: String,
    pub phase: String,
    pub pass_index: usize,
    pub query_id: String,
    pub wall_ms: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkOverall {
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub scope: BenchmarkScope,
    pub environment: BenchmarkEnvironment,
    pub mode_summaries: Vec<ModeSummary>,
    pub failures: Vec<BenchmarkFailure>,
    pub overall: BenchmarkOverall,
}

// ---------------------------------------------------------------------------
// Capture manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitMetadata {
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub dirty: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureArtifact {
    pub name: String,
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub phase: String,
    pub mode: String,
    pub captured_at: String,
    pub engine_version: String,
    pub git: GitMetadata,
    pub artifacts: Vec<CaptureArtifact>,
    pub notes: Vec<String>,
}

impl CaptureManifest {
    pub fn artifact(&self, name: &str) -> Option<&CaptureArtifact> {
        self.artifacts.iter().find(|artifact| artifact.name == name)
    }
}

// ---------------------------------------------------------------------------
// Engine quality reports (read side of the engine contract)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QualityReportDoc {
    pub run_id: String,
    pub status: String,
    pub summary: QualitySummary,
    pub checks: Vec<QualityCheck>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualitySummary {
    pub total_checks: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualityCheck {
    pub check_id: String,
    pub result: String,
}

/// Subset of the engine's semantic quality summary the gate compares on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SemanticQualityDoc {
    pub summary: SemanticQualitySummary,
    #[serde(default)]
    pub checks: Vec<QualityCheck>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SemanticQualitySummary {
    pub semantic_ndcg_at_10: Option<f64>,
    pub hybrid_ndcg_at_10: Option<f64>,
    pub exact_ref_top1_hit_rate: Option<f64>,
    pub citation_parity_top1: Option<f64>,
    pub retrieval_determinism_topk_overlap: Option<f64>,
    pub hybrid_recall_at_50: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::{
        DecisionRecord, ThresholdPolicy, append_decision, load_decision_log,
        load_threshold_policy,
    };
    use crate::util::append_ndjson_line;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "iso26262-gate-model-{tag}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).expect("scratch dir should be creatable");
        dir
    }

    #[test]
    fn builtin_policy_checksum_is_stable_across_load_cycles() {
        let first = load_threshold_policy(None).expect("defaults should load");
        let second = load_threshold_policy(None).expect("defaults should load");
        assert_eq!(first.provenance.sha256, second.provenance.sha256);
        assert_eq!(first.provenance.source, "builtin-defaults");
    }

    #[test]
    fn policy_round_trips_through_serde() {
        let policy = ThresholdPolicy::default();
        let raw = serde_json::to_string(&policy).expect("policy should serialize");
        let back: ThresholdPolicy = serde_json::from_str(&raw).expect("policy should parse");
        assert_eq!(policy, back);
    }

    #[test]
    fn decision_ids_increment_monotonically() {
        let dir = scratch_dir("decisions");
        let path = dir.join("decision_log.ndjson");

        let first = append_decision(&path, "run-1", Some("before"), None, "run-start", "fresh run")
            .expect("append should succeed");
        let second = append_decision(&path, "run-1", Some("before"), Some("R03-COMPAT-CHECK"),
            "compat-ok", "versions match")
            .expect("append should succeed");

        assert_eq!(first.decision_id, 1);
        assert_eq!(second.decision_id, 2);
        assert_eq!(load_decision_log(&path).expect("log should load").len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn decision_id_regression_is_an_error_naming_the_line() {
        let dir = scratch_dir("regress");
        let path = dir.join("decision_log.ndjson");

        for id in [1_u64, 5, 3] {
            append_ndjson_line(
                &path,
                &DecisionRecord {
                    decision_id: id,
                    recorded_at: "2026-01-01T00:00:00Z".to_string(),
                    run_id: "run-1".to_string(),
                    phase: None,
                    step: None,
                    action: "test".to_string(),
                    reason: "fixture".to_string(),
                },
            )
            .expect("fixture append should succeed");
        }

        let err = load_decision_log(&path).expect_err("regression should fail");
        assert!(err.to_string().contains("line 3"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
