use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use crate::metrics::{jaccard, mean, num_delta};
use crate::model::{
    BenchmarkReport, CaptureManifest, ModeSummary, QualityCheck, QuerySnapshotRecord,
    SemanticQualitySummary,
};

/// One before/after pair with its computed delta. Null operands propagate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricDelta {
    pub before: Option<f64>,
    pub after: Option<f64>,
    pub delta: Option<f64>,
}

impl MetricDelta {
    pub fn new(before: Option<f64>, after: Option<f64>) -> Self {
        Self { before, after, delta: num_delta(before, after) }
    }

    /// Positive when the metric decreased; regressions on
    /// higher-is-better metrics read as positive drops.
    pub fn drop(&self) -> Option<f64> {
        self.delta.map(|delta| -delta)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSetDrift {
    pub report: String,
    pub before_failing: Vec<String>,
    pub after_failing: Vec<String>,
    pub new_failing: Vec<String>,
}

pub fn check_set_drift(report: &str, before: &[QualityCheck], after: &[QualityCheck]) -> CheckSetDrift {
    let before_failing = non_passing_ids(before);
    let after_failing = non_passing_ids(after);
    let new_failing: Vec<String> = after_failing
        .iter()
        .filter(|check_id| !before_failing.contains(*check_id))
        .cloned()
        .collect();

    CheckSetDrift {
        report: report.to_string(),
        before_failing: before_failing.into_iter().collect(),
        after_failing: after_failing.into_iter().collect(),
        new_failing,
    }
}

fn non_passing_ids(checks: &[QualityCheck]) -> BTreeSet<String> {
    checks
        .iter()
        .filter(|check| check.result != "pass")
        .map(|check| check.check_id.clone())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityDrift {
    pub hybrid_ndcg_at_10: MetricDelta,
    pub semantic_ndcg_at_10: MetricDelta,
    pub exact_ref_top1_hit_rate: MetricDelta,
    pub citation_parity_top1: MetricDelta,
    pub retrieval_determinism_topk_overlap: MetricDelta,
    pub hybrid_recall_at_50: MetricDelta,
}

pub fn quality_drift(before: &SemanticQualitySummary, after: &SemanticQualitySummary) -> QualityDrift {
    QualityDrift {
        hybrid_ndcg_at_10: MetricDelta::new(before.hybrid_ndcg_at_10, after.hybrid_ndcg_at_10),
        semantic_ndcg_at_10: MetricDelta::new(before.semantic_ndcg_at_10, after.semantic_ndcg_at_10),
        exact_ref_top1_hit_rate: MetricDelta::new(
            before.exact_ref_top1_hit_rate,
            after.exact_ref_top1_hit_rate,
        ),
        citation_parity_top1: MetricDelta::new(
            before.citation_parity_top1,
            after.citation_parity_top1,
        ),
        retrieval_determinism_topk_overlap: MetricDelta::new(
            before.retrieval_determinism_topk_overlap,
            after.retrieval_determinism_topk_overlap,
        ),
        hybrid_recall_at_50: MetricDelta::new(before.hybrid_recall_at_50, after.hybrid_recall_at_50),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub query_count: usize,
    pub error_count: usize,
    pub no_result_rate: f64,
    pub timeout_rate: f64,
    pub fallback_rate: f64,
    pub must_hit_count: usize,
    pub top1_expected_hit_rate: Option<f64>,
}

pub fn snapshot_summary(records: &[QuerySnapshotRecord]) -> SnapshotSummary {
    let total = records.len();
    let rate = |count: usize| if total == 0 { 0.0 } else { count as f64 / total as f64 };

    let error_count = records.iter().filter(|record| record.status != "ok").count();
    let no_result =
        records.iter().filter(|record| record.status == "ok" && record.returned == 0).count();
    let timeouts = records.iter().filter(|record| record.timed_out).count();
    let fallbacks = records.iter().filter(|record| record.fallback_used).count();

    let must_hit: Vec<&QuerySnapshotRecord> =
        records.iter().filter(|record| record.must_hit_top1).collect();
    let top1_expected_hit_rate = if must_hit.is_empty() {
        None
    } else {
        let hits = must_hit
            .iter()
            .filter(|record| {
                record.status == "ok"
                    && record
                        .top1_chunk_id
                        .as_deref()
                        .is_some_and(|top1| record.expected_chunk_ids.iter().any(|id| id == top1))
            })
            .count();
        Some(hits as f64 / must_hit.len() as f64)
    };

    SnapshotSummary {
        query_count: total,
        error_count,
        no_result_rate: rate(no_result),
        timeout_rate: rate(timeouts),
        fallback_rate: rate(fallbacks),
        must_hit_count: must_hit.len(),
        top1_expected_hit_rate,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotOverlap {
    pub common_query_count: usize,
    pub mean_jaccard_top10: Option<f64>,
    pub top1_same_rate: Option<f64>,
}

/// Overlap statistics across the query ids both captures answered without
/// error. Jaccard is computed over each query's top-10 result-id set.
pub fn snapshot_overlap(
    before: &[QuerySnapshotRecord],
    after: &[QuerySnapshotRecord],
) -> SnapshotOverlap {
    let before_by_id: BTreeMap<&str, &QuerySnapshotRecord> = before
        .iter()
        .filter(|record| record.status == "ok")
        .map(|record| (record.query_id.as_str(), record))
        .collect();
    let after_by_id: BTreeMap<&str, &QuerySnapshotRecord> = after
        .iter()
        .filter(|record| record.status == "ok")
        .map(|record| (record.query_id.as_str(), record))
        .collect();

    let mut jaccard_values = Vec::new();
    let mut top1_same = 0_usize;
    let mut common = 0_usize;

    for (query_id, before_record) in &before_by_id {
        let Some(after_record) = after_by_id.get(query_id) else {
            continue;
        };
        common += 1;

        let before_ids: HashSet<String> = before_record
            .top_k
            .iter()
            .take(10)
            .map(|hit| hit.chunk_id.clone())
            .collect();
        let after_ids: HashSet<String> = after_record
            .top_k
            .iter()
            .take(10)
            .map(|hit| hit.chunk_id.clone())
            .collect();
        jaccard_values.push(jaccard(&before_ids, &after_ids));

        if before_record.top1_chunk_id == after_record.top1_chunk_id {
            top1_same += 1;
        }
    }

    SnapshotOverlap {
        common_query_count: common,
        mean_jaccard_top10: mean(&jaccard_values),
        top1_same_rate: if common == 0 { None } else { Some(top1_same as f64 / common as f64) },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDrift {
    pub mode: String,
    pub before: SnapshotSummary,
    pub after: SnapshotSummary,
    pub overlap: SnapshotOverlap,
}

pub fn snapshot_drift(
    mode: &str,
    before: &[QuerySnapshotRecord],
    after: &[QuerySnapshotRecord],
) -> SnapshotDrift {
    SnapshotDrift {
        mode: mode.to_string(),
        before: snapshot_summary(before),
        after: snapshot_summary(after),
        overlap: snapshot_overlap(before, after),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsDelta {
    pub p50: MetricDelta,
    pub p95: MetricDelta,
    pub p99: MetricDelta,
    pub mean: MetricDelta,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchModeDrift {
    pub mode: String,
    pub latency_ms: StatsDelta,
    pub wall_ms: StatsDelta,
}

pub fn bench_drift(before: &BenchmarkReport, after: &BenchmarkReport) -> Vec<BenchModeDrift> {
    let mode_pair = |mode: &str| -> (Option<&ModeSummary>, Option<&ModeSummary>) {
        (
            before.mode_summaries.iter().find(|summary| summary.mode == mode),
            after.mode_summaries.iter().find(|summary| summary.mode == mode),
        )
    };

    let mut modes: Vec<&str> =
        before.mode_summaries.iter().map(|summary| summary.mode.as_str()).collect();
    for summary in &after.mode_summaries {
        if !modes.contains(&summary.mode.as_str()) {
            modes.push(summary.mode.as_str());
        }
    }

    modes
        .into_iter()
        .map(|mode| {
            let (before_summary, after_summary) = mode_pair(mode);
            let stats = |select: fn(&ModeSummary) -> crate::metrics::NumericStats| StatsDelta {
                p50: MetricDelta::new(
                    before_summary.and_then(|summary| select(summary).p50),
                    after_summary.and_then(|summary| select(summary).p50),
                ),
                p95: MetricDelta::new(
                    before_summary.and_then(|summary| select(summary).p95),
                    after_summary.and_then(|summary| select(summary).p95),
                ),
                p99: MetricDelta::new(
                    before_summary.and_then(|summary| select(summary).p99),
                    after_summary.and_then(|summary| select(summary).p99),
                ),
                mean: MetricDelta::new(
                    before_summary.and_then(|summary| select(summary).mean),
                    after_summary.and_then(|summary| select(summary).mean),
                ),
            };

            BenchModeDrift {
                mode: mode.to_string(),
                latency_ms: stats(|summary| summary.latency_ms),
                wall_ms: stats(|summary| summary.wall_ms),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct LockfileDrift {
    pub before_sha256: Option<String>,
    pub after_sha256: Option<String>,
    pub changed: bool,
}

pub fn lockfile_drift(before: &CaptureManifest, after: &CaptureManifest) -> LockfileDrift {
    let before_sha256 = before.artifact("semantic_model_lock").map(|artifact| artifact.sha256.clone());
    let after_sha256 = after.artifact("semantic_model_lock").map(|artifact| artifact.sha256.clone());
    let changed = match (&before_sha256, &after_sha256) {
        (Some(before_hash), Some(after_hash)) => before_hash != after_hash,
        _ => false,
    };

    LockfileDrift { before_sha256, after_sha256, changed }
}

/// Everything the rule engine evaluates, computed once per comparison.
#[derive(Debug, Clone, Serialize)]
pub struct DriftFacts {
    pub check_sets: Vec<CheckSetDrift>,
    pub quality: QualityDrift,
    pub snapshots: Vec<SnapshotDrift>,
    pub benchmark: Vec<BenchModeDrift>,
    pub bench_valid_before: bool,
    pub bench_valid_after: bool,
    pub lockfile: LockfileDrift,
}
