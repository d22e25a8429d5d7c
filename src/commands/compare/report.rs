use std::fmt::Write as _;

use serde::Serialize;

use crate::commands::compare::facts::{DriftFacts, MetricDelta};
use crate::commands::compare::rules::{GateStatus, RuleResult, Severity};
use crate::model::{PolicyProvenance, ThresholdPolicy};
use crate::util::now_utc_string;

#[derive(Debug, Clone, Serialize)]
pub struct RuleResults {
    pub hard_failures: Vec<RuleResult>,
    pub soft_failures: Vec<RuleResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyBlock {
    pub source: String,
    pub sha256: String,
    pub thresholds: ThresholdPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub generated_at: String,
    pub run_id: String,
    pub mode: String,
    pub policy: PolicyBlock,
    pub facts: DriftFacts,
    pub rule_results: RuleResults,
    pub gate_status: String,
}

pub fn build(
    run_id: &str,
    mode: &str,
    provenance: &PolicyProvenance,
    policy: ThresholdPolicy,
    facts: DriftFacts,
    fired: Vec<RuleResult>,
    status: GateStatus,
) -> DriftReport {
    let (hard_failures, soft_failures): (Vec<RuleResult>, Vec<RuleResult>) =
        fired.into_iter().partition(|rule| rule.severity == Severity::Hard);

    DriftReport {
        generated_at: now_utc_string(),
        run_id: run_id.to_string(),
        mode: mode.to_string(),
        policy: PolicyBlock {
            source: provenance.source.clone(),
            sha256: provenance.sha256.clone(),
            thresholds: policy,
        },
        facts,
        rule_results: RuleResults { hard_failures, soft_failures },
        gate_status: status.as_str().to_string(),
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.4}"),
        None => "n/a".to_string(),
    }
}

fn fmt_delta(delta: &MetricDelta) -> String {
    format!(
        "{} -> {} (delta {})",
        fmt_opt(delta.before),
        fmt_opt(delta.after),
        fmt_opt(delta.delta)
    )
}

/// Human-readable digest of the same data the JSON report carries.
pub fn render_markdown(report: &DriftReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Drift report: {}", report.run_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Gate status: **{}**", report.gate_status);
    let _ = writeln!(out, "- Capture mode: {}", report.mode);
    let _ = writeln!(out, "- Generated at: {}", report.generated_at);
    let _ = writeln!(
        out,
        "- Policy: {} (sha256 `{}`)",
        report.policy.source, report.policy.sha256
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "## Rule results");
    let _ = writeln!(out);
    if report.rule_results.hard_failures.is_empty() && report.rule_results.soft_failures.is_empty()
    {
        let _ = writeln!(out, "No rules triggered.");
    } else {
        for rule in &report.rule_results.hard_failures {
            let _ = writeln!(
                out,
                "- **HARD** `{}`: {} (observed {}, limit {})",
                rule.id,
                rule.message,
                fmt_opt(rule.observed),
                fmt_opt(rule.limit)
            );
        }
        for rule in &report.rule_results.soft_failures {
            let _ = writeln!(
                out,
                "- SOFT `{}`: {} (observed {}, limit {})",
                rule.id,
                rule.message,
                fmt_opt(rule.observed),
                fmt_opt(rule.limit)
            );
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Check sets");
    let _ = writeln!(out);
    for check_set in &report.facts.check_sets {
        let _ = writeln!(
            out,
            "- {}: {} non-passing before, {} after, {} new ({})",
            check_set.report,
            check_set.before_failing.len(),
            check_set.after_failing.len(),
            check_set.new_failing.len(),
            if check_set.new_failing.is_empty() {
                "none".to_string()
            } else {
                check_set.new_failing.join(", ")
            }
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Quality metrics");
    let _ = writeln!(out);
    let quality = &report.facts.quality;
    let _ = writeln!(out, "- hybrid nDCG@10: {}", fmt_delta(&quality.hybrid_ndcg_at_10));
    let _ = writeln!(out, "- semantic nDCG@10: {}", fmt_delta(&quality.semantic_ndcg_at_10));
    let _ = writeln!(
        out,
        "- exact-ref top-1 hit rate: {}",
        fmt_delta(&quality.exact_ref_top1_hit_rate)
    );
    let _ = writeln!(out, "- citation parity top-1: {}", fmt_delta(&quality.citation_parity_top1));
    let _ = writeln!(
        out,
        "- determinism top-k overlap: {}",
        fmt_delta(&quality.retrieval_determinism_topk_overlap)
    );
    let _ = writeln!(out, "- hybrid recall@50: {}", fmt_delta(&quality.hybrid_recall_at_50));
    let _ = writeln!(out);

    let _ = writeln!(out, "## Query snapshots");
    let _ = writeln!(out);
    for snapshot in &report.facts.snapshots {
        let _ = writeln!(out, "### {}", snapshot.mode);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "- queries: {} before / {} after ({} comparable)",
            snapshot.before.query_count,
            snapshot.after.query_count,
            snapshot.overlap.common_query_count
        );
        let _ = writeln!(
            out,
            "- no-result rate: {:.4} -> {:.4}",
            snapshot.before.no_result_rate, snapshot.after.no_result_rate
        );
        let _ = writeln!(
            out,
            "- timeout rate: {:.4} -> {:.4}",
            snapshot.before.timeout_rate, snapshot.after.timeout_rate
        );
        let _ = writeln!(
            out,
            "- fallback rate: {:.4} -> {:.4}",
            snapshot.before.fallback_rate, snapshot.after.fallback_rate
        );
        let _ = writeln!(
            out,
            "- top-1 expected-hit rate: {} -> {}",
            fmt_opt(snapshot.before.top1_expected_hit_rate),
            fmt_opt(snapshot.after.top1_expected_hit_rate)
        );
        let _ = writeln!(
            out,
            "- mean Jaccard@10: {}; top-1 unchanged: {}",
            fmt_opt(snapshot.overlap.mean_jaccard_top10),
            fmt_opt(snapshot.overlap.top1_same_rate)
        );
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Benchmark latency");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "- benchmark validity: before {}, after {}",
        report.facts.bench_valid_before, report.facts.bench_valid_after
    );
    for bench in &report.facts.benchmark {
        let _ = writeln!(
            out,
            "- {}: p50 {} | p95 {} | p99 {} | mean {}",
            bench.mode,
            fmt_delta(&bench.latency_ms.p50),
            fmt_delta(&bench.latency_ms.p95),
            fmt_delta(&bench.latency_ms.p99),
            fmt_delta(&bench.latency_ms.mean)
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Model lockfile");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "- changed: {} (before {}, after {})",
        report.facts.lockfile.changed,
        report.facts.lockfile.before_sha256.as_deref().unwrap_or("absent"),
        report.facts.lockfile.after_sha256.as_deref().unwrap_or("absent")
    );

    out
}
