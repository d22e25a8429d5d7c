use serde::Serialize;

use crate::commands::compare::facts::DriftFacts;
use crate::model::ThresholdPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Hard,
    Soft,
}

/// One triggered rule, normalized for the report: stable id, human message,
/// the observed value, and the limit it violated.
#[derive(Debug, Clone, Serialize)]
pub struct RuleResult {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    pub observed: Option<f64>,
    pub limit: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Pass,
    Warn,
    Fail,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Warn => crate::EXIT_GATE_WARN,
            Self::Fail => crate::EXIT_GATE_FAIL,
        }
    }
}

/// The verdict is a pure function of the triggered rules: any hard failure
/// forces FAIL, otherwise any soft failure forces WARN.
pub fn gate_status(results: &[RuleResult]) -> GateStatus {
    if results.iter().any(|result| result.severity == Severity::Hard) {
        GateStatus::Fail
    } else if results.is_empty() {
        GateStatus::Pass
    } else {
        GateStatus::Warn
    }
}

/// Evaluate the threshold policy against computed drift facts. Only
/// triggered rules are returned.
pub fn evaluate(facts: &DriftFacts, policy: &ThresholdPolicy) -> Vec<RuleResult> {
    let mut fired: Vec<RuleResult> = Vec::new();

    for check_set in &facts.check_sets {
        if check_set.new_failing.len() > policy.hard.max_new_failed_checks {
            fired.push(RuleResult {
                id: format!("H-NEW-FAILED-CHECKS-{}", check_set.report.to_uppercase()),
                severity: Severity::Hard,
                message: format!(
                    "{} report gained non-passing checks: {}",
                    check_set.report,
                    check_set.new_failing.join(", ")
                ),
                observed: Some(check_set.new_failing.len() as f64),
                limit: Some(policy.hard.max_new_failed_checks as f64),
            });
        }
    }

    if !facts.bench_valid_before {
        fired.push(RuleResult {
            id: "H-BENCH-INVALID-BEFORE".to_string(),
            severity: Severity::Hard,
            message: "before benchmark exceeded its timed-failure budget; latency deltas are untrustworthy"
                .to_string(),
            observed: Some(0.0),
            limit: Some(1.0),
        });
    }
    if !facts.bench_valid_after {
        fired.push(RuleResult {
            id: "H-BENCH-INVALID-AFTER".to_string(),
            severity: Severity::Hard,
            message: "after benchmark exceeded its timed-failure budget; latency deltas are untrustworthy"
                .to_string(),
            observed: Some(0.0),
            limit: Some(1.0),
        });
    }

    push_drop_rule(
        &mut fired,
        "H-QUALITY-HYBRID-NDCG10-DROP",
        Severity::Hard,
        "hybrid nDCG@10",
        facts.quality.hybrid_ndcg_at_10.drop(),
        policy.hard.max_hybrid_ndcg10_drop,
    );
    push_drop_rule(
        &mut fired,
        "H-QUALITY-EXACT-TOP1-DROP",
        Severity::Hard,
        "exact-reference top-1 hit rate",
        facts.quality.exact_ref_top1_hit_rate.drop(),
        policy.hard.max_exact_top1_hit_rate_drop,
    );
    push_drop_rule(
        &mut fired,
        "H-QUALITY-CITATION-PARITY-DROP",
        Severity::Hard,
        "citation parity top-1",
        facts.quality.citation_parity_top1.drop(),
        policy.hard.max_citation_parity_top1_drop,
    );

    // Determinism is held to an absolute floor, not a delta: the after
    // capture must meet the policy minimum outright.
    if let Some(after) = facts.quality.retrieval_determinism_topk_overlap.after
        && after < policy.hard.min_determinism_topk_overlap
    {
        fired.push(RuleResult {
            id: "H-DETERMINISM-TOPK-OVERLAP".to_string(),
            severity: Severity::Hard,
            message: format!(
                "retrieval determinism top-k overlap {:.4} is below the required floor {:.4}",
                after, policy.hard.min_determinism_topk_overlap
            ),
            observed: Some(after),
            limit: Some(policy.hard.min_determinism_topk_overlap),
        });
    }

    push_drop_rule(
        &mut fired,
        "S-QUALITY-SEMANTIC-NDCG10-DROP",
        Severity::Soft,
        "semantic nDCG@10",
        facts.quality.semantic_ndcg_at_10.drop(),
        policy.soft.max_semantic_ndcg10_drop,
    );
    push_drop_rule(
        &mut fired,
        "S-QUALITY-RECALL50-DROP",
        Severity::Soft,
        "hybrid recall@50",
        facts.quality.hybrid_recall_at_50.drop(),
        policy.soft.max_recall50_drop,
    );

    for snapshot in &facts.snapshots {
        let mode_tag = snapshot.mode.to_uppercase();

        // Hard only when the before capture actually held the floor; a rate
        // that was already out of compliance can only regress further, which
        // the soft rules still surface.
        if let (Some(before_rate), Some(after_rate)) = (
            snapshot.before.top1_expected_hit_rate,
            snapshot.after.top1_expected_hit_rate,
        ) && before_rate >= policy.hard.min_top1_expected_hit_rate
            && after_rate < policy.hard.min_top1_expected_hit_rate
        {
            fired.push(RuleResult {
                id: format!("H-SNAP-TOP1-EXPECTED-{mode_tag}"),
                severity: Severity::Hard,
                message: format!(
                    "{} top-1 expected-hit rate fell from {:.4} below the {:.4} floor to {:.4}",
                    snapshot.mode, before_rate, policy.hard.min_top1_expected_hit_rate, after_rate
                ),
                observed: Some(after_rate),
                limit: Some(policy.hard.min_top1_expected_hit_rate),
            });
        }

        push_increase_rule(
            &mut fired,
            &format!("S-SNAP-NO-RESULT-{mode_tag}"),
            &format!("{} no-result rate", snapshot.mode),
            snapshot.before.no_result_rate,
            snapshot.after.no_result_rate,
            policy.soft.max_no_result_rate_increase,
        );
        push_increase_rule(
            &mut fired,
            &format!("S-SNAP-TIMEOUT-{mode_tag}"),
            &format!("{} timeout rate", snapshot.mode),
            snapshot.before.timeout_rate,
            snapshot.after.timeout_rate,
            policy.soft.max_timeout_rate_increase,
        );
        push_increase_rule(
            &mut fired,
            &format!("S-SNAP-FALLBACK-{mode_tag}"),
            &format!("{} fallback rate", snapshot.mode),
            snapshot.before.fallback_rate,
            snapshot.after.fallback_rate,
            policy.soft.max_fallback_rate_increase,
        );

        if let Some(mean_jaccard) = snapshot.overlap.mean_jaccard_top10
            && mean_jaccard < policy.soft.min_mean_jaccard_top10
        {
            fired.push(RuleResult {
                id: format!("S-SNAP-JACCARD10-{mode_tag}"),
                severity: Severity::Soft,
                message: format!(
                    "{} mean Jaccard@10 {:.4} is below the {:.4} floor",
                    snapshot.mode, mean_jaccard, policy.soft.min_mean_jaccard_top10
                ),
                observed: Some(mean_jaccard),
                limit: Some(policy.soft.min_mean_jaccard_top10),
            });
        }
        if let Some(top1_same) = snapshot.overlap.top1_same_rate
            && top1_same < policy.soft.min_top1_same_rate
        {
            fired.push(RuleResult {
                id: format!("S-SNAP-TOP1-CHANGED-{mode_tag}"),
                severity: Severity::Soft,
                message: format!(
                    "{} top-1 identity stability {:.4} is below the {:.4} floor",
                    snapshot.mode, top1_same, policy.soft.min_top1_same_rate
                ),
                observed: Some(top1_same),
                limit: Some(policy.soft.min_top1_same_rate),
            });
        }
    }

    for bench in &facts.benchmark {
        let mode_tag = bench.mode.to_uppercase();
        if let (Some(before_p95), Some(increase)) =
            (bench.latency_ms.p95.before, bench.latency_ms.p95.delta)
        {
            // Absolute floor keeps already-fast modes from tripping on
            // millisecond jitter; the relative floor still catches
            // proportionally large regressions on slow modes.
            let limit = policy
                .soft
                .bench_p95_abs_floor_ms
                .max(policy.soft.bench_p95_rel_floor_pct / 100.0 * before_p95);
            if increase > limit {
                fired.push(RuleResult {
                    id: format!("S-BENCH-P95-{mode_tag}"),
                    severity: Severity::Soft,
                    message: format!(
                        "{} p95 latency rose {:.2} ms over a {:.2} ms baseline (allowed {:.2} ms)",
                        bench.mode, increase, before_p95, limit
                    ),
                    observed: Some(increase),
                    limit: Some(limit),
                });
            }
        }
    }

    if facts.lockfile.changed {
        fired.push(RuleResult {
            id: "S-LOCKFILE-MODEL-CHANGED".to_string(),
            severity: Severity::Soft,
            message: "semantic model lockfile checksum changed between captures".to_string(),
            observed: None,
            limit: None,
        });
    }

    fired
}

fn push_drop_rule(
    fired: &mut Vec<RuleResult>,
    id: &str,
    severity: Severity,
    label: &str,
    drop: Option<f64>,
    limit: f64,
) {
    if let Some(drop) = drop
        && drop > limit
    {
        fired.push(RuleResult {
            id: id.to_string(),
            severity,
            message: format!("{label} dropped {drop:.4} (allowed {limit:.4})"),
            observed: Some(drop),
            limit: Some(limit),
        });
    }
}

fn push_increase_rule(
    fired: &mut Vec<RuleResult>,
    id: &str,
    label: &str,
    before: f64,
    after: f64,
    limit: f64,
) {
    let increase = after - before;
    if increase > limit {
        fired.push(RuleResult {
            id: id.to_string(),
            severity: Severity::Soft,
            message: format!("{label} rose {increase:.4} (allowed {limit:.4})"),
            observed: Some(increase),
            limit: Some(limit),
        });
    }
}
