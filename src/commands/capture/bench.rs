use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::engine::{EngineCli, QueryRequest};
use crate::metrics::numeric_stats;
use crate::model::{
    BenchmarkEnvironment, BenchmarkFailure, BenchmarkOverall, BenchmarkReport, BenchmarkScope,
    ModeSummary, QueryCase,
};
use crate::util::now_utc_string;

pub const BENCH_MODES: [&str; 3] = ["lexical", "semantic", "hybrid"];
pub const PHASE_WARMUP: &str = "warmup";
pub const PHASE_TIMED: &str = "timed";

/// Per-mode failure budget. One percent of expected timed queries.
const MAX_FAILURE_RATE: f64 = 0.01;

/// One successfully executed query case. Immutable once produced; the
/// aggregator only ever reads these.
#[derive(Debug, Clone)]
pub struct TimedRecord {
    pub mode: String,
    pub phase: String,
    pub pass_index: usize,
    pub query_id: String,
    pub latency_ms: f64,
    pub wall_ms: f64,
    pub lexical_candidates: u64,
    pub semantic_candidates: u64,
    pub fused_candidates: u64,
    pub returned: usize,
    pub fallback_used: bool,
}

#[derive(Debug, Clone)]
pub struct BenchParams {
    pub profile: String,
    pub lexical_k: usize,
    pub semantic_k: usize,
    pub rrf_k: u32,
    pub limit: usize,
    pub timeout_ms: u64,
    pub warmup_passes: usize,
    pub timed_passes: usize,
    pub repetitions: usize,
}

/// Collapse one mode's records into distribution stats. The failure rate is
/// computed against the planned query count, not the observed one, so a run
/// that silently lost queries is penalized instead of flattered.
pub fn summarize_mode(
    mode: &str,
    timed: &[TimedRecord],
    failures: &[BenchmarkFailure],
    expected_timed_queries: usize,
) -> ModeSummary {
    let rows: Vec<&TimedRecord> = timed
        .iter()
        .filter(|record| record.mode == mode && record.phase == PHASE_TIMED)
        .collect();
    let timed_failure_count = failures
        .iter()
        .filter(|failure| failure.mode == mode && failure.phase == PHASE_TIMED)
        .count();

    let latency: Vec<f64> = rows.iter().map(|record| record.latency_ms).collect();
    let wall: Vec<f64> = rows.iter().map(|record| record.wall_ms).collect();
    let returned: Vec<f64> = rows.iter().map(|record| record.returned as f64).collect();
    let lexical: Vec<f64> = rows.iter().map(|record| record.lexical_candidates as f64).collect();
    let semantic: Vec<f64> = rows.iter().map(|record| record.semantic_candidates as f64).collect();
    let fused: Vec<f64> = rows.iter().map(|record| record.fused_candidates as f64).collect();

    let failure_rate = if expected_timed_queries == 0 {
        0.0
    } else {
        timed_failure_count as f64 / expected_timed_queries as f64
    };
    let fallback_used_rate = if rows.is_empty() {
        0.0
    } else {
        rows.iter().filter(|record| record.fallback_used).count() as f64 / rows.len() as f64
    };

    ModeSummary {
        mode: mode.to_string(),
        expected_timed_queries,
        completed_timed_queries: rows.len(),
        timed_failure_count,
        failure_rate,
        latency_ms: numeric_stats(&latency),
        wall_ms: numeric_stats(&wall),
        returned: numeric_stats(&returned),
        lexical_candidates: numeric_stats(&lexical),
        semantic_candidates: numeric_stats(&semantic),
        fused_candidates: numeric_stats(&fused),
        fallback_used_rate,
    }
}

pub fn build_report(
    scope: BenchmarkScope,
    environment: BenchmarkEnvironment,
    timed: &[TimedRecord],
    failures: Vec<BenchmarkFailure>,
) -> BenchmarkReport {
    let expected = scope.timed_passes * scope.query_count;
    let mode_summaries: Vec<ModeSummary> = BENCH_MODES
        .iter()
        .map(|mode| summarize_mode(mode, timed, &failures, expected))
        .collect();

    let valid = mode_summaries
        .iter()
        .all(|summary| summary.failure_rate <= MAX_FAILURE_RATE);

    BenchmarkReport {
        scope,
        environment,
        mode_summaries,
        failures,
        overall: BenchmarkOverall { valid },
    }
}

fn hybrid_p95(report: &BenchmarkReport) -> Option<f64> {
    report
        .mode_summaries
        .iter()
        .find(|summary| summary.mode == "hybrid")
        .and_then(|summary| summary.latency_ms.p95)
}

/// Rank-median selection across repetitions by hybrid p95 latency. Damps
/// single-run noise without rewarding the single best or worst run. A
/// repetition with no p95 sorts last.
pub fn select_median_repetition(reports: &[BenchmarkReport]) -> Option<usize> {
    if reports.is_empty() {
        return None;
    }

    let mut order: Vec<usize> = (0..reports.len()).collect();
    order.sort_by(|&a, &b| {
        let left = hybrid_p95(&reports[a]);
        let right = hybrid_p95(&reports[b]);
        match (left, right) {
            (Some(left), Some(right)) => left.total_cmp(&right),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(&b),
        }
    });

    Some(order[(order.len() - 1) / 2])
}

/// Run the full benchmark: N repetitions of warmup plus timed passes over
/// every query in every retrieval mode, then keep the median repetition.
pub fn run_benchmark(
    engine: &EngineCli,
    queries: &[QueryCase],
    params: &BenchParams,
    engine_version: &str,
) -> Result<BenchmarkReport> {
    let mut reports: Vec<BenchmarkReport> = Vec::with_capacity(params.repetitions);

    for repetition in 0..params.repetitions {
        info!(repetition, repetitions = params.repetitions, "benchmark repetition starting");
        let report = run_repetition(engine, queries, params, engine_version, repetition)?;
        reports.push(report);
    }

    let selected = select_median_repetition(&reports)
        .context("benchmark produced no repetitions to select from")?;
    info!(selected, "selected median benchmark repetition by hybrid p95");

    Ok(reports.swap_remove(selected))
}

fn run_repetition(
    engine: &EngineCli,
    queries: &[QueryCase],
    params: &BenchParams,
    engine_version: &str,
    repetition: usize,
) -> Result<BenchmarkReport> {
    let mut timed: Vec<TimedRecord> = Vec::new();
    let mut failures: Vec<BenchmarkFailure> = Vec::new();

    for mode in BENCH_MODES {
        for pass_index in 0..(params.warmup_passes + params.timed_passes) {
            let phase = if pass_index < params.warmup_passes { PHASE_WARMUP } else { PHASE_TIMED };

            for case in queries {
                let request = QueryRequest {
                    query: case.query_text.clone(),
                    retrieval_mode: mode.to_string(),
                    lexical_k: params.lexical_k,
                    semantic_k: params.semantic_k,
                    rrf_k: params.rrf_k,
                    timeout_ms: params.timeout_ms,
                    limit: params.limit,
                    part_filter: case.part_filter,
                    chunk_type_filter: case.chunk_type_filter.clone(),
                };

                let started = Instant::now();
                match engine.query(&request) {
                    Ok(response) => timed.push(TimedRecord {
                        mode: mode.to_string(),
                        phase: phase.to_string(),
                        pass_index,
                        query_id: case.query_id.clone(),
                        latency_ms: response.retrieval.query_duration_ms,
                        wall_ms: started.elapsed().as_secs_f64() * 1000.0,
                        lexical_candidates: response.retrieval.lexical_candidate_count,
                        semantic_candidates: response.retrieval.semantic_candidate_count,
                        fused_candidates: response.retrieval.fused_candidate_count,
                        returned: response.returned,
                        fallback_used: response.retrieval.fallback_used,
                    }),
                    Err(err) => {
                        warn!(
                            mode = %mode,
                            phase = %phase,
                            query_id = %case.query_id,
                            error = %err,
                            "benchmark query failed"
                        );
                        failures.push(BenchmarkFailure {
                            mode: mode.to_string(),
                            phase: phase.to_string(),
                            pass_index,
                            query_id: case.query_id.clone(),
                            wall_ms: started.elapsed().as_secs_f64() * 1000.0,
                            reason: format!("{err:#}"),
                        });
                    }
                }
            }
        }
    }

    let scope = BenchmarkScope {
        profile: params.profile.clone(),
        lexical_k: params.lexical_k,
        semantic_k: params.semantic_k,
        rrf_k: params.rrf_k,
        limit: params.limit,
        timeout_ms: params.timeout_ms,
        query_count: queries.len(),
        warmup_passes: params.warmup_passes,
        timed_passes: params.timed_passes,
        repetition_index: repetition,
        repetition_count: params.repetitions,
    };
    let environment = BenchmarkEnvironment {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        engine_version: engine_version.to_string(),
        captured_at: now_utc_string(),
    };

    Ok(build_report(scope, environment, &timed, failures))
}

#[cfg(test)]
mod tests {
    use super::{
        BENCH_MODES, PHASE_TIMED, TimedRecord, build_report, select_median_repetition,
        summarize_mode,
    };
    use crate::model::{
        BenchmarkEnvironment, BenchmarkFailure, BenchmarkReport, BenchmarkScope,
    };

    fn timed_record(mode: &str, query_id: &str, pass_index: usize, latency_ms: f64) -> TimedRecord {
        TimedRecord {
            mode: mode.to_string(),
            phase: PHASE_TIMED.to_string(),
            pass_index,
            query_id: query_id.to_string(),
            latency_ms,
            wall_ms: latency_ms + 1.5,
            lexical_candidates: 40,
            semantic_candidates: 38,
            fused_candidates: 55,
            returned: 10,
            fallback_used: false,
        }
    }

    fn timed_failure(mode: &str, query_id: &str) -> BenchmarkFailure {
        BenchmarkFailure {
            mode: mode.to_string(),
            phase: PHASE_TIMED.to_string(),
            pass_index: 1,
            query_id: query_id.to_string(),
            wall_ms: 4.0,
            reason: "engine query exited with exit status: 1".to_string(),
        }
    }

    fn scope(query_count: usize, timed_passes: usize) -> BenchmarkScope {
        BenchmarkScope {
            profile: "lite".to_string(),
            lexical_k: 96,
            semantic_k: 96,
            rrf_k: 60,
            limit: 10,
            timeout_ms: 2000,
            query_count,
            warmup_passes: 1,
            timed_passes,
            repetition_index: 0,
            repetition_count: 3,
        }
    }

    fn environment() -> BenchmarkEnvironment {
        BenchmarkEnvironment {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            engine_version: "0.1.0".to_string(),
            captured_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn report_with_hybrid_p95(p95: Option<f64>) -> BenchmarkReport {
        let timed: Vec<TimedRecord> = match p95 {
            Some(value) => vec![timed_record("hybrid", "q-001", 1, value)],
            None => Vec::new(),
        };
        build_report(scope(1, 1), environment(), &timed, Vec::new())
    }

    #[test]
    fn expected_counts_are_fixed_in_advance() {
        let mut timed = Vec::new();
        for pass_index in [1, 2] {
            for query in 0..10 {
                timed.push(timed_record("hybrid", &format!("q-{query:03}"), pass_index, 8.0));
            }
        }

        let summary = summarize_mode("hybrid", &timed, &[], 20);
        assert_eq!(summary.expected_timed_queries, 20);
        assert_eq!(summary.completed_timed_queries, 20);
        assert_eq!(summary.failure_rate, 0.0);
    }

    #[test]
    fn failure_rate_uses_the_expected_denominator() {
        let timed = vec![timed_record("lexical", "q-001", 1, 8.0)];
        let failures = vec![timed_failure("lexical", "q-002"), timed_failure("lexical", "q-003")];

        // Only one of twenty planned queries completed; the two recorded
        // failures still divide by twenty.
        let summary = summarize_mode("lexical", &timed, &failures, 20);
        assert_eq!(summary.completed_timed_queries, 1);
        assert_eq!(summary.timed_failure_count, 2);
        assert!((summary.failure_rate - 0.1).abs() < 1e-12);
    }

    #[test]
    fn one_percent_failure_budget_is_inclusive() {
        let failures_at_budget: Vec<BenchmarkFailure> =
            (0..2).map(|index| timed_failure("lexical", &format!("q-{index}"))).collect();
        let summary = summarize_mode("lexical", &[], &failures_at_budget, 200);
        assert!((summary.failure_rate - 0.01).abs() < 1e-12);

        let report = build_report(scope(100, 2), environment(), &[], failures_at_budget);
        assert!(report.overall.valid);

        let failures_over_budget: Vec<BenchmarkFailure> =
            (0..3).map(|index| timed_failure("lexical", &format!("q-{index}"))).collect();
        let report = build_report(scope(100, 2), environment(), &[], failures_over_budget);
        assert!(!report.overall.valid);
    }

    #[test]
    fn report_summarizes_every_mode() {
        let report = build_report(scope(1, 1), environment(), &[], Vec::new());
        let modes: Vec<&str> =
            report.mode_summaries.iter().map(|summary| summary.mode.as_str()).collect();
        assert_eq!(modes, BENCH_MODES);
    }

    #[test]
    fn median_selection_picks_the_rank_median_not_the_best() {
        let reports = vec![
            report_with_hybrid_p95(Some(12.0)),
            report_with_hybrid_p95(Some(9.0)),
            report_with_hybrid_p95(Some(31.0)),
        ];
        assert_eq!(select_median_repetition(&reports), Some(0));
    }

    #[test]
    fn missing_hybrid_p95_sorts_last() {
        let reports = vec![
            report_with_hybrid_p95(None),
            report_with_hybrid_p95(Some(20.0)),
            report_with_hybrid_p95(Some(10.0)),
        ];
        // Sorted order: 10, 20, missing; the rank median is the 20ms run.
        assert_eq!(select_median_repetition(&reports), Some(1));
    }

    #[test]
    fn empty_repetition_list_selects_nothing() {
        assert_eq!(select_median_repetition(&[]), None);
    }
}
