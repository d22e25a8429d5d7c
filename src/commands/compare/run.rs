use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::CompareArgs;
use crate::commands::compare::{facts, report, rules};
use crate::commands::{RunPaths, latest_run_id};
use crate::model::{
    BenchmarkReport, CaptureManifest, QualityReportDoc, QuerySnapshotRecord, SemanticQualityDoc,
    append_decision, load_threshold_policy,
};
use crate::util::{read_json, read_ndjson, write_json_pretty};

struct CaptureBundle {
    manifest: CaptureManifest,
    extraction: QualityReportDoc,
    semantic: SemanticQualityDoc,
    lexical_snapshot: Vec<QuerySnapshotRecord>,
    semantic_snapshot: Vec<QuerySnapshotRecord>,
    benchmark: BenchmarkReport,
}

pub fn run(args: CompareArgs) -> Result<i32> {
    let run_id = match args.run_id.clone() {
        Some(run_id) => run_id,
        None => latest_run_id(&args.output_root)?,
    };
    let paths = RunPaths::new(&args.output_root, &run_id);

    let loaded = load_threshold_policy(args.thresholds.as_deref())?;
    let before = load_bundle(&paths, "before")?;
    let after = load_bundle(&paths, "after")?;

    if before.manifest.mode != after.manifest.mode {
        bail!(
            "capture modes differ: before is '{}' but after is '{}'; captures are not comparable",
            before.manifest.mode,
            after.manifest.mode
        );
    }
    let mode = before.manifest.mode.clone();

    let drift_facts = compute_facts(&before, &after);
    let fired = rules::evaluate(&drift_facts, &loaded.policy);
    let status = rules::gate_status(&fired);

    let drift_report = report::build(
        &run_id,
        &mode,
        &loaded.provenance,
        loaded.policy,
        drift_facts,
        fired,
        status,
    );

    let compare_dir = paths.compare_dir();
    write_json_pretty(&compare_dir.join("drift_report.json"), &drift_report)?;
    let markdown_path = compare_dir.join("drift_report.md");
    std::fs::write(&markdown_path, report::render_markdown(&drift_report))
        .with_context(|| format!("failed to write drift summary: {}", markdown_path.display()))?;

    append_decision(
        &paths.decision_log(),
        &run_id,
        None,
        None,
        "compare-verdict",
        &format!(
            "{} ({} hard, {} soft)",
            status.as_str(),
            drift_report.rule_results.hard_failures.len(),
            drift_report.rule_results.soft_failures.len()
        ),
    )?;

    for rule in drift_report
        .rule_results
        .hard_failures
        .iter()
        .chain(&drift_report.rule_results.soft_failures)
    {
        warn!(rule = %rule.id, message = %rule.message, "rule triggered");
    }
    info!(
        run_id = %run_id,
        gate_status = %status.as_str(),
        hard = drift_report.rule_results.hard_failures.len(),
        soft = drift_report.rule_results.soft_failures.len(),
        report = %compare_dir.join("drift_report.json").display(),
        "comparison complete"
    );

    if let Some(expected) = args.expect_status {
        if expected.as_str() != status.as_str() {
            bail!(
                "expected gate status {} but computed {}",
                expected.as_str(),
                status.as_str()
            );
        }
        info!(expected = %expected.as_str(), "expected-status assertion held");
    }

    Ok(status.exit_code())
}

fn load_bundle(paths: &RunPaths, phase: &str) -> Result<CaptureBundle> {
    let manifest_path = paths.capture_manifest(phase);
    if !manifest_path.exists() {
        bail!(
            "no {phase} capture for run {}: {} is missing (run `capture --phase {phase}` first)",
            paths.run_id,
            manifest_path.display()
        );
    }

    let phase_dir = paths.phase_dir(phase);
    Ok(CaptureBundle {
        manifest: read_json(&manifest_path)?,
        extraction: read_json(&phase_dir.join("extraction_quality_report.json"))?,
        semantic: read_json(&phase_dir.join("semantic_quality_report.json"))?,
        lexical_snapshot: read_ndjson(&paths.query_snapshot(phase, "lexical"))?,
        semantic_snapshot: read_ndjson(&paths.query_snapshot(phase, "semantic"))?,
        benchmark: read_json(&paths.benchmark_report(phase))?,
    })
}

fn compute_facts(before: &CaptureBundle, after: &CaptureBundle) -> facts::DriftFacts {
    facts::DriftFacts {
        check_sets: vec![
            facts::check_set_drift("extraction", &before.extraction.checks, &after.extraction.checks),
            facts::check_set_drift("semantic", &before.semantic.checks, &after.semantic.checks),
        ],
        quality: facts::quality_drift(&before.semantic.summary, &after.semantic.summary),
        snapshots: vec![
            facts::snapshot_drift("lexical", &before.lexical_snapshot, &after.lexical_snapshot),
            facts::snapshot_drift("semantic", &before.semantic_snapshot, &after.semantic_snapshot),
        ],
        benchmark: facts::bench_drift(&before.benchmark, &after.benchmark),
        bench_valid_before: before.benchmark.overall.valid,
        bench_valid_after: after.benchmark.overall.valid,
        lockfile: facts::lockfile_drift(&before.manifest, &after.manifest),
    }
}
