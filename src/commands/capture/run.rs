use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::{CaptureArgs, CaptureMode, CapturePhase};
use crate::commands::capture::{bench, compat, manifest, refresh, seed, snapshot};
use crate::commands::{RunPaths, latest_run_id};
use crate::engine::{EngineCli, QueryRequest};
use crate::model::{
    LoadedPolicy, QueryManifest, append_decision, load_decision_log, load_query_manifest,
    load_threshold_policy,
};
use crate::runstate::{
    CompatStatus, ResumeFlags, RunState, RunbookStep, StartDecision, is_valid_run_id, resume_plan,
};
use crate::util::{ensure_directory, utc_compact_string};

struct CaptureContext {
    args: CaptureArgs,
    phase: &'static str,
    paths: RunPaths,
    engine: EngineCli,
    engine_version: String,
    policy: LoadedPolicy,
    queries: QueryManifest,
    state: RunState,
    notes: Vec<String>,
    /// Set on a compatibility rebuild: the re-seeded store still carries the
    /// mismatch, so the full refresh must run even in lite mode.
    force_full_refresh: bool,
}

struct StepSuccess {
    command: String,
    artifact: Option<String>,
}

enum StepOutcome {
    Done(StepSuccess),
    /// Compatibility mismatch with remediation disabled; halt and persist.
    Blocked(String),
    /// Compatibility mismatch with remediation enabled; archive and restart
    /// under a fresh run id.
    Rebuild(String),
}

pub fn run(args: CaptureArgs) -> Result<()> {
    let phase = args.phase.as_str();
    let run_id = resolve_run_id(&args)?;
    let paths = RunPaths::new(&args.output_root, &run_id);

    // Everything up to the first RunState write is read-only (plus an
    // optional engine build): environment errors must not mutate gate state.
    let previous = load_previous_state(&paths, phase)?;
    let current_branch = manifest::current_branch();
    let flags = ResumeFlags { resume: args.resume, override_blocked: args.override_blocked };
    let start_step = match resume_plan(previous.as_ref(), flags, current_branch.as_deref())? {
        StartDecision::Start(step) => step,
        StartDecision::Blocked(reason) => bail!(reason),
    };

    let engine_bin = resolve_engine_bin(&args)?;
    let engine = EngineCli::new(engine_bin, paths.work_cache_root(phase));
    let engine_version = engine.engine_version()?;
    let policy = load_threshold_policy(args.thresholds.as_deref())?;
    let queries = load_query_manifest(&query_manifest_path(&args))?;
    validate_parameters(&args)?;

    info!(
        run_id = %run_id,
        phase = %phase,
        mode = %args.mode.as_str(),
        engine_version = %engine_version,
        start_step = %start_step,
        "capture starting"
    );

    let resuming = previous.is_some();
    let state = match previous {
        Some(state) => state,
        None => RunState::new(&run_id, phase, current_branch),
    };

    let mut ctx = CaptureContext {
        phase,
        paths,
        engine,
        engine_version,
        policy,
        queries,
        state,
        notes: Vec::new(),
        force_full_refresh: false,
        args,
    };

    ensure_directory(&ctx.paths.run_dir())?;
    if resuming {
        let action = if ctx.args.override_blocked { "override-blocked" } else { "resume" };
        append_decision(
            &ctx.paths.decision_log(),
            &ctx.paths.run_id,
            Some(phase),
            Some(start_step.id()),
            action,
            &format!("continuing capture at {start_step}"),
        )?;
    } else {
        append_decision(
            &ctx.paths.decision_log(),
            &ctx.paths.run_id,
            Some(phase),
            Some(start_step.id()),
            "run-start",
            "fresh capture run",
        )?;
    }

    execute_from(&mut ctx, start_step)
}

fn execute_from(ctx: &mut CaptureContext, start_step: RunbookStep) -> Result<()> {
    for step in RunbookStep::ALL.into_iter().skip(start_step.rank()) {
        ctx.state.begin_step(step);
        ctx.state.save(&ctx.paths.run_state(ctx.phase))?;

        match execute_step(ctx, step) {
            Ok(StepOutcome::Done(success)) => {
                ctx.state
                    .complete_step(step, &success.command, success.artifact.as_deref());
                ctx.state.save(&ctx.paths.run_state(ctx.phase))?;
                info!(step = %step, command = %success.command, "runbook step complete");
            }
            Ok(StepOutcome::Blocked(reason)) => {
                ctx.state.mark_blocked(&reason);
                ctx.state.save(&ctx.paths.run_state(ctx.phase))?;
                append_decision(
                    &ctx.paths.decision_log(),
                    &ctx.paths.run_id,
                    Some(ctx.phase),
                    Some(step.id()),
                    "compat-blocked",
                    &reason,
                )?;
                bail!(
                    "run {} blocked at {step}: {reason}; rerun with --allow-rebuild to remediate \
                     or --override-blocked to re-run {} and continue",
                    ctx.paths.run_id,
                    RunbookStep::CompatCheck
                );
            }
            Ok(StepOutcome::Rebuild(reason)) => {
                return rebuild_and_restart(ctx, reason);
            }
            Err(err) => {
                let reason = format!("{step}: {err:#}");
                ctx.state.mark_failed(step, &reason);
                ctx.state.save(&ctx.paths.run_state(ctx.phase))?;
                append_decision(
                    &ctx.paths.decision_log(),
                    &ctx.paths.run_id,
                    Some(ctx.phase),
                    Some(step.id()),
                    "step-failed",
                    &reason,
                )?;
                return Err(err.context(format!(
                    "capture failed at {step}; rerun with --resume to continue from that step"
                )));
            }
        }
    }

    ctx.state.mark_completed();
    ctx.state.save(&ctx.paths.run_state(ctx.phase))?;
    info!(run_id = %ctx.paths.run_id, phase = %ctx.phase, "capture complete");
    Ok(())
}

fn execute_step(ctx: &mut CaptureContext, step: RunbookStep) -> Result<StepOutcome> {
    match step {
        RunbookStep::Preflight => step_preflight(ctx),
        RunbookStep::ConfigValidate => step_config_validate(ctx),
        RunbookStep::DirSetup => step_dir_setup(ctx),
        RunbookStep::CompatCheck => step_compat_check(ctx),
        RunbookStep::TargetRefresh => step_target_refresh(ctx),
        RunbookStep::Ingest => step_ingest(ctx),
        RunbookStep::Validate => step_validate(ctx),
        RunbookStep::Traceability => step_traceability(ctx),
        RunbookStep::ReportVerify => step_report_verify(ctx),
        RunbookStep::Benchmark => step_benchmark(ctx),
        RunbookStep::Snapshot => step_snapshot(ctx),
        RunbookStep::Finalize => step_finalize(ctx),
    }
}

fn step_preflight(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    // Binary resolution and the version probe already ran before any state
    // was written; this records the verified facts as the first checkpoint.
    Ok(StepOutcome::Done(StepSuccess {
        command: format!("{} --version", ctx.engine.bin().display()),
        artifact: Some(ctx.engine_version.clone()),
    }))
}

fn step_config_validate(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    Ok(StepOutcome::Done(StepSuccess {
        command: format!(
            "config-validate thresholds={} queries={}",
            ctx.policy.provenance.source,
            ctx.queries.queries.len()
        ),
        artifact: Some(format!("policy sha256 {}", ctx.policy.provenance.sha256)),
    }))
}

fn step_dir_setup(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    let phase_dir = ctx.paths.phase_dir(ctx.phase);
    ensure_directory(&phase_dir)?;

    let work_cache = ctx.paths.work_cache_root(ctx.phase);
    let hashes = seed::seed_working_copy(&ctx.args.cache_root, &work_cache)?;
    ctx.state.source_sha256 = hashes;

    Ok(StepOutcome::Done(StepSuccess {
        command: format!(
            "seed {} -> {}",
            ctx.args.cache_root.display(),
            work_cache.display()
        ),
        artifact: Some(work_cache.display().to_string()),
    }))
}

fn step_compat_check(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    let store_db = store_db_path(ctx);
    let marker = compat::read_store_schema_marker(&store_db)?;
    let prior = find_prior_execution(ctx)?;

    let snapshot = compat::evaluate(
        &ctx.engine_version,
        marker.as_deref(),
        prior.as_ref(),
        &ctx.state.source_sha256,
        ctx.args.allow_rebuild,
    );
    let status = snapshot.status;
    let reason = snapshot.reason.clone();
    ctx.state.compatibility = Some(snapshot);

    match status {
        CompatStatus::Ok => Ok(StepOutcome::Done(StepSuccess {
            command: "compat-check".to_string(),
            artifact: Some(format!("engine {} schema {:?}", ctx.engine_version, marker)),
        })),
        CompatStatus::Blocked => Ok(StepOutcome::Blocked(
            reason.unwrap_or_else(|| "compatibility mismatch".to_string()),
        )),
        CompatStatus::Rebuild => Ok(StepOutcome::Rebuild(
            reason.unwrap_or_else(|| "compatibility mismatch".to_string()),
        )),
    }
}

fn step_target_refresh(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    let probe = ctx
        .queries
        .queries
        .first()
        .context("query manifest is empty; nothing to probe determinism with")?
        .clone();
    let request = probe_request(&probe, &ctx.args);
    refresh::target_refresh(&ctx.engine, &probe, &request, &store_db_path(ctx))?;

    Ok(StepOutcome::Done(StepSuccess {
        command: "determinism smoke + embed --refresh-mode missing-or-stale + idempotence smoke"
            .to_string(),
        artifact: None,
    }))
}

fn step_ingest(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    if skip_full_refresh(ctx.args.mode, ctx.force_full_refresh) {
        ctx.notes.push("full-mode refresh skipped (lite capture)".to_string());
        return Ok(StepOutcome::Done(StepSuccess {
            command: "ingest skipped (lite mode)".to_string(),
            artifact: None,
        }));
    }
    if ctx.args.mode == CaptureMode::Lite {
        ctx.notes.push("full-mode refresh forced by compatibility rebuild".to_string());
    }

    refresh::full_refresh(&ctx.engine)?;
    Ok(StepOutcome::Done(StepSuccess {
        command: "ingest + embed --refresh-mode full".to_string(),
        artifact: None,
    }))
}

/// Lite captures reuse the seeded extraction output. A rebuild run may not:
/// its working copy was re-seeded from the same mismatched cache root, and
/// only the full ingest plus full embed repairs the store.
fn skip_full_refresh(mode: CaptureMode, rebuilding: bool) -> bool {
    mode == CaptureMode::Lite && !rebuilding
}

fn step_validate(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    let report_path = extraction_report_path(ctx);
    ctx.engine.validate(&report_path)?;

    Ok(StepOutcome::Done(StepSuccess {
        command: "validate".to_string(),
        artifact: Some(report_path.display().to_string()),
    }))
}

fn step_traceability(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    // Loading verifies decision-id monotonicity before we extend the log.
    let decisions = load_decision_log(&ctx.paths.decision_log())?;
    append_decision(
        &ctx.paths.decision_log(),
        &ctx.paths.run_id,
        Some(ctx.phase),
        Some(RunbookStep::Traceability.id()),
        "trace-verified",
        &format!("decision log monotonic across {} records", decisions.len()),
    )?;

    Ok(StepOutcome::Done(StepSuccess {
        command: format!("traceability-check records={}", decisions.len()),
        artifact: None,
    }))
}

fn step_report_verify(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    let report_path = extraction_report_path(ctx);
    let report = manifest::verify_quality_report(&report_path)?;

    Ok(StepOutcome::Done(StepSuccess {
        command: "report-verify".to_string(),
        artifact: Some(format!(
            "run {} checks {}/{} passed",
            report.run_id, report.summary.passed, report.summary.total_checks
        )),
    }))
}

fn step_benchmark(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    let params = bench::BenchParams {
        profile: ctx.args.mode.as_str().to_string(),
        lexical_k: ctx.args.lexical_k,
        semantic_k: ctx.args.semantic_k,
        rrf_k: ctx.args.rrf_k,
        limit: ctx.args.limit,
        timeout_ms: ctx.args.timeout_ms,
        warmup_passes: ctx.args.warmup_passes,
        timed_passes: ctx.args.timed_passes,
        repetitions: ctx.args.bench_repetitions,
    };

    let report =
        bench::run_benchmark(&ctx.engine, &ctx.queries.queries, &params, &ctx.engine_version)?;
    let report_path = ctx.paths.benchmark_report(ctx.phase);
    crate::util::write_json_pretty(&report_path, &report)?;

    if !report.overall.valid {
        bail!(
            "benchmark validity gate failed: a mode exceeded the 1% timed-failure budget \
             (report written to {})",
            report_path.display()
        );
    }

    Ok(StepOutcome::Done(StepSuccess {
        command: format!("benchmark repetitions={}", params.repetitions),
        artifact: Some(report_path.display().to_string()),
    }))
}

fn step_snapshot(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    let params = snapshot::SnapshotParams {
        lexical_k: ctx.args.lexical_k,
        semantic_k: ctx.args.semantic_k,
        rrf_k: ctx.args.rrf_k,
        limit: ctx.args.limit,
        timeout_ms: ctx.args.timeout_ms,
    };

    for mode in snapshot::SNAPSHOT_MODES {
        let out_path = ctx.paths.query_snapshot(ctx.phase, mode);
        if out_path.exists() {
            // A resumed snapshot step starts the file over; the writer
            // appends row by row.
            std::fs::remove_file(&out_path)
                .with_context(|| format!("failed to reset {}", out_path.display()))?;
        }
        snapshot::capture_mode_snapshot(&ctx.engine, &ctx.queries.queries, mode, &params, &out_path)?;
    }

    Ok(StepOutcome::Done(StepSuccess {
        command: format!("snapshot queries={} modes=lexical,semantic", ctx.queries.queries.len()),
        artifact: None,
    }))
}

fn step_finalize(ctx: &mut CaptureContext) -> Result<StepOutcome> {
    let capture_manifest = manifest::finalize(
        &ctx.paths,
        ctx.phase,
        ctx.args.mode.as_str(),
        &ctx.engine_version,
        ctx.notes.clone(),
    )?;
    append_decision(
        &ctx.paths.decision_log(),
        &ctx.paths.run_id,
        Some(ctx.phase),
        Some(RunbookStep::Finalize.id()),
        "capture-complete",
        &format!("{} artifacts captured", capture_manifest.artifacts.len()),
    )?;

    Ok(StepOutcome::Done(StepSuccess {
        command: "finalize".to_string(),
        artifact: Some(ctx.paths.capture_manifest(ctx.phase).display().to_string()),
    }))
}

/// Archive the mismatched working copy, mint a fresh run id, and restart the
/// pipeline at target refresh. The abandoned run directory is retained for
/// audit, never purged.
fn rebuild_and_restart(ctx: &mut CaptureContext, reason: String) -> Result<()> {
    let old_run_id = ctx.paths.run_id.clone();
    append_decision(
        &ctx.paths.decision_log(),
        &old_run_id,
        Some(ctx.phase),
        Some(RunbookStep::CompatCheck.id()),
        "compat-rebuild",
        &reason,
    )?;
    seed::archive_working_copy(&ctx.paths.work_dir(ctx.phase))?;

    let new_run_id = mint_run_id();
    warn!(
        old_run_id = %old_run_id,
        new_run_id = %new_run_id,
        reason = %reason,
        "compatibility rebuild: restarting under a fresh run id"
    );

    ctx.state.mark_failed(
        RunbookStep::CompatCheck,
        &format!("superseded by rebuild run {new_run_id}: {reason}"),
    );
    ctx.state.save(&ctx.paths.run_state(ctx.phase))?;

    // Rebuild the context against the new run directory and re-seed.
    let paths = RunPaths::new(&ctx.args.output_root, &new_run_id);
    let mut state = RunState::new(&new_run_id, ctx.phase, ctx.state.active_branch.clone());
    let work_cache = paths.work_cache_root(ctx.phase);
    ensure_directory(&paths.phase_dir(ctx.phase))?;
    state.source_sha256 = seed::seed_working_copy(&ctx.args.cache_root, &work_cache)?;
    state.compatibility = Some(compat::evaluate(
        &ctx.engine_version,
        compat::read_store_schema_marker(&store_db_path_for(&paths, ctx.phase))?.as_deref(),
        None,
        &state.source_sha256,
        true,
    ));

    append_decision(
        &paths.decision_log(),
        &new_run_id,
        Some(ctx.phase),
        Some(RunbookStep::TargetRefresh.id()),
        "run-start-rebuild",
        &format!("rebuild of {old_run_id}: {reason}"),
    )?;

    ctx.engine = ctx.engine.with_cache_root(work_cache);
    ctx.paths = paths;
    ctx.state = state;
    ctx.force_full_refresh = true;
    ctx.notes.push(format!("rebuilt from {old_run_id}: {reason}"));

    execute_from(ctx, RunbookStep::TargetRefresh)
}

fn resolve_run_id(args: &CaptureArgs) -> Result<String> {
    if let Some(run_id) = args.run_id.as_deref() {
        if !is_valid_run_id(run_id) {
            bail!("malformed run id '{run_id}' (expected run-YYYYMMDDTHHMMSSZ)");
        }
        return Ok(run_id.to_string());
    }

    match args.phase {
        CapturePhase::Before => Ok(mint_run_id()),
        CapturePhase::After => latest_run_id(&args.output_root)
            .context("no prior run to attach the after phase to; pass --run-id"),
    }
}

fn mint_run_id() -> String {
    format!("run-{}", utc_compact_string(Utc::now()))
}

fn load_previous_state(paths: &RunPaths, phase: &str) -> Result<Option<RunState>> {
    let state_path = paths.run_state(phase);
    if !state_path.exists() {
        return Ok(None);
    }
    RunState::load(&state_path).map(Some)
}

/// The most recent prior execution, searched newest-first across run
/// directories. For an after phase this is usually the same run's before
/// phase; for a fresh before phase, the previous run's latest phase.
fn find_prior_execution(ctx: &CaptureContext) -> Result<Option<RunState>> {
    let runs_root = ctx.args.output_root.join("runs");
    if !runs_root.exists() {
        return Ok(None);
    }

    let mut run_ids: Vec<String> = std::fs::read_dir(&runs_root)
        .with_context(|| format!("failed to read {}", runs_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|run_id| run_id.as_str() <= ctx.paths.run_id.as_str())
        .collect();
    run_ids.sort();

    for run_id in run_ids.into_iter().rev() {
        for phase in ["after", "before"] {
            if run_id == ctx.paths.run_id
                && (phase == ctx.phase || (ctx.phase == "before" && phase == "after"))
            {
                continue;
            }
            let state_path = RunPaths::new(&ctx.args.output_root, &run_id).run_state(phase);
            if state_path.exists() {
                return RunState::load(&state_path).map(Some);
            }
        }
    }

    Ok(None)
}

fn resolve_engine_bin(args: &CaptureArgs) -> Result<PathBuf> {
    let Some(build_dir) = args.engine_build_dir.as_deref() else {
        return Ok(args.engine_bin.clone());
    };

    info!(build_dir = %build_dir.display(), "building engine from source");
    let output = Command::new("cargo")
        .args(["build", "--release"])
        .current_dir(build_dir)
        .output()
        .with_context(|| format!("failed to launch cargo build in {}", build_dir.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "engine build failed in {}: {}",
            build_dir.display(),
            stderr.trim()
        );
    }

    let built = build_dir.join("target").join("release").join("iso26262");
    if !built.exists() {
        bail!("engine build produced no binary at {}", built.display());
    }
    Ok(built)
}

fn validate_parameters(args: &CaptureArgs) -> Result<()> {
    if args.bench_repetitions == 0 {
        bail!("--bench-repetitions must be at least 1");
    }
    if args.timed_passes == 0 {
        bail!("--timed-passes must be at least 1");
    }
    if args.limit == 0 {
        bail!("--limit must be at least 1");
    }
    if args.lexical_k == 0 || args.semantic_k == 0 {
        bail!("--lexical-k and --semantic-k must be at least 1");
    }
    Ok(())
}

fn query_manifest_path(args: &CaptureArgs) -> PathBuf {
    args.query_manifest_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("manifests").join("semantic_eval_manifest.json"))
}

fn probe_request(case: &crate::model::QueryCase, args: &CaptureArgs) -> QueryRequest {
    QueryRequest {
        query: case.query_text.clone(),
        retrieval_mode: "hybrid".to_string(),
        lexical_k: args.lexical_k,
        semantic_k: args.semantic_k,
        rrf_k: args.rrf_k,
        timeout_ms: args.timeout_ms,
        limit: args.limit,
        part_filter: case.part_filter,
        chunk_type_filter: case.chunk_type_filter.clone(),
    }
}

fn store_db_path(ctx: &CaptureContext) -> PathBuf {
    store_db_path_for(&ctx.paths, ctx.phase)
}

fn store_db_path_for(paths: &RunPaths, phase: &str) -> PathBuf {
    paths.work_cache_root(phase).join(seed::STORE_DB_FILENAME)
}

fn extraction_report_path(ctx: &CaptureContext) -> PathBuf {
    ctx.paths
        .work_cache_root(ctx.phase)
        .join("manifests")
        .join("extraction_quality_report.json")
}
