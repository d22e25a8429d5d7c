use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::{RunPaths, latest_run_id};
use crate::model::{CaptureManifest, load_decision_log};
use crate::runstate::RunState;
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    let run_id = match args.run_id {
        Some(run_id) => run_id,
        None => latest_run_id(&args.output_root)?,
    };
    let paths = RunPaths::new(&args.output_root, &run_id);

    info!(run_id = %run_id, run_dir = %paths.run_dir().display(), "status requested");

    for phase in ["before", "after"] {
        let state_path = paths.run_state(phase);
        if state_path.exists() {
            let state = RunState::load(&state_path)?;
            info!(
                phase = %phase,
                status = %state.status.as_str(),
                current_step = %state.current_step,
                started_at = %state.started_at,
                updated_at = %state.updated_at,
                active_branch = %state.active_branch.clone().unwrap_or_default(),
                last_successful_command = %state.last_successful_command.clone().unwrap_or_default(),
                next_planned_command = %state.next_planned_command.clone().unwrap_or_default(),
                failed_step = %state.failed_step.map(|step| step.id().to_string()).unwrap_or_default(),
                failure_reason = %state.failure_reason.clone().unwrap_or_default(),
                resume_from_step = %state.resume_from_step.map(|step| step.id().to_string()).unwrap_or_default(),
                compatibility_status = %state
                    .compatibility
                    .as_ref()
                    .map(|compat| compat.status.as_str().to_string())
                    .unwrap_or_default(),
                compatibility_reason = %state
                    .compatibility
                    .as_ref()
                    .and_then(|compat| compat.reason.clone())
                    .unwrap_or_default(),
                "loaded run state"
            );
        } else {
            warn!(phase = %phase, path = %state_path.display(), "run state missing");
        }

        let manifest_path = paths.capture_manifest(phase);
        if manifest_path.exists() {
            let manifest: CaptureManifest = read_json(&manifest_path)?;
            info!(
                phase = %phase,
                mode = %manifest.mode,
                captured_at = %manifest.captured_at,
                engine_version = %manifest.engine_version,
                artifacts = manifest.artifacts.len(),
                notes = manifest.notes.len(),
                "loaded capture manifest"
            );
        } else {
            warn!(phase = %phase, path = %manifest_path.display(), "capture manifest missing");
        }
    }

    let decision_log_path = paths.decision_log();
    if decision_log_path.exists() {
        let decisions = load_decision_log(&decision_log_path)?;
        info!(decisions = decisions.len(), "decision log loaded");
        for decision in decisions.iter().rev().take(5).rev() {
            info!(
                decision_id = decision.decision_id,
                recorded_at = %decision.recorded_at,
                phase = %decision.phase.clone().unwrap_or_default(),
                step = %decision.step.clone().unwrap_or_default(),
                action = %decision.action,
                reason = %decision.reason,
                "decision"
            );
        }
    } else {
        warn!(path = %decision_log_path.display(), "decision log missing");
    }

    let drift_report_path = paths.compare_dir().join("drift_report.json");
    if drift_report_path.exists() {
        info!(path = %drift_report_path.display(), "drift report present");
    }

    Ok(())
}
