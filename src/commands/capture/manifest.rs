use std::path::Path;
use std::process::Command;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::commands::RunPaths;
use crate::model::{
    CAPTURE_MANIFEST_VERSION, CaptureArtifact, CaptureManifest, GitMetadata, QualityReportDoc,
};
use crate::util::{copy_file, now_utc_string, read_json, sha256_file, write_json_pretty};

pub const ENGINE_LOCKFILE_NAME: &str = "semantic_model_config.lock.json";

/// R08: the engine's quality report must identify its run and its summary
/// must be internally consistent before the capture is worth keeping.
pub fn verify_quality_report(path: &Path) -> Result<QualityReportDoc> {
    let report: QualityReportDoc = read_json(path)?;

    if report.run_id.trim().is_empty() {
        bail!("quality report {} has an empty run id", path.display());
    }
    if report.status == "failed" {
        bail!(
            "quality report {} recorded status 'failed'; refusing to capture a failing baseline",
            path.display()
        );
    }

    let summed = report.summary.passed + report.summary.failed + report.summary.pending;
    if summed != report.summary.total_checks {
        bail!(
            "quality report {} summary is inconsistent: passed {} + failed {} + pending {} != total {}",
            path.display(),
            report.summary.passed,
            report.summary.failed,
            report.summary.pending,
            report.summary.total_checks
        );
    }
    if report.checks.len() != report.summary.total_checks {
        bail!(
            "quality report {} lists {} checks but summary claims {}",
            path.display(),
            report.checks.len(),
            report.summary.total_checks
        );
    }

    Ok(report)
}

pub fn git_metadata() -> GitMetadata {
    let branch = git_capture(&["rev-parse", "--abbrev-ref", "HEAD"]);
    let commit = git_capture(&["rev-parse", "HEAD"]);
    let dirty = git_capture(&["status", "--porcelain"]).map(|output| !output.is_empty());

    if branch.is_none() {
        warn!("not inside a git checkout; capture manifest git metadata will be null");
    }

    GitMetadata { branch, commit, dirty }
}

pub fn current_branch() -> Option<String> {
    git_capture(&["rev-parse", "--abbrev-ref", "HEAD"])
}

fn git_capture(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string())
}

/// R11: copy the engine-produced reports out of the working copy, checksum
/// every artifact, and write the immutable capture manifest.
pub fn finalize(
    paths: &RunPaths,
    phase: &str,
    mode: &str,
    engine_version: &str,
    notes: Vec<String>,
) -> Result<CaptureManifest> {
    let phase_dir = paths.phase_dir(phase);
    let work_manifests = paths.work_cache_root(phase).join("manifests");

    for report_name in ["extraction_quality_report.json", "semantic_quality_report.json"] {
        let source = work_manifests.join(report_name);
        if !source.exists() {
            bail!(
                "required quality report missing from working copy: {}",
                source.display()
            );
        }
        copy_file(&source, &phase_dir.join(report_name))?;
    }

    let mut notes = notes;
    let lockfile_source = work_manifests.join(ENGINE_LOCKFILE_NAME);
    let lockfile_present = lockfile_source.exists();
    if lockfile_present {
        copy_file(&lockfile_source, &phase_dir.join("semantic_model.lock.json"))?;
    } else {
        notes.push("engine model lockfile absent from working copy".to_string());
    }

    let mut required = vec![
        ("extraction_quality_report", "extraction_quality_report.json"),
        ("semantic_quality_report", "semantic_quality_report.json"),
        ("benchmark_report", "benchmark_report.json"),
        ("query_snapshot_lexical", "query_snapshot_lexical.ndjson"),
        ("query_snapshot_semantic", "query_snapshot_semantic.ndjson"),
    ];
    if lockfile_present {
        required.push(("semantic_model_lock", "semantic_model.lock.json"));
    }

    let mut artifacts = Vec::with_capacity(required.len());
    for (name, file_name) in required {
        let path = phase_dir.join(file_name);
        if !path.exists() {
            bail!("required capture artifact missing: {}", path.display());
        }
        artifacts.push(CaptureArtifact {
            name: name.to_string(),
            path: file_name.to_string(),
            sha256: sha256_file(&path)?,
        });
    }

    let manifest = CaptureManifest {
        manifest_version: CAPTURE_MANIFEST_VERSION,
        run_id: paths.run_id.clone(),
        phase: phase.to_string(),
        mode: mode.to_string(),
        captured_at: now_utc_string(),
        engine_version: engine_version.to_string(),
        git: git_metadata(),
        artifacts,
        notes,
    };

    write_json_pretty(&paths.capture_manifest(phase), &manifest)?;
    info!(
        phase = %phase,
        artifacts = manifest.artifacts.len(),
        path = %paths.capture_manifest(phase).display(),
        "capture manifest written"
    );

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::verify_quality_report;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "iso26262-gate-manifest-{tag}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).expect("scratch dir should be creatable");
        dir
    }

    fn write_report(dir: &std::path::Path, run_id: &str, status: &str, totals: (usize, usize, usize, usize), check_count: usize) -> std::path::PathBuf {
        let (total, passed, failed, pending) = totals;
        let checks: Vec<String> = (0..check_count)
            .map(|index| format!(r#"{{"check_id":"Q-{:03}","name":"check","result":"pass"}}"#, index + 1))
            .collect();
        let path = dir.join("extraction_quality_report.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"run_id":"{run_id}","status":"{status}","summary":{{"total_checks":{total},"passed":{passed},"failed":{failed},"pending":{pending}}},"checks":[{}]}}"#,
                checks.join(",")
            ),
        )
        .expect("report fixture should write");
        path
    }

    #[test]
    fn consistent_report_verifies() {
        let dir = scratch_dir("ok");
        let path = write_report(&dir, "run-20260830T120000Z", "pass", (2, 1, 0, 1), 2);
        let report = verify_quality_report(&path).expect("report should verify");
        assert_eq!(report.checks.len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_run_id_is_rejected() {
        let dir = scratch_dir("runid");
        let path = write_report(&dir, "  ", "pass", (1, 1, 0, 0), 1);
        let err = verify_quality_report(&path).expect_err("empty run id must fail");
        assert!(err.to_string().contains("empty run id"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn failed_status_is_rejected() {
        let dir = scratch_dir("failed");
        let path = write_report(&dir, "run-20260830T120000Z", "failed", (1, 0, 1, 0), 1);
        let err = verify_quality_report(&path).expect_err("failed status must fail");
        assert!(err.to_string().contains("status 'failed'"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn inconsistent_summary_totals_are_rejected() {
        let dir = scratch_dir("totals");
        let path = write_report(&dir, "run-20260830T120000Z", "pass", (3, 1, 0, 1), 3);
        let err = verify_quality_report(&path).expect_err("bad totals must fail");
        assert!(err.to_string().contains("inconsistent"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn check_list_must_match_claimed_total() {
        let dir = scratch_dir("checklist");
        let path = write_report(&dir, "run-20260830T120000Z", "pass", (2, 2, 0, 0), 1);
        let err = verify_quality_report(&path).expect_err("short check list must fail");
        assert!(err.to_string().contains("lists 1 checks"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
