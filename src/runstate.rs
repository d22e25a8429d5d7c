use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::util::{now_utc_string, read_json, write_json_atomic};

pub const RUNBOOK_VERSION: &str = "1.0.0";

/// The fixed, totally ordered runbook. Rank is the discriminant; the string
/// ids are the on-disk contract and must stay stable across releases because
/// resume reads them back from persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RunbookStep {
    Preflight = 0,
    ConfigValidate = 1,
    DirSetup = 2,
    CompatCheck = 3,
    TargetRefresh = 4,
    Ingest = 5,
    Validate = 6,
    Traceability = 7,
    ReportVerify = 8,
    Benchmark = 9,
    Snapshot = 10,
    Finalize = 11,
}

impl RunbookStep {
    pub const ALL: [RunbookStep; 12] = [
        Self::Preflight,
        Self::ConfigValidate,
        Self::DirSetup,
        Self::CompatCheck,
        Self::TargetRefresh,
        Self::Ingest,
        Self::Validate,
        Self::Traceability,
        Self::ReportVerify,
        Self::Benchmark,
        Self::Snapshot,
        Self::Finalize,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Preflight => "R00-PREFLIGHT",
            Self::ConfigValidate => "R01-CONFIG-VALIDATE",
            Self::DirSetup => "R02-DIR-SETUP",
            Self::CompatCheck => "R03-COMPAT-CHECK",
            Self::TargetRefresh => "R04-TARGET-REFRESH",
            Self::Ingest => "R05-INGEST",
            Self::Validate => "R06-VALIDATE",
            Self::Traceability => "R07-TRACEABILITY",
            Self::ReportVerify => "R08-REPORT-VERIFY",
            Self::Benchmark => "R09-BENCHMARK",
            Self::Snapshot => "R10-SNAPSHOT",
            Self::Finalize => "R11-FINALIZE",
        }
    }

    pub fn rank(self) -> usize {
        self as usize
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|step| step.id() == raw)
            .with_context(|| format!("unknown runbook step id: {raw}"))
    }

    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.rank() + 1).copied()
    }
}

impl fmt::Display for RunbookStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl From<RunbookStep> for String {
    fn from(step: RunbookStep) -> Self {
        step.id().to_string()
    }
}

impl TryFrom<String> for RunbookStep {
    type Error = anyhow::Error;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Failed,
    Blocked,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatStatus {
    Ok,
    Rebuild,
    Blocked,
}

impl CompatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Rebuild => "rebuild",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilitySnapshot {
    pub runbook_version: String,
    pub engine_version: String,
    pub db_schema_version: Option<String>,
    pub status: CompatStatus,
    pub reason: Option<String>,
}

/// One persisted record per phase execution, rewritten atomically at every
/// step boundary. Optional fields serialize as explicit nulls so the on-disk
/// record always carries the full schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub phase: String,
    pub current_step: RunbookStep,
    pub status: RunStatus,
    pub active_branch: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    pub last_successful_command: Option<String>,
    pub last_successful_artifact: Option<String>,
    pub next_planned_command: Option<String>,
    pub failed_step: Option<RunbookStep>,
    pub failure_reason: Option<String>,
    pub resume_from_step: Option<RunbookStep>,
    pub source_sha256: Vec<String>,
    pub compatibility: Option<CompatibilitySnapshot>,
}

impl RunState {
    pub fn new(run_id: &str, phase: &str, active_branch: Option<String>) -> Self {
        let now = now_utc_string();
        Self {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            current_step: RunbookStep::Preflight,
            status: RunStatus::NotStarted,
            active_branch,
            started_at: now.clone(),
            updated_at: now,
            last_successful_command: None,
            last_successful_artifact: None,
            next_planned_command: None,
            failed_step: None,
            failure_reason: None,
            resume_from_step: None,
            source_sha256: Vec::new(),
            compatibility: None,
        }
    }

    pub fn begin_step(&mut self, step: RunbookStep) {
        self.current_step = step;
        self.status = RunStatus::Running;
        self.updated_at = now_utc_string();
    }

    pub fn complete_step(&mut self, step: RunbookStep, command: &str, artifact: Option<&str>) {
        self.current_step = step;
        self.status = RunStatus::Running;
        self.last_successful_command = Some(command.to_string());
        if let Some(artifact) = artifact {
            self.last_successful_artifact = Some(artifact.to_string());
        }
        self.next_planned_command = step.next().map(|next| next.id().to_string());
        self.failed_step = None;
        self.failure_reason = None;
        self.updated_at = now_utc_string();
    }

    pub fn mark_failed(&mut self, step: RunbookStep, reason: &str) {
        self.status = RunStatus::Failed;
        self.failed_step = Some(step);
        self.failure_reason = Some(reason.to_string());
        self.resume_from_step = Some(step);
        self.updated_at = now_utc_string();
    }

    pub fn mark_blocked(&mut self, reason: &str) {
        self.status = RunStatus::Blocked;
        self.failure_reason = Some(reason.to_string());
        self.resume_from_step = Some(RunbookStep::CompatCheck);
        self.updated_at = now_utc_string();
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.current_step = RunbookStep::Finalize;
        self.next_planned_command = None;
        self.updated_at = now_utc_string();
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeFlags {
    pub resume: bool,
    pub override_blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDecision {
    /// Begin (or continue) execution at this step.
    Start(RunbookStep),
    /// Refuse to proceed; the persisted block record stands untouched.
    Blocked(String),
}

pub fn is_valid_run_id(raw: &str) -> bool {
    Regex::new(r"^run-\d{8}T\d{6}Z$")
        .map(|pattern| pattern.is_match(raw))
        .unwrap_or(false)
}

/// Pure resume planning over the previously persisted state. No filesystem
/// access happens here; callers act on the decision.
pub fn resume_plan(
    previous: Option<&RunState>,
    flags: ResumeFlags,
    current_branch: Option<&str>,
) -> Result<StartDecision> {
    let Some(previous) = previous else {
        return Ok(StartDecision::Start(RunbookStep::Preflight));
    };

    if !is_valid_run_id(&previous.run_id) {
        bail!("persisted run state carries malformed run id: {}", previous.run_id);
    }

    if let (Some(recorded), Some(current)) = (previous.active_branch.as_deref(), current_branch)
        && recorded != current
    {
        bail!(
            "run state for {} was recorded on branch '{recorded}' but the working tree is on '{current}'; \
             refusing to resume across environments",
            previous.run_id
        );
    }

    match previous.status {
        RunStatus::NotStarted => Ok(StartDecision::Start(RunbookStep::Preflight)),
        RunStatus::Running => Ok(StartDecision::Start(previous.current_step)),
        RunStatus::Failed => {
            if !flags.resume {
                let step = previous.failed_step.unwrap_or(previous.current_step);
                bail!(
                    "run {} previously failed at {}: {}; pass --resume to continue from that step",
                    previous.run_id,
                    step,
                    previous.failure_reason.as_deref().unwrap_or("unknown reason")
                );
            }
            let step = previous
                .resume_from_step
                .or(previous.failed_step)
                .unwrap_or(previous.current_step);
            Ok(StartDecision::Start(step))
        }
        RunStatus::Blocked => {
            if flags.override_blocked {
                // The compatibility check must run again before any further
                // mutation; a persisting mismatch blocks again.
                Ok(StartDecision::Start(RunbookStep::CompatCheck))
            } else {
                Ok(StartDecision::Blocked(format!(
                    "run {} is blocked: {}; pass --override-blocked to re-run {} and continue",
                    previous.run_id,
                    previous.failure_reason.as_deref().unwrap_or("compatibility mismatch"),
                    RunbookStep::CompatCheck
                )))
            }
        }
        RunStatus::Completed => bail!(
            "run {} phase {} already completed; captures are immutable, start a fresh run instead",
            previous.run_id,
            previous.phase
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CompatStatus, CompatibilitySnapshot, ResumeFlags, RunState, RunStatus, RunbookStep,
        StartDecision, is_valid_run_id, resume_plan,
    };

    fn state_with_status(status: RunStatus) -> RunState {
        let mut state = RunState::new("run-20260830T120000Z", "before", Some("main".to_string()));
        state.status = status;
        state
    }

    #[test]
    fn step_ordering_is_strictly_ascending_and_ids_round_trip() {
        for window in RunbookStep::ALL.windows(2) {
            assert!(window[0].rank() < window[1].rank());
        }
        for step in RunbookStep::ALL {
            assert_eq!(RunbookStep::parse(step.id()).expect("id should parse"), step);
        }
        assert!(RunbookStep::parse("R99-NOPE").is_err());
    }

    #[test]
    fn next_walks_the_runbook_and_stops_at_finalize() {
        assert_eq!(RunbookStep::Preflight.next(), Some(RunbookStep::ConfigValidate));
        assert_eq!(RunbookStep::Finalize.next(), None);
    }

    #[test]
    fn run_id_shape_is_enforced() {
        assert!(is_valid_run_id("run-20260830T120000Z"));
        assert!(!is_valid_run_id("run-20260830"));
        assert!(!is_valid_run_id("20260830T120000Z"));
    }

    #[test]
    fn fresh_start_begins_at_preflight() {
        let decision = resume_plan(None, ResumeFlags::default(), Some("main"))
            .expect("fresh start should plan");
        assert_eq!(decision, StartDecision::Start(RunbookStep::Preflight));
    }

    #[test]
    fn failed_state_resumes_at_the_failed_step() {
        let mut state = state_with_status(RunStatus::Failed);
        state.failed_step = Some(RunbookStep::Ingest);
        state.resume_from_step = Some(RunbookStep::Ingest);

        let flags = ResumeFlags { resume: true, override_blocked: false };
        let decision =
            resume_plan(Some(&state), flags, Some("main")).expect("resume should plan");
        assert_eq!(decision, StartDecision::Start(RunbookStep::Ingest));
    }

    #[test]
    fn failed_state_without_resume_flag_is_refused_with_guidance() {
        let mut state = state_with_status(RunStatus::Failed);
        state.failed_step = Some(RunbookStep::Ingest);

        let err = resume_plan(Some(&state), ResumeFlags::default(), Some("main"))
            .expect_err("should refuse without --resume");
        assert!(err.to_string().contains("R05-INGEST"));
        assert!(err.to_string().contains("--resume"));
    }

    #[test]
    fn blocked_state_without_override_refuses_to_proceed() {
        let mut state = state_with_status(RunStatus::Blocked);
        state.failure_reason = Some("db schema drift".to_string());

        let decision = resume_plan(Some(&state), ResumeFlags::default(), Some("main"))
            .expect("refusal is a decision, not an error");
        match decision {
            StartDecision::Blocked(reason) => {
                assert!(reason.contains("db schema drift"));
                assert!(reason.contains("--override-blocked"));
            }
            StartDecision::Start(step) => panic!("expected refusal, got start at {step}"),
        }
    }

    #[test]
    fn blocked_state_with_override_restarts_at_the_compatibility_check() {
        let state = state_with_status(RunStatus::Blocked);
        let flags = ResumeFlags { resume: false, override_blocked: true };
        let decision =
            resume_plan(Some(&state), flags, Some("main")).expect("override should plan");
        assert_eq!(decision, StartDecision::Start(RunbookStep::CompatCheck));
    }

    #[test]
    fn blocked_override_replays_the_compatibility_check_before_mutating_steps() {
        let mut state = state_with_status(RunStatus::Blocked);
        state.failure_reason = Some("store schema marker drift".to_string());

        let flags = ResumeFlags { resume: false, override_blocked: true };
        let decision =
            resume_plan(Some(&state), flags, Some("main")).expect("override should plan");
        let StartDecision::Start(start_step) = decision else {
            panic!("override must plan a start, not a refusal");
        };

        let replayed: Vec<&str> = RunbookStep::ALL
            .into_iter()
            .skip(start_step.rank())
            .map(RunbookStep::id)
            .collect();
        let compat_rank = replayed
            .iter()
            .position(|id| *id == "R03-COMPAT-CHECK")
            .expect("overridden run must re-run the compatibility check");
        let refresh_rank = replayed
            .iter()
            .position(|id| *id == "R04-TARGET-REFRESH")
            .expect("overridden run must still reach target refresh");
        assert!(compat_rank < refresh_rank);
    }

    #[test]
    fn completed_phase_is_immutable() {
        let state = state_with_status(RunStatus::Completed);
        let err = resume_plan(Some(&state), ResumeFlags::default(), Some("main"))
            .expect_err("completed phase must not restart");
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn branch_mismatch_is_a_hard_resume_error() {
        let state = state_with_status(RunStatus::Running);
        let err = resume_plan(Some(&state), ResumeFlags::default(), Some("feature/x"))
            .expect_err("branch drift must refuse resume");
        assert!(err.to_string().contains("main"));
        assert!(err.to_string().contains("feature/x"));
    }

    #[test]
    fn run_state_round_trips_with_explicit_nulls_for_optionals() {
        let mut state = state_with_status(RunStatus::Running);
        state.current_step = RunbookStep::Benchmark;
        state.compatibility = Some(CompatibilitySnapshot {
            runbook_version: "1.0.0".to_string(),
            engine_version: "0.1.0".to_string(),
            db_schema_version: Some("0.1.0".to_string()),
            status: CompatStatus::Ok,
            reason: None,
        });

        let raw = serde_json::to_string_pretty(&state).expect("state should serialize");
        assert!(raw.contains("\"failed_step\": null"));
        assert!(raw.contains("\"resume_from_step\": null"));
        assert!(raw.contains("\"current_step\": \"R09-BENCHMARK\""));
        assert!(raw.contains("\"status\": \"running\""));

        let back: RunState = serde_json::from_str(&raw).expect("state should parse");
        assert_eq!(back.current_step, RunbookStep::Benchmark);
        assert_eq!(back.failed_step, None);
        assert_eq!(back.resume_from_step, None);
        let compat = back.compatibility.expect("compatibility should survive");
        assert_eq!(compat.status, CompatStatus::Ok);
        assert_eq!(compat.reason, None);
    }
}
