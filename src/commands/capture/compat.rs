use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{info, warn};

use crate::runstate::{CompatStatus, CompatibilitySnapshot, RUNBOOK_VERSION, RunState};

/// Schema generation of the engine store this gate build understands.
pub const EXPECTED_DB_SCHEMA_VERSION: &str = "0.1.0";

pub fn read_store_schema_marker(store_db_path: &Path) -> Result<Option<String>> {
    if !store_db_path.exists() {
        return Ok(None);
    }

    let connection = Connection::open_with_flags(
        store_db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open store read-only: {}", store_db_path.display()))?;

    let marker = connection
        .query_row(
            "SELECT value FROM metadata WHERE key = 'db_schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| {
            format!("failed to read schema marker from {}", store_db_path.display())
        })?;

    Ok(marker)
}

/// Compare the running engine and seeded store against the most recent prior
/// execution. Any mismatch blocks unless rebuild remediation was requested.
pub fn evaluate(
    engine_version: &str,
    store_schema_marker: Option<&str>,
    previous: Option<&RunState>,
    current_source_hashes: &[String],
    allow_rebuild: bool,
) -> CompatibilitySnapshot {
    let mut reasons: Vec<String> = Vec::new();

    match store_schema_marker {
        Some(marker) if marker != EXPECTED_DB_SCHEMA_VERSION => {
            reasons.push(format!(
                "store schema marker '{marker}' differs from expected '{EXPECTED_DB_SCHEMA_VERSION}'"
            ));
        }
        Some(_) => {}
        None => reasons.push("store has no schema marker".to_string()),
    }

    if let Some(previous) = previous {
        if let Some(prior_compat) = previous.compatibility.as_ref() {
            if prior_compat.engine_version != engine_version {
                reasons.push(format!(
                    "engine version changed from {} to {} since run {}",
                    prior_compat.engine_version, engine_version, previous.run_id
                ));
            }
            if prior_compat.runbook_version != RUNBOOK_VERSION {
                reasons.push(format!(
                    "runbook version changed from {} to {}",
                    prior_compat.runbook_version, RUNBOOK_VERSION
                ));
            }
        }

        let prior_hashes: BTreeSet<&str> =
            previous.source_sha256.iter().map(String::as_str).collect();
        let current_hashes: BTreeSet<&str> =
            current_source_hashes.iter().map(String::as_str).collect();
        if prior_hashes != current_hashes {
            reasons.push(format!(
                "source document hash set changed since run {} ({} -> {} documents)",
                previous.run_id,
                prior_hashes.len(),
                current_hashes.len()
            ));
        }
    }

    if reasons.is_empty() {
        info!(engine_version = %engine_version, "compatibility check passed");
        return CompatibilitySnapshot {
            runbook_version: RUNBOOK_VERSION.to_string(),
            engine_version: engine_version.to_string(),
            db_schema_version: store_schema_marker.map(str::to_string),
            status: CompatStatus::Ok,
            reason: None,
        };
    }

    let reason = reasons.join("; ");
    let status = if allow_rebuild { CompatStatus::Rebuild } else { CompatStatus::Blocked };
    warn!(status = %status.as_str(), reason = %reason, "compatibility mismatch");

    CompatibilitySnapshot {
        runbook_version: RUNBOOK_VERSION.to_string(),
        engine_version: engine_version.to_string(),
        db_schema_version: store_schema_marker.map(str::to_string),
        status,
        reason: Some(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::{EXPECTED_DB_SCHEMA_VERSION, evaluate};
    use crate::runstate::{CompatStatus, CompatibilitySnapshot, RUNBOOK_VERSION, RunState};

    fn previous_run(engine_version: &str, hashes: &[&str]) -> RunState {
        let mut state =
            RunState::new("run-20260801T080000Z", "after", Some("main".to_string()));
        state.source_sha256 = hashes.iter().map(|hash| hash.to_string()).collect();
        state.compatibility = Some(CompatibilitySnapshot {
            runbook_version: RUNBOOK_VERSION.to_string(),
            engine_version: engine_version.to_string(),
            db_schema_version: Some(EXPECTED_DB_SCHEMA_VERSION.to_string()),
            status: CompatStatus::Ok,
            reason: None,
        });
        state
    }

    #[test]
    fn matching_environment_is_ok_with_empty_reason() {
        let previous = previous_run("0.1.0", &["aaa"]);
        let snapshot = evaluate(
            "0.1.0",
            Some(EXPECTED_DB_SCHEMA_VERSION),
            Some(&previous),
            &["aaa".to_string()],
            false,
        );
        assert_eq!(snapshot.status, CompatStatus::Ok);
        assert_eq!(snapshot.reason, None);
    }

    #[test]
    fn any_mismatch_without_remediation_is_blocked() {
        let previous = previous_run("0.1.0", &["aaa"]);
        let snapshot = evaluate(
            "0.2.0",
            Some(EXPECTED_DB_SCHEMA_VERSION),
            Some(&previous),
            &["aaa".to_string()],
            false,
        );
        assert_eq!(snapshot.status, CompatStatus::Blocked);
        let reason = snapshot.reason.expect("mismatch must carry a reason");
        assert!(reason.contains("engine version changed from 0.1.0 to 0.2.0"));
    }

    #[test]
    fn mismatch_with_remediation_enabled_is_rebuild() {
        let previous = previous_run("0.1.0", &["aaa", "bbb"]);
        let snapshot = evaluate(
            "0.1.0",
            Some(EXPECTED_DB_SCHEMA_VERSION),
            Some(&previous),
            &["aaa".to_string()],
            true,
        );
        assert_eq!(snapshot.status, CompatStatus::Rebuild);
        assert!(
            snapshot
                .reason
                .expect("mismatch must carry a reason")
                .contains("source document hash set changed")
        );
    }

    #[test]
    fn stale_store_marker_blocks() {
        let snapshot = evaluate("0.1.0", Some("0.0.9"), None, &[], false);
        assert_eq!(snapshot.status, CompatStatus::Blocked);
        assert!(
            snapshot
                .reason
                .expect("mismatch must carry a reason")
                .contains("store schema marker '0.0.9'")
        );
    }

    #[test]
    fn first_run_with_healthy_store_is_ok() {
        let snapshot =
            evaluate("0.1.0", Some(EXPECTED_DB_SCHEMA_VERSION), None, &["aaa".to_string()], false);
        assert_eq!(snapshot.status, CompatStatus::Ok);
    }
}
