use std::path::Path;

use anyhow::{Result, bail};
use tracing::info;

use crate::engine::{EngineCli, QueryRequest, RefreshMode, normalized_response_fingerprint};
use crate::model::QueryCase;
use crate::util::sha256_file;

/// Replay the same hybrid query twice and require identical normalized
/// responses. Catches nondeterministic ranking before anything is captured.
pub fn determinism_check(engine: &EngineCli, probe: &QueryCase, request: &QueryRequest) -> Result<()> {
    let first = engine.query(request)?;
    let second = engine.query(request)?;

    let first_fingerprint = normalized_response_fingerprint(&first);
    let second_fingerprint = normalized_response_fingerprint(&second);
    if first_fingerprint != second_fingerprint {
        bail!(
            "determinism smoke failed for query {}: responses differ ({} vs {})",
            probe.query_id,
            first_fingerprint,
            second_fingerprint
        );
    }

    info!(query_id = %probe.query_id, "determinism smoke passed");
    Ok(())
}

/// A second quick refresh over an already-fresh store must leave the store
/// byte-identical. Backs the byte-for-byte capture idempotence requirement.
pub fn idempotence_check(engine: &EngineCli, store_db_path: &Path) -> Result<()> {
    let before = sha256_file(store_db_path)?;
    engine.embed(RefreshMode::MissingOrStale)?;
    let after = sha256_file(store_db_path)?;

    if before != after {
        bail!(
            "idempotence smoke failed: repeated quick refresh mutated {} ({} -> {})",
            store_db_path.display(),
            before,
            after
        );
    }

    info!(store = %store_db_path.display(), "idempotence smoke passed");
    Ok(())
}
