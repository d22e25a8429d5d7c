use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::commands::capture::smoke;
use crate::engine::{EngineCli, QueryRequest, RefreshMode};
use crate::model::QueryCase;

/// R04: determinism smoke, quick-mode refresh, then the idempotence smoke
/// over the refreshed store.
pub fn target_refresh(
    engine: &EngineCli,
    probe: &QueryCase,
    probe_request: &QueryRequest,
    store_db_path: &Path,
) -> Result<()> {
    smoke::determinism_check(engine, probe, probe_request)?;

    engine.embed(RefreshMode::MissingOrStale)?;
    info!("quick-mode refresh complete");

    smoke::idempotence_check(engine, store_db_path)
}

/// R05: full-mode refresh, only requested in full capture mode.
pub fn full_refresh(engine: &EngineCli) -> Result<()> {
    engine.ingest()?;
    engine.embed(RefreshMode::Full)?;
    info!("full-mode refresh complete");
    Ok(())
}
