use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::util::{copy_directory_recursive, read_json, utc_compact_string};

pub const STORE_DB_FILENAME: &str = "iso26262_index.sqlite";

#[derive(Debug, Deserialize)]
struct PdfInventoryManifest {
    pdfs: Vec<PdfInventoryEntry>,
}

#[derive(Debug, Deserialize)]
struct PdfInventoryEntry {
    sha256: String,
}

/// Copy the engine's persisted state into the phase's isolated working copy.
/// Every mutating engine invocation runs against the copy; the original cache
/// root is never touched. Returns the sorted source-document hash set read
/// from the copied inventory manifest.
pub fn seed_working_copy(original_cache_root: &Path, work_cache_root: &Path) -> Result<Vec<String>> {
    if !original_cache_root.exists() {
        bail!(
            "engine cache root does not exist: {}",
            original_cache_root.display()
        );
    }
    if work_cache_root.exists() {
        // Leftover from a seed that was interrupted mid-copy; a resumed run
        // re-executes this step and rebuilds the copy from scratch.
        info!(stale = %work_cache_root.display(), "clearing partial working copy before re-seed");
        std::fs::remove_dir_all(work_cache_root).with_context(|| {
            format!(
                "failed to clear stale working copy: {}",
                work_cache_root.display()
            )
        })?;
    }

    copy_directory_recursive(original_cache_root, work_cache_root).with_context(|| {
        format!(
            "failed to seed working copy from {}",
            original_cache_root.display()
        )
    })?;

    info!(
        from = %original_cache_root.display(),
        to = %work_cache_root.display(),
        "seeded isolated working copy"
    );

    source_hashes(work_cache_root)
}

pub fn source_hashes(cache_root: &Path) -> Result<Vec<String>> {
    let inventory_path = cache_root.join("manifests").join("pdf_inventory.json");
    if !inventory_path.exists() {
        return Ok(Vec::new());
    }

    let inventory: PdfInventoryManifest = read_json(&inventory_path)?;
    let mut hashes: Vec<String> = inventory.pdfs.into_iter().map(|entry| entry.sha256).collect();
    hashes.sort();
    hashes.dedup();
    Ok(hashes)
}

/// Rename the working copy aside with a timestamp suffix. Rebuilds archive,
/// they never delete.
pub fn archive_working_copy(work_dir: &Path) -> Result<PathBuf> {
    let stamp = utc_compact_string(Utc::now());
    let file_name = work_dir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("work");
    let archived = work_dir.with_file_name(format!("{file_name}.archived-{stamp}"));

    std::fs::rename(work_dir, &archived).with_context(|| {
        format!(
            "failed to archive working copy {} to {}",
            work_dir.display(),
            archived.display()
        )
    })?;

    info!(archived = %archived.display(), "archived working copy");
    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::{archive_working_copy, seed_working_copy, source_hashes};

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "iso26262-gate-seed-{tag}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).expect("scratch dir should be creatable");
        dir
    }

    fn write_inventory(cache_root: &std::path::Path, hashes: &[&str]) {
        let manifests = cache_root.join("manifests");
        std::fs::create_dir_all(&manifests).expect("manifests dir should be creatable");
        let pdfs: Vec<String> = hashes
            .iter()
            .map(|hash| format!(r#"{{"filename":"part.pdf","part":6,"year":2018,"sha256":"{hash}"}}"#))
            .collect();
        std::fs::write(
            manifests.join("pdf_inventory.json"),
            format!(
                r#"{{"manifest_version":1,"generated_at":"2026-01-01T00:00:00Z","source_directory":"pdfs","pdf_count":{},"pdfs":[{}]}}"#,
                hashes.len(),
                pdfs.join(",")
            ),
        )
        .expect("inventory fixture should write");
    }

    #[test]
    fn seeding_copies_the_store_and_collects_sorted_hashes() {
        let dir = scratch_dir("copy");
        let original = dir.join("cache");
        std::fs::create_dir_all(&original).expect("cache dir should be creatable");
        std::fs::write(original.join(super::STORE_DB_FILENAME), b"sqlite-bytes")
            .expect("store fixture should write");
        write_inventory(&original, &["bbb", "aaa", "bbb"]);

        let work = dir.join("work").join("cache");
        let hashes = seed_working_copy(&original, &work).expect("seed should succeed");

        assert_eq!(hashes, vec!["aaa".to_string(), "bbb".to_string()]);
        assert!(work.join(super::STORE_DB_FILENAME).exists());
        assert!(original.join(super::STORE_DB_FILENAME).exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reseeding_replaces_a_partial_working_copy_left_by_an_interrupted_run() {
        let dir = scratch_dir("reseed");
        let original = dir.join("cache");
        std::fs::create_dir_all(&original).expect("cache dir should be creatable");
        std::fs::write(original.join(super::STORE_DB_FILENAME), b"sqlite-bytes")
            .expect("store fixture should write");
        write_inventory(&original, &["aaa"]);

        // An interrupted copy leaves a partial tree: a stray file, no store.
        let work = dir.join("work").join("cache");
        std::fs::create_dir_all(&work).expect("work dir should be creatable");
        std::fs::write(work.join("half-copied.tmp"), b"x").expect("stale file should write");

        let hashes = seed_working_copy(&original, &work).expect("re-seed should succeed");

        assert_eq!(hashes, vec!["aaa".to_string()]);
        assert!(work.join(super::STORE_DB_FILENAME).exists());
        assert!(!work.join("half-copied.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_inventory_yields_an_empty_hash_set() {
        let dir = scratch_dir("noinv");
        let hashes = source_hashes(&dir).expect("empty set expected");
        assert!(hashes.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn archive_renames_with_timestamp_suffix() {
        let dir = scratch_dir("archive");
        let work = dir.join("work");
        std::fs::create_dir_all(&work).expect("work dir should be creatable");
        std::fs::write(work.join("marker"), b"x").expect("marker should write");

        let archived = archive_working_copy(&work).expect("archive should succeed");
        assert!(!work.exists());
        assert!(archived.exists());
        assert!(
            archived
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("work.archived-"))
        );
        std::fs::remove_dir_all(&dir).ok();
    }
}
