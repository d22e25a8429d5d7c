use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::engine::{EngineCli, QueryRequest, QueryResponse};
use crate::model::{QueryCase, QuerySnapshotRecord, SnapshotCandidateCounts, SnapshotHit};
use crate::util::append_ndjson_line;

pub const SNAPSHOT_MODES: [&str; 2] = ["lexical", "semantic"];

#[derive(Debug, Clone)]
pub struct SnapshotParams {
    pub lexical_k: usize,
    pub semantic_k: usize,
    pub rrf_k: u32,
    pub limit: usize,
    pub timeout_ms: u64,
}

/// A timeout of zero disables the check entirely.
pub fn classify_timed_out(latency_ms: f64, timeout_ms: u64) -> bool {
    timeout_ms > 0 && latency_ms >= timeout_ms as f64
}

pub fn record_from_response(
    case: &QueryCase,
    response: &QueryResponse,
    timeout_ms: u64,
) -> QuerySnapshotRecord {
    let top_k: Vec<SnapshotHit> = response
        .results
        .iter()
        .map(|result| SnapshotHit {
            chunk_id: result.chunk_id.clone(),
            reference: result.reference.clone(),
        })
        .collect();

    QuerySnapshotRecord {
        query_id: case.query_id.clone(),
        status: "ok".to_string(),
        returned: response.returned,
        fallback_used: response.retrieval.fallback_used,
        timed_out: classify_timed_out(response.retrieval.query_duration_ms, timeout_ms),
        candidate_counts: SnapshotCandidateCounts {
            lexical: response.retrieval.lexical_candidate_count,
            semantic: response.retrieval.semantic_candidate_count,
            fused: response.retrieval.fused_candidate_count,
        },
        top1_chunk_id: top_k.first().map(|hit| hit.chunk_id.clone()),
        top1_reference: top_k.first().and_then(|hit| hit.reference.clone()),
        top_k,
        expected_chunk_ids: case.expected_chunk_ids.clone(),
        must_hit_top1: case.must_hit_top1,
        error: None,
    }
}

pub fn record_from_error(case: &QueryCase, reason: &str) -> QuerySnapshotRecord {
    QuerySnapshotRecord {
        query_id: case.query_id.clone(),
        status: "error".to_string(),
        returned: 0,
        fallback_used: false,
        timed_out: false,
        candidate_counts: SnapshotCandidateCounts { lexical: 0, semantic: 0, fused: 0 },
        top_k: Vec::new(),
        top1_chunk_id: None,
        top1_reference: None,
        expected_chunk_ids: case.expected_chunk_ids.clone(),
        must_hit_top1: case.must_hit_top1,
        error: Some(reason.to_string()),
    }
}

/// Replay every manifest query in query-id order and persist one NDJSON row
/// per query. A failing query becomes an error row; it never aborts the
/// surrounding snapshot.
pub fn capture_mode_snapshot(
    engine: &EngineCli,
    queries: &[QueryCase],
    mode: &str,
    params: &SnapshotParams,
    out_path: &Path,
) -> Result<usize> {
    let mut error_count = 0_usize;

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

        let record = match engine.query(&request) {
            Ok(response) => record_from_response(case, &response, params.timeout_ms),
            Err(err) => {
                warn!(mode = %mode, query_id = %case.query_id, error = %err, "snapshot query failed");
                error_count += 1;
                record_from_error(case, &format!("{err:#}"))
            }
        };
        append_ndjson_line(out_path, &record)?;
    }

    info!(
        mode = %mode,
        queries = queries.len(),
        errors = error_count,
        path = %out_path.display(),
        "query snapshot captured"
    );
    Ok(queries.len())
}

#[cfg(test)]
mod tests {
    use super::{classify_timed_out, record_from_error, record_from_response};
    use crate::engine::QueryResponse;
    use crate::model::QueryCase;

    fn case(query_id: &str, must_hit_top1: bool) -> QueryCase {
        QueryCase {
            query_id: query_id.to_string(),
            query_text: "software unit verification".to_string(),
            expected_chunk_ids: vec!["c-100".to_string()],
            must_hit_top1,
            part_filter: Some(6),
            chunk_type_filter: None,
        }
    }

    fn response(duration_ms: f64, ids: &[&str]) -> QueryResponse {
        let results: Vec<String> = ids
            .iter()
            .map(|id| format!(r#"{{"chunk_id":"{id}","reference":"8.4.5","citation":null}}"#))
            .collect();
        serde_json::from_str(&format!(
            r#"{{
              "returned": {},
              "results": [{}],
              "retrieval": {{
                "query_duration_ms": {duration_ms},
                "lexical_candidate_count": 12,
                "semantic_candidate_count": 9,
                "fused_candidate_count": 17,
                "fallback_used": true
              }}
            }}"#,
            ids.len(),
            results.join(","),
        ))
        .expect("response fixture should parse")
    }

    #[test]
    fn timeout_classification_uses_inclusive_floor_and_zero_disables() {
        assert!(classify_timed_out(2000.0, 2000));
        assert!(classify_timed_out(2500.0, 2000));
        assert!(!classify_timed_out(1999.9, 2000));
        assert!(!classify_timed_out(90_000.0, 0));
    }

    #[test]
    fn ok_record_captures_top1_and_candidate_counts() {
        let record = record_from_response(&case("q-001", true), &response(12.0, &["c-100", "c-200"]), 2000);
        assert_eq!(record.status, "ok");
        assert_eq!(record.returned, 2);
        assert_eq!(record.top1_chunk_id.as_deref(), Some("c-100"));
        assert_eq!(record.top1_reference.as_deref(), Some("8.4.5"));
        assert_eq!(record.candidate_counts.fused, 17);
        assert!(record.fallback_used);
        assert!(!record.timed_out);
        assert!(record.must_hit_top1);
    }

    #[test]
    fn empty_result_set_has_no_top1() {
        let record = record_from_response(&case("q-002", false), &response(3.0, &[]), 2000);
        assert_eq!(record.returned, 0);
        assert_eq!(record.top1_chunk_id, None);
        assert!(record.top_k.is_empty());
    }

    #[test]
    fn error_record_keeps_expectations_for_drift_scoring() {
        let record = record_from_error(&case("q-003", true), "engine query exited with exit status: 1");
        assert_eq!(record.status, "error");
        assert_eq!(record.returned, 0);
        assert_eq!(record.expected_chunk_ids, vec!["c-100".to_string()]);
        assert!(record.must_hit_top1);
        assert!(record.error.expect("reason should be present").contains("exit status"));
    }
}
