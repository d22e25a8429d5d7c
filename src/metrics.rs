use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Distribution summary over one numeric series. Empty input yields all-null
/// fields rather than an error so partial captures still serialize cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NumericStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

pub fn numeric_stats(values: &[f64]) -> NumericStats {
    if values.is_empty() {
        return NumericStats::default();
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    NumericStats {
        min: sorted.first().copied(),
        max: sorted.last().copied(),
        mean: mean(values),
        p50: percentile_sorted(&sorted, 0.50),
        p95: percentile_sorted(&sorted, 0.95),
        p99: percentile_sorted(&sorted, 0.99),
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Linear-interpolated percentile with `p` in `[0, 1]`.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

fn percentile_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return Some(sorted[low]);
    }

    let weight = rank - low as f64;
    Some(sorted[low] * (1.0 - weight) + sorted[high] * weight)
}

/// Two empty sets agree perfectly on "nothing", so the overlap is 1.0.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

pub fn num_delta(before: Option<f64>, after: Option<f64>) -> Option<f64> {
    match (before, after) {
        (Some(before), Some(after)) => Some(after - before),
        _ => None,
    }
}

/// Relative change against the before value. A zero baseline cannot anchor a
/// relative change: zero-to-zero is 0.0, zero-to-anything-else is undefined.
pub fn rel_increase(before: Option<f64>, after: Option<f64>) -> Option<f64> {
    let (before, after) = match (before, after) {
        (Some(before), Some(after)) => (before, after),
        _ => return None,
    };

    if before == 0.0 {
        if after == 0.0 {
            return Some(0.0);
        }
        return None;
    }

    Some((after - before) / before)
}

#[cfg(test)]
mod tests {
    use super::{jaccard, mean, num_delta, numeric_stats, percentile, rel_increase};
    use std::collections::HashSet;

    fn set(values: &[&str]) -> HashSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn percentile_endpoints_are_min_and_max() {
        let values = vec![9.0, 3.0, 41.0, 17.0, 5.0];
        assert_eq!(percentile(&values, 0.0), Some(3.0));
        assert_eq!(percentile(&values, 1.0), Some(41.0));
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 0.5), Some(25.0));
        assert_eq!(percentile(&values, 0.25), Some(17.5));
    }

    #[test]
    fn percentile_and_mean_are_null_on_empty_input() {
        assert_eq!(percentile(&[], 0.95), None);
        assert_eq!(mean(&[]), None);
        let stats = numeric_stats(&[]);
        assert_eq!(stats.min, None);
        assert_eq!(stats.p99, None);
    }

    #[test]
    fn numeric_stats_single_value_collapses_all_fields() {
        let stats = numeric_stats(&[12.5]);
        assert_eq!(stats.min, Some(12.5));
        assert_eq!(stats.max, Some(12.5));
        assert_eq!(stats.mean, Some(12.5));
        assert_eq!(stats.p95, Some(12.5));
    }

    #[test]
    fn jaccard_of_identical_sets_is_one_including_empty() {
        let a = set(&["x", "y"]);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 1.0);
    }

    #[test]
    fn jaccard_counts_overlap_against_union() {
        let a = set(&["a", "b", "c"]);
        let b = set(&["b", "c", "d"]);
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rel_increase_zero_baseline_rules() {
        assert_eq!(rel_increase(Some(0.0), Some(0.0)), Some(0.0));
        assert_eq!(rel_increase(Some(0.0), Some(4.0)), None);
        assert_eq!(rel_increase(Some(20.0), Some(25.0)), Some(0.25));
        assert_eq!(rel_increase(None, Some(1.0)), None);
    }

    #[test]
    fn num_delta_propagates_null() {
        assert_eq!(num_delta(Some(2.0), Some(5.0)), Some(3.0));
        assert_eq!(num_delta(Some(2.0), None), None);
        assert_eq!(num_delta(None, Some(5.0)), None);
    }
}
