//! Concept purity
//!
//! Each instance is clustered by its highest-assignment concept. A cluster's
//! accuracy is the share of its members carrying the cluster's majority
//! ground-truth concept label.

use std::collections::BTreeMap;

/// Majority-label accuracy of every non-empty cluster, ascending cluster id
pub fn cluster_accuracy(clusters: &[usize], labels: &[u32]) -> Vec<f32> {
    let mut members: BTreeMap<usize, BTreeMap<u32, usize>> = BTreeMap::new();
    for (&cluster, &label) in clusters.iter().zip(labels) {
        *members.entry(cluster).or_default().entry(label).or_default() += 1;
    }
    members
        .values()
        .map(|counts| {
            let total: usize = counts.values().sum();
            let majority = counts.values().copied().max().unwrap_or(0);
            majority as f32 / total as f32
        })
        .collect()
}

/// Mean and population standard deviation; `(0, 0)` when empty
pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}

/// Harmonic mean; zero if any value is zero or the input is empty
pub fn harmonic_mean(values: &[f32]) -> f32 {
    if values.is_empty() || values.iter().any(|&v| v <= 0.0) {
        return 0.0;
    }
    values.len() as f32 / values.iter().map(|v| 1.0 / v).sum::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pure_clusters() {
        let acc = cluster_accuracy(&[0, 0, 1, 1], &[3, 3, 5, 5]);
        assert_eq!(acc, vec![1.0, 1.0]);
        assert_eq!(mean_std(&acc), (1.0, 0.0));
    }

    #[test]
    fn test_mixed_cluster() {
        let acc = cluster_accuracy(&[2, 2, 2, 2, 0], &[1, 1, 1, 0, 4]);
        assert_eq!(acc, vec![1.0, 0.75]);
        let (mean, std) = mean_std(&acc);
        assert!((mean - 0.875).abs() < 1e-6);
        assert!((std - 0.125).abs() < 1e-6);
    }

    #[test]
    fn test_invariant_to_cluster_relabelling() {
        let labels = [0, 1, 1, 2, 2, 2];
        let a = cluster_accuracy(&[0, 1, 1, 2, 2, 0], &labels);
        let b = cluster_accuracy(&[7, 4, 4, 5, 5, 7], &labels);
        let ((ma, sa), (mb, sb)) = (mean_std(&a), mean_std(&b));
        assert!((ma - mb).abs() < 1e-6);
        assert!((sa - sb).abs() < 1e-6);
    }

    #[test]
    fn test_harmonic_mean() {
        assert!((harmonic_mean(&[0.5, 1.0]) - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(harmonic_mean(&[0.9, 0.0]), 0.0);
        assert_eq!(harmonic_mean(&[]), 0.0);
    }
}
