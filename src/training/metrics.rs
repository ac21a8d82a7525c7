//! Epoch and inspection metrics

use crate::{ExplainerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Dataset split a pass runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
        }
    }
}

/// Fixed-width histogram over `[0, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub counts: Vec<u64>,
}

impl Histogram {
    pub const BINS: usize = 10;

    /// Bin `values` into [`Self::BINS`] equal bins; out-of-range values land in the edge bins
    pub fn from_values(values: &[f32]) -> Self {
        let mut counts = vec![0u64; Self::BINS];
        for &v in values.iter().filter(|v| v.is_finite()) {
            let bin = ((v.clamp(0.0, 1.0) * Self::BINS as f32) as usize).min(Self::BINS - 1);
            counts[bin] += 1;
        }
        Self { counts }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            counts: vec![0; Self::BINS],
        }
    }
}

/// Averages and diagnostics of one pass over a split
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f32,
    /// Argmax accuracy (concept labels in debug mode)
    pub acc_per_class: f32,
    /// Fraction of graphs whose thresholded logits match the one-hot label exactly
    pub acc_overall: f32,
    pub len_loss: f32,
    pub logic_loss: f32,
    pub prototype_distance_loss: f32,
    pub r1_loss: f32,
    pub r2_loss: f32,
    pub div_loss: f32,
    pub debug_loss: f32,
    pub concept_entropy_loss: f32,
    pub distribution_entropy_loss: f32,
    pub temperature: f64,
    pub cluster_acc_mean: f32,
    pub cluster_acc_std: f32,
    pub concept_vector_entropy: f32,
    pub assignment_histogram: Histogram,
    pub concept_vector_histogram: Histogram,
}

/// Explanation quality measured by one inspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicMetrics {
    pub epoch: usize,
    /// Harmonic mean of the per-class formula accuracies
    pub logic_acc: f32,
    /// Accuracy of the formulas used together as a classifier
    pub logic_acc_clf: f32,
    pub concept_purity: f32,
    pub concept_purity_std: f32,
}

/// Every metric recorded during a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub train: Vec<EpochMetrics>,
    pub val: Vec<EpochMetrics>,
    pub train_logic: Vec<LogicMetrics>,
    pub val_logic: Vec<LogicMetrics>,
}

impl MetricsHistory {
    pub fn push_epoch(&mut self, split: Split, metrics: EpochMetrics) {
        match split {
            Split::Train => self.train.push(metrics),
            Split::Val => self.val.push(metrics),
        }
    }

    pub fn push_logic(&mut self, split: Split, metrics: LogicMetrics) {
        match split {
            Split::Train => self.train_logic.push(metrics),
            Split::Val => self.val_logic.push(metrics),
        }
    }

    pub fn epochs(&self, split: Split) -> &[EpochMetrics] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
        }
    }

    pub fn logic(&self, split: Split) -> &[LogicMetrics] {
        match split {
            Split::Train => &self.train_logic,
            Split::Val => &self.val_logic,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExplainerError::Serialization(format!("metrics history: {}", e)))
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ExplainerError::Serialization(format!("metrics history: {}", e)))
    }
}

// ============================================================================
// Accuracy helpers
// ============================================================================

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

/// Fraction of rows whose argmax equals the label
pub fn argmax_accuracy(scores: &[Vec<f32>], labels: &[u32]) -> f32 {
    if scores.is_empty() {
        return 0.0;
    }
    let hits = scores
        .iter()
        .zip(labels)
        .filter(|&(row, &y)| argmax(row) == y as usize)
        .count();
    hits as f32 / scores.len() as f32
}

/// Fraction of rows where `logit > 0` agrees with the one-hot label on every class
pub fn threshold_accuracy(logits: &[Vec<f32>], labels: &[u32]) -> f32 {
    if logits.is_empty() {
        return 0.0;
    }
    let hits = logits
        .iter()
        .zip(labels)
        .filter(|&(row, &y)| row.iter().enumerate().all(|(c, &l)| (l > 0.0) == (c == y as usize)))
        .count();
    hits as f32 / logits.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_bins() {
        let h = Histogram::from_values(&[0.0, 0.05, 0.5, 0.99, 1.0, 1.5, -0.2, f32::NAN]);
        assert_eq!(h.counts.len(), Histogram::BINS);
        assert_eq!(h.counts[0], 3);
        assert_eq!(h.counts[5], 1);
        assert_eq!(h.counts[9], 3);
        assert_eq!(h.total(), 7);
    }

    #[test]
    fn test_accuracies() {
        let logits = vec![vec![1.0, -1.0], vec![0.5, 0.2], vec![-2.0, 3.0]];
        let labels = [0, 0, 1];
        assert!((argmax_accuracy(&logits, &labels) - 1.0).abs() < 1e-6);
        // Row 1 fires both classes
        assert!((threshold_accuracy(&logits, &labels) - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(argmax_accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_history_json_round_trip() {
        let mut history = MetricsHistory::default();
        history.push_epoch(
            Split::Train,
            EpochMetrics {
                epoch: 1,
                loss: 0.7,
                temperature: 1.5,
                ..Default::default()
            },
        );
        history.push_logic(
            Split::Val,
            LogicMetrics {
                epoch: 20,
                logic_acc: 0.9,
                ..Default::default()
            },
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        history.save_json(&path).unwrap();
        let loaded = MetricsHistory::load_json(&path).unwrap();
        assert_eq!(loaded, history);
        assert_eq!(loaded.epochs(Split::Train).len(), 1);
        assert!(loaded.epochs(Split::Val).is_empty());
        assert_eq!(loaded.logic(Split::Val)[0].epoch, 20);
    }

    #[test]
    fn test_split_display() {
        assert_eq!(Split::Train.to_string(), "train");
        assert_eq!(Split::Val.to_string(), "val");
    }
}
