//! Concept aggregation
//!
//! Instances carry a raw (possibly sparse) graph id. [`GraphIndex`] renumbers
//! those ids into a dense `0..G` space in ascending raw-id order, and
//! [`aggregate`] reduces instance assignments `[N, K]` to concept vectors
//! `[G, K]` by taking, for every concept independently, the maximum over
//! the graph's instances.

use crate::primitives::gnn::{segment_reduce, Reduce};
use crate::{ExplainerError, Result};
use candle_core::{Device, Tensor};

/// Dense renumbering of the raw graph ids in one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphIndex {
    /// Dense id of every instance, in instance order
    dense_ids: Vec<usize>,
    /// Raw id of every dense graph, ascending
    raw_ids: Vec<u64>,
}

impl GraphIndex {
    /// Index the graph ids of a batch (one entry per instance)
    pub fn from_raw(graph_ids: &[u64]) -> Result<Self> {
        if graph_ids.is_empty() {
            return Err(ExplainerError::Data("cannot index an empty batch".into()));
        }
        let mut raw_ids = graph_ids.to_vec();
        raw_ids.sort_unstable();
        raw_ids.dedup();

        let dense_ids = graph_ids
            .iter()
            .map(|id| raw_ids.binary_search(id).unwrap_or_default())
            .collect();

        Ok(Self { dense_ids, raw_ids })
    }

    pub fn num_graphs(&self) -> usize {
        self.raw_ids.len()
    }

    pub fn num_instances(&self) -> usize {
        self.dense_ids.len()
    }

    pub fn dense_ids(&self) -> &[usize] {
        &self.dense_ids
    }

    pub fn raw_ids(&self) -> &[u64] {
        &self.raw_ids
    }
}

/// Concept vectors `[G, K]`: per-graph, per-concept maximum of `assignments` `[N, K]`
///
/// Gradients flow to the instance holding each maximum.
pub fn aggregate(assignments: &Tensor, index: &GraphIndex) -> Result<Tensor> {
    segment_reduce(assignments, index.dense_ids(), index.num_graphs(), Reduce::Max)
}

/// One label per graph: the maximum task label among its instances
pub fn graph_labels(task_labels: &[u32], index: &GraphIndex) -> Result<Vec<u32>> {
    if task_labels.len() != index.num_instances() {
        return Err(ExplainerError::Data(format!(
            "{} task labels for {} instances",
            task_labels.len(),
            index.num_instances()
        )));
    }
    let mut labels = vec![0u32; index.num_graphs()];
    for (&g, &y) in index.dense_ids().iter().zip(task_labels) {
        labels[g] = labels[g].max(y);
    }
    Ok(labels)
}

/// `[G, num_classes]` one-hot float encoding of `labels`
pub fn one_hot(labels: &[u32], num_classes: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; labels.len() * num_classes];
    for (row, &y) in labels.iter().enumerate() {
        let y = y as usize;
        if y >= num_classes {
            return Err(ExplainerError::Data(format!(
                "label {} out of range for {} classes",
                y, num_classes
            )));
        }
        data[row * num_classes + y] = 1.0;
    }
    Tensor::from_vec(data, (labels.len(), num_classes), device)
        .map_err(|e| ExplainerError::Tensor(format!("one_hot failed: {}", e)))
}
