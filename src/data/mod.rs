//! Instances, batches and the epoch loader
//!
//! An [`Instance`] is one local subgraph (typically a local explanation
//! extracted from a larger graph). Instances sharing a `graph_id` form one
//! top-level graph. The loader always keeps every instance of a graph in the
//! same batch, so per-batch concept vectors cover whole graphs.

use crate::{ExplainerError, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One local subgraph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    /// One row per node, all rows the same width
    pub node_features: Vec<Vec<f32>>,
    /// Directed `(source, target)` pairs over local node indices
    pub edges: Vec<(usize, usize)>,
    /// Ground-truth concept (purity evaluation and debug mode only)
    pub concept_label: u32,
    /// Raw identifier of the owning graph, need not be contiguous
    pub graph_id: u64,
    /// Task label of the owning graph
    pub task_label: u32,
}

impl Instance {
    /// Create and validate an instance
    pub fn new(
        node_features: Vec<Vec<f32>>,
        edges: Vec<(usize, usize)>,
        concept_label: u32,
        graph_id: u64,
        task_label: u32,
    ) -> Result<Self> {
        let instance = Self {
            node_features,
            edges,
            concept_label,
            graph_id,
            task_label,
        };
        instance.validate()?;
        Ok(instance)
    }

    /// Number of nodes
    pub fn num_nodes(&self) -> usize {
        self.node_features.len()
    }

    /// Width of the node feature rows (0 for an empty instance)
    pub fn num_features(&self) -> usize {
        self.node_features.first().map(Vec::len).unwrap_or(0)
    }

    fn validate(&self) -> Result<()> {
        if self.node_features.is_empty() {
            return Err(ExplainerError::Data(format!(
                "instance of graph {} has no nodes",
                self.graph_id
            )));
        }
        let width = self.num_features();
        if width == 0 || self.node_features.iter().any(|row| row.len() != width) {
            return Err(ExplainerError::Data(format!(
                "instance of graph {} has ragged or empty feature rows",
                self.graph_id
            )));
        }
        if let Some(&(s, t)) = self
            .edges
            .iter()
            .find(|&&(s, t)| s >= self.num_nodes() || t >= self.num_nodes())
        {
            return Err(ExplainerError::Data(format!(
                "edge ({}, {}) out of range in instance of graph {} ({} nodes)",
                s,
                t,
                self.graph_id,
                self.num_nodes()
            )));
        }
        Ok(())
    }
}

/// A collated mini-batch of instances
#[derive(Debug, Clone)]
pub struct InstanceBatch {
    /// Stacked node features `[total_nodes, F]`
    pub x: Tensor,
    /// Edges re-offset into batch node space
    pub edges: Vec<(usize, usize)>,
    /// Node → instance index within the batch
    pub batch: Vec<usize>,
    pub num_instances: usize,
    pub concept_labels: Vec<u32>,
    pub graph_ids: Vec<u64>,
    pub task_labels: Vec<u32>,
}

impl InstanceBatch {
    /// Collate instances into one block-diagonal batch
    pub fn collate<'a, I>(instances: I, device: &Device) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Instance>,
    {
        let mut features = Vec::new();
        let mut edges = Vec::new();
        let mut batch = Vec::new();
        let mut concept_labels = Vec::new();
        let mut graph_ids = Vec::new();
        let mut task_labels = Vec::new();
        let mut width = None;
        let mut offset = 0;

        for (idx, inst) in instances.into_iter().enumerate() {
            let w = *width.get_or_insert(inst.num_features());
            if w != inst.num_features() {
                return Err(ExplainerError::Data(format!(
                    "feature width mismatch in batch: {} vs {}",
                    w,
                    inst.num_features()
                )));
            }
            for row in &inst.node_features {
                features.extend_from_slice(row);
                batch.push(idx);
            }
            edges.extend(inst.edges.iter().map(|&(s, t)| (s + offset, t + offset)));
            offset += inst.num_nodes();
            concept_labels.push(inst.concept_label);
            graph_ids.push(inst.graph_id);
            task_labels.push(inst.task_label);
        }

        let width = width.ok_or_else(|| ExplainerError::Data("cannot collate an empty batch".into()))?;
        let x = Tensor::from_vec(features, (offset, width), device)
            .map_err(|e| ExplainerError::Tensor(format!("batch features failed: {}", e)))?;

        Ok(Self {
            x,
            edges,
            batch,
            num_instances: graph_ids.len(),
            concept_labels,
            graph_ids,
            task_labels,
        })
    }
}

/// Epoch iterator over a split, batching whole graphs
pub struct InstanceLoader {
    instances: Vec<Instance>,
    /// Instance indices per graph, ascending raw graph id
    graphs: Vec<Vec<usize>>,
    /// Graphs per batch
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    device: Device,
}

impl InstanceLoader {
    /// Create a loader over a split
    ///
    /// `batch_size` counts graphs, not instances.
    pub fn new(
        instances: Vec<Instance>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if instances.is_empty() {
            return Err(ExplainerError::Data("loader needs at least one instance".into()));
        }
        if batch_size == 0 {
            return Err(ExplainerError::Config("batch_size must be at least 1".into()));
        }
        let width = instances[0].num_features();
        for inst in &instances {
            inst.validate()?;
            if inst.num_features() != width {
                return Err(ExplainerError::Data(format!(
                    "feature width mismatch in split: {} vs {}",
                    width,
                    inst.num_features()
                )));
            }
        }

        let mut by_graph: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (idx, inst) in instances.iter().enumerate() {
            by_graph.entry(inst.graph_id).or_default().push(idx);
        }

        Ok(Self {
            instances,
            graphs: by_graph.into_values().collect(),
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        })
    }

    /// Batches for one epoch, shuffled by graph when the loader shuffles
    pub fn batches(&mut self) -> Result<Vec<InstanceBatch>> {
        let mut order: Vec<usize> = (0..self.graphs.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        self.collate_in(&order)
    }

    /// Batches in ascending graph-id order, never shuffled
    pub fn ordered_batches(&self) -> Result<Vec<InstanceBatch>> {
        let order: Vec<usize> = (0..self.graphs.len()).collect();
        self.collate_in(&order)
    }

    fn collate_in(&self, order: &[usize]) -> Result<Vec<InstanceBatch>> {
        order
            .chunks(self.batch_size)
            .map(|chunk| {
                let members = chunk
                    .iter()
                    .flat_map(|&g| self.graphs[g].iter().map(|&i| &self.instances[i]));
                InstanceBatch::collate(members, &self.device)
            })
            .collect()
    }

    /// Number of batches per epoch
    pub fn num_batches(&self) -> usize {
        self.graphs.len().div_ceil(self.batch_size)
    }

    /// Number of distinct graphs
    pub fn num_graphs(&self) -> usize {
        self.graphs.len()
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Node feature width shared by every instance
    pub fn num_features(&self) -> usize {
        self.instances[0].num_features()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
