//! Graph Neural Network primitives
//!
//! Message-passing layers over a batch of small graphs given as an edge list
//! plus a node → instance `batch` vector, and the segment reductions that
//! pool node features to one row per instance (and instance assignments to
//! one row per graph).
//!
//! ## Layer types
//!
//! | Function | Architecture | Paper |
//! |---|---|---|
//! | [`gin_layer`] | GIN: sum aggregation + MLP | Xu et al. 2019 |
//! | [`gat_layer`] | GAT: learned attention over neighbour edges | Veličković et al. 2018 |
//! | [`multi_head_gat`] | Concatenated GAT heads | |
//!
//! Batches of local explanations are small, so edges are scattered into a
//! dense `[N, N]` adjacency once per forward pass via [`dense_adjacency`].
//! Node indices in different instances never share an edge, so the dense
//! matrix is block-diagonal.

use crate::primitives::leaky_relu;
use crate::{ExplainerError, Result};
use candle_core::{Device, Tensor, Var};

// =============================================================================
// Adjacency
// =============================================================================

/// Build `A[target, source] = #edges(source → target)` for `num_nodes` nodes
///
/// Edges referencing a node outside `0..num_nodes` are a data error.
pub fn dense_adjacency(edges: &[(usize, usize)], num_nodes: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; num_nodes * num_nodes];
    for &(src, dst) in edges {
        if src >= num_nodes || dst >= num_nodes {
            return Err(ExplainerError::Data(format!(
                "edge ({}, {}) out of range for {} nodes",
                src, dst, num_nodes
            )));
        }
        data[dst * num_nodes + src] += 1.0;
    }
    Tensor::from_vec(data, (num_nodes, num_nodes), device)
        .map_err(|e| ExplainerError::Tensor(format!("adjacency from_vec failed: {}", e)))
}

// =============================================================================
// GIN layer
// =============================================================================

/// Weights of a single linear map `x @ W + b`
#[derive(Debug, Clone)]
pub struct LinearParams {
    /// `[in_dim, out_dim]`
    pub w: Var,
    /// `[out_dim]`
    pub b: Var,
}

impl LinearParams {
    /// Fan-in scaled uniform init for an `[in_dim, out_dim]` map
    pub fn init(rng: &mut rand::rngs::StdRng, in_dim: usize, out_dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            w: crate::primitives::fan_in_var(rng, &[in_dim, out_dim], in_dim, device)?,
            b: crate::primitives::fan_in_var(rng, &[out_dim], in_dim, device)?,
        })
    }

    /// Apply `x @ W + b` to a 2-D input
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.matmul(self.w.as_tensor())
            .and_then(|t| t.broadcast_add(self.b.as_tensor()))
            .map_err(|e| ExplainerError::Tensor(format!("linear forward failed: {}", e)))
    }
}

/// GIN layer with fixed ε = 0 (Xu et al. 2019)
///
/// ```text
/// h_agg = (1 + ε)·h_i + Σ_{j→i} h_j             # sum aggregation
/// h_out = Dropout(LeakyReLU(h_agg @ W + b))      # one-layer MLP
/// ```
///
/// # Arguments
/// - `h`: Node features `[N, in_dim]`
/// - `adj`: Dense adjacency from [`dense_adjacency`] `[N, N]`
/// - `mlp`: Linear map `[in_dim, out_dim]`
/// - `dropout`: Drop probability, applied only when `train` is set
pub fn gin_layer(h: &Tensor, adj: &Tensor, mlp: &LinearParams, dropout: f32, train: bool) -> Result<Tensor> {
    let agg = adj
        .matmul(h)
        .and_then(|neigh| neigh + h)
        .map_err(|e| ExplainerError::Tensor(format!("gin aggregation failed: {}", e)))?;

    let out = leaky_relu(&mlp.forward(&agg)?, crate::primitives::LEAKY_SLOPE)?;

    if train && dropout > 0.0 {
        candle_nn::ops::dropout(&out, dropout)
            .map_err(|e| ExplainerError::Tensor(format!("gin dropout failed: {}", e)))
    } else {
        Ok(out)
    }
}

// =============================================================================
// GAT layer
// =============================================================================

/// Parameters of one attention head
#[derive(Debug, Clone)]
pub struct GatHead {
    /// Node transform `[in_dim, head_dim]`
    pub w: Var,
    /// Attention vector on the target node `[head_dim]`
    pub a_dst: Var,
    /// Attention vector on the source node `[head_dim]`
    pub a_src: Var,
    /// Bias `[head_dim]`
    pub b: Var,
}

/// GAT message passing layer (Veličković et al. 2018) with self-loops
///
/// ```text
/// z      = H @ W
/// e_ij   = LeakyReLU(a_dst·z_i + a_src·z_j)        # split form of a·[z_i ‖ z_j]
/// α_ij   = softmax_j(e_ij) over j ∈ N(i) ∪ {i}
/// h_out  = Σ_j α_ij z_j + b
/// ```
///
/// Self-loops guarantee every row has at least one finite score, so the
/// masked softmax never divides by zero for isolated nodes.
pub fn gat_layer(h: &Tensor, adj: &Tensor, head: &GatHead, leaky_relu_slope: f64) -> Result<Tensor> {
    let (n, _) = h
        .dims2()
        .map_err(|e| ExplainerError::Tensor(format!("gat dims2 failed: {}", e)))?;
    let device = h.device();

    let z = h
        .matmul(head.w.as_tensor())
        .map_err(|e| ExplainerError::Tensor(format!("gat matmul W failed: {}", e)))?;

    // Per-node scores as target [N, 1] and as source [1, N]
    let score_dst = head
        .a_dst
        .as_tensor()
        .unsqueeze(1)
        .and_then(|a| z.matmul(&a))
        .map_err(|e| ExplainerError::Tensor(format!("gat dst score failed: {}", e)))?;
    let score_src = head
        .a_src
        .as_tensor()
        .unsqueeze(1)
        .and_then(|a| z.matmul(&a))
        .and_then(|t| t.t())
        .map_err(|e| ExplainerError::Tensor(format!("gat src score failed: {}", e)))?;

    let e_raw = score_dst
        .broadcast_add(&score_src)
        .map_err(|e| ExplainerError::Tensor(format!("gat pair scores failed: {}", e)))?;
    let e = leaky_relu(&e_raw, leaky_relu_slope)?;

    // Mask non-edges (self-loops always kept) with -inf before softmax
    let eye = Tensor::eye(n, candle_core::DType::F32, device)
        .map_err(|e| ExplainerError::Tensor(format!("gat eye failed: {}", e)))?;
    let mask = (adj + &eye)
        .and_then(|t| t.gt(0.0f64))
        .map_err(|e| ExplainerError::Tensor(format!("gat mask failed: {}", e)))?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (n, n), device)
        .map_err(|e| ExplainerError::Tensor(format!("gat neg_inf failed: {}", e)))?;
    let e_masked = mask
        .where_cond(&e, &neg_inf)
        .map_err(|e| ExplainerError::Tensor(format!("gat where_cond failed: {}", e)))?;

    let alpha = crate::primitives::softmax(&e_masked, 1)?;

    alpha
        .matmul(&z)
        .and_then(|t| t.broadcast_add(head.b.as_tensor()))
        .map_err(|e| ExplainerError::Tensor(format!("gat aggregate failed: {}", e)))
}

/// Multi-head GAT layer, heads concatenated to `[N, head_dim * num_heads]`
pub fn multi_head_gat(h: &Tensor, adj: &Tensor, heads: &[GatHead], leaky_relu_slope: f64) -> Result<Tensor> {
    if heads.is_empty() {
        return Err(ExplainerError::Tensor("multi_head_gat: at least one head required".into()));
    }

    let outputs = heads
        .iter()
        .map(|head| gat_layer(h, adj, head, leaky_relu_slope))
        .collect::<Result<Vec<_>>>()?;

    Tensor::cat(&outputs, 1)
        .map_err(|e| ExplainerError::Tensor(format!("multi_head_gat cat failed: {}", e)))
}

// =============================================================================
// Segment reductions
// =============================================================================

/// Reduction applied within each segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Mean,
    Sum,
    Max,
}

/// Row indices per segment: `groups[s]` lists every `i` with `segments[i] == s`
///
/// Fails if a segment id is `>= num_segments` or a segment is empty.
pub fn segment_groups(segments: &[usize], num_segments: usize) -> Result<Vec<Vec<u32>>> {
    let mut groups = vec![Vec::new(); num_segments];
    for (row, &seg) in segments.iter().enumerate() {
        let group = groups.get_mut(seg).ok_or_else(|| {
            ExplainerError::Data(format!("segment id {} out of range for {} segments", seg, num_segments))
        })?;
        group.push(row as u32);
    }
    if let Some(empty) = groups.iter().position(|g| g.is_empty()) {
        return Err(ExplainerError::Data(format!("segment {} has no rows", empty)));
    }
    Ok(groups)
}

/// Reduce rows of `x` `[R, F]` into `[num_segments, F]` by segment
///
/// Differentiable: gradients flow back through `index_select` to the rows
/// of each segment (for `Max`, to the arg-max row).
pub fn segment_reduce(x: &Tensor, segments: &[usize], num_segments: usize, reduce: Reduce) -> Result<Tensor> {
    let rows = x
        .dim(0)
        .map_err(|e| ExplainerError::Tensor(format!("segment_reduce dim failed: {}", e)))?;
    if rows != segments.len() {
        return Err(ExplainerError::Data(format!(
            "segment_reduce: {} rows but {} segment ids",
            rows,
            segments.len()
        )));
    }

    let groups = segment_groups(segments, num_segments)?;
    let pooled = groups
        .into_iter()
        .map(|group| {
            let idx = Tensor::new(group.as_slice(), x.device())?;
            let members = x.index_select(&idx, 0)?;
            match reduce {
                Reduce::Mean => members.mean(0),
                Reduce::Sum => members.sum(0),
                Reduce::Max => members.max(0),
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()
        .map_err(|e| ExplainerError::Tensor(format!("segment_reduce {:?} failed: {}", reduce, e)))?;

    Tensor::stack(&pooled, 0)
        .map_err(|e| ExplainerError::Tensor(format!("segment_reduce stack failed: {}", e)))
}

/// Mean, sum and max pooling per instance, concatenated to `[S, 3F]`
pub fn mean_add_max_pool(h: &Tensor, batch: &[usize], num_instances: usize) -> Result<Tensor> {
    let mean = segment_reduce(h, batch, num_instances, Reduce::Mean)?;
    let sum = segment_reduce(h, batch, num_instances, Reduce::Sum)?;
    let max = segment_reduce(h, batch, num_instances, Reduce::Max)?;
    Tensor::cat(&[&mean, &sum, &max], 1)
        .map_err(|e| ExplainerError::Tensor(format!("pool cat failed: {}", e)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn device() -> Device {
        Device::Cpu
    }

    fn var(rows: usize, cols: usize, value: f32) -> Var {
        Var::from_tensor(&Tensor::full(value, (rows, cols), &device()).unwrap()).unwrap()
    }

    fn vec_var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &device()).unwrap()).unwrap()
    }

    #[test]
    fn test_dense_adjacency_direction() {
        let adj = dense_adjacency(&[(0, 1), (1, 2)], 3, &device()).unwrap();
        let rows = adj.to_vec2::<f32>().unwrap();
        assert_eq!(rows[1][0], 1.0);
        assert_eq!(rows[2][1], 1.0);
        assert_eq!(rows[0][1], 0.0);
    }

    #[test]
    fn test_dense_adjacency_out_of_range() {
        let err = dense_adjacency(&[(0, 5)], 3, &device()).unwrap_err();
        assert!(matches!(err, ExplainerError::Data(_)));
    }

    #[test]
    fn test_gin_layer_sums_neighbours() {
        // Path 0 - 1 - 2 (both directions), identity-like weights
        let edges = [(0, 1), (1, 0), (1, 2), (2, 1)];
        let adj = dense_adjacency(&edges, 3, &device()).unwrap();
        let h = Tensor::new(&[[1f32], [2.0], [3.0]], &device()).unwrap();
        let mlp = LinearParams {
            w: var(1, 1, 1.0),
            b: Var::zeros(1, DType::F32, &device()).unwrap(),
        };

        let out = gin_layer(&h, &adj, &mlp, 0.0, false).unwrap();
        let vals: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        // node 0: 1 + 2, node 1: 2 + 1 + 3, node 2: 3 + 2
        assert_eq!(vals, vec![3.0, 6.0, 5.0]);
    }

    #[test]
    fn test_gat_layer_isolated_node_attends_to_itself() {
        let adj = dense_adjacency(&[(0, 1), (1, 0)], 3, &device()).unwrap();
        let h = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [2.0, 2.0]], &device()).unwrap();
        let head = GatHead {
            w: Var::from_tensor(&Tensor::eye(2, DType::F32, &device()).unwrap()).unwrap(),
            a_dst: vec_var(&[0.1, -0.2]),
            a_src: vec_var(&[0.3, 0.4]),
            b: Var::zeros(2, DType::F32, &device()).unwrap(),
        };

        let out = gat_layer(&h, &adj, &head, 0.2).unwrap().to_vec2::<f32>().unwrap();
        // Node 2 has no neighbours: output equals its own transformed features
        assert!((out[2][0] - 2.0).abs() < 1e-5);
        assert!((out[2][1] - 2.0).abs() < 1e-5);
        for row in &out {
            assert!(row.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_multi_head_gat_concat() {
        let adj = dense_adjacency(&[(0, 1), (1, 0)], 2, &device()).unwrap();
        let h = Tensor::randn(0f32, 1.0, (2, 3), &device()).unwrap();
        let heads: Vec<GatHead> = (0..4)
            .map(|_| GatHead {
                w: var(3, 2, 0.1),
                a_dst: vec_var(&[0.1, 0.1]),
                a_src: vec_var(&[0.2, 0.2]),
                b: Var::zeros(2, DType::F32, &device()).unwrap(),
            })
            .collect();

        let out = multi_head_gat(&h, &adj, &heads, 0.2).unwrap();
        assert_eq!(out.dims(), &[2, 8]);
        assert!(multi_head_gat(&h, &adj, &[], 0.2).is_err());
    }

    #[test]
    fn test_segment_reduce() {
        let x = Tensor::new(&[[1f32, 5.0], [3.0, 2.0], [10.0, -1.0]], &device()).unwrap();
        let segments = [0, 0, 1];

        let max = segment_reduce(&x, &segments, 2, Reduce::Max).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(max, vec![vec![3.0, 5.0], vec![10.0, -1.0]]);

        let sum = segment_reduce(&x, &segments, 2, Reduce::Sum).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(sum, vec![vec![4.0, 7.0], vec![10.0, -1.0]]);

        let mean = segment_reduce(&x, &segments, 2, Reduce::Mean).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(mean, vec![vec![2.0, 3.5], vec![10.0, -1.0]]);
    }

    #[test]
    fn test_segment_reduce_rejects_empty_segment() {
        let x = Tensor::new(&[[1f32], [2.0]], &device()).unwrap();
        let err = segment_reduce(&x, &[0, 2], 3, Reduce::Max).unwrap_err();
        assert!(err.to_string().contains("segment 1"));
    }

    #[test]
    fn test_segment_max_gradient_reaches_argmax_row() {
        let x = Var::from_tensor(&Tensor::new(&[[1f32], [4.0], [2.0]], &device()).unwrap()).unwrap();
        let pooled = segment_reduce(x.as_tensor(), &[0, 0, 0], 1, Reduce::Max).unwrap();
        let grads = pooled.sum_all().unwrap().backward().unwrap();
        let g: Vec<f32> = grads.get(x.as_tensor()).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_mean_add_max_pool_shape() {
        let h = Tensor::randn(0f32, 1.0, (5, 4), &device()).unwrap();
        let pooled = mean_add_max_pool(&h, &[0, 0, 1, 1, 1], 2).unwrap();
        assert_eq!(pooled.dims(), &[2, 12]);
    }
}
