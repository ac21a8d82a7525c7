//! Local embedder
//!
//! Maps every instance of a batch to one embedding vector living in the
//! prototype space. The trainer only sees the [`LocalEmbedder`] trait;
//! [`GraphEmbedder`] is the bundled implementation:
//!
//! ```text
//! h⁰ = node features
//! hˡ = act(conv_l(hˡ⁻¹))                 # GIN or 4-head GAT, `num_layers` times
//! g  = [mean ‖ sum ‖ max](h, batch)       # per-instance readout
//! e  = act(g @ W_proj + b_proj)           # [N, dim_prototypes]
//! ```

use crate::config::{Activation, Backbone, ExplainerConfig, GAT_HEADS};
use crate::data::InstanceBatch;
use crate::primitives::gnn::{
    dense_adjacency, gin_layer, mean_add_max_pool, multi_head_gat, GatHead, LinearParams,
};
use crate::primitives::{activate, fan_in_var};
use crate::{ExplainerError, Result};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Slope of the LeakyReLU inside GAT attention scores
const GAT_ATTENTION_SLOPE: f64 = 0.2;

/// Differentiable map from a batch of instances to `[N, D]` embeddings
pub trait LocalEmbedder {
    /// Embed every instance
    ///
    /// - `x`: node features `[nodes, F]`
    /// - `edges`: `(source, target)` pairs in batch node space
    /// - `batch`: node → instance index
    /// - `train`: enables dropout
    fn forward(
        &self,
        x: &Tensor,
        edges: &[(usize, usize)],
        batch: &[usize],
        num_instances: usize,
        train: bool,
    ) -> Result<Tensor>;

    /// Trainable variables, optimised as one group
    fn vars(&self) -> Vec<Var>;

    /// Trainable variables with stable names for checkpoints
    fn named_vars(&self) -> Vec<(String, Var)>;

    /// Embed a collated batch
    fn embed(&self, batch: &InstanceBatch, train: bool) -> Result<Tensor> {
        self.forward(&batch.x, &batch.edges, &batch.batch, batch.num_instances, train)
    }
}

enum ConvLayer {
    Gin(LinearParams),
    Gat(Vec<GatHead>),
}

/// GIN/GAT message-passing embedder with mean/sum/max readout
pub struct GraphEmbedder {
    convs: Vec<ConvLayer>,
    proj: LinearParams,
    activation: Activation,
    dropout: f32,
}

impl GraphEmbedder {
    /// Build from the configured backbone, activation, depth and widths
    ///
    /// Output width is `config.dim_prototypes`. Weights are drawn from a
    /// `StdRng` seeded with `config.seed`.
    pub fn new(num_features: usize, config: &ExplainerConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        if num_features == 0 {
            return Err(ExplainerError::Config("embedder needs at least one node feature".into()));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let hidden = config.num_gnn_hidden;

        let convs = (0..config.num_layers)
            .map(|i| {
                let in_dim = if i == 0 { num_features } else { hidden };
                match config.backbone {
                    Backbone::Gin => Ok(ConvLayer::Gin(LinearParams::init(&mut rng, in_dim, hidden, device)?)),
                    Backbone::Gat => {
                        let head_dim = hidden / GAT_HEADS;
                        let heads = (0..GAT_HEADS)
                            .map(|_| {
                                Ok(GatHead {
                                    w: fan_in_var(&mut rng, &[in_dim, head_dim], in_dim, device)?,
                                    a_dst: fan_in_var(&mut rng, &[head_dim], head_dim, device)?,
                                    a_src: fan_in_var(&mut rng, &[head_dim], head_dim, device)?,
                                    b: Var::zeros(head_dim, candle_core::DType::F32, device)?,
                                })
                            })
                            .collect::<Result<Vec<_>>>()?;
                        Ok(ConvLayer::Gat(heads))
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let proj = LinearParams::init(&mut rng, hidden * 3, config.dim_prototypes, device)?;

        Ok(Self {
            convs,
            proj,
            activation: config.activation,
            dropout: config.dropout as f32,
        })
    }

    /// Node embeddings after the message-passing stack `[nodes, hidden]`
    pub fn node_embeddings(&self, x: &Tensor, adj: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for conv in &self.convs {
            let out = match conv {
                ConvLayer::Gin(mlp) => gin_layer(&h, adj, mlp, self.dropout, train)?,
                ConvLayer::Gat(heads) => multi_head_gat(&h, adj, heads, GAT_ATTENTION_SLOPE)?,
            };
            h = activate(&out, self.activation)?;
        }
        Ok(h)
    }
}

impl LocalEmbedder for GraphEmbedder {
    fn forward(
        &self,
        x: &Tensor,
        edges: &[(usize, usize)],
        batch: &[usize],
        num_instances: usize,
        train: bool,
    ) -> Result<Tensor> {
        let num_nodes = x
            .dim(0)
            .map_err(|e| ExplainerError::Tensor(format!("embedder node count failed: {}", e)))?;
        let adj = dense_adjacency(edges, num_nodes, x.device())?;

        let h = self.node_embeddings(x, &adj, train)?;
        let pooled = mean_add_max_pool(&h, batch, num_instances)?;
        activate(&self.proj.forward(&pooled)?, self.activation)
    }

    fn vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, v)| v).collect()
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = Vec::new();
        for (l, conv) in self.convs.iter().enumerate() {
            match conv {
                ConvLayer::Gin(mlp) => {
                    vars.push((format!("embedder.conv{}.w", l), mlp.w.clone()));
                    vars.push((format!("embedder.conv{}.b", l), mlp.b.clone()));
                }
                ConvLayer::Gat(heads) => {
                    for (k, head) in heads.iter().enumerate() {
                        vars.push((format!("embedder.conv{}.head{}.w", l, k), head.w.clone()));
                        vars.push((format!("embedder.conv{}.head{}.a_dst", l, k), head.a_dst.clone()));
                        vars.push((format!("embedder.conv{}.head{}.a_src", l, k), head.a_src.clone()));
                        vars.push((format!("embedder.conv{}.head{}.b", l, k), head.b.clone()));
                    }
                }
            }
        }
        vars.push(("embedder.proj.w".into(), self.proj.w.clone()));
        vars.push(("embedder.proj.b".into(), self.proj.b.clone()));
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Instance;

    fn batch() -> InstanceBatch {
        let a = Instance::new(vec![vec![1.0, 0.0, 0.5]; 3], vec![(0, 1), (1, 2)], 0, 0, 0).unwrap();
        let b = Instance::new(vec![vec![0.0, 1.0, -0.5]; 2], vec![(0, 1), (1, 0)], 1, 1, 1).unwrap();
        InstanceBatch::collate([&a, &b], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_gin_embedder_shape() {
        let config = ExplainerConfig {
            dim_prototypes: 2,
            dropout: 0.0,
            ..Default::default()
        };
        let embedder = GraphEmbedder::new(3, &config, &Device::Cpu).unwrap();
        let out = embedder.embed(&batch(), false).unwrap();
        assert_eq!(out.dims(), &[2, 2]);
        // 2 layers × (w, b) + projection (w, b)
        assert_eq!(embedder.vars().len(), 6);
    }

    #[test]
    fn test_gat_embedder_shape() {
        let config = ExplainerConfig {
            backbone: Backbone::Gat,
            num_gnn_hidden: 8,
            activation: Activation::Tanh,
            ..Default::default()
        };
        let embedder = GraphEmbedder::new(3, &config, &Device::Cpu).unwrap();
        let out = embedder.embed(&batch(), true).unwrap();
        assert_eq!(out.dims(), &[2, 10]);
        for v in out.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((-1.0..=1.0).contains(&v));
        }
        assert_eq!(embedder.named_vars().len(), 2 * GAT_HEADS * 4 + 2);
    }

    #[test]
    fn test_same_seed_same_embeddings() {
        let config = ExplainerConfig {
            dropout: 0.0,
            ..Default::default()
        };
        let a = GraphEmbedder::new(3, &config, &Device::Cpu).unwrap();
        let b = GraphEmbedder::new(3, &config, &Device::Cpu).unwrap();
        let ea: Vec<f32> = a.embed(&batch(), false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let eb: Vec<f32> = b.embed(&batch(), false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(ea, eb);
    }

    #[test]
    fn test_zero_features_rejected() {
        assert!(GraphEmbedder::new(0, &ExplainerConfig::default(), &Device::Cpu).is_err());
    }

    #[test]
    fn test_embedding_is_differentiable() {
        let config = ExplainerConfig {
            dropout: 0.0,
            activation: Activation::Linear,
            ..Default::default()
        };
        let embedder = GraphEmbedder::new(3, &config, &Device::Cpu).unwrap();
        let out = embedder.embed(&batch(), false).unwrap();
        let grads = out.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        let vars = embedder.vars();
        for var in &vars {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }
}
