//! Prototype bank
//!
//! K learnable vectors in embedding space. [`PrototypeBank::assign`] compares
//! every embedding against every prototype and returns an assignment
//! distribution `[N, K]`:
//!
//! | Policy | Value | Gradient |
//! |---|---|---|
//! | `Softmax` | `softmax(-d² / T)` | exact |
//! | `Similarity` | `softmax(log((d² + 1) / (d² + ε)) / T)` | exact |
//! | `StraightThrough` | one-hot argmax of `Softmax` | that of `Softmax` |
//!
//! `T` is floored at [`MIN_TEMPERATURE`] and the softmax is max-subtracted,
//! so annealing towards zero sharpens the distribution without overflow.

use crate::config::AssignFunction;
use crate::primitives::{softmax, sq_distances, uniform_var};
use crate::{ExplainerError, Result};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;

/// Smallest temperature used in a division
pub const MIN_TEMPERATURE: f64 = 1e-4;

/// ε in the log-similarity denominator
const SIMILARITY_EPS: f64 = 1e-4;

/// Learnable prototypes plus the bound assignment policy
pub struct PrototypeBank {
    prototypes: Var,
    assign_func: AssignFunction,
}

impl PrototypeBank {
    /// `num_prototypes` vectors of width `dim`, drawn uniformly from `[0, 1)`
    pub fn new(
        num_prototypes: usize,
        dim: usize,
        assign_func: AssignFunction,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        if num_prototypes == 0 || dim == 0 {
            return Err(ExplainerError::Config(format!(
                "prototype bank needs K >= 1 and D >= 1 (got K={}, D={})",
                num_prototypes, dim
            )));
        }
        Ok(Self {
            prototypes: uniform_var(rng, &[num_prototypes, dim], 0.0, 1.0, device)?,
            assign_func,
        })
    }

    /// Wrap explicit prototype values `[K, D]`
    pub fn from_tensor(prototypes: &Tensor, assign_func: AssignFunction) -> Result<Self> {
        let (k, d) = prototypes
            .dims2()
            .map_err(|e| ExplainerError::Tensor(format!("prototypes must be [K, D]: {}", e)))?;
        if k == 0 || d == 0 {
            return Err(ExplainerError::Config("prototype bank cannot be empty".into()));
        }
        Ok(Self {
            prototypes: Var::from_tensor(prototypes)?,
            assign_func,
        })
    }

    /// Current prototype values `[K, D]` (tracked for gradients)
    pub fn prototypes(&self) -> &Tensor {
        self.prototypes.as_tensor()
    }

    pub fn var(&self) -> &Var {
        &self.prototypes
    }

    /// Trainable variables, optimised as one group
    pub fn vars(&self) -> Vec<Var> {
        vec![self.prototypes.clone()]
    }

    pub fn assign_func(&self) -> AssignFunction {
        self.assign_func
    }

    pub fn num_prototypes(&self) -> usize {
        self.prototypes.as_tensor().dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.prototypes.as_tensor().dims()[1]
    }

    /// Checkpoint names
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        vec![("prototypes".into(), self.prototypes.clone())]
    }

    /// Squared distances from every embedding to every prototype `[N, K]`
    pub fn sq_distances(&self, embeddings: &Tensor) -> Result<Tensor> {
        let width = embeddings
            .dim(1)
            .map_err(|e| ExplainerError::Tensor(format!("embeddings must be [N, D]: {}", e)))?;
        if width != self.dim() {
            return Err(ExplainerError::Data(format!(
                "embedding width {} does not match prototype width {}",
                width,
                self.dim()
            )));
        }
        sq_distances(embeddings, self.prototypes())
    }

    /// Assignment distribution `[N, K]` at `temperature`
    pub fn assign(&self, embeddings: &Tensor, temperature: f64) -> Result<Tensor> {
        let t = temperature.max(MIN_TEMPERATURE);
        let d = self.sq_distances(embeddings)?;

        match self.assign_func {
            AssignFunction::Softmax => self.distance_softmax(&d, t),
            AssignFunction::Similarity => {
                let num = d
                    .affine(1.0, 1.0)
                    .map_err(|e| ExplainerError::Tensor(format!("similarity num failed: {}", e)))?;
                let den = d
                    .affine(1.0, SIMILARITY_EPS)
                    .map_err(|e| ExplainerError::Tensor(format!("similarity den failed: {}", e)))?;
                let sim = num
                    .div(&den)
                    .and_then(|r| r.log())
                    .and_then(|s| s.affine(1.0 / t, 0.0))
                    .map_err(|e| ExplainerError::Tensor(format!("similarity log failed: {}", e)))?;
                softmax(&sim, 1)
            }
            AssignFunction::StraightThrough => {
                let soft = self.distance_softmax(&d, t)?;
                let hard = one_hot_argmax(&soft)?;
                // Forward value = hard, gradient = d soft
                (hard - soft.detach())
                    .and_then(|t| t + &soft)
                    .map_err(|e| ExplainerError::Tensor(format!("straight-through failed: {}", e)))
            }
        }
    }

    fn distance_softmax(&self, d: &Tensor, t: f64) -> Result<Tensor> {
        let logits = d
            .affine(-1.0 / t, 0.0)
            .map_err(|e| ExplainerError::Tensor(format!("distance logits failed: {}", e)))?;
        softmax(&logits, 1)
    }
}

/// One-hot encoding of the row-wise argmax of a `[N, K]` matrix (no gradient)
pub fn one_hot_argmax(x: &Tensor) -> Result<Tensor> {
    let (n, k) = x
        .dims2()
        .map_err(|e| ExplainerError::Tensor(format!("one_hot_argmax dims failed: {}", e)))?;
    let idx: Vec<u32> = x
        .argmax(1)
        .and_then(|t| t.to_vec1())
        .map_err(|e| ExplainerError::Tensor(format!("argmax failed: {}", e)))?;
    let mut data = vec![0f32; n * k];
    for (row, &col) in idx.iter().enumerate() {
        data[row * k + col as usize] = 1.0;
    }
    Tensor::from_vec(data, (n, k), x.device())
        .map_err(|e| ExplainerError::Tensor(format!("one-hot failed: {}", e)))
}
