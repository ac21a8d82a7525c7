//! Logic classifier
//!
//! The trainer only depends on the [`LogicClassifier`] trait. The bundled
//! [`EntropyLogicNetwork`] is an entropy-attention network (Barbiero et al.
//! 2022): its first layer learns, per class, a softmax attention over input
//! concepts, so each class prediction depends on a few relevant concepts and
//! can be read back as a Boolean formula.
//!
//! ```text
//! γ_c      = Σ_out |W_c|                     # [C, K]  concept importance
//! α_c      = softmax(γ_c / τ)                # attention over concepts
//! α̃_c      = α_c / max(α_c)                 # relevance in (0, 1]
//! h_c      = LeakyReLU((x ⊙ α̃_c) @ W_cᵀ + b_c)
//! h_c      = LeakyReLU(h_c @ W₂ + b₂)
//! logit_c  = h_c @ W₃ + b₃
//! ```

use crate::config::ExplainerConfig;
use crate::primitives::gnn::LinearParams;
use crate::primitives::{fan_in_var, leaky_relu, softmax, LEAKY_SLOPE, LOG_EPS};
use crate::{ExplainerError, Result};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Classes of the binary task
pub const NUM_CLASSES: usize = 2;

/// Width of the second hidden layer
const SECOND_HIDDEN: usize = 5;

/// Concept vector → class logits, with an interpretability hook
pub trait LogicClassifier {
    /// Class logits `[G, C]` for concept vectors `[G, K]`
    fn forward(&self, concepts: &Tensor, train: bool) -> Result<Tensor>;

    /// Trainable variables, optimised as one group
    fn vars(&self) -> Vec<Var>;

    /// Trainable variables with stable names for checkpoints
    fn named_vars(&self) -> Vec<(String, Var)>;

    /// Scalar regularisation term, differentiable in the classifier's vars
    fn regularization(&self) -> Result<Tensor>;

    /// Relevance in `[0, 1]` of every concept for `class`
    fn concept_relevance(&self, class: usize) -> Result<Vec<f32>>;

    fn num_classes(&self) -> usize;
}

/// Entropy-attention logic network: EntropyLinear → LeakyReLU → Linear → LeakyReLU → Linear
pub struct EntropyLogicNetwork {
    /// `[C, hidden, K]`
    weight: Var,
    /// `[C, 1, hidden]`
    bias: Var,
    second: LinearParams,
    out: LinearParams,
    temperature: f64,
    num_concepts: usize,
    hidden: usize,
}

impl EntropyLogicNetwork {
    pub fn new(num_concepts: usize, config: &ExplainerConfig, device: &Device) -> Result<Self> {
        if num_concepts == 0 {
            return Err(ExplainerError::Config("logic network needs at least one concept".into()));
        }
        if config.len_hidden == 0 {
            return Err(ExplainerError::Config("len_hidden must be at least 1".into()));
        }
        if config.len_temperature <= 0.0 {
            return Err(ExplainerError::Config(format!(
                "len_temperature must be positive (got {})",
                config.len_temperature
            )));
        }

        // Offset keeps the classifier's stream independent of the embedder's
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        let hidden = config.len_hidden;

        Ok(Self {
            weight: fan_in_var(&mut rng, &[NUM_CLASSES, hidden, num_concepts], num_concepts, device)?,
            bias: fan_in_var(&mut rng, &[NUM_CLASSES, 1, hidden], num_concepts, device)?,
            second: LinearParams::init(&mut rng, hidden, SECOND_HIDDEN, device)?,
            out: LinearParams::init(&mut rng, SECOND_HIDDEN, 1, device)?,
            temperature: config.len_temperature,
            num_concepts,
            hidden,
        })
    }

    pub fn num_concepts(&self) -> usize {
        self.num_concepts
    }

    /// Attention over concepts per class `[C, K]`, rows sum to 1
    pub fn alpha(&self) -> Result<Tensor> {
        let gamma = self
            .weight
            .as_tensor()
            .abs()
            .and_then(|t| t.sum(1))
            .and_then(|t| t.affine(1.0 / self.temperature, 0.0))
            .map_err(|e| ExplainerError::Tensor(format!("entropy gamma failed: {}", e)))?;
        softmax(&gamma, 1)
    }

    /// Attention rescaled so the most relevant concept of each class is 1
    pub fn alpha_norm(&self) -> Result<Tensor> {
        let alpha = self.alpha()?;
        alpha
            .max_keepdim(1)
            .and_then(|m| alpha.broadcast_div(&m))
            .map_err(|e| ExplainerError::Tensor(format!("alpha_norm failed: {}", e)))
    }

    /// Per-class hidden activations of the entropy layer `[G·C, hidden]`
    fn entropy_layer(&self, concepts: &Tensor) -> Result<Tensor> {
        let (g, k) = concepts
            .dims2()
            .map_err(|e| ExplainerError::Tensor(format!("concepts must be [G, K]: {}", e)))?;
        if k != self.num_concepts {
            return Err(ExplainerError::Data(format!(
                "classifier expects {} concepts, got {}",
                self.num_concepts, k
            )));
        }

        let alpha_norm = self.alpha_norm()?;
        // [1, G, K] ⊙ [C, 1, K] → [C, G, K]
        let masked = concepts
            .unsqueeze(0)
            .and_then(|x| x.broadcast_mul(&alpha_norm.unsqueeze(1)?))
            .map_err(|e| ExplainerError::Tensor(format!("entropy mask failed: {}", e)))?;

        self.weight
            .as_tensor()
            .transpose(1, 2)
            .and_then(|wt| masked.matmul(&wt.contiguous()?))
            .and_then(|h| h.broadcast_add(self.bias.as_tensor()))
            .and_then(|h| h.permute((1, 0, 2)))
            .and_then(|h| h.contiguous())
            .and_then(|h| h.reshape((g * NUM_CLASSES, self.hidden)))
            .map_err(|e| ExplainerError::Tensor(format!("entropy linear failed: {}", e)))
    }
}

impl LogicClassifier for EntropyLogicNetwork {
    fn forward(&self, concepts: &Tensor, _train: bool) -> Result<Tensor> {
        let g = concepts
            .dim(0)
            .map_err(|e| ExplainerError::Tensor(format!("classifier batch dim failed: {}", e)))?;

        let h = leaky_relu(&self.entropy_layer(concepts)?, LEAKY_SLOPE)?;
        let h = leaky_relu(&self.second.forward(&h)?, LEAKY_SLOPE)?;
        self.out
            .forward(&h)?
            .reshape((g, NUM_CLASSES))
            .map_err(|e| ExplainerError::Tensor(format!("classifier output reshape failed: {}", e)))
    }

    fn vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, v)| v).collect()
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        vec![
            ("classifier.entropy.w".into(), self.weight.clone()),
            ("classifier.entropy.b".into(), self.bias.clone()),
            ("classifier.hidden.w".into(), self.second.w.clone()),
            ("classifier.hidden.b".into(), self.second.b.clone()),
            ("classifier.out.w".into(), self.out.w.clone()),
            ("classifier.out.b".into(), self.out.b.clone()),
        ]
    }

    /// `-Σ α log α` summed over classes
    fn regularization(&self) -> Result<Tensor> {
        let alpha = self.alpha()?;
        alpha
            .affine(1.0, LOG_EPS)
            .and_then(|t| t.log())
            .and_then(|log_a| alpha.mul(&log_a))
            .and_then(|t| t.sum_all())
            .and_then(|t| t.neg())
            .map_err(|e| ExplainerError::Tensor(format!("entropy regularization failed: {}", e)))
    }

    fn concept_relevance(&self, class: usize) -> Result<Vec<f32>> {
        if class >= NUM_CLASSES {
            return Err(ExplainerError::Data(format!(
                "class {} out of range for {} classes",
                class, NUM_CLASSES
            )));
        }
        self.alpha_norm()?
            .get(class)
            .and_then(|row| row.to_vec1::<f32>())
            .map_err(|e| ExplainerError::Tensor(format!("relevance readout failed: {}", e)))
    }

    fn num_classes(&self) -> usize {
        NUM_CLASSES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    fn network(k: usize) -> EntropyLogicNetwork {
        EntropyLogicNetwork::new(k, &ExplainerConfig::default(), &device()).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let net = network(4);
        let x = Tensor::new(&[[1f32, 0.0, 0.5, 0.2], [0.0, 1.0, 0.1, 0.9], [0.3, 0.3, 0.3, 0.3]], &device()).unwrap();
        let logits = net.forward(&x, true).unwrap();
        assert_eq!(logits.dims(), &[3, 2]);
        assert_eq!(net.vars().len(), 6);
    }

    #[test]
    fn test_concept_count_mismatch() {
        let x = Tensor::zeros((2, 3), candle_core::DType::F32, &device()).unwrap();
        assert!(matches!(network(4).forward(&x, false), Err(ExplainerError::Data(_))));
    }

    #[test]
    fn test_alpha_is_distribution_and_relevance_peaks_at_one() {
        let net = network(5);
        for row in net.alpha().unwrap().to_vec2::<f32>().unwrap() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        for class in 0..NUM_CLASSES {
            let rel = net.concept_relevance(class).unwrap();
            let max = rel.iter().cloned().fold(f32::MIN, f32::max);
            assert!((max - 1.0).abs() < 1e-6);
            assert!(rel.iter().all(|r| *r > 0.0 && *r <= 1.0));
        }
        assert!(net.concept_relevance(2).is_err());
    }

    #[test]
    fn test_regularization_bounds() {
        let k = 6;
        let net = network(k);
        let reg = net.regularization().unwrap().to_scalar::<f32>().unwrap();
        // Between 0 and C·ln K
        assert!(reg >= 0.0);
        assert!(reg <= NUM_CLASSES as f32 * (k as f32).ln() + 1e-4);
    }

    #[test]
    fn test_regularization_gradient_reaches_entropy_weights() {
        let net = network(3);
        let grads = net.regularization().unwrap().backward().unwrap();
        assert!(grads.get(net.weight.as_tensor()).is_some());
    }

    #[test]
    fn test_irrelevant_concept_is_suppressed() {
        let mut config = ExplainerConfig::default();
        config.len_temperature = 0.1;
        let net = EntropyLogicNetwork::new(2, &config, &device()).unwrap();
        // Concept 0 dominates class 0; concept 1 is nearly unused
        let w = Tensor::new(
            &[[[3f32, 0.0]; 10], [[0.0, 3.0]; 10]],
            &device(),
        )
        .unwrap();
        net.weight.set(&w).unwrap();
        let rel = net.concept_relevance(0).unwrap();
        assert_eq!(rel[0], 1.0);
        assert!(rel[1] < 0.5);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = ExplainerConfig::default();
        config.len_temperature = 0.0;
        assert!(EntropyLogicNetwork::new(3, &config, &device()).is_err());
        assert!(EntropyLogicNetwork::new(0, &ExplainerConfig::default(), &device()).is_err());
    }
}
