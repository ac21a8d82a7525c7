//! Composite loss
//!
//! One mini-batch objective assembled from a declarative table of
//! coefficient-gated terms. Each entry pairs a [`LossTerm`] with the function
//! computing its unscaled value; a term whose coefficient is exactly zero is
//! never evaluated and contributes a zero scalar.
//!
//! | Term | Unscaled value | Pulls towards |
//! |---|---|---|
//! | `Classification` | `0.5 · L(logits, one_hot(y))` (BCE or focal) | accuracy |
//! | `Logic` | classifier regularisation (attention entropy) | sparse formulas |
//! | `PrototypeDistance` | `-mean_k min_{j≠k} min(‖p_k - p_j‖, 0.5)` | separated prototypes |
//! | `Diversity` | `Σ relu(cos(p̂, p̂ᵀ) - I - 0.2)` | non-collinear prototypes |
//! | `R1` | `mean_k min_i ‖e_i - p_k‖²` | every prototype near a sample |
//! | `R2` | `mean_i min_k ‖e_i - p_k‖²` | every sample near a prototype |
//! | `ConceptEntropy` | `mean_i H(a_i)` | confident assignments |
//! | `DistributionEntropy` | `H(normalize₂(Σ_i a_i))` | balanced concept usage |

use crate::config::{ClassificationLoss, ExplainerConfig};
use crate::logic::LogicClassifier;
use crate::primitives::{
    bce_with_logits, cosine_similarity_matrix, entropy_loss, fill_diagonal, focal_loss, l2_normalize,
    pairwise_distances, scalar_value, sq_distances, zero_scalar,
};
use crate::{ExplainerError, Result};
use candle_core::{DType, Tensor};
use std::fmt;

/// Prototype distances above this no longer count as closer
const PDIST_CLIP: f32 = 0.5;

/// Cosine similarity tolerated between distinct prototypes
const DIVERSITY_MARGIN: f64 = 0.2;

// ============================================================================
// Terms
// ============================================================================

/// One additive component of the objective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LossTerm {
    Classification,
    Logic,
    PrototypeDistance,
    Diversity,
    R1,
    R2,
    ConceptEntropy,
    DistributionEntropy,
}

impl LossTerm {
    pub const COUNT: usize = 8;

    pub const ALL: [LossTerm; Self::COUNT] = [
        LossTerm::Classification,
        LossTerm::Logic,
        LossTerm::PrototypeDistance,
        LossTerm::Diversity,
        LossTerm::R1,
        LossTerm::R2,
        LossTerm::ConceptEntropy,
        LossTerm::DistributionEntropy,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Metric key
    pub fn name(self) -> &'static str {
        match self {
            LossTerm::Classification => "len_loss",
            LossTerm::Logic => "logic_loss",
            LossTerm::PrototypeDistance => "prototype_distance_loss",
            LossTerm::Diversity => "div_loss",
            LossTerm::R1 => "r1_loss",
            LossTerm::R2 => "r2_loss",
            LossTerm::ConceptEntropy => "concept_entropy_loss",
            LossTerm::DistributionEntropy => "distribution_entropy_loss",
        }
    }
}

impl fmt::Display for LossTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tensors one mini-batch contributes to the objective
pub struct LossInputs<'a> {
    /// Classifier output `[G, C]`
    pub logits: &'a Tensor,
    /// One-hot graph labels `[G, C]`
    pub targets: &'a Tensor,
    /// Instance embeddings `[N, D]`
    pub embeddings: &'a Tensor,
    /// Assignment distributions `[N, K]`
    pub assignments: &'a Tensor,
    /// Prototype matrix `[K, D]`
    pub prototypes: &'a Tensor,
    pub classifier: &'a dyn LogicClassifier,
}

type TermFn = fn(&CompositeLoss, &LossInputs<'_>) -> Result<Tensor>;

/// Every term of the objective, in reporting order
const TERMS: [(LossTerm, TermFn); LossTerm::COUNT] = [
    (LossTerm::Classification, classification_term),
    (LossTerm::Logic, logic_term),
    (LossTerm::PrototypeDistance, prototype_distance_term),
    (LossTerm::Diversity, diversity_term),
    (LossTerm::R1, r1_term),
    (LossTerm::R2, r2_term),
    (LossTerm::ConceptEntropy, concept_entropy_term),
    (LossTerm::DistributionEntropy, distribution_entropy_term),
];

fn classification_term(loss: &CompositeLoss, inputs: &LossInputs<'_>) -> Result<Tensor> {
    let base = match loss.classification {
        ClassificationLoss::Bce => bce_with_logits(inputs.logits, inputs.targets)?,
        ClassificationLoss::Focal { gamma, alpha } => focal_loss(inputs.logits, inputs.targets, gamma, alpha)?,
    };
    base.affine(0.5, 0.0)
        .map_err(|e| ExplainerError::Tensor(format!("classification scale failed: {}", e)))
}

fn logic_term(_loss: &CompositeLoss, inputs: &LossInputs<'_>) -> Result<Tensor> {
    inputs.classifier.regularization()
}

fn prototype_distance_term(_loss: &CompositeLoss, inputs: &LossInputs<'_>) -> Result<Tensor> {
    prototype_separation(inputs.prototypes)
}

fn diversity_term(_loss: &CompositeLoss, inputs: &LossInputs<'_>) -> Result<Tensor> {
    prototype_diversity(inputs.prototypes)
}

fn r1_term(_loss: &CompositeLoss, inputs: &LossInputs<'_>) -> Result<Tensor> {
    r1_penalty(inputs.embeddings, inputs.prototypes)
}

fn r2_term(_loss: &CompositeLoss, inputs: &LossInputs<'_>) -> Result<Tensor> {
    r2_penalty(inputs.embeddings, inputs.prototypes)
}

fn concept_entropy_term(_loss: &CompositeLoss, inputs: &LossInputs<'_>) -> Result<Tensor> {
    entropy_loss(inputs.assignments)
}

fn distribution_entropy_term(_loss: &CompositeLoss, inputs: &LossInputs<'_>) -> Result<Tensor> {
    distribution_entropy(inputs.assignments)
}

// ============================================================================
// Term bodies
// ============================================================================

/// `-mean_k min_{j≠k} min(‖p_k - p_j‖, 0.5)`; zero with fewer than two prototypes
pub fn prototype_separation(prototypes: &Tensor) -> Result<Tensor> {
    let k = prototypes
        .dim(0)
        .map_err(|e| ExplainerError::Tensor(format!("prototype count failed: {}", e)))?;
    if k < 2 {
        return zero_scalar(prototypes.device());
    }
    let clipped = pairwise_distances(prototypes)?
        .clamp(0f32, PDIST_CLIP)
        .map_err(|e| ExplainerError::Tensor(format!("pdist clip failed: {}", e)))?;
    fill_diagonal(&clipped, f32::INFINITY)?
        .min(1)
        .and_then(|t| t.mean_all())
        .and_then(|t| t.neg())
        .map_err(|e| ExplainerError::Tensor(format!("pdist reduce failed: {}", e)))
}

/// `Σ relu(cos(p̂, p̂ᵀ) - I - margin)` over all prototype pairs
pub fn prototype_diversity(prototypes: &Tensor) -> Result<Tensor> {
    let cos = cosine_similarity_matrix(prototypes)?;
    let (k, _) = cos
        .dims2()
        .map_err(|e| ExplainerError::Tensor(format!("diversity dims failed: {}", e)))?;
    let eye = Tensor::eye(k, DType::F32, prototypes.device())
        .map_err(|e| ExplainerError::Tensor(format!("diversity eye failed: {}", e)))?;
    (cos - eye)
        .and_then(|t| t.affine(1.0, -DIVERSITY_MARGIN))
        .and_then(|t| t.relu())
        .and_then(|t| t.sum_all())
        .map_err(|e| ExplainerError::Tensor(format!("diversity reduce failed: {}", e)))
}

/// Mean over prototypes of the squared distance to their closest embedding
pub fn r1_penalty(embeddings: &Tensor, prototypes: &Tensor) -> Result<Tensor> {
    sq_distances(embeddings, prototypes)?
        .min(0)
        .and_then(|t| t.mean_all())
        .map_err(|e| ExplainerError::Tensor(format!("r1 reduce failed: {}", e)))
}

/// Mean over embeddings of the squared distance to their closest prototype
pub fn r2_penalty(embeddings: &Tensor, prototypes: &Tensor) -> Result<Tensor> {
    sq_distances(embeddings, prototypes)?
        .min(1)
        .and_then(|t| t.mean_all())
        .map_err(|e| ExplainerError::Tensor(format!("r2 reduce failed: {}", e)))
}

/// Entropy of the L2-normalised concept usage `Σ_i a_i`
pub fn distribution_entropy(assignments: &Tensor) -> Result<Tensor> {
    let usage = assignments
        .sum_keepdim(0)
        .map_err(|e| ExplainerError::Tensor(format!("concept usage sum failed: {}", e)))?;
    entropy_loss(&l2_normalize(&usage, 1)?)
}

// ============================================================================
// Composite loss
// ============================================================================

/// Per-batch loss value plus every term's contribution
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Differentiable total
    pub total: Tensor,
    values: [f32; LossTerm::COUNT],
    /// Concept cross-entropy, non-zero only in debug mode
    pub debug: f32,
}

impl LossBreakdown {
    /// Scaled contribution of `term`
    pub fn value(&self, term: LossTerm) -> f32 {
        self.values[term.index()]
    }

    pub fn total_value(&self) -> Result<f32> {
        scalar_value(&self.total)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LossTerm, f32)> + '_ {
        LossTerm::ALL.iter().map(move |&t| (t, self.value(t)))
    }
}

/// Objective with its coefficients and classification loss bound once
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeLoss {
    classification: ClassificationLoss,
    coefficients: [f64; LossTerm::COUNT],
}

impl CompositeLoss {
    pub fn from_config(config: &ExplainerConfig) -> Self {
        let mut coefficients = [0.0; LossTerm::COUNT];
        for term in LossTerm::ALL {
            coefficients[term.index()] = match term {
                LossTerm::Classification => config.coeff_classification,
                LossTerm::Logic => config.coeff_logic_loss,
                LossTerm::PrototypeDistance => config.coeff_pdist,
                LossTerm::Diversity => config.coeff_divloss,
                LossTerm::R1 => config.coeff_r1,
                LossTerm::R2 => config.coeff_r2,
                LossTerm::ConceptEntropy => config.coeff_ce,
                LossTerm::DistributionEntropy => config.coeff_de,
            };
        }
        Self {
            classification: config.classification_loss(),
            coefficients,
        }
    }

    pub fn coefficient(&self, term: LossTerm) -> f64 {
        self.coefficients[term.index()]
    }

    /// Terms evaluated by [`compute`](Self::compute)
    pub fn active_terms(&self) -> impl Iterator<Item = LossTerm> + '_ {
        LossTerm::ALL.into_iter().filter(|&t| self.coefficient(t) != 0.0)
    }

    /// Full objective for one mini-batch
    pub fn compute(&self, inputs: &LossInputs<'_>) -> Result<LossBreakdown> {
        let device = inputs.logits.device();
        let mut total = zero_scalar(device)?;
        let mut values = [0f32; LossTerm::COUNT];

        for (term, term_fn) in TERMS.iter() {
            let coeff = self.coefficient(*term);
            if coeff == 0.0 {
                continue;
            }
            let scaled = term_fn(self, inputs)?
                .affine(coeff, 0.0)
                .map_err(|e| ExplainerError::Tensor(format!("{} scale failed: {}", term, e)))?;
            values[term.index()] = scalar_value(&scaled)?;
            total = (total + scaled)
                .map_err(|e| ExplainerError::Tensor(format!("{} accumulate failed: {}", term, e)))?;
        }

        Ok(LossBreakdown { total, values, debug: 0.0 })
    }

    /// Prototype debugging objective
    ///
    /// Treats the assignments as logits over concept labels:
    /// `cross_entropy(a, concept_labels) + c_r1·R1 + c_r2·R2`.
    pub fn debug(
        &self,
        embeddings: &Tensor,
        assignments: &Tensor,
        prototypes: &Tensor,
        concept_labels: &[u32],
    ) -> Result<LossBreakdown> {
        let (n, k) = assignments
            .dims2()
            .map_err(|e| ExplainerError::Tensor(format!("debug assignments dims failed: {}", e)))?;
        if concept_labels.len() != n {
            return Err(ExplainerError::Data(format!(
                "{} concept labels for {} instances",
                concept_labels.len(),
                n
            )));
        }
        if let Some(bad) = concept_labels.iter().find(|&&c| c as usize >= k) {
            return Err(ExplainerError::Data(format!(
                "concept label {} out of range for {} prototypes",
                bad, k
            )));
        }

        let target = Tensor::new(concept_labels, assignments.device())
            .map_err(|e| ExplainerError::Tensor(format!("debug targets failed: {}", e)))?;
        let ce = candle_nn::loss::cross_entropy(assignments, &target)
            .map_err(|e| ExplainerError::Tensor(format!("debug cross entropy failed: {}", e)))?;
        let r1 = r1_penalty(embeddings, prototypes)?
            .affine(self.coefficient(LossTerm::R1), 0.0)
            .map_err(|e| ExplainerError::Tensor(format!("debug r1 scale failed: {}", e)))?;
        let r2 = r2_penalty(embeddings, prototypes)?
            .affine(self.coefficient(LossTerm::R2), 0.0)
            .map_err(|e| ExplainerError::Tensor(format!("debug r2 scale failed: {}", e)))?;

        let mut values = [0f32; LossTerm::COUNT];
        values[LossTerm::R1.index()] = scalar_value(&r1)?;
        values[LossTerm::R2.index()] = scalar_value(&r2)?;
        let debug = scalar_value(&ce)?;

        let total = (ce + r1)
            .and_then(|t| t + r2)
            .map_err(|e| ExplainerError::Tensor(format!("debug total failed: {}", e)))?;
        Ok(LossBreakdown { total, values, debug })
    }
}
