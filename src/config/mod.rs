//! Explainer configuration
//!
//! Hyper-parameters for the embedder, prototype bank, logic classifier,
//! composite loss and trainer. Loaded from TOML; every option has a default
//! so partial files are accepted.
//!
//! ```toml
//! num_prototypes = 6
//! dim_prototypes = 10
//! assign_func = "softmax"
//! ts = 2.0
//! te = 1.0
//! backbone = "gin"
//! activation = "leaky"
//! coeff_r1 = 0.09
//! ```
//!
//! String-valued choices are closed enums. Unknown tags are rejected when
//! the file is parsed, so a bad backbone never reaches model construction.

use crate::{ExplainerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

// =============================================================================
// Closed choices
// =============================================================================

/// How embeddings are turned into assignment distributions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignFunction {
    /// `softmax(-d² / T)` over prototypes
    Softmax,
    /// ProtoPNet log-similarity `log((d² + 1) / (d² + ε))`, softmax-normalised
    Similarity,
    /// One-hot forward value with the soft policy's gradient
    StraightThrough,
}

impl FromStr for AssignFunction {
    type Err = ExplainerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "softmax" => Ok(Self::Softmax),
            "sim" | "similarity" => Ok(Self::Similarity),
            "straight_through" | "hard" => Ok(Self::StraightThrough),
            other => Err(ExplainerError::Config(format!(
                "unknown assignment function '{}'",
                other
            ))),
        }
    }
}

/// Nonlinearity used inside the embedder and on its projection head
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Sigmoid,
    Tanh,
    /// LeakyReLU with slope 0.01
    Leaky,
    /// Identity (LeakyReLU with slope 1)
    Linear,
}

impl FromStr for Activation {
    type Err = ExplainerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "leaky" => Ok(Self::Leaky),
            "lin" | "linear" => Ok(Self::Linear),
            other => Err(ExplainerError::Config(format!(
                "activation '{}' not available",
                other
            ))),
        }
    }
}

/// Message-passing backbone of the embedder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Backbone {
    /// Graph Isomorphism Network (sum aggregation + MLP)
    Gin,
    /// Graph attention, 4 heads concatenated
    Gat,
}

impl FromStr for Backbone {
    type Err = ExplainerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gin" => Ok(Self::Gin),
            "gat" => Ok(Self::Gat),
            other => Err(ExplainerError::Config(format!(
                "backbone '{}' not available",
                other
            ))),
        }
    }
}

/// Classification loss bound at trainer construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClassificationLoss {
    /// Binary cross-entropy on logits
    Bce,
    /// Sigmoid focal loss
    Focal { gamma: f64, alpha: f64 },
}

// =============================================================================
// Configuration
// =============================================================================

/// Number of attention heads used by the GAT backbone
pub const GAT_HEADS: usize = 4;

/// Full hyper-parameter set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExplainerConfig {
    /// Number of prototype concepts (K)
    pub num_prototypes: usize,
    /// Prototype and embedding dimensionality (D)
    pub dim_prototypes: usize,
    pub assign_func: AssignFunction,

    /// Temperature at the first epoch
    pub ts: f64,
    /// Temperature reached after `num_epochs`
    pub te: f64,

    /// Learning rate for the embedder group
    pub le_emb_lr: f64,
    /// Learning rate for the logic classifier group
    pub len_lr: f64,
    /// Learning rate for the prototype group
    pub proto_lr: f64,

    /// Use focal loss instead of plain BCE
    pub focal_loss: bool,
    pub focal_gamma: f64,
    pub focal_alpha: f64,

    pub coeff_classification: f64,
    pub coeff_logic_loss: f64,
    pub coeff_pdist: f64,
    pub coeff_divloss: f64,
    pub coeff_r1: f64,
    pub coeff_r2: f64,
    pub coeff_ce: f64,
    pub coeff_de: f64,

    /// Classify instance assignments against concept labels instead of
    /// training the full pipeline
    pub debug_prototypes: bool,
    /// Persist best-so-far checkpoints (and reload on early stop)
    pub log_models: bool,
    pub checkpoint_dir: String,

    pub backbone: Backbone,
    pub activation: Activation,
    pub num_layers: usize,
    pub num_gnn_hidden: usize,
    pub dropout: f64,

    /// Width of the entropy layer in the logic classifier
    pub len_hidden: usize,
    /// Temperature of the classifier's concept attention softmax
    pub len_temperature: f64,

    /// Early-stopping patience in epochs
    pub patience: usize,
    /// Graphs per mini-batch
    pub batch_size: usize,
    pub seed: u64,
    /// Run explanation inspection every N epochs
    pub inspect_every: usize,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            num_prototypes: 6,
            dim_prototypes: 10,
            assign_func: AssignFunction::Softmax,
            ts: 2.0,
            te: 1.0,
            le_emb_lr: 0.001,
            len_lr: 0.0005,
            proto_lr: 0.001,
            focal_loss: false,
            focal_gamma: 2.0,
            focal_alpha: 0.5,
            coeff_classification: 1.0,
            coeff_logic_loss: 0.01,
            coeff_pdist: 0.5,
            coeff_divloss: 0.0,
            coeff_r1: 0.09,
            coeff_r2: 0.001,
            coeff_ce: 0.01,
            coeff_de: 0.0,
            debug_prototypes: false,
            log_models: false,
            checkpoint_dir: "trained_models".into(),
            backbone: Backbone::Gin,
            activation: Activation::Leaky,
            num_layers: 2,
            num_gnn_hidden: 20,
            dropout: 0.1,
            len_hidden: 10,
            len_temperature: 0.6,
            patience: 100,
            batch_size: 32,
            seed: 42,
            inspect_every: 20,
        }
    }
}

impl ExplainerConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ExplainerError::Io)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ExplainerError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ExplainerError::Serialization(e.to_string()))
    }

    /// The classification loss selected by `focal_loss`
    pub fn classification_loss(&self) -> ClassificationLoss {
        if self.focal_loss {
            ClassificationLoss::Focal {
                gamma: self.focal_gamma,
                alpha: self.focal_alpha,
            }
        } else {
            ClassificationLoss::Bce
        }
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        fn fail<T>(msg: String) -> Result<T> {
            Err(ExplainerError::Config(msg))
        }

        if self.num_prototypes == 0 {
            return fail("num_prototypes must be at least 1".into());
        }
        if self.dim_prototypes == 0 {
            return fail("dim_prototypes must be at least 1".into());
        }
        if !(self.ts.is_finite() && self.ts > 0.0) {
            return fail(format!("ts must be positive and finite (got {})", self.ts));
        }
        // Assignment floors the temperature, so annealing all the way to 0 is allowed
        if !(self.te.is_finite() && self.te >= 0.0) {
            return fail(format!("te must be non-negative and finite (got {})", self.te));
        }
        for (name, lr) in [
            ("le_emb_lr", self.le_emb_lr),
            ("len_lr", self.len_lr),
            ("proto_lr", self.proto_lr),
        ] {
            if !(lr.is_finite() && lr > 0.0) {
                return fail(format!("{} must be positive, got {}", name, lr));
            }
        }
        for (name, coeff) in [
            ("coeff_classification", self.coeff_classification),
            ("coeff_logic_loss", self.coeff_logic_loss),
            ("coeff_pdist", self.coeff_pdist),
            ("coeff_divloss", self.coeff_divloss),
            ("coeff_r1", self.coeff_r1),
            ("coeff_r2", self.coeff_r2),
            ("coeff_ce", self.coeff_ce),
            ("coeff_de", self.coeff_de),
        ] {
            if !(coeff.is_finite() && coeff >= 0.0) {
                return fail(format!("{} must be non-negative, got {}", name, coeff));
            }
        }
        if self.focal_loss && (self.focal_gamma < 0.0 || !(0.0..=1.0).contains(&self.focal_alpha)) {
            return fail(format!(
                "focal loss needs gamma >= 0 and alpha in [0, 1] (gamma={}, alpha={})",
                self.focal_gamma, self.focal_alpha
            ));
        }
        if self.num_layers == 0 || self.num_gnn_hidden == 0 {
            return fail("embedder needs at least one layer and a hidden size".into());
        }
        if self.backbone == Backbone::Gat && self.num_gnn_hidden % GAT_HEADS != 0 {
            return fail(format!(
                "GAT backbone needs num_gnn_hidden divisible by {} (got {})",
                GAT_HEADS, self.num_gnn_hidden
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return fail(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if self.len_hidden == 0 || !(self.len_temperature.is_finite() && self.len_temperature > 0.0) {
            return fail("logic classifier needs len_hidden >= 1 and len_temperature > 0".into());
        }
        if self.patience == 0 || self.batch_size == 0 || self.inspect_every == 0 {
            return fail("patience, batch_size and inspect_every must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ExplainerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.classification_loss(), ClassificationLoss::Bce);
    }

    #[test]
    fn test_partial_toml() {
        let config = ExplainerConfig::from_toml_str(
            r#"
            num_prototypes = 4
            assign_func = "straight_through"
            backbone = "gat"
            num_gnn_hidden = 16
            focal_loss = true
            "#,
        )
        .unwrap();

        assert_eq!(config.num_prototypes, 4);
        assert_eq!(config.assign_func, AssignFunction::StraightThrough);
        assert_eq!(config.backbone, Backbone::Gat);
        assert_eq!(
            config.classification_loss(),
            ClassificationLoss::Focal { gamma: 2.0, alpha: 0.5 }
        );
        // Untouched fields keep defaults
        assert_eq!(config.dim_prototypes, 10);
    }

    #[test]
    fn test_unknown_backbone_rejected() {
        let err = ExplainerConfig::from_toml_str(r#"backbone = "gcn""#).unwrap_err();
        assert!(matches!(err, ExplainerError::Config(_)));
    }

    #[test]
    fn test_from_str_tags() {
        assert_eq!("GIN".parse::<Backbone>().unwrap(), Backbone::Gin);
        assert_eq!("lin".parse::<Activation>().unwrap(), Activation::Linear);
        assert_eq!("sim".parse::<AssignFunction>().unwrap(), AssignFunction::Similarity);
        assert!("relu6".parse::<Activation>().is_err());
        assert!("gumbel".parse::<AssignFunction>().is_err());
    }

    #[test]
    fn test_gat_hidden_must_split_into_heads() {
        let config = ExplainerConfig {
            backbone: Backbone::Gat,
            num_gnn_hidden: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_coefficient_rejected() {
        let config = ExplainerConfig {
            coeff_r2: -0.1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("coeff_r2"));
    }

    #[test]
    fn test_end_temperature_may_reach_zero() {
        let config = ExplainerConfig {
            ts: 1.0,
            te: 0.0,
            ..Default::default()
        };
        config.validate().unwrap();

        for te in [-0.1, f64::NAN] {
            let config = ExplainerConfig { te, ..Default::default() };
            assert!(config.validate().is_err());
        }
        let config = ExplainerConfig { ts: 0.0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ExplainerConfig {
            num_prototypes: 3,
            log_models: true,
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        let parsed = ExplainerConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
