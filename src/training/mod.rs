//! Training Infrastructure
//!
//! Joint optimisation of the embedder, prototype bank and logic classifier.
//!
//! ## Overview
//!
//! - **Optimizer**: [`GroupedOptimizer`], one AdamW per named [`VarGroup`]
//!   so every component keeps its own learning rate
//! - **Early stopping**: [`EarlyStopping`] on validation loss
//! - **Metrics**: per-epoch [`EpochMetrics`] and per-inspection
//!   [`LogicMetrics`], collected in a serialisable [`MetricsHistory`]
//! - **Trainer**: [`Trainer`], the epoch loop tying it all together
//!
//! ## Example
//!
//! ```ignore
//! use graph_concept_explainer::training::{GroupedOptimizer, VarGroup};
//!
//! let groups = vec![
//!     VarGroup::new("embedder", embedder.vars(), 0.001),
//!     VarGroup::new("classifier", classifier.vars(), 0.0005),
//!     VarGroup::new("prototypes", bank.vars(), 0.001),
//! ];
//! let mut optimizer = GroupedOptimizer::adam(groups)?;
//!
//! let grads = loss.backward()?;
//! optimizer.step(&grads)?;
//! ```

mod metrics;
mod trainer;

pub use metrics::{argmax_accuracy, threshold_accuracy, EpochMetrics, Histogram, LogicMetrics, MetricsHistory, Split};
pub use trainer::{Trainer, TrainingSummary};

use crate::ExplainerError;
use candle_core::Var;
use candle_nn::optim::Optimizer as CandleOptimizer;

// =============================================================================
// Variable Groups
// =============================================================================

/// A group of variables with shared hyperparameters
///
/// The trainer builds three: `embedder`, `classifier` and `prototypes`.
#[derive(Debug, Clone)]
pub struct VarGroup {
    /// Variables in this group
    pub vars: Vec<Var>,
    /// Learning rate for this group
    pub learning_rate: f64,
    /// Group name (for logging)
    pub name: String,
}

impl VarGroup {
    pub fn new(name: impl Into<String>, vars: Vec<Var>, learning_rate: f64) -> Self {
        Self {
            vars,
            learning_rate,
            name: name.into(),
        }
    }
}

/// Optimizer with multiple variable groups, each with its own hyperparameters
pub struct GroupedOptimizer {
    groups: Vec<(VarGroup, candle_nn::optim::AdamW)>,
}

impl GroupedOptimizer {
    /// Create a grouped Adam optimizer
    pub fn adam(groups: Vec<VarGroup>) -> crate::Result<Self> {
        let mut opt_groups = Vec::new();

        for group in groups {
            if group.learning_rate <= 0.0 {
                return Err(ExplainerError::Config(format!(
                    "learning rate for group '{}' must be positive (got {})",
                    group.name, group.learning_rate
                )));
            }
            let params = candle_nn::optim::ParamsAdamW {
                lr: group.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            };

            let optimizer =
                <candle_nn::optim::AdamW as CandleOptimizer>::new(group.vars.clone(), params)
                    .map_err(|e| {
                        ExplainerError::Tensor(format!(
                            "AdamW init failed for group '{}': {}",
                            group.name, e
                        ))
                    })?;

            opt_groups.push((group, optimizer));
        }

        Ok(Self { groups: opt_groups })
    }

    /// Take a gradient step on all groups
    pub fn step(&mut self, grads: &candle_core::backprop::GradStore) -> crate::Result<()> {
        for (group, opt) in &mut self.groups {
            CandleOptimizer::step(opt, grads).map_err(|e| {
                ExplainerError::Training(format!("Step failed for group '{}': {}", group.name, e))
            })?;
        }
        Ok(())
    }

    /// `(name, learning rate, variable count)` per group, in construction order
    pub fn groups(&self) -> Vec<(&str, f64, usize)> {
        self.groups
            .iter()
            .map(|(g, opt)| (g.name.as_str(), CandleOptimizer::learning_rate(opt), g.vars.len()))
            .collect()
    }

    /// Every variable across all groups
    pub fn all_vars(&self) -> Vec<Var> {
        self.groups
            .iter()
            .flat_map(|(g, _)| g.vars.iter().cloned())
            .collect()
    }
}

// =============================================================================
// Early Stopping
// =============================================================================

/// Validation-loss early stopping
///
/// An epoch improves when its loss is below `best - min_delta`. Training
/// should stop once `patience` consecutive epochs fail to improve.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best_loss: Option<f64>,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: None,
            best_epoch: 0,
            wait: 0,
        }
    }

    /// Record the validation loss of `epoch`; returns true when training should stop
    pub fn on_epoch_end(&mut self, epoch: usize, val_loss: f64) -> bool {
        let improved = self
            .best_loss
            .map(|best| val_loss < best - self.min_delta)
            .unwrap_or(true);

        if improved {
            self.best_loss = Some(val_loss);
            self.best_epoch = epoch;
            self.wait = 0;
        } else {
            self.wait += 1;
        }
        self.wait >= self.patience
    }

    /// Epoch with the lowest validation loss so far (0 before any record)
    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    /// Epochs since the last improvement
    pub fn wait(&self) -> usize {
        self.wait
    }
}

// =============================================================================
// Gradient Utilities
// =============================================================================

/// Compute the total L2 norm of all gradients
///
/// Useful for monitoring gradient explosion during training.
pub fn compute_grad_norm(
    grads: &candle_core::backprop::GradStore,
    vars: &[candle_core::Var],
) -> crate::Result<f32> {
    let mut total_sq_norm = 0.0f32;

    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq_norm = grad
                .sqr()
                .and_then(|t| t.sum_all())
                .and_then(|t| t.to_scalar::<f32>())
                .map_err(|e| ExplainerError::Tensor(format!("grad norm failed: {}", e)))?;
            total_sq_norm += sq_norm;
        }
    }

    Ok(total_sq_norm.sqrt())
}

/// Check if any gradient contains NaN or Inf
///
/// Returns `Ok(true)` if gradients are healthy (no NaN/Inf). A gradient that
/// cannot be read back is an error, not a healthy gradient.
pub fn check_gradients_health(
    grads: &candle_core::backprop::GradStore,
    vars: &[candle_core::Var],
) -> crate::Result<bool> {
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let vals = grad
                .flatten_all()
                .and_then(|t| t.to_dtype(candle_core::DType::F32))
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(|e| ExplainerError::Tensor(format!("gradient readout failed: {}", e)))?;
            if vals.iter().any(|v| !v.is_finite()) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn scalar_var(value: f32) -> Var {
        Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn test_grouped_optimizer_independent_rates() {
        let a = scalar_var(1.0);
        let b = scalar_var(1.0);
        let mut opt = GroupedOptimizer::adam(vec![
            VarGroup::new("fast", vec![a.clone()], 0.1),
            VarGroup::new("slow", vec![b.clone()], 0.001),
        ])
        .unwrap();

        let loss = (a.as_tensor().sqr().unwrap() + b.as_tensor().sqr().unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();

        let da = 1.0 - a.as_tensor().to_vec1::<f32>().unwrap()[0];
        let db = 1.0 - b.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!(da > db * 10.0);
        assert_eq!(opt.groups(), vec![("fast", 0.1, 1), ("slow", 0.001, 1)]);
        assert_eq!(opt.all_vars().len(), 2);
    }

    #[test]
    fn test_non_positive_learning_rate_rejected() {
        let err = GroupedOptimizer::adam(vec![VarGroup::new("g", vec![scalar_var(0.0)], 0.0)]);
        assert!(matches!(err, Err(ExplainerError::Config(_))));
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut es = EarlyStopping::new(3, 0.0);
        assert!(!es.on_epoch_end(1, 1.0));
        assert!(!es.on_epoch_end(2, 0.8));
        assert!(!es.on_epoch_end(3, 0.9));
        assert!(!es.on_epoch_end(4, 0.8)); // equal is not an improvement
        assert!(es.on_epoch_end(5, 0.85));
        assert_eq!(es.best_epoch(), 2);
        assert_eq!(es.best_loss(), Some(0.8));
    }

    #[test]
    fn test_early_stopping_resets_on_improvement() {
        let mut es = EarlyStopping::new(2, 0.0);
        es.on_epoch_end(1, 1.0);
        es.on_epoch_end(2, 1.5);
        assert_eq!(es.wait(), 1);
        assert!(!es.on_epoch_end(3, 0.5));
        assert_eq!(es.wait(), 0);
        assert_eq!(es.best_epoch(), 3);
    }

    #[test]
    fn test_early_stopping_min_delta() {
        let mut es = EarlyStopping::new(1, 0.1);
        es.on_epoch_end(1, 1.0);
        assert!(es.on_epoch_end(2, 0.95));
        assert_eq!(es.best_epoch(), 1);
    }

    #[test]
    fn test_gradient_health_and_norm() {
        let v = scalar_var(3.0);
        let grads = v.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        assert!(check_gradients_health(&grads, &[v.clone()]).unwrap());
        // d(x²)/dx = 2x = 6
        assert!((compute_grad_norm(&grads, &[v.clone()]).unwrap() - 6.0).abs() < 1e-5);

        let w = scalar_var(0.0);
        let grads = w.as_tensor().sqrt().unwrap().sum_all().unwrap().backward().unwrap();
        assert!(!check_gradients_health(&grads, &[w.clone()]).unwrap());
        // Vars without a gradient are skipped
        let unused = scalar_var(1.0);
        assert!(check_gradients_health(&grads, &[unused]).unwrap());
    }
}
