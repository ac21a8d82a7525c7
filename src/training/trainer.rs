//! Joint trainer
//!
//! Owns the embedder, prototype bank and logic classifier together with the
//! run state: temperature schedule, optimizer, early stopping, checkpoint
//! store and metrics history.
//!
//! ```text
//! batch ─► embed ─► assign(T) ─► max per graph ─► classifier ─► composite loss
//!                       │                                          │
//!                       └──────────── debug mode: CE vs concepts ◄─┘
//! ```
//!
//! One call to [`Trainer::iterate`] runs the schedule:
//!
//! 1. inspect the training split
//! 2. for each epoch `1..=N`: train pass, validation pass, inspection of both
//!    splits every `inspect_every` epochs, temperature annealed by
//!    `(ts - te) / N`, best-so-far checkpoint, early-stopping check
//! 3. on early stop, restore the best checkpoint

use super::{
    argmax_accuracy, check_gradients_health, compute_grad_norm, threshold_accuracy, EarlyStopping,
    EpochMetrics, GroupedOptimizer, Histogram, MetricsHistory, Split, VarGroup,
};
use crate::aggregate::{aggregate, graph_labels, one_hot, GraphIndex};
use crate::checkpoint::CheckpointStore;
use crate::config::ExplainerConfig;
use crate::data::{InstanceBatch, InstanceLoader};
use crate::embedder::LocalEmbedder;
use crate::explain::{cluster_accuracy, explain, mean_std, ConceptSnapshot, ExplanationReport};
use crate::logic::LogicClassifier;
use crate::loss::{CompositeLoss, LossBreakdown, LossInputs, LossTerm};
use crate::primitives::{entropy_loss, scalar_value};
use crate::prototypes::PrototypeBank;
use crate::{ExplainerError, Result};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of [`Trainer::iterate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    /// Epoch with the lowest validation loss
    pub best_epoch: usize,
    pub best_val_loss: Option<f64>,
    pub early_stopped: bool,
    pub elapsed_secs: f64,
}

/// Joint optimiser of embedder, prototypes and logic classifier
pub struct Trainer {
    embedder: Box<dyn LocalEmbedder>,
    bank: PrototypeBank,
    classifier: Box<dyn LogicClassifier>,
    optimizer: GroupedOptimizer,
    loss: CompositeLoss,
    early_stopping: EarlyStopping,
    store: CheckpointStore,
    history: MetricsHistory,
    config: ExplainerConfig,
    dataset: String,
    temperature: f64,
    epoch: usize,
    device: Device,
}

impl Trainer {
    /// Build the prototype bank, optimizer groups and run state
    ///
    /// `dataset` tags checkpoint files. The classifier must accept
    /// `config.num_prototypes` concepts.
    pub fn new(
        embedder: Box<dyn LocalEmbedder>,
        classifier: Box<dyn LogicClassifier>,
        config: ExplainerConfig,
        dataset: &str,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(2));
        let bank = PrototypeBank::new(
            config.num_prototypes,
            config.dim_prototypes,
            config.assign_func,
            &mut rng,
            device,
        )?;

        let optimizer = GroupedOptimizer::adam(vec![
            VarGroup::new("embedder", embedder.vars(), config.le_emb_lr),
            VarGroup::new("classifier", classifier.vars(), config.len_lr),
            VarGroup::new("prototypes", bank.vars(), config.proto_lr),
        ])?;

        info!(
            dataset,
            prototypes = config.num_prototypes,
            dim = config.dim_prototypes,
            assign = ?config.assign_func,
            debug_prototypes = config.debug_prototypes,
            "trainer ready"
        );
        for (group, lr, vars) in optimizer.groups() {
            debug!(group, lr, vars, "optimizer group");
        }

        Ok(Self {
            embedder,
            bank,
            classifier,
            optimizer,
            loss: CompositeLoss::from_config(&config),
            early_stopping: EarlyStopping::new(config.patience, 0.0),
            store: CheckpointStore::new(&config.checkpoint_dir),
            history: MetricsHistory::default(),
            temperature: config.ts,
            dataset: dataset.to_string(),
            epoch: 0,
            config,
            device: device.clone(),
        })
    }

    /// Current assignment temperature
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Last completed epoch (0 before training)
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    pub fn bank(&self) -> &PrototypeBank {
        &self.bank
    }

    pub fn classifier(&self) -> &dyn LogicClassifier {
        self.classifier.as_ref()
    }

    pub fn config(&self) -> &ExplainerConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Every learnable parameter, named for checkpoints
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = self.embedder.named_vars();
        vars.extend(self.bank.named_vars());
        vars.extend(self.classifier.named_vars());
        vars
    }

    // ========================================================================
    // Epoch pass
    // ========================================================================

    /// One pass over `loader`; optimises only on [`Split::Train`]
    ///
    /// The training split is visited in shuffled order, validation in graph
    /// order. The returned metrics are also appended to the history.
    pub fn train_epoch(&mut self, loader: &mut InstanceLoader, split: Split) -> Result<EpochMetrics> {
        let train = split == Split::Train;
        let batches = if train {
            loader.batches()?
        } else {
            loader.ordered_batches()?
        };
        if batches.is_empty() {
            return Err(ExplainerError::Data(format!("{} split produced no batches", split)));
        }

        let mut metrics = EpochMetrics {
            epoch: self.epoch,
            temperature: self.temperature,
            ..Default::default()
        };
        let mut seen = ConceptSnapshot::default();
        let mut concept_values = Vec::new();

        for (b, batch) in batches.iter().enumerate() {
            let pass = self.forward_batch(batch, train)?;

            let total = pass.breakdown.total_value()?;
            if !total.is_finite() {
                return Err(ExplainerError::Training(format!(
                    "non-finite loss {} at epoch {} ({} batch {})",
                    total, self.epoch, split, b
                )));
            }
            if train {
                self.step(&pass.breakdown.total)?;
            }
            debug!(%split, batch = b, loss = total, "batch done");

            metrics.loss += total;
            metrics.debug_loss += pass.breakdown.debug;
            for (term, value) in pass.breakdown.iter() {
                *term_slot(&mut metrics, term) += value;
            }

            concept_values.extend(rows(&pass.concepts)?.into_iter().flatten());
            seen.assignments.extend(rows(&pass.assignments)?);
            seen.concept_labels.extend_from_slice(&batch.concept_labels);
            if let Some(logits) = &pass.logits {
                seen.logits.extend(rows(logits)?);
                seen.labels.extend(pass.labels);
            }
        }

        let n = batches.len() as f32;
        metrics.loss /= n;
        metrics.debug_loss /= n;
        for term in LossTerm::ALL {
            *term_slot(&mut metrics, term) /= n;
        }

        if self.config.debug_prototypes {
            metrics.acc_per_class = argmax_accuracy(&seen.assignments, &seen.concept_labels);
            metrics.acc_overall = 0.0;
        } else {
            metrics.acc_per_class = argmax_accuracy(&seen.logits, &seen.labels);
            metrics.acc_overall = threshold_accuracy(&seen.logits, &seen.labels);
        }

        let (cluster_mean, cluster_std) = mean_std(&cluster_accuracy(&seen.clusters(), &seen.concept_labels));
        metrics.cluster_acc_mean = cluster_mean;
        metrics.cluster_acc_std = cluster_std;
        metrics.concept_vector_entropy = mean_entropy(&seen.assignments)?;
        let assignment_values: Vec<f32> = seen.assignments.iter().flatten().copied().collect();
        metrics.assignment_histogram = Histogram::from_values(&assignment_values);
        metrics.concept_vector_histogram = Histogram::from_values(&concept_values);

        self.history.push_epoch(split, metrics.clone());
        Ok(metrics)
    }

    fn forward_batch(&self, batch: &InstanceBatch, train: bool) -> Result<BatchPass> {
        let embeddings = self.embedder.embed(batch, train)?;
        let assignments = self.bank.assign(&embeddings, self.temperature)?;
        let index = GraphIndex::from_raw(&batch.graph_ids)?;
        let concepts = aggregate(&assignments, &index)?;

        if self.config.debug_prototypes {
            let breakdown = self.loss.debug(
                &embeddings,
                &assignments,
                self.bank.prototypes(),
                &batch.concept_labels,
            )?;
            return Ok(BatchPass {
                breakdown,
                assignments: assignments.detach(),
                concepts: concepts.detach(),
                logits: None,
                labels: Vec::new(),
            });
        }

        let labels = graph_labels(&batch.task_labels, &index)?;
        let targets = one_hot(&labels, self.classifier.num_classes(), &self.device)?;
        let logits = self.classifier.forward(&concepts, train)?;
        let breakdown = self.loss.compute(&LossInputs {
            logits: &logits,
            targets: &targets,
            embeddings: &embeddings,
            assignments: &assignments,
            prototypes: self.bank.prototypes(),
            classifier: self.classifier.as_ref(),
        })?;

        Ok(BatchPass {
            breakdown,
            assignments: assignments.detach(),
            concepts: concepts.detach(),
            logits: Some(logits.detach()),
            labels,
        })
    }

    fn step(&mut self, total: &Tensor) -> Result<()> {
        let grads = total
            .backward()
            .map_err(|e| ExplainerError::Tensor(format!("backward failed: {}", e)))?;
        let vars = self.optimizer.all_vars();
        if !check_gradients_health(&grads, &vars)? {
            return Err(ExplainerError::Training(format!(
                "non-finite gradient at epoch {}",
                self.epoch
            )));
        }
        debug!(grad_norm = compute_grad_norm(&grads, &vars)?, "optimizer step");
        self.optimizer.step(&grads)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Extract explanations on `loader` and record the logic metrics
    pub fn inspect(&mut self, loader: &InstanceLoader, split: Split) -> Result<ExplanationReport> {
        let snapshot = ConceptSnapshot::collect(
            self.embedder.as_ref(),
            &self.bank,
            self.classifier.as_ref(),
            loader,
            self.temperature,
        )?;
        let report = explain(self.classifier.as_ref(), &snapshot)?;

        for class in &report.classes {
            info!(
                %split,
                epoch = self.epoch,
                class = class.class,
                accuracy = class.accuracy,
                formula = %class.formula,
                "explanation"
            );
        }
        info!(
            %split,
            epoch = self.epoch,
            logic_acc = report.logic_acc(),
            logic_acc_clf = report.logic_acc_clf,
            len_fidelity = report.len_fidelity,
            purity = report.concept_purity,
            purity_std = report.concept_purity_std,
            "inspection"
        );

        self.history.push_logic(split, report.logic_metrics(self.epoch));
        Ok(report)
    }

    // ========================================================================
    // Schedule
    // ========================================================================

    /// Run up to `num_epochs` epochs with annealing, checkpointing and early stopping
    pub fn iterate(
        &mut self,
        train: &mut InstanceLoader,
        val: &mut InstanceLoader,
        num_epochs: usize,
    ) -> Result<TrainingSummary> {
        if num_epochs == 0 {
            return Err(ExplainerError::Config("num_epochs must be at least 1".into()));
        }
        let start = Instant::now();
        let anneal = (self.config.ts - self.config.te) / num_epochs as f64;

        self.inspect(train, Split::Train)?;

        let mut early_stopped = false;
        let mut epochs_run = 0;
        for epoch in 1..=num_epochs {
            self.epoch = epoch;
            let train_metrics = self.train_epoch(train, Split::Train)?;
            let val_metrics = self.train_epoch(val, Split::Val)?;

            if epoch % self.config.inspect_every == 0 {
                self.inspect(train, Split::Train)?;
                self.inspect(val, Split::Val)?;
            }

            self.temperature -= anneal;
            epochs_run = epoch;

            let stop = self.early_stopping.on_epoch_end(epoch, val_metrics.loss as f64);
            if self.early_stopping.best_epoch() == epoch && self.config.log_models {
                self.store.save(&self.dataset, epoch, &self.named_vars())?;
            }

            info!(
                epoch,
                loss = train_metrics.loss,
                len = train_metrics.len_loss,
                acc_per_class = train_metrics.acc_per_class,
                acc_overall = train_metrics.acc_overall,
                val_acc = val_metrics.acc_overall,
                val_loss = val_metrics.loss,
                val_len = val_metrics.len_loss,
                temperature = self.temperature,
                "epoch"
            );

            if stop {
                info!(
                    epoch,
                    best_epoch = self.early_stopping.best_epoch(),
                    "early stopping"
                );
                self.restore_best()?;
                early_stopped = true;
                break;
            }
        }

        let summary = TrainingSummary {
            epochs_run,
            best_epoch: self.early_stopping.best_epoch(),
            best_val_loss: self.early_stopping.best_loss(),
            early_stopped,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        info!(
            best_epoch = summary.best_epoch,
            elapsed_secs = summary.elapsed_secs,
            "training finished"
        );
        Ok(summary)
    }

    /// Reload the best-so-far checkpoint
    ///
    /// Returns `false` (and keeps the current weights) when checkpoints are
    /// not being written. With checkpoints enabled a missing file is an error.
    pub fn restore_best(&mut self) -> Result<bool> {
        if !self.config.log_models {
            warn!(
                best_epoch = self.early_stopping.best_epoch(),
                "checkpoints disabled, keeping current weights"
            );
            return Ok(false);
        }
        let best = self.early_stopping.best_epoch();
        self.store.load_into(&self.dataset, best, &self.named_vars())?;
        info!(epoch = best, "restored best weights");
        Ok(true)
    }
}

/// Detached outputs of one batch plus its differentiable loss
struct BatchPass {
    breakdown: LossBreakdown,
    assignments: Tensor,
    concepts: Tensor,
    /// `None` in debug mode
    logits: Option<Tensor>,
    labels: Vec<u32>,
}

fn term_slot(metrics: &mut EpochMetrics, term: LossTerm) -> &mut f32 {
    match term {
        LossTerm::Classification => &mut metrics.len_loss,
        LossTerm::Logic => &mut metrics.logic_loss,
        LossTerm::PrototypeDistance => &mut metrics.prototype_distance_loss,
        LossTerm::Diversity => &mut metrics.div_loss,
        LossTerm::R1 => &mut metrics.r1_loss,
        LossTerm::R2 => &mut metrics.r2_loss,
        LossTerm::ConceptEntropy => &mut metrics.concept_entropy_loss,
        LossTerm::DistributionEntropy => &mut metrics.distribution_entropy_loss,
    }
}

fn rows(t: &Tensor) -> Result<Vec<Vec<f32>>> {
    t.to_vec2::<f32>()
        .map_err(|e| ExplainerError::Tensor(format!("readout failed: {}", e)))
}

/// Mean assignment entropy over the whole epoch
fn mean_entropy(assignments: &[Vec<f32>]) -> Result<f32> {
    let k = match assignments.first() {
        Some(row) => row.len(),
        None => return Ok(0.0),
    };
    let flat: Vec<f32> = assignments.iter().flatten().copied().collect();
    let t = Tensor::from_vec(flat, (assignments.len(), k), &Device::Cpu)
        .map_err(|e| ExplainerError::Tensor(format!("entropy input failed: {}", e)))?;
    scalar_value(&entropy_loss(&t)?)
}
