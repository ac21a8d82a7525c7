//! # graph-concept-explainer
//!
//! Interpretable concept bottleneck for graph classification: local graph
//! embeddings → learned prototype concepts → per-graph concept vectors →
//! entropy-based logic classifier → Boolean explanations.
//!
//! ## Overview
//!
//! Each top-level graph is described by one or more local instances (small
//! subgraphs). The pipeline learns three pieces jointly:
//!
//! - **Embedder**: GIN/GAT message passing, pooled to one vector per instance
//! - **Prototype bank**: K learnable vectors that turn embeddings into
//!   concept assignment distributions at a scheduled temperature
//! - **Logic classifier**: entropy-attention network over the per-graph
//!   concept vector (max-reduced over the graph's instances)
//!
//! After training, the explanation extractor distills the classifier into one
//! Boolean formula per class and measures fidelity and concept purity.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use graph_concept_explainer::prelude::*;
//!
//! let config = ExplainerConfig::load("explainer.toml")?;
//! let device = best_device();
//!
//! let embedder = GraphEmbedder::new(num_features, &config, &device)?;
//! let classifier = EntropyLogicNetwork::new(config.num_prototypes, &config, &device)?;
//! let mut trainer = Trainer::new(Box::new(embedder), Box::new(classifier), config, "mutag", &device)?;
//!
//! let summary = trainer.iterate(&mut train_loader, &mut val_loader, 200)?;
//! let report = trainer.inspect(&train_loader, Split::Train)?;
//! for class in &report.classes {
//!     println!("class {}: {} (acc {:.3})", class.class, class.formula, class.accuracy);
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod embedder;
pub mod explain;
pub mod logic;
pub mod loss;
pub mod primitives;
pub mod prototypes;
pub mod training;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for concept explainer operations
#[derive(Debug, thiserror::Error)]
pub enum ExplainerError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    Data(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for concept explainer operations
pub type Result<T> = std::result::Result<T, ExplainerError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{ExplainerError, Result};

    // Primitives
    pub use crate::primitives::{
        best_device, cpu_device, gpu_disabled,
        bce_with_logits, focal_loss, entropy_loss, l2_normalize,
        pairwise_distances, sq_distances,
    };

    // Configuration
    pub use crate::config::{
        Activation, AssignFunction, Backbone, ClassificationLoss, ExplainerConfig,
    };

    // Data
    pub use crate::data::{Instance, InstanceBatch, InstanceLoader};

    // Model components
    pub use crate::aggregate::{aggregate, GraphIndex};
    pub use crate::embedder::{GraphEmbedder, LocalEmbedder};
    pub use crate::logic::{EntropyLogicNetwork, LogicClassifier};
    pub use crate::prototypes::PrototypeBank;

    // Loss and training
    pub use crate::loss::{CompositeLoss, LossBreakdown, LossTerm};
    pub use crate::training::{
        EarlyStopping, EpochMetrics, GroupedOptimizer, LogicMetrics, MetricsHistory, Split,
        Trainer, TrainingSummary, VarGroup,
    };

    // Explanations
    pub use crate::explain::{ClassExplanation, ExplanationReport, Formula, Literal, Minterm};

    // Persistence
    pub use crate::checkpoint::CheckpointStore;
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let device = best_device();
        assert!(matches!(device, Device::Cpu) || matches!(device, Device::Metal(_)) || matches!(device, Device::Cuda(_)));
    }

    #[test]
    fn test_error_display() {
        let err = crate::ExplainerError::Config("unknown backbone 'gcn'".into());
        assert_eq!(err.to_string(), "Invalid configuration: unknown backbone 'gcn'");
    }
}
