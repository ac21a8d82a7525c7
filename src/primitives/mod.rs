//! Tensor Primitives
//!
//! Core tensor operations shared by the embedder, prototype bank, logic
//! classifier and composite loss.
//!
//! ## Submodules
//!
//! - [`tensor_ops`]: Device selection, distances, normalisation, losses
//! - [`activations`]: Activation functions (sigmoid, leaky ReLU, softmax)
//! - [`gnn`]: Message-passing layers and segment reductions over edge lists
//! - [`init`]: Seeded uniform parameter initialisation

mod activations;
pub mod gnn;
mod init;
mod tensor_ops;

// Re-export all primitives at module level
pub use activations::*;
pub use init::*;
pub use tensor_ops::*;
