//! Activation Functions
//!
//! Nonlinearities used by the embedder and the logic classifier, plus the
//! dispatch from the configured [`Activation`] tag.

use candle_core::Tensor;
use crate::config::Activation;
use crate::{Result, ExplainerError};

/// Negative slope of the default LeakyReLU
pub const LEAKY_SLOPE: f64 = 0.01;

/// Apply a configured activation
pub fn activate(tensor: &Tensor, activation: Activation) -> Result<Tensor> {
    match activation {
        Activation::Sigmoid => sigmoid(tensor),
        Activation::Tanh => tanh(tensor),
        Activation::Leaky => leaky_relu(tensor, LEAKY_SLOPE),
        Activation::Linear => Ok(tensor.clone()),
    }
}

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let exp_neg = tensor.neg()
        .and_then(|t| t.exp())
        .map_err(|e| ExplainerError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    (exp_neg + 1.0)
        .and_then(|t| t.recip())
        .map_err(|e| ExplainerError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// Softmax along a dimension (max-subtracted, safe for large logits)
pub fn softmax(tensor: &Tensor, dim: usize) -> Result<Tensor> {
    candle_nn::ops::softmax(tensor, dim)
        .map_err(|e| ExplainerError::Tensor(format!("Softmax failed: {}", e)))
}

/// Leaky ReLU activation: max(αx, x)
pub fn leaky_relu(tensor: &Tensor, negative_slope: f64) -> Result<Tensor> {
    let zeros = Tensor::zeros_like(tensor)
        .map_err(|e| ExplainerError::Tensor(format!("zeros_like failed: {}", e)))?;

    let positive = tensor.maximum(&zeros)
        .map_err(|e| ExplainerError::Tensor(format!("maximum failed: {}", e)))?;

    let negative = tensor.minimum(&zeros)
        .and_then(|t| t.affine(negative_slope, 0.0))
        .map_err(|e| ExplainerError::Tensor(format!("leaky scale failed: {}", e)))?;

    (positive + negative)
        .map_err(|e| ExplainerError::Tensor(format!("leaky_relu add failed: {}", e)))
}

/// Tanh activation, maps to (-1, 1)
pub fn tanh(tensor: &Tensor) -> Result<Tensor> {
    tensor.tanh()
        .map_err(|e| ExplainerError::Tensor(format!("tanh failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_sigmoid() {
        let vals = sigmoid(&tensor(&[0.0, 100.0, -100.0])).unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] - 0.5).abs() < 0.001);
        assert!((vals[1] - 1.0).abs() < 0.001);
        assert!(vals[2].abs() < 0.001);
    }

    #[test]
    fn test_leaky_relu() {
        let vals = leaky_relu(&tensor(&[-2.0, 0.0, 3.0]), 0.1).unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] + 0.2).abs() < 1e-6);
        assert!(vals[1].abs() < 1e-6);
        assert!((vals[2] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_linear_activation_is_identity() {
        let t = tensor(&[-5.0, 0.5, 7.0]);
        let out = activate(&t, Activation::Linear).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out, vec![-5.0, 0.5, 7.0]);
    }

    #[test]
    fn test_activation_ranges() {
        let t = tensor(&[-10.0, -1.0, 0.0, 1.0, 10.0]);
        for v in activate(&t, Activation::Sigmoid).unwrap().to_vec1::<f32>().unwrap() {
            assert!((0.0..=1.0).contains(&v));
        }
        for v in activate(&t, Activation::Tanh).unwrap().to_vec1::<f32>().unwrap() {
            assert!((-1.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 500.0, 0.0, -500.0], (2, 3), &Device::Cpu).unwrap();
        let rows = softmax(&t, 1).unwrap().to_vec2::<f32>().unwrap();
        for row in rows {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|v| v.is_finite()));
        }
    }
}
