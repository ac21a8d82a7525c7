//! Core Tensor Operations
//!
//! Device selection plus the numeric building blocks of the composite loss:
//! distances between embeddings and prototypes, L2 normalisation, entropy,
//! and classification losses on logits.
//!
//! Every function that divides or takes a logarithm floors its argument with
//! a small epsilon so degenerate inputs (all-zero rows, coincident
//! prototypes) stay finite in both the forward and the backward pass.

use crate::{ExplainerError, Result};
use candle_core::{DType, Device, Tensor};
use tracing::info;

/// Floor applied to norms before dividing
pub const NORM_EPS: f64 = 1e-12;

/// Floor added inside logarithms
pub const LOG_EPS: f64 = 1e-10;

/// Added to squared distances before `sqrt` so the gradient at zero is finite
const SQRT_EPS: f64 = 1e-12;

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via environment variable.
///
/// Set `GCE_NO_GPU=1` to force CPU-only mode.
pub fn gpu_disabled() -> bool {
    std::env::var("GCE_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `GCE_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
pub fn best_device() -> Device {
    if gpu_disabled() {
        info!("💻 Using CPU device (GCE_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("🍎 Using Metal device (Apple Silicon)");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("🟢 Using CUDA device (NVIDIA GPU)");
            return device;
        }
    }

    info!("💻 Using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
pub fn cpu_device() -> Device {
    Device::Cpu
}

// ============================================================================
// Distances
// ============================================================================

/// Squared Euclidean distances between the rows of `a` `[N, D]` and `b` `[M, D]`
///
/// Expands `‖a‖² + ‖b‖² - 2abᵀ` and clamps at zero to absorb rounding.
/// Returns `[N, M]`.
pub fn sq_distances(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_sq = a
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .map_err(|e| ExplainerError::Tensor(format!("sq_distances |a|² failed: {}", e)))?;
    let b_sq = b
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.t())
        .map_err(|e| ExplainerError::Tensor(format!("sq_distances |b|² failed: {}", e)))?;
    let cross = b
        .t()
        .and_then(|bt| a.matmul(&bt.contiguous()?))
        .and_then(|t| t.affine(-2.0, 0.0))
        .map_err(|e| ExplainerError::Tensor(format!("sq_distances cross term failed: {}", e)))?;

    cross
        .broadcast_add(&a_sq)
        .and_then(|t| t.broadcast_add(&b_sq))
        .and_then(|t| t.clamp(0f32, f32::MAX))
        .map_err(|e| ExplainerError::Tensor(format!("sq_distances sum failed: {}", e)))
}

/// Euclidean distances between all pairs of rows of `p` `[K, D]`, `[K, K]`
pub fn pairwise_distances(p: &Tensor) -> Result<Tensor> {
    sq_distances(p, p)?
        .affine(1.0, SQRT_EPS)
        .and_then(|t| t.sqrt())
        .map_err(|e| ExplainerError::Tensor(format!("pairwise_distances sqrt failed: {}", e)))
}

/// Replace the diagonal of a square matrix with `value`
pub fn fill_diagonal(m: &Tensor, value: f32) -> Result<Tensor> {
    let (n, _) = m
        .dims2()
        .map_err(|e| ExplainerError::Tensor(format!("fill_diagonal dims2 failed: {}", e)))?;
    let eye = Tensor::eye(n, DType::U8, m.device())
        .map_err(|e| ExplainerError::Tensor(format!("fill_diagonal eye failed: {}", e)))?;
    let fill = Tensor::full(value, (n, n), m.device())
        .map_err(|e| ExplainerError::Tensor(format!("fill_diagonal full failed: {}", e)))?;
    eye.where_cond(&fill, m)
        .map_err(|e| ExplainerError::Tensor(format!("fill_diagonal where_cond failed: {}", e)))
}

// ============================================================================
// Normalisation and entropy
// ============================================================================

/// L2-normalise along `dim`, flooring the norm at [`NORM_EPS`]
pub fn l2_normalize(x: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = x
        .sqr()
        .and_then(|t| t.sum_keepdim(dim))
        .and_then(|t| t.sqrt())
        .and_then(|t| t.clamp(NORM_EPS as f32, f32::MAX))
        .map_err(|e| ExplainerError::Tensor(format!("l2_normalize norm failed: {}", e)))?;
    x.broadcast_div(&norm)
        .map_err(|e| ExplainerError::Tensor(format!("l2_normalize div failed: {}", e)))
}

/// Pairwise cosine similarity between the rows of `p` `[K, D]`, `[K, K]`
pub fn cosine_similarity_matrix(p: &Tensor) -> Result<Tensor> {
    let normed = l2_normalize(p, 1)?;
    normed
        .t()
        .and_then(|t| normed.matmul(&t.contiguous()?))
        .map_err(|e| ExplainerError::Tensor(format!("cosine matrix matmul failed: {}", e)))
}

/// Mean row entropy `mean_i(-Σ_k p_ik · log(p_ik + ε))` of a `[N, K]` matrix
///
/// Returns a scalar tensor. Rows are not required to sum to one.
pub fn entropy_loss(p: &Tensor) -> Result<Tensor> {
    let log_p = p
        .affine(1.0, LOG_EPS)
        .and_then(|t| t.log())
        .map_err(|e| ExplainerError::Tensor(format!("entropy log failed: {}", e)))?;
    p.mul(&log_p)
        .and_then(|t| t.sum(1))
        .and_then(|t| t.neg())
        .and_then(|t| t.mean_all())
        .map_err(|e| ExplainerError::Tensor(format!("entropy reduce failed: {}", e)))
}

// ============================================================================
// Classification losses
// ============================================================================

/// Element-wise `max(x, 0) - x·y + log(1 + e^(-|x|))`
fn bce_with_logits_elementwise(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let relu = logits
        .relu()
        .map_err(|e| ExplainerError::Tensor(format!("bce relu failed: {}", e)))?;
    let xy = logits
        .mul(targets)
        .map_err(|e| ExplainerError::Tensor(format!("bce x*y failed: {}", e)))?;
    let softplus = logits
        .abs()
        .and_then(|t| t.neg())
        .and_then(|t| t.exp())
        .and_then(|t| t.affine(1.0, 1.0))
        .and_then(|t| t.log())
        .map_err(|e| ExplainerError::Tensor(format!("bce log1p failed: {}", e)))?;
    (relu - xy)
        .and_then(|t| t + softplus)
        .map_err(|e| ExplainerError::Tensor(format!("bce combine failed: {}", e)))
}

/// Binary cross-entropy on logits, averaged over every element
///
/// Numerically stable for large |logits|; equivalent to
/// `-[y·log σ(x) + (1-y)·log(1-σ(x))]`.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    bce_with_logits_elementwise(logits, targets)?
        .mean_all()
        .map_err(|e| ExplainerError::Tensor(format!("bce mean failed: {}", e)))
}

/// Sigmoid focal loss (Lin et al. 2017), averaged over every element
///
/// ```text
/// p_t   = σ(x)·y + (1-σ(x))·(1-y)
/// α_t   = α·y + (1-α)·(1-y)
/// loss  = α_t · (1-p_t)^γ · BCE(x, y)
/// ```
pub fn focal_loss(logits: &Tensor, targets: &Tensor, gamma: f64, alpha: f64) -> Result<Tensor> {
    let ce = bce_with_logits_elementwise(logits, targets)?;
    let p = crate::primitives::sigmoid(logits)?;

    // p_t = p·y + (1-p)·(1-y) = 1 - p - y + 2py
    let py = p
        .mul(targets)
        .map_err(|e| ExplainerError::Tensor(format!("focal p*y failed: {}", e)))?;
    let one_minus_pt = (p + targets)
        .and_then(|t| t - py.affine(2.0, 0.0)?)
        .and_then(|t| t.clamp(1e-7f32, 1f32))
        .map_err(|e| ExplainerError::Tensor(format!("focal 1-p_t failed: {}", e)))?;
    let modulating = one_minus_pt
        .powf(gamma)
        .map_err(|e| ExplainerError::Tensor(format!("focal powf failed: {}", e)))?;
    let alpha_t = targets
        .affine(2.0 * alpha - 1.0, 1.0 - alpha)
        .map_err(|e| ExplainerError::Tensor(format!("focal alpha_t failed: {}", e)))?;

    ce.mul(&modulating)
        .and_then(|t| t.mul(&alpha_t))
        .and_then(|t| t.mean_all())
        .map_err(|e| ExplainerError::Tensor(format!("focal reduce failed: {}", e)))
}

/// Rank-0 zero on `device`
pub fn zero_scalar(device: &Device) -> Result<Tensor> {
    Tensor::zeros((), DType::F32, device)
        .map_err(|e| ExplainerError::Tensor(format!("zero scalar failed: {}", e)))
}

/// Read a rank-0 (or single-element) tensor as `f32`
pub fn scalar_value(t: &Tensor) -> Result<f32> {
    t.flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| ExplainerError::Tensor(format!("scalar read failed: {}", e)))?
        .first()
        .copied()
        .ok_or_else(|| ExplainerError::Tensor("scalar read on empty tensor".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[&[f32]]) -> Tensor {
        let cols = rows[0].len();
        let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(data, (rows.len(), cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_best_device() {
        let device = best_device();
        assert!(matches!(
            device,
            Device::Cpu | Device::Metal(_) | Device::Cuda(_)
        ));
    }

    #[test]
    fn test_cpu_device() {
        assert!(matches!(cpu_device(), Device::Cpu));
    }

    #[test]
    fn test_sq_distances() {
        let a = matrix(&[&[0.0, 0.0], &[1.0, 1.0]]);
        let b = matrix(&[&[3.0, 4.0]]);
        let d = sq_distances(&a, &b).unwrap().to_vec2::<f32>().unwrap();
        assert!((d[0][0] - 25.0).abs() < 1e-4);
        assert!((d[1][0] - 13.0).abs() < 1e-4);
    }

    #[test]
    fn test_sq_distances_self_is_zero() {
        let a = matrix(&[&[0.3, -1.7, 2.2], &[5.0, 5.0, 5.0]]);
        let d = sq_distances(&a, &a).unwrap().to_vec2::<f32>().unwrap();
        for (i, row) in d.iter().enumerate() {
            assert!(row[i].abs() < 1e-4);
            assert!(row.iter().all(|v| *v >= 0.0));
        }
    }

    #[test]
    fn test_pairwise_distances() {
        let p = matrix(&[&[0.0, 0.0], &[0.3, 0.4]]);
        let d = pairwise_distances(&p).unwrap().to_vec2::<f32>().unwrap();
        assert!((d[0][1] - 0.5).abs() < 1e-4);
        assert!((d[1][0] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_fill_diagonal() {
        let m = matrix(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let filled = fill_diagonal(&m, f32::INFINITY).unwrap().to_vec2::<f32>().unwrap();
        assert!(filled[0][0].is_infinite());
        assert_eq!(filled[0][1], 2.0);
        assert_eq!(filled[1][0], 3.0);
        assert!(filled[1][1].is_infinite());
    }

    #[test]
    fn test_l2_normalize_zero_row_is_finite() {
        let m = matrix(&[&[3.0, 4.0], &[0.0, 0.0]]);
        let n = l2_normalize(&m, 1).unwrap().to_vec2::<f32>().unwrap();
        assert!((n[0][0] - 0.6).abs() < 1e-6);
        assert!((n[0][1] - 0.8).abs() < 1e-6);
        assert_eq!(n[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_similarity_matrix() {
        let p = matrix(&[&[1.0, 0.0], &[0.0, 2.0], &[-3.0, 0.0]]);
        let c = cosine_similarity_matrix(&p).unwrap().to_vec2::<f32>().unwrap();
        assert!((c[0][0] - 1.0).abs() < 1e-6);
        assert!(c[0][1].abs() < 1e-6);
        assert!((c[0][2] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_entropy_loss() {
        // One-hot rows have zero entropy, uniform rows have log(K)
        let one_hot = matrix(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let h = scalar_value(&entropy_loss(&one_hot).unwrap()).unwrap();
        assert!(h.abs() < 1e-5);

        let uniform = matrix(&[&[0.25, 0.25, 0.25, 0.25]]);
        let h = scalar_value(&entropy_loss(&uniform).unwrap()).unwrap();
        assert!((h - 4f32.ln()).abs() < 1e-4);
    }

    #[test]
    fn test_bce_with_logits_matches_definition() {
        let logits = matrix(&[&[2.0, -1.0]]);
        let targets = matrix(&[&[1.0, 0.0]]);
        let loss = scalar_value(&bce_with_logits(&logits, &targets).unwrap()).unwrap();

        let s = |x: f32| 1.0 / (1.0 + (-x).exp());
        let expected = (-(s(2.0)).ln() - (1.0 - s(-1.0)).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_bce_with_logits_extreme_values() {
        let logits = matrix(&[&[1000.0, -1000.0]]);
        let targets = matrix(&[&[0.0, 1.0]]);
        let loss = scalar_value(&bce_with_logits(&logits, &targets).unwrap()).unwrap();
        assert!(loss.is_finite());
        assert!((loss - 1000.0).abs() < 1e-2);
    }

    #[test]
    fn test_focal_loss_downweights_easy_examples() {
        let targets = matrix(&[&[1.0]]);
        let easy = matrix(&[&[4.0]]);
        let hard = matrix(&[&[-1.0]]);

        let bce_easy = scalar_value(&bce_with_logits(&easy, &targets).unwrap()).unwrap();
        let focal_easy = scalar_value(&focal_loss(&easy, &targets, 2.0, 0.5).unwrap()).unwrap();
        let focal_hard = scalar_value(&focal_loss(&hard, &targets, 2.0, 0.5).unwrap()).unwrap();

        assert!(focal_easy < bce_easy);
        assert!(focal_hard > focal_easy);
    }

    #[test]
    fn test_focal_gamma_zero_is_weighted_bce() {
        let logits = matrix(&[&[0.7, -0.2], &[-1.5, 2.5]]);
        let targets = matrix(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let bce = scalar_value(&bce_with_logits(&logits, &targets).unwrap()).unwrap();
        let focal = scalar_value(&focal_loss(&logits, &targets, 0.0, 0.5).unwrap()).unwrap();
        assert!((focal - 0.5 * bce).abs() < 1e-5);
    }
}
