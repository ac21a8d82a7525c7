//! Seeded parameter initialisation
//!
//! Candle's CPU RNG cannot be seeded, so every learnable tensor is drawn from
//! a caller-owned `StdRng` and uploaded with `Tensor::from_vec`. Two models
//! built from the same seed start bit-identical.

use crate::{ExplainerError, Result};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;

/// `Var` of the given shape with entries drawn uniformly from `[low, high)`
pub fn uniform_var(rng: &mut StdRng, dims: &[usize], low: f32, high: f32, device: &Device) -> Result<Var> {
    let count: usize = dims.iter().product();
    let data: Vec<f32> = (0..count).map(|_| rng.gen_range(low..high)).collect();
    let tensor = Tensor::from_vec(data, dims, device)
        .map_err(|e| ExplainerError::Tensor(format!("uniform init failed: {}", e)))?;
    Var::from_tensor(&tensor).map_err(|e| ExplainerError::Tensor(format!("var init failed: {}", e)))
}

/// Fan-in scaled uniform init `U(-1/√fan_in, 1/√fan_in)`, as used for dense layers
pub fn fan_in_var(rng: &mut StdRng, dims: &[usize], fan_in: usize, device: &Device) -> Result<Var> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    uniform_var(rng, dims, -bound, bound, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_uniform_var_range_and_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let v = uniform_var(&mut rng, &[4, 3], 0.0, 1.0, &Device::Cpu).unwrap();
        assert_eq!(v.as_tensor().dims(), &[4, 3]);
        let vals: Vec<f32> = v.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|x| (0.0..1.0).contains(x)));
    }

    #[test]
    fn test_same_seed_same_values() {
        let draw = || {
            let mut rng = StdRng::seed_from_u64(42);
            fan_in_var(&mut rng, &[5], 25, &Device::Cpu)
                .unwrap()
                .as_tensor()
                .to_vec1::<f32>()
                .unwrap()
        };
        let a = draw();
        assert_eq!(a, draw());
        assert!(a.iter().all(|x| x.abs() <= 0.2));
    }
}
