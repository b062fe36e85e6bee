// math.rs
// ============================================================================
// Note:     Numerics shared by the decoder: row softmax (parallel), gelu,
//           sigmoid, and small helpers for 1-D probability vectors.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::{Array2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use crate::error::{EngineError, EngineResult};

// tanh approximation of gelu
const GELU_SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

/// Row-wise softmax. Rows that are entirely masked (`-inf`) become zeros.
pub fn softmax_rows_par(m: &Array2<f32>) -> Array2<f32> {
    let mut out = m.clone();
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max_v = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if !max_v.is_finite() {
                row.fill(0.0);
                return;
            }
            let mut sum = 0.0f32;
            for v in row.iter_mut() {
                *v = (*v - max_v).exp();
                sum += *v;
            }
            if sum > 0.0 {
                for v in row.iter_mut() {
                    *v /= sum;
                }
            }
        });
    out
}

/// Softmax over a slice. An all `-inf` input yields all zeros.
pub fn softmax(v_logits: &[f32]) -> Vec<f32> {
    let d_max = v_logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !d_max.is_finite() {
        return vec![0.0; v_logits.len()];
    }
    let v_exp: Vec<f32> = v_logits.iter().map(|&x| (x - d_max).exp()).collect();
    let d_sum: f32 = v_exp.iter().sum();
    v_exp.into_iter().map(|x| x / d_sum).collect()
}

pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (GELU_SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x)).tanh())
}

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Matrix drawn from N(0, std^2).
pub fn random_normal<R: Rng>(rng: &mut R, t_shape: (usize, usize), d_std: f32) -> EngineResult<Array2<f32>> {
    let normal = Normal::new(0.0f32, d_std)
        .map_err(|e| EngineError::InvalidConfig(format!("normal init with std {d_std}: {e}")))?;
    Ok(Array2::from_shape_fn(t_shape, |_| normal.sample(rng)))
}

/// He-style init used by the projection matrices: std = sqrt(2 / fan_in).
pub fn random_he<R: Rng>(rng: &mut R, t_shape: (usize, usize)) -> EngineResult<Array2<f32>> {
    random_normal(rng, t_shape, (2.0 / t_shape.0.max(1) as f32).sqrt())
}

/// Index of the largest value, lowest index on ties.
pub fn argmax(v_values: &[f32]) -> usize {
    let mut i_best = 0usize;
    for (i, &d) in v_values.iter().enumerate() {
        if d > v_values[i_best] {
            i_best = i;
        }
    }
    i_best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn softmax_rows_sum_to_one() {
        let m = array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]];
        let p = softmax_rows_par(&m);
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!(p[[0, 2]] > p[[0, 1]]);
    }

    #[test]
    fn fully_masked_row_is_zero() {
        let m = array![[f32::NEG_INFINITY, f32::NEG_INFINITY], [0.0, f32::NEG_INFINITY]];
        let p = softmax_rows_par(&m);
        assert_eq!(p.row(0).to_vec(), vec![0.0, 0.0]);
        assert_eq!(p.row(1).to_vec(), vec![1.0, 0.0]);
        assert_eq!(softmax(&[f32::NEG_INFINITY; 3]), vec![0.0; 3]);
    }

    #[test]
    fn activations() {
        assert!(gelu(0.0).abs() < 1e-7);
        assert!((gelu(3.0) - 3.0).abs() < 0.01);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(-100.0) >= 0.0 && sigmoid(100.0) <= 1.0);
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), 1);
    }
}
