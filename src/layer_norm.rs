// ===========================================================================
//  File:         layer_norm.rs
//  Module:       Layer normalisation
// ---------------------------------------------------------------------------
//  History:
//      Inference-only variant: gamma/beta restored from the checkpoint,
//      denominator sqrt(var + eps).
// ===========================================================================

use ndarray::{Array2, Axis};

use crate::checkpoint::Checkpoint;
use crate::error::EngineResult;

const EPSILON: f32 = 1e-5;

/// Layer normalisation with learned scale and shift.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    gamma: Array2<f32>, // [1, dim]
    beta: Array2<f32>,  // [1, dim]
}

impl LayerNorm {
    /// gamma = 1, beta = 0.
    pub fn new(i_dim: usize) -> Self {
        LayerNorm {
            gamma: Array2::ones((1, i_dim)),
            beta: Array2::zeros((1, i_dim)),
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        let i_dim = input.ncols().max(1) as f32;
        // mean/var per row over features
        let mean = (input.sum_axis(Axis(1)) / i_dim).insert_axis(Axis(1));
        let centered = input - &mean;
        let var = (centered.mapv(|v| v * v).sum_axis(Axis(1)) / i_dim).insert_axis(Axis(1));
        let denom = var.mapv(|v| (v + EPSILON).sqrt());

        let x_hat = centered / &denom;
        &self.gamma * &x_hat + &self.beta
    }

    pub fn write_into(&self, ckpt: &mut Checkpoint, s_prefix: &str) {
        ckpt.put(&format!("{s_prefix}.gamma"), &self.gamma);
        ckpt.put(&format!("{s_prefix}.beta"), &self.beta);
    }

    pub fn read_from(ckpt: &mut Checkpoint, s_prefix: &str, i_dim: usize) -> EngineResult<Self> {
        Ok(LayerNorm {
            gamma: ckpt.take(&format!("{s_prefix}.gamma"), (1, i_dim))?,
            beta: ckpt.take(&format!("{s_prefix}.beta"), (1, i_dim))?,
        })
    }
}
