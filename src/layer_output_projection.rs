// ===========================================================================
//  File:         layer_output_projection.rs
//  Module:       Output heads
//  History:      Tied vocabulary head (shares the token embedding table),
//                safety and empathy heads on the last position.
// ===========================================================================

use ndarray::{Array2, ArrayView2};
use rand::Rng;

use crate::checkpoint::Checkpoint;
use crate::config::ModelConfig;
use crate::error::EngineResult;
use crate::math::{random_he, sigmoid, softmax};

pub const SAFETY_SAFE: usize = 0;
pub const SAFETY_UNSAFE: usize = 1;

#[derive(Clone, Debug)]
pub struct OutputHeads {
    /// [hidden, embedding] back-projection, only when the widths differ
    pub back_projection: Option<Array2<f32>>,
    pub w_safety: Array2<f32>,  // [hidden, 2]
    pub b_safety: Array2<f32>,  // [1, 2]
    pub w_empathy: Array2<f32>, // [hidden, 1]
    pub b_empathy: Array2<f32>, // [1, 1]
}

impl OutputHeads {
    pub fn random<R: Rng>(cfg: &ModelConfig, rng: &mut R) -> EngineResult<Self> {
        let h = cfg.hidden_dim;
        let back_projection = if cfg.embedding_dim != h {
            Some(random_he(rng, (h, cfg.embedding_dim))?)
        } else {
            None
        };
        Ok(OutputHeads {
            back_projection,
            w_safety: random_he(rng, (h, 2))?,
            b_safety: Array2::zeros((1, 2)),
            w_empathy: random_he(rng, (h, 1))?,
            b_empathy: Array2::zeros((1, 1)),
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.back_projection.as_ref().map_or(0, |p| p.len())
            + self.w_safety.len()
            + self.b_safety.len()
            + self.w_empathy.len()
            + self.b_empathy.len()
    }

    /// Vocabulary logits [seq, vocab] through the tied token table.
    pub fn logits(&self, m_hidden: &Array2<f32>, m_token_table: &Array2<f32>) -> Array2<f32> {
        match &self.back_projection {
            Some(w) => m_hidden.dot(w).dot(&m_token_table.t()),
            None => m_hidden.dot(&m_token_table.t()),
        }
    }

    /// [P(safe), P(unsafe)] for a single hidden row [1, hidden].
    pub fn safety(&self, m_last: ArrayView2<f32>) -> [f32; 2] {
        let m_z = m_last.dot(&self.w_safety) + &self.b_safety;
        let v_p = softmax(&[m_z[[0, 0]], m_z[[0, 1]]]);
        [v_p[SAFETY_SAFE], v_p[SAFETY_UNSAFE]]
    }

    pub fn empathy(&self, m_last: ArrayView2<f32>) -> f32 {
        let m_z = m_last.dot(&self.w_empathy) + &self.b_empathy;
        sigmoid(m_z[[0, 0]])
    }

    pub fn write_into(&self, ckpt: &mut Checkpoint) {
        if let Some(w) = &self.back_projection {
            ckpt.put("head.out_projection", w);
        }
        ckpt.put("safety.weight", &self.w_safety);
        ckpt.put("safety.bias", &self.b_safety);
        ckpt.put("empathy_head.weight", &self.w_empathy);
        ckpt.put("empathy_head.bias", &self.b_empathy);
    }

    pub fn read_from(ckpt: &mut Checkpoint, cfg: &ModelConfig) -> EngineResult<Self> {
        let h = cfg.hidden_dim;
        let back_projection = if cfg.embedding_dim != h {
            Some(ckpt.take("head.out_projection", (h, cfg.embedding_dim))?)
        } else {
            None
        };
        Ok(OutputHeads {
            back_projection,
            w_safety: ckpt.take("safety.weight", (h, 2))?,
            b_safety: ckpt.take("safety.bias", (1, 2))?,
            w_empathy: ckpt.take("empathy_head.weight", (h, 1))?,
            b_empathy: ckpt.take("empathy_head.bias", (1, 1))?,
        })
    }
}
