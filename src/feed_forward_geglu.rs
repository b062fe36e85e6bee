// src/feed_forward_geglu.rs
// FeedForwardGeGLU – gated feed-forward: (x W_lin) * gelu(x W_gate), then W_out
use ndarray::{Array2, Axis};
use rand::Rng;

use crate::checkpoint::Checkpoint;
use crate::error::EngineResult;
use crate::math::{gelu, random_he};

#[derive(Clone, Debug)]
pub struct FeedForwardGeGLU {
    pub w_in: Array2<f32>,  // [embed, 2*hidden], columns lin | gate
    pub w_out: Array2<f32>, // [hidden, embed]
}

impl FeedForwardGeGLU {
    pub fn random<R: Rng>(i_embed: usize, i_hidden: usize, rng: &mut R) -> EngineResult<Self> {
        Ok(FeedForwardGeGLU {
            w_in: random_he(rng, (i_embed, i_hidden * 2))?,
            w_out: random_he(rng, (i_hidden, i_embed))?,
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.w_in.len() + self.w_out.len()
    }

    pub fn forward(&self, m_x: &Array2<f32>) -> Array2<f32> {
        let m_proj = m_x.dot(&self.w_in); // [seq, 2h]
        let i_half = m_proj.ncols() / 2;
        let (m_lin, m_gate) = m_proj.view().split_at(Axis(1), i_half);
        let m_act = &m_lin * &m_gate.mapv(gelu); // [seq, h]
        m_act.dot(&self.w_out) // [seq, embed]
    }

    pub fn write_into(&self, ckpt: &mut Checkpoint, s_prefix: &str) {
        ckpt.put(&format!("{s_prefix}.w_in"), &self.w_in);
        ckpt.put(&format!("{s_prefix}.w_out"), &self.w_out);
    }

    pub fn read_from(
        ckpt: &mut Checkpoint,
        s_prefix: &str,
        i_embed: usize,
        i_hidden: usize,
    ) -> EngineResult<Self> {
        Ok(FeedForwardGeGLU {
            w_in: ckpt.take(&format!("{s_prefix}.w_in"), (i_embed, i_hidden * 2))?,
            w_out: ckpt.take(&format!("{s_prefix}.w_out"), (i_hidden, i_embed))?,
        })
    }
}
