// src/transformer_block.rs
// TransformerBlock – pre-norm residual block: attention, then gated feed-forward
use ndarray::Array2;
use rand::Rng;

use crate::checkpoint::Checkpoint;
use crate::config::ModelConfig;
use crate::error::EngineResult;
use crate::feed_forward_geglu::FeedForwardGeGLU;
use crate::kv_cache::LayerKv;
use crate::layer_norm::LayerNorm;
use crate::multi_head_attention::MultiHeadAttention;

#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub norm1: LayerNorm,
    pub attention: MultiHeadAttention,
    pub norm2: LayerNorm,
    pub feedforward: FeedForwardGeGLU,
}

impl TransformerBlock {
    pub fn random<R: Rng>(cfg: &ModelConfig, rng: &mut R) -> EngineResult<Self> {
        Ok(TransformerBlock {
            norm1: LayerNorm::new(cfg.hidden_dim),
            attention: MultiHeadAttention::random(cfg.hidden_dim, cfg.num_heads, rng)?,
            norm2: LayerNorm::new(cfg.hidden_dim),
            feedforward: FeedForwardGeGLU::random(cfg.hidden_dim, cfg.ff_dim, rng)?,
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.attention.parameter_count()
            + self.feedforward.parameter_count()
            + self.norm1.parameter_count()
            + self.norm2.parameter_count()
    }

    pub fn forward(
        &self,
        m_x: &Array2<f32>,
        past: Option<&LayerKv>,
        padding: Option<&[bool]>,
    ) -> EngineResult<(Array2<f32>, LayerKv)> {
        // attention + residual
        let m_norm1 = self.norm1.forward(m_x);
        let (m_attn, kv) = self.attention.forward(&m_norm1, past, padding)?;
        let m_y = &m_attn + m_x;

        // feed-forward + residual
        let m_norm2 = self.norm2.forward(&m_y);
        let m_ff = self.feedforward.forward(&m_norm2);
        Ok((&m_ff + &m_y, kv))
    }

    pub fn write_into(&self, ckpt: &mut Checkpoint, s_prefix: &str) {
        self.norm1.write_into(ckpt, &format!("{s_prefix}.norm1"));
        self.attention.write_into(ckpt, &format!("{s_prefix}.attn"));
        self.norm2.write_into(ckpt, &format!("{s_prefix}.norm2"));
        self.feedforward.write_into(ckpt, &format!("{s_prefix}.ffn"));
    }

    pub fn read_from(ckpt: &mut Checkpoint, s_prefix: &str, cfg: &ModelConfig) -> EngineResult<Self> {
        let h = cfg.hidden_dim;
        Ok(TransformerBlock {
            norm1: LayerNorm::read_from(ckpt, &format!("{s_prefix}.norm1"), h)?,
            attention: MultiHeadAttention::read_from(ckpt, &format!("{s_prefix}.attn"), h, cfg.num_heads)?,
            norm2: LayerNorm::read_from(ckpt, &format!("{s_prefix}.norm2"), h)?,
            feedforward: FeedForwardGeGLU::read_from(ckpt, &format!("{s_prefix}.ffn"), h, cfg.ff_dim)?,
        })
    }
}
