// ===========================================================================
//  File:         embeddings.rs
//  Module:       Token and position embeddings
// ---------------------------------------------------------------------------
//  Description:
//      Token table [vocab_size, embedding_dim] and learned position table
//      [max_seq_len, embedding_dim]. Positions are offset by the length of
//      the key/value cache so that incremental steps see the same absolute
//      positions as a full recomputation. When the model width differs from
//      the embedding width a learned projection [embedding_dim, hidden_dim]
//      is applied after the sum.
//
//      Row 0 (pad) of the token table is held at zero.
// ===========================================================================

use ndarray::{s, Array2};
use rand::Rng;

use crate::checkpoint::Checkpoint;
use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};
use crate::math::{random_he, random_normal};
use crate::vocab::PAD_ID;

const EMBEDDING_INIT_STD: f32 = 0.02;

#[derive(Clone, Debug)]
pub struct Embeddings {
    /// [vocab_size, embedding_dim], also the tied output matrix
    pub token_embeddings: Array2<f32>,
    /// [max_seq_len, embedding_dim]
    pub positional_embeddings: Array2<f32>,
    /// [embedding_dim, hidden_dim], present only when the widths differ
    pub projection: Option<Array2<f32>>,
}

impl Embeddings {
    pub fn random<R: Rng>(cfg: &ModelConfig, rng: &mut R) -> EngineResult<Self> {
        let mut token_embeddings =
            random_normal(rng, (cfg.vocab_size, cfg.embedding_dim), EMBEDDING_INIT_STD)?;
        let positional_embeddings =
            random_normal(rng, (cfg.max_seq_len, cfg.embedding_dim), EMBEDDING_INIT_STD)?;
        let projection = if cfg.embedding_dim != cfg.hidden_dim {
            Some(random_he(rng, (cfg.embedding_dim, cfg.hidden_dim))?)
        } else {
            None
        };
        token_embeddings.row_mut(PAD_ID).fill(0.0);
        Ok(Self {
            token_embeddings,
            positional_embeddings,
            projection,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.token_embeddings.nrows()
    }

    pub fn parameter_count(&self) -> usize {
        self.token_embeddings.len()
            + self.positional_embeddings.len()
            + self.projection.as_ref().map_or(0, |p| p.len())
    }

    /// Token + position embedding for `v_ids` placed at absolute positions
    /// `i_offset ..`, projected to the model width. Result: [seq, hidden].
    pub fn embed_tokens(&self, v_ids: &[usize], i_offset: usize) -> EngineResult<Array2<f32>> {
        let i_vocab = self.vocab_size();
        let i_end = i_offset + v_ids.len();
        if i_end > self.positional_embeddings.nrows() {
            return Err(EngineError::LengthExceeded {
                len: i_end,
                max: self.positional_embeddings.nrows(),
            });
        }

        let mut m_out = self
            .positional_embeddings
            .slice(s![i_offset..i_end, ..])
            .to_owned();
        for (i, &i_id) in v_ids.iter().enumerate() {
            if i_id >= i_vocab {
                return Err(EngineError::TokenOutOfRange {
                    id: i_id,
                    vocab_size: i_vocab,
                });
            }
            let mut row = m_out.row_mut(i);
            row += &self.token_embeddings.row(i_id);
        }

        Ok(match &self.projection {
            Some(w) => m_out.dot(w),
            None => m_out,
        })
    }

    pub fn write_into(&self, ckpt: &mut Checkpoint) {
        ckpt.put("embed.token", &self.token_embeddings);
        ckpt.put("embed.position", &self.positional_embeddings);
        if let Some(w) = &self.projection {
            ckpt.put("embed.projection", w);
        }
    }

    pub fn read_from(ckpt: &mut Checkpoint, cfg: &ModelConfig) -> EngineResult<Self> {
        let i_rows = ckpt
            .tensors
            .get("embed.token")
            .and_then(|t| t.shape.first().copied());
        if let Some(i_rows) = i_rows {
            if i_rows != cfg.vocab_size {
                return Err(EngineError::VocabMismatch {
                    context: "token embedding table",
                    expected: cfg.vocab_size,
                    found: i_rows,
                });
            }
        }

        let mut token_embeddings = ckpt.take("embed.token", (cfg.vocab_size, cfg.embedding_dim))?;
        token_embeddings.row_mut(PAD_ID).fill(0.0);
        let positional_embeddings =
            ckpt.take("embed.position", (cfg.max_seq_len, cfg.embedding_dim))?;
        let projection = if cfg.embedding_dim != cfg.hidden_dim {
            Some(ckpt.take("embed.projection", (cfg.embedding_dim, cfg.hidden_dim))?)
        } else {
            None
        };
        Ok(Self {
            token_embeddings,
            positional_embeddings,
            projection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny() -> ModelConfig {
        ModelConfig {
            vocab_size: 12,
            embedding_dim: 6,
            hidden_dim: 8,
            ff_dim: 16,
            num_layers: 1,
            num_heads: 2,
            max_seq_len: 5,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn offset_selects_position_rows() {
        let mut rng = StdRng::seed_from_u64(3);
        let emb = Embeddings::random(&tiny(), &mut rng).expect("init");
        let full = emb.embed_tokens(&[4, 5, 6], 0).expect("full");
        let tail = emb.embed_tokens(&[6], 2).expect("tail");
        assert_eq!(full.dim(), (3, 8));
        for (a, b) in full.row(2).iter().zip(tail.row(0).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn pad_row_is_zero_and_bounds_are_checked() {
        let mut rng = StdRng::seed_from_u64(3);
        let emb = Embeddings::random(&tiny(), &mut rng).expect("init");
        assert!(emb.token_embeddings.row(PAD_ID).iter().all(|v| *v == 0.0));
        assert!(matches!(
            emb.embed_tokens(&[12], 0),
            Err(EngineError::TokenOutOfRange { id: 12, .. })
        ));
        assert!(matches!(
            emb.embed_tokens(&[4, 4], 4),
            Err(EngineError::LengthExceeded { len: 6, max: 5 })
        ));
    }

    #[test]
    fn vocab_rows_must_match_config() {
        let mut rng = StdRng::seed_from_u64(3);
        let emb = Embeddings::random(&tiny(), &mut rng).expect("init");
        let mut ckpt = Checkpoint::new(tiny());
        emb.write_into(&mut ckpt);
        let wider = ModelConfig {
            vocab_size: 20,
            ..tiny()
        };
        assert!(matches!(
            Embeddings::read_from(&mut ckpt, &wider),
            Err(EngineError::VocabMismatch { .. })
        ));
    }
}
