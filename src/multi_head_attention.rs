// src/multi_head_attention.rs
// MultiHeadAttention – causal self-attention over cached keys/values
use ndarray::{concatenate, s, Array2, Axis};
use rand::Rng;
use rayon::prelude::*;

use crate::checkpoint::Checkpoint;
use crate::error::{EngineError, EngineResult};
use crate::kv_cache::LayerKv;
use crate::math::{random_he, softmax_rows_par};

#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub i_embed: usize,
    pub i_heads: usize,
    pub i_head_dim: usize,
    pub w_qkv: Array2<f32>, // [embed, 3*embed]
    pub w_o: Array2<f32>,   // [embed, embed]
}

impl MultiHeadAttention {
    pub fn random<R: Rng>(i_embed: usize, i_heads: usize, rng: &mut R) -> EngineResult<Self> {
        if i_heads == 0 || i_embed % i_heads != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "width {i_embed} is not divisible into {i_heads} heads"
            )));
        }
        Ok(MultiHeadAttention {
            i_embed,
            i_heads,
            i_head_dim: i_embed / i_heads,
            w_qkv: random_he(rng, (i_embed, i_embed * 3))?,
            w_o: random_he(rng, (i_embed, i_embed))?,
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.w_qkv.len() + self.w_o.len()
    }

    /// Attends the current rows `m_x` ([seq, embed]) to the cached keys plus
    /// their own keys. Query i sits at absolute position past_len + i and
    /// sees keys 0..=past_len + i. `padding` (true = ignore) covers all key
    /// positions. Returns the output and the extended cache entry.
    pub fn forward(
        &self,
        m_x: &Array2<f32>,
        past: Option<&LayerKv>,
        padding: Option<&[bool]>,
    ) -> EngineResult<(Array2<f32>, LayerKv)> {
        // 1) QKV, current step only
        let m_qkv = m_x.dot(&self.w_qkv); // [seq, 3*embed]
        let (m_q_view, tmp) = m_qkv.view().split_at(Axis(1), self.i_embed);
        let (m_k_view, m_v_view) = tmp.split_at(Axis(1), self.i_embed);
        let m_q = m_q_view.to_owned();

        // 2) append to cache
        let i_past = past.map_or(0, LayerKv::len);
        let (m_k, m_v) = match past {
            Some(kv) if !kv.is_empty() => (
                concatenate(Axis(0), &[kv.keys.view(), m_k_view])?,
                concatenate(Axis(0), &[kv.values.view(), m_v_view])?,
            ),
            _ => (m_k_view.to_owned(), m_v_view.to_owned()),
        };
        let i_total = m_k.nrows();
        if let Some(v_pad) = padding {
            if v_pad.len() != i_total {
                return Err(EngineError::ShapeMismatch {
                    name: "padding mask".into(),
                    expected: vec![i_total],
                    found: vec![v_pad.len()],
                });
            }
        }

        // 3) heads
        let q_heads = self.split_heads_vec(&m_q);
        let k_heads = self.split_heads_vec(&m_k);
        let v_heads = self.split_heads_vec(&m_v);
        let scale = (self.i_head_dim as f32).sqrt();

        let ctx_per_head: Vec<Array2<f32>> = (0..self.i_heads)
            .into_par_iter()
            .map(|h| {
                // scores: [seq, total]
                let mut scores = q_heads[h].dot(&k_heads[h].t());
                scores.mapv_inplace(|v| v / scale);
                for ((i, j), v) in scores.indexed_iter_mut() {
                    let b_future = j > i_past + i;
                    let b_padded = padding.is_some_and(|p| p[j]);
                    if b_future || b_padded {
                        *v = f32::NEG_INFINITY;
                    }
                }
                let probs = softmax_rows_par(&scores);
                probs.dot(&v_heads[h]) // [seq, head_dim]
            })
            .collect();

        // 4) merge + projection
        let m_concat = self.merge_heads_vec(&ctx_per_head)?;
        let m_out = m_concat.dot(&self.w_o);
        Ok((m_out, LayerKv { keys: m_k, values: m_v }))
    }

    fn split_heads_vec(&self, m: &Array2<f32>) -> Vec<Array2<f32>> {
        let mut out = Vec::with_capacity(self.i_heads);
        for h in 0..self.i_heads {
            let c0 = h * self.i_head_dim;
            let c1 = c0 + self.i_head_dim;
            out.push(m.slice(s![.., c0..c1]).to_owned());
        }
        out
    }

    fn merge_heads_vec(&self, parts: &[Array2<f32>]) -> EngineResult<Array2<f32>> {
        let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
        Ok(concatenate(Axis(1), &views)?)
    }

    pub fn write_into(&self, ckpt: &mut Checkpoint, s_prefix: &str) {
        ckpt.put(&format!("{s_prefix}.w_qkv"), &self.w_qkv);
        ckpt.put(&format!("{s_prefix}.w_o"), &self.w_o);
    }

    pub fn read_from(
        ckpt: &mut Checkpoint,
        s_prefix: &str,
        i_embed: usize,
        i_heads: usize,
    ) -> EngineResult<Self> {
        Ok(MultiHeadAttention {
            i_embed,
            i_heads,
            i_head_dim: i_embed / i_heads.max(1),
            w_qkv: ckpt.take(&format!("{s_prefix}.w_qkv"), (i_embed, i_embed * 3))?,
            w_o: ckpt.take(&format!("{s_prefix}.w_o"), (i_embed, i_embed))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn attention() -> MultiHeadAttention {
        MultiHeadAttention::random(8, 2, &mut StdRng::seed_from_u64(5)).expect("init")
    }

    fn input(i_rows: usize) -> Array2<f32> {
        Array2::from_shape_fn((i_rows, 8), |(i, j)| ((i * 8 + j) as f32 * 0.37).sin())
    }

    #[test]
    fn rejects_indivisible_heads() {
        assert!(MultiHeadAttention::random(10, 3, &mut StdRng::seed_from_u64(1)).is_err());
    }

    #[test]
    fn incremental_rows_match_full_pass() {
        let mha = attention();
        let m_x = input(4);
        let (full, kv_full) = mha.forward(&m_x, None, None).expect("full");

        let (_, kv) = mha.forward(&m_x.slice(s![0..3, ..]).to_owned(), None, None).expect("prefix");
        let (last, kv_next) = mha
            .forward(&m_x.slice(s![3..4, ..]).to_owned(), Some(&kv), None)
            .expect("step");

        assert_eq!(kv_next.len(), 4);
        for (a, b) in full.row(3).iter().zip(last.row(0).iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        for (a, b) in kv_full.keys.iter().zip(kv_next.keys.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn first_row_ignores_future_tokens() {
        let mha = attention();
        let m_a = input(3);
        let mut m_b = m_a.clone();
        m_b.row_mut(2).fill(5.0);
        let (out_a, _) = mha.forward(&m_a, None, None).expect("a");
        let (out_b, _) = mha.forward(&m_b, None, None).expect("b");
        for (a, b) in out_a.row(0).iter().zip(out_b.row(0).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn padding_mask_must_cover_all_keys() {
        let mha = attention();
        let m_x = input(3);
        assert!(mha.forward(&m_x, None, Some(&[false, false])).is_err());
        let (out, _) = mha.forward(&m_x, None, Some(&[false, false, true])).expect("masked");
        assert_eq!(out.dim(), (3, 8));
    }
}
