// ===========================================================================
//  File:         decoder.rs
//  Module:       Causal transformer decoder
// ---------------------------------------------------------------------------
//  Purpose
//  -------
//  Read-only decoder shared by all generation calls. One forward pass:
//
//      ┌──────────────────────────────────────────────────────────────┐
//      │ Embeddings        token + position (offset = cache length)  │
//      ├──────────────────────────────────────────────────────────────┤
//      │ Empathy           emotion gate + mood bias                  │
//      ├──────────────────────────────────────────────────────────────┤
//      │ Blocks x N        pre-norm attention / gated feed-forward   │
//      ├──────────────────────────────────────────────────────────────┤
//      │ Final norm        LayerNorm                                 │
//      ├──────────────────────────────────────────────────────────────┤
//      │ Heads             tied logits, safety + empathy on demand   │
//      └──────────────────────────────────────────────────────────────┘
//
//  The key/value cache is passed in and a new one is returned; the
//  parameters are never mutated after construction.
//
//  Check-pointing: one bincode record (see checkpoint.rs). A missing file is
//  only tolerated when the caller explicitly accepts an untrained model.
// ===========================================================================

use std::path::Path;

use log::{info, warn};
use ndarray::{s, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::checkpoint::Checkpoint;
use crate::config::ModelConfig;
use crate::embeddings::Embeddings;
use crate::empathy::{Conditioning, EmpathyConditioning};
use crate::error::{EngineError, EngineResult};
use crate::kv_cache::KvCache;
use crate::layer_norm::LayerNorm;
use crate::layer_output_projection::OutputHeads;
use crate::transformer_block::TransformerBlock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelStatus {
    Trained,
    /// Randomly initialised weights, output is not meaningful.
    Untrained,
}

#[derive(Clone, Debug)]
pub struct DecoderOutput {
    /// [seq, vocab]
    pub logits: Array2<f32>,
    /// [P(safe), P(unsafe)] of the last position
    pub safety: Option<[f32; 2]>,
    pub empathy: Option<f32>,
    pub cache: KvCache,
}

impl DecoderOutput {
    pub fn last_logits(&self) -> Vec<f32> {
        let i_last = self.logits.nrows().saturating_sub(1);
        self.logits.row(i_last).to_vec()
    }
}

#[derive(Clone, Debug)]
pub struct Decoder {
    config: ModelConfig,
    embeddings: Embeddings,
    empathy: EmpathyConditioning,
    layers: Box<[TransformerBlock]>,
    final_norm: LayerNorm,
    heads: OutputHeads,
    status: ModelStatus,
}

impl Decoder {
    /// Seeded random initialisation, reported as `ModelStatus::Untrained`.
    pub fn random(config: &ModelConfig, u64_seed: u64) -> EngineResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(u64_seed);
        let embeddings = Embeddings::random(config, &mut rng)?;
        let empathy = EmpathyConditioning::random(config, &mut rng)?;
        let layers = (0..config.num_layers)
            .map(|_| TransformerBlock::random(config, &mut rng))
            .collect::<EngineResult<Vec<_>>>()?
            .into_boxed_slice();
        let heads = OutputHeads::random(config, &mut rng)?;
        Ok(Decoder {
            config: config.clone(),
            embeddings,
            empathy,
            layers,
            final_norm: LayerNorm::new(config.hidden_dim),
            heads,
            status: ModelStatus::Untrained,
        })
    }

    /// Restores all weights for `config`. Every parameter must be present
    /// with the expected shape.
    pub fn from_checkpoint(mut ckpt: Checkpoint, config: &ModelConfig) -> EngineResult<Self> {
        config.validate()?;
        check_architecture(&ckpt.config, config)?;

        let embeddings = Embeddings::read_from(&mut ckpt, config)?;
        let empathy = EmpathyConditioning::read_from(&mut ckpt, config)?;
        let layers = (0..config.num_layers)
            .map(|i| TransformerBlock::read_from(&mut ckpt, &format!("layers.{i}"), config))
            .collect::<EngineResult<Vec<_>>>()?
            .into_boxed_slice();
        let final_norm = LayerNorm::read_from(&mut ckpt, "final_norm", config.hidden_dim)?;
        let heads = OutputHeads::read_from(&mut ckpt, config)?;

        if let Some(s_name) = ckpt.tensors.keys().next() {
            return Err(EngineError::InvalidConfig(format!(
                "checkpoint carries {} tensors the decoder does not use (first: {s_name})",
                ckpt.tensors.len()
            )));
        }

        Ok(Decoder {
            config: config.clone(),
            embeddings,
            empathy,
            layers,
            final_norm,
            heads,
            status: ModelStatus::Trained,
        })
    }

    pub fn to_checkpoint(&self) -> Checkpoint {
        let mut ckpt = Checkpoint::new(self.config.clone());
        self.embeddings.write_into(&mut ckpt);
        self.empathy.write_into(&mut ckpt);
        for (i, block) in self.layers.iter().enumerate() {
            block.write_into(&mut ckpt, &format!("layers.{i}"));
        }
        self.final_norm.write_into(&mut ckpt, "final_norm");
        self.heads.write_into(&mut ckpt);
        ckpt
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, p_path: P) -> EngineResult<()> {
        self.to_checkpoint().save(p_path.as_ref())?;
        info!(
            "checkpoint written to {} ({} parameters)",
            p_path.as_ref().display(),
            self.parameter_count()
        );
        Ok(())
    }

    pub fn load_checkpoint<P: AsRef<Path>>(p_path: P, config: &ModelConfig) -> EngineResult<Self> {
        let ckpt = Checkpoint::load(p_path.as_ref())?;
        let decoder = Self::from_checkpoint(ckpt, config)?;
        info!(
            "checkpoint loaded from {} ({} layers, {} parameters)",
            p_path.as_ref().display(),
            decoder.layers.len(),
            decoder.parameter_count()
        );
        Ok(decoder)
    }

    /// Loads the checkpoint; a missing file yields a seeded random model
    /// when `b_allow_untrained` is set and is fatal otherwise.
    pub fn load_or_init<P: AsRef<Path>>(
        p_path: P,
        config: &ModelConfig,
        b_allow_untrained: bool,
        u64_seed: u64,
    ) -> EngineResult<Self> {
        let p_path = p_path.as_ref();
        if p_path.exists() {
            return Self::load_checkpoint(p_path, config);
        }
        if !b_allow_untrained {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("checkpoint {} not found", p_path.display()),
            )));
        }
        warn!(
            "checkpoint {} not found, using an untrained model",
            p_path.display()
        );
        Self::random(config, u64_seed)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_emotions(&self) -> usize {
        self.empathy.num_emotions()
    }

    pub fn parameter_count(&self) -> usize {
        self.embeddings.parameter_count()
            + self.empathy.parameter_count()
            + self.layers.iter().map(TransformerBlock::parameter_count).sum::<usize>()
            + self.final_norm.parameter_count()
            + self.heads.parameter_count()
    }

    /// Runs `v_ids` after the positions held in `past`. The safety and
    /// empathy heads are evaluated on the last position only when
    /// `b_want_heads` is set. `padding` (true = ignore) spans past + current
    /// positions.
    pub fn forward(
        &self,
        v_ids: &[usize],
        past: Option<&KvCache>,
        cond: &Conditioning,
        b_want_heads: bool,
        padding: Option<&[bool]>,
    ) -> EngineResult<DecoderOutput> {
        if v_ids.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        let past = past.filter(|c| !c.is_empty());
        let i_past = past.map_or(0, KvCache::len);
        let i_total = i_past + v_ids.len();
        if i_total > self.config.max_seq_len {
            return Err(EngineError::LengthExceeded {
                len: i_total,
                max: self.config.max_seq_len,
            });
        }
        if let Some(cache) = past {
            if cache.num_layers() != self.layers.len() {
                return Err(EngineError::InvalidConfig(format!(
                    "cache has {} layers, decoder has {}",
                    cache.num_layers(),
                    self.layers.len()
                )));
            }
        }

        let m_embedded = self.embeddings.embed_tokens(v_ids, i_past)?;
        let mut m_x = self.empathy.apply(&m_embedded, cond)?;

        let mut v_kv = Vec::with_capacity(self.layers.len());
        for (i, block) in self.layers.iter().enumerate() {
            let (m_next, kv) = block.forward(&m_x, past.and_then(|c| c.layer(i)), padding)?;
            m_x = m_next;
            v_kv.push(kv);
        }
        let m_hidden = self.final_norm.forward(&m_x);
        let logits = self.heads.logits(&m_hidden, &self.embeddings.token_embeddings);

        let (safety, empathy) = if b_want_heads {
            let i_last = m_hidden.nrows() - 1;
            let m_last = m_hidden.slice(s![i_last..i_last + 1, ..]);
            (
                Some(self.heads.safety(m_last)),
                Some(self.heads.empathy(m_last)),
            )
        } else {
            (None, None)
        };

        Ok(DecoderOutput {
            logits,
            safety,
            empathy,
            cache: KvCache::with_layers(v_kv),
        })
    }
}

/// The stored architecture must equal the configured one; dropout is
/// training-only and not compared.
fn check_architecture(stored: &ModelConfig, config: &ModelConfig) -> EngineResult<()> {
    if stored.vocab_size != config.vocab_size {
        return Err(EngineError::VocabMismatch {
            context: "checkpoint",
            expected: config.vocab_size,
            found: stored.vocab_size,
        });
    }
    let v_fields = [
        ("embedding_dim", stored.embedding_dim, config.embedding_dim),
        ("hidden_dim", stored.hidden_dim, config.hidden_dim),
        ("ff_dim", stored.ff_dim, config.ff_dim),
        ("num_layers", stored.num_layers, config.num_layers),
        ("num_heads", stored.num_heads, config.num_heads),
        ("max_seq_len", stored.max_seq_len, config.max_seq_len),
        ("num_emotions", stored.num_emotions, config.num_emotions),
    ];
    for (s_field, i_stored, i_expected) in v_fields {
        if i_stored != i_expected {
            return Err(EngineError::InvalidConfig(format!(
                "checkpoint {s_field} is {i_stored}, settings expect {i_expected}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 24,
            embedding_dim: 8,
            hidden_dim: 12,
            ff_dim: 16,
            num_layers: 2,
            num_heads: 3,
            max_seq_len: 10,
            num_emotions: 4,
            dropout: 0.1,
        }
    }

    fn close(a: &Array2<f32>, b: &Array2<f32>) -> bool {
        a.dim() == b.dim() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-4)
    }

    #[test]
    fn random_model_is_untrained_and_sized() {
        let dec = Decoder::random(&tiny_config(), 1).expect("init");
        assert_eq!(dec.status(), ModelStatus::Untrained);
        let out = dec
            .forward(&[2, 5, 6], None, &Conditioning::default(), false, None)
            .expect("forward");
        assert_eq!(out.logits.dim(), (3, 24));
        assert!(out.safety.is_none() && out.empathy.is_none());
        assert_eq!(out.cache.len(), 3);
        assert_eq!(out.cache.num_layers(), 2);
    }

    #[test]
    fn heads_are_computed_on_request() {
        let dec = Decoder::random(&tiny_config(), 1).expect("init");
        let out = dec
            .forward(&[2, 5], None, &Conditioning::new(Some(1), Some(8.0)), true, None)
            .expect("forward");
        let [d_safe, d_unsafe] = out.safety.expect("safety");
        assert!((d_safe + d_unsafe - 1.0).abs() < 1e-5);
        let d_emp = out.empathy.expect("empathy");
        assert!((0.0..=1.0).contains(&d_emp));
    }

    #[test]
    fn cached_steps_match_full_recomputation() {
        let dec = Decoder::random(&tiny_config(), 7).expect("init");
        let cond = Conditioning::new(Some(2), Some(3.0));
        let v_ids = [2usize, 9, 4, 17, 11];
        let full = dec.forward(&v_ids, None, &cond, false, None).expect("full");

        let mut step = dec.forward(&v_ids[..2], None, &cond, false, None).expect("prefix");
        let mut v_rows = vec![step.logits.row(0).to_owned(), step.logits.row(1).to_owned()];
        for &i_id in &v_ids[2..] {
            step = dec
                .forward(&[i_id], Some(&step.cache), &cond, false, None)
                .expect("step");
            v_rows.push(step.logits.row(0).to_owned());
        }
        let views: Vec<_> = v_rows.iter().map(|r| r.view()).collect();
        let incremental = ndarray::stack(ndarray::Axis(0), &views).expect("stack");
        assert!(close(&full.logits, &incremental));
    }

    #[test]
    fn length_and_input_errors() {
        let dec = Decoder::random(&tiny_config(), 1).expect("init");
        let cond = Conditioning::default();
        assert!(matches!(
            dec.forward(&[], None, &cond, false, None),
            Err(EngineError::EmptyInput)
        ));
        assert!(matches!(
            dec.forward(&[1; 11], None, &cond, false, None),
            Err(EngineError::LengthExceeded { len: 11, max: 10 })
        ));
        let out = dec.forward(&[1; 10], None, &cond, false, None).expect("full window");
        assert!(matches!(
            dec.forward(&[1], Some(&out.cache), &cond, false, None),
            Err(EngineError::LengthExceeded { len: 11, max: 10 })
        ));
        assert!(matches!(
            dec.forward(&[1], None, &Conditioning::new(Some(4), None), false, None),
            Err(EngineError::UnknownEmotion { .. })
        ));
    }

    #[test]
    fn checkpoint_round_trip_preserves_outputs() {
        let dir = tempfile::tempdir().expect("tmp");
        let p_file = dir.path().join("decoder.bin");
        let cfg = tiny_config();
        let dec = Decoder::random(&cfg, 3).expect("init");
        dec.save_checkpoint(&p_file).expect("save");

        let loaded = Decoder::load_checkpoint(&p_file, &cfg).expect("load");
        assert_eq!(loaded.status(), ModelStatus::Trained);
        let cond = Conditioning::new(Some(0), None);
        let a = dec.forward(&[2, 3, 4], None, &cond, true, None).expect("a");
        let b = loaded.forward(&[2, 3, 4], None, &cond, true, None).expect("b");
        assert!(close(&a.logits, &b.logits));
        assert_eq!(a.safety, b.safety);
    }

    #[test]
    fn missing_or_misshaped_weights_are_fatal() {
        let cfg = tiny_config();
        let dec = Decoder::random(&cfg, 3).expect("init");

        let mut ckpt = dec.to_checkpoint();
        ckpt.tensors.remove("layers.1.ffn.w_out");
        assert!(matches!(
            Decoder::from_checkpoint(ckpt, &cfg),
            Err(EngineError::MissingWeight(name)) if name == "layers.1.ffn.w_out"
        ));

        let mut ckpt = dec.to_checkpoint();
        ckpt.put("layers.0.ffn.w_out", &Array2::zeros((cfg.ff_dim + 1, cfg.hidden_dim)));
        assert!(matches!(
            Decoder::from_checkpoint(ckpt, &cfg),
            Err(EngineError::ShapeMismatch { .. })
        ));

        let other_vocab = ModelConfig { vocab_size: 30, ..cfg.clone() };
        assert!(matches!(
            Decoder::from_checkpoint(dec.to_checkpoint(), &other_vocab),
            Err(EngineError::VocabMismatch { .. })
        ));

        let mut ckpt = dec.to_checkpoint();
        ckpt.put("layers.2.ffn.w_out", &Array2::zeros((cfg.ff_dim, cfg.hidden_dim)));
        assert!(matches!(
            Decoder::from_checkpoint(ckpt, &cfg),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn architecture_mismatch_is_fatal() {
        let stored = ModelConfig { num_heads: 4, num_layers: 2, ..tiny_config() };
        let ckpt = Decoder::random(&stored, 5).expect("init").to_checkpoint();

        // same tensor shapes, attention split differently
        let fewer_heads = ModelConfig { num_heads: 2, ..stored.clone() };
        assert!(matches!(
            Decoder::from_checkpoint(ckpt.clone(), &fewer_heads),
            Err(EngineError::InvalidConfig(msg)) if msg.contains("num_heads")
        ));

        let fewer_layers = ModelConfig { num_layers: 1, ..stored.clone() };
        assert!(matches!(
            Decoder::from_checkpoint(ckpt.clone(), &fewer_layers),
            Err(EngineError::InvalidConfig(msg)) if msg.contains("num_layers")
        ));

        for other in [
            ModelConfig { ff_dim: 32, ..stored.clone() },
            ModelConfig { max_seq_len: 12, ..stored.clone() },
            ModelConfig { num_emotions: 5, ..stored.clone() },
        ] {
            assert!(matches!(
                Decoder::from_checkpoint(ckpt.clone(), &other),
                Err(EngineError::InvalidConfig(_))
            ));
        }

        let dropout_only = ModelConfig { dropout: 0.0, ..stored.clone() };
        assert!(Decoder::from_checkpoint(ckpt, &dropout_only).is_ok());
    }

    #[test]
    fn missing_checkpoint_needs_explicit_opt_in() {
        let dir = tempfile::tempdir().expect("tmp");
        let p_file = dir.path().join("absent.bin");
        let cfg = tiny_config();
        assert!(Decoder::load_or_init(&p_file, &cfg, false, 0).is_err());
        let dec = Decoder::load_or_init(&p_file, &cfg, true, 0).expect("untrained");
        assert_eq!(dec.status(), ModelStatus::Untrained);
    }

    #[test]
    fn pad_row_stays_zero_after_load() {
        let cfg = tiny_config();
        let mut ckpt = Decoder::random(&cfg, 3).expect("init").to_checkpoint();
        if let Some(t) = ckpt.tensors.get_mut("embed.token") {
            t.data.iter_mut().take(cfg.embedding_dim).for_each(|v| *v = 1.0);
        }
        let dec = Decoder::from_checkpoint(ckpt, &cfg).expect("load");
        let back = dec.to_checkpoint();
        let t = &back.tensors["embed.token"];
        assert!(t.data[..cfg.embedding_dim].iter().all(|v| *v == 0.0));
    }
}
