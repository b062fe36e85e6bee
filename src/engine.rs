// engine.rs
// ============================================================================
// Note:     Facade over tokenizer, decoder and generation controller. Shared
//           read-only between threads; every call owns its own state.
// ============================================================================

#![forbid(unsafe_code)]

use log::{info, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::EngineConfig;
use crate::decoder::{Decoder, ModelStatus};
use crate::empathy::{Conditioning, MOOD_MAX, MOOD_MIN};
use crate::error::{EngineError, EngineResult};
use crate::generation::{GenerationOutput, GenerationSession};
use crate::sampling::SamplingConfig;
use crate::tokenizer_bpe::Tokenizer;
use crate::vocab::{BOS_ID, S_ASSISTANT, S_EMOTION, S_MOOD, S_USER};

/// Seed of the random weights when no checkpoint is available.
const UNTRAINED_SEED: u64 = 0;

/// Scoring-only result of `Engine::forward`.
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    pub logits: Array2<f32>,
    pub safety_scores: Option<[f32; 2]>,
    pub empathy_score: Option<f32>,
}

pub struct Engine {
    tokenizer: Tokenizer,
    decoder: Decoder,
}

impl Engine {
    pub fn new(tokenizer: Tokenizer, decoder: Decoder) -> EngineResult<Self> {
        if tokenizer.vocab_size() != decoder.vocab_size() {
            return Err(EngineError::VocabMismatch {
                context: "decoder embedding table",
                expected: tokenizer.vocab_size(),
                found: decoder.vocab_size(),
            });
        }
        Ok(Self { tokenizer, decoder })
    }

    /// Builds the engine from persisted state. Configuration problems are
    /// reported here and never at call time.
    pub fn load(cfg: &EngineConfig) -> EngineResult<Self> {
        cfg.validate()?;
        let tokenizer = Tokenizer::load(
            &cfg.tokenizer,
            &cfg.paths.vocab,
            &cfg.paths.merges,
            &cfg.paths.segment_cache,
        )?;
        let decoder = Decoder::load_or_init(
            &cfg.paths.checkpoint,
            &cfg.model,
            cfg.allow_untrained,
            UNTRAINED_SEED,
        )?;
        let engine = Self::new(tokenizer, decoder)?;
        match engine.status() {
            ModelStatus::Trained => info!("engine ready"),
            ModelStatus::Untrained => warn!("engine ready with untrained weights"),
        }
        Ok(engine)
    }

    pub fn status(&self) -> ModelStatus {
        self.decoder.status()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn encode(&self, s_text: &str) -> Vec<usize> {
        self.tokenizer.encode(s_text)
    }

    pub fn decode(&self, v_ids: &[usize]) -> String {
        self.tokenizer.decode(v_ids)
    }

    pub fn encode_batch(&self, v_texts: &[&str], i_max_length: usize) -> Vec<Vec<usize>> {
        self.tokenizer.encode_batch(v_texts, i_max_length)
    }

    pub fn generate(
        &self,
        v_input: &[usize],
        sampling: &SamplingConfig,
        conditioning: Conditioning,
        u64_seed: u64,
    ) -> EngineResult<GenerationOutput> {
        self.session(v_input, sampling, conditioning, u64_seed)?.run()
    }

    pub fn session(
        &self,
        v_input: &[usize],
        sampling: &SamplingConfig,
        conditioning: Conditioning,
        u64_seed: u64,
    ) -> EngineResult<GenerationSession<'_>> {
        GenerationSession::new(
            &self.decoder,
            v_input,
            sampling,
            conditioning,
            StdRng::seed_from_u64(u64_seed),
        )
    }

    /// Scores a sequence without generating. Heads are evaluated on request.
    pub fn forward(&self, v_input: &[usize], b_heads: bool) -> EngineResult<ForwardOutput> {
        self.forward_conditioned(v_input, b_heads, Conditioning::default())
    }

    pub fn forward_conditioned(
        &self,
        v_input: &[usize],
        b_heads: bool,
        conditioning: Conditioning,
    ) -> EngineResult<ForwardOutput> {
        let out = self
            .decoder
            .forward(v_input, None, &conditioning, b_heads, None)?;
        Ok(ForwardOutput {
            logits: out.logits,
            safety_scores: out.safety,
            empathy_score: out.empathy,
        })
    }

    /// Chat prompt: bos, optional mood / emotion markers, user marker, the
    /// encoded text, assistant marker. Markers missing from the vocabulary
    /// are left out. The text is cut from the front so that at least one
    /// position remains for the reply.
    pub fn build_prompt(&self, s_text: &str, conditioning: &Conditioning) -> Vec<usize> {
        let vocab = self.tokenizer.vocab();
        let mut v_head = vec![BOS_ID];
        if let Some(d_mood) = conditioning.mood.filter(|d| d.is_finite()) {
            let i_level = d_mood.clamp(MOOD_MIN, MOOD_MAX).round() as usize;
            if let (Some(i_marker), Some(i_scale)) = (
                vocab.special_id(S_MOOD),
                vocab.id(&format!("<scale_{i_level}>")),
            ) {
                v_head.extend([i_marker, i_scale]);
            }
        }
        if conditioning.emotion.is_some() {
            v_head.extend(vocab.special_id(S_EMOTION));
        }
        v_head.extend(vocab.special_id(S_USER));

        let v_tail: Vec<usize> = vocab.special_id(S_ASSISTANT).into_iter().collect();
        let mut v_text = self.tokenizer.encode(s_text);

        let i_budget = self
            .decoder
            .max_seq_len()
            .saturating_sub(1 + v_head.len() + v_tail.len());
        if v_text.len() > i_budget {
            v_text.drain(..v_text.len() - i_budget);
        }

        let mut v_prompt = v_head;
        v_prompt.extend(v_text);
        v_prompt.extend(v_tail);
        v_prompt
    }

    /// Prompt, generate and decode in one call.
    pub fn respond(
        &self,
        s_text: &str,
        sampling: &SamplingConfig,
        conditioning: Conditioning,
        u64_seed: u64,
    ) -> EngineResult<String> {
        let v_prompt = self.build_prompt(s_text, &conditioning);
        let out = self.generate(&v_prompt, sampling, conditioning, u64_seed)?;
        Ok(self.decode(&out.generated_ids))
    }
}
