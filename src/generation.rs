// generation.rs
// ============================================================================
// Note:     Autoregressive loop over the decoder. A session owns everything a
//           call needs (ids, cache, counters, RNG) and advances one token per
//           `step`, so callers can stream tokens and stop between steps.
//
//           Safety gate: each drawn candidate is run through the decoder with
//           the safety head. Unsafe candidates are redrawn up to
//           MAX_SAFETY_RETRIES times at temperature * 0.7^retry; when every
//           draw is unsafe the session emits eos and terminates.
// ============================================================================

#![forbid(unsafe_code)]

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::decoder::{Decoder, DecoderOutput};
use crate::empathy::Conditioning;
use crate::error::{EngineError, EngineResult};
use crate::layer_output_projection::SAFETY_UNSAFE;
use crate::sampling::{sample_next, SamplingConfig};
use crate::vocab::EOS_ID;

pub const MAX_SAFETY_RETRIES: usize = 3;
pub const SAFETY_TEMPERATURE_DECAY: f32 = 0.7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationState {
    AwaitingNextToken,
    TerminatedByEos,
    TerminatedByLength,
    TerminatedBySafetyExhaustion,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationState::AwaitingNextToken)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Generated suffix, including the final eos when one was emitted.
    pub generated_ids: Vec<usize>,
    pub generation_length: usize,
    /// Number of candidate draws the safety gate rejected.
    pub unsafe_attempts: usize,
    pub terminal_state: GenerationState,
}

enum SafetyOutcome {
    Accepted {
        token: usize,
        output: Option<DecoderOutput>,
    },
    Exhausted,
}

pub struct GenerationSession<'a> {
    decoder: &'a Decoder,
    config: SamplingConfig,
    conditioning: Conditioning,
    rng: StdRng,
    v_ids: Vec<usize>,
    i_input_len: usize,
    i_step_limit: usize,
    state: GenerationState,
    i_unsafe_attempts: usize,
    b_use_cache: bool,
    // decoder output whose last row holds the logits of the next position
    pending: Option<DecoderOutput>,
}

impl<'a> GenerationSession<'a> {
    /// Validates the request and runs the full input once.
    pub fn new(
        decoder: &'a Decoder,
        v_input: &[usize],
        config: &SamplingConfig,
        conditioning: Conditioning,
        rng: StdRng,
    ) -> EngineResult<Self> {
        config.validate()?;
        if v_input.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        let i_max = decoder.max_seq_len();
        if v_input.len() > i_max {
            return Err(EngineError::LengthExceeded {
                len: v_input.len(),
                max: i_max,
            });
        }

        let i_step_limit = config.max_length.min(i_max - v_input.len());
        let (state, pending) = if i_step_limit == 0 {
            (GenerationState::TerminatedByLength, None)
        } else {
            let out = decoder.forward(v_input, None, &conditioning, false, None)?;
            (GenerationState::AwaitingNextToken, Some(out))
        };

        Ok(Self {
            decoder,
            config: config.clone(),
            conditioning,
            rng,
            v_ids: v_input.to_vec(),
            i_input_len: v_input.len(),
            i_step_limit,
            state,
            i_unsafe_attempts: 0,
            b_use_cache: true,
            pending,
        })
    }

    /// Recompute the whole sequence on every step instead of using the cache.
    pub fn without_cache(mut self) -> Self {
        self.b_use_cache = false;
        self
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn generated_ids(&self) -> &[usize] {
        &self.v_ids[self.i_input_len..]
    }

    pub fn unsafe_attempts(&self) -> usize {
        self.i_unsafe_attempts
    }

    /// Produces the next token, or `None` once the session has terminated.
    pub fn step(&mut self) -> EngineResult<Option<usize>> {
        if self.state.is_terminal() {
            return Ok(None);
        }
        let Some(current) = self.pending.as_ref() else {
            return Ok(None);
        };
        let v_base = current.last_logits();

        match self.screen(&v_base)? {
            SafetyOutcome::Accepted { token, output } => {
                let i_produced = self.generated_ids().len() + 1;
                let b_done = token == EOS_ID || i_produced >= self.i_step_limit;
                self.pending = match (b_done, output) {
                    (true, _) => None,
                    (false, Some(out)) => Some(out),
                    (false, None) => Some(self.advance(token)?),
                };
                self.v_ids.push(token);
                if token == EOS_ID {
                    self.state = GenerationState::TerminatedByEos;
                } else if i_produced >= self.i_step_limit {
                    self.state = GenerationState::TerminatedByLength;
                }
                debug!("step {}: token {}", i_produced, token);
                Ok(Some(token))
            }
            SafetyOutcome::Exhausted => {
                self.pending = None;
                self.v_ids.push(EOS_ID);
                self.state = GenerationState::TerminatedBySafetyExhaustion;
                Ok(Some(EOS_ID))
            }
        }
    }

    /// Runs the session to its terminal state.
    pub fn run(mut self) -> EngineResult<GenerationOutput> {
        while self.step()?.is_some() {}
        Ok(self.finish())
    }

    pub fn finish(self) -> GenerationOutput {
        let generated_ids = self.v_ids[self.i_input_len..].to_vec();
        GenerationOutput {
            generation_length: generated_ids.len(),
            generated_ids,
            unsafe_attempts: self.i_unsafe_attempts,
            terminal_state: self.state,
        }
    }

    /// Decoder pass for `token` appended to the current sequence.
    fn advance(&self, token: usize) -> EngineResult<DecoderOutput> {
        let b_heads = self.config.safety_filter;
        match (&self.pending, self.b_use_cache) {
            (Some(prev), true) => {
                self.decoder
                    .forward(&[token], Some(&prev.cache), &self.conditioning, b_heads, None)
            }
            _ => {
                let mut v_all = self.v_ids.clone();
                v_all.push(token);
                self.decoder
                    .forward(&v_all, None, &self.conditioning, b_heads, None)
            }
        }
    }

    fn screen(&mut self, v_base: &[f32]) -> EngineResult<SafetyOutcome> {
        if !self.config.safety_filter {
            let token = sample_next(
                v_base,
                &self.v_ids,
                &self.config,
                self.config.temperature,
                &mut self.rng,
            );
            return Ok(SafetyOutcome::Accepted {
                token,
                output: None,
            });
        }

        for (i_retry, d_temperature) in safety_temperatures(self.config.temperature)
            .into_iter()
            .enumerate()
        {
            let token = sample_next(v_base, &self.v_ids, &self.config, d_temperature, &mut self.rng);
            let out = self.advance(token)?;
            let d_unsafe = out.safety.map_or(0.0, |p| p[SAFETY_UNSAFE]);
            if d_unsafe > self.config.safety_threshold {
                self.i_unsafe_attempts += 1;
                debug!(
                    "candidate {} rejected (p_unsafe {:.3}, retry {})",
                    token, d_unsafe, i_retry
                );
                continue;
            }
            return Ok(SafetyOutcome::Accepted {
                token,
                output: Some(out),
            });
        }

        warn!(
            "safety gate exhausted after {} draws, emitting eos",
            MAX_SAFETY_RETRIES + 1
        );
        Ok(SafetyOutcome::Exhausted)
    }
}

/// Sampling temperature of every safety draw: the initial one, then each
/// retry cooled by `SAFETY_TEMPERATURE_DECAY`.
fn safety_temperatures(d_base: f32) -> [f32; MAX_SAFETY_RETRIES + 1] {
    let mut v_out = [d_base; MAX_SAFETY_RETRIES + 1];
    for (i_retry, d_t) in v_out.iter_mut().enumerate() {
        *d_t = d_base * SAFETY_TEMPERATURE_DECAY.powi(i_retry as i32);
    }
    v_out
}

/// One-shot generation with a caller-provided seed.
pub fn generate(
    decoder: &Decoder,
    v_input: &[usize],
    config: &SamplingConfig,
    conditioning: Conditioning,
    u64_seed: u64,
) -> EngineResult<GenerationOutput> {
    GenerationSession::new(
        decoder,
        v_input,
        config,
        conditioning,
        StdRng::seed_from_u64(u64_seed),
    )?
    .run()
}
