//! Sampling configuration and the logit transforms applied before a draw.
//!
//! Operates on raw logit slices. Order per step: repetition penalty,
//! temperature, top-k, top-p, categorical draw.

use std::collections::HashSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::math::{argmax, softmax};

/// Temperatures below this are treated as this value.
pub const MIN_TEMPERATURE: f32 = 1e-6;

/// Immutable per-call sampling settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    /// 0 disables top-k.
    pub top_k: usize,
    /// >= 1.0 disables nucleus filtering.
    pub top_p: f32,
    pub repetition_penalty: f32,
    /// Upper bound on generated tokens (eos included).
    pub max_length: usize,
    pub safety_filter: bool,
    /// A candidate is unsafe when P(unsafe) exceeds this value.
    pub safety_threshold: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 50,
            top_p: 0.9,
            repetition_penalty: 1.2,
            max_length: 64,
            safety_filter: true,
            safety_threshold: 0.5,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            temperature: MIN_TEMPERATURE,
            top_k: 1,
            top_p: 1.0,
            repetition_penalty: 1.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(self.temperature.is_finite() && self.temperature >= 0.0) {
            return Err(EngineError::InvalidSampling(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p.is_finite() && self.top_p > 0.0) {
            return Err(EngineError::InvalidSampling(format!(
                "top_p must be > 0, got {}",
                self.top_p
            )));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(EngineError::InvalidSampling(format!(
                "repetition_penalty must be > 0, got {}",
                self.repetition_penalty
            )));
        }
        if !(0.0..=1.0).contains(&self.safety_threshold) {
            return Err(EngineError::InvalidSampling(format!(
                "safety_threshold must be within 0..=1, got {}",
                self.safety_threshold
            )));
        }
        Ok(())
    }
}

/// Positive logits are divided by `penalty`, negative ones multiplied.
/// Each distinct id is penalised once.
pub fn apply_repetition_penalty(logits: &mut [f32], past_tokens: &[usize], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = HashSet::with_capacity(past_tokens.len());
    for &idx in past_tokens {
        if idx >= logits.len() || !seen.insert(idx) {
            continue;
        }
        if logits[idx] > 0.0 {
            logits[idx] /= penalty;
        } else {
            logits[idx] *= penalty;
        }
    }
}

pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    let t = temperature.max(MIN_TEMPERATURE);
    for v in logits.iter_mut() {
        *v /= t;
    }
}

/// Keep the k highest logits; on ties the lower id wins. k = 0 is a no-op.
pub fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    // stable: equal logits keep ascending id order
    indices.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    for &idx in &indices[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Nucleus filter: keep the smallest prefix (by descending probability) whose
/// cumulative mass exceeds `p`. The first token is always kept.
pub fn apply_top_p(logits: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let mut indices: Vec<usize> = (0..probs.len()).collect();
    indices.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumsum = 0.0f32;
    let mut keep = vec![false; logits.len()];
    for &idx in &indices {
        keep[idx] = true;
        cumsum += probs[idx];
        if cumsum > p {
            break;
        }
    }
    for (v, &b_keep) in logits.iter_mut().zip(keep.iter()) {
        if !b_keep {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Draws from softmax(logits). Falls back to argmax when the weights are
/// degenerate.
pub fn sample_categorical<R: Rng>(logits: &[f32], rng: &mut R) -> usize {
    let probs = softmax(logits);
    match WeightedIndex::new(&probs) {
        Ok(dist) => dist.sample(rng),
        Err(_) => argmax(logits),
    }
}

/// Full per-draw pipeline on a copy of the step's base logits.
pub fn sample_next<R: Rng>(
    base_logits: &[f32],
    history: &[usize],
    config: &SamplingConfig,
    temperature: f32,
    rng: &mut R,
) -> usize {
    let mut logits = base_logits.to_vec();
    apply_repetition_penalty(&mut logits, history, config.repetition_penalty);
    apply_temperature(&mut logits, temperature);
    apply_top_k(&mut logits, config.top_k);
    apply_top_p(&mut logits, config.top_p);
    sample_categorical(&logits, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn repetition_penalty_is_sign_asymmetric() {
        let mut logits = vec![2.0, -2.0, 6.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 0, 1], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 6.0]);
    }

    #[test]
    fn top_k_prefers_lower_id_on_ties() {
        let mut logits = vec![1.0, 3.0, 3.0, 0.5];
        apply_top_k(&mut logits, 1);
        assert_eq!(logits[1], 3.0);
        assert!(logits.iter().enumerate().all(|(i, v)| i == 1 || *v == f32::NEG_INFINITY));

        let mut untouched = vec![1.0, 2.0];
        apply_top_k(&mut untouched, 0);
        assert_eq!(untouched, vec![1.0, 2.0]);
    }

    #[test]
    fn top_p_keeps_first_token_exceeding_mass() {
        let mut logits = vec![10.0, -10.0, -10.0, -10.0];
        apply_top_p(&mut logits, 0.5);
        assert!(logits[0].is_finite());
        assert!(logits[1..].iter().all(|v| *v == f32::NEG_INFINITY));

        // probabilities 0.5 / 0.5: 0.5 does not exceed 0.5, second one kept too
        let mut even = vec![0.0, 0.0, f32::NEG_INFINITY];
        apply_top_p(&mut even, 0.5);
        assert!(even[0].is_finite() && even[1].is_finite());
        assert_eq!(even[2], f32::NEG_INFINITY);

        let mut all = vec![1.0, 2.0, 3.0];
        apply_top_p(&mut all, 1.0);
        assert_eq!(all, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn categorical_draw_respects_masking() {
        let logits = vec![f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY];
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            assert_eq!(sample_categorical(&logits, &mut rng), 1);
        }
        assert_eq!(sample_categorical(&[f32::NEG_INFINITY; 3], &mut rng), 0);
    }

    #[test]
    fn near_zero_temperature_is_greedy() {
        let base = vec![0.1, 0.3, 0.2];
        let cfg = SamplingConfig {
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            ..SamplingConfig::default()
        };
        for u64_seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(u64_seed);
            assert_eq!(sample_next(&base, &[], &cfg, 0.0, &mut rng), 1);
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(SamplingConfig::default().validate().is_ok());
        let bad = SamplingConfig { top_p: 0.0, ..SamplingConfig::default() };
        assert!(bad.validate().is_err());
        let bad = SamplingConfig { temperature: f32::NAN, ..SamplingConfig::default() };
        assert!(bad.validate().is_err());
        let bad = SamplingConfig { safety_threshold: 1.5, ..SamplingConfig::default() };
        assert!(bad.validate().is_err());
    }
}
