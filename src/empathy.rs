// empathy.rs
// ============================================================================
// Note:     Empathy conditioning applied to the embedded sequence before the
//           transformer blocks.
//             e = emotion_table[emotion]
//             t = tanh(x W_t + b_t)
//             g = sigmoid([t, e] W_g + b_g)
//             x = x + g * e + (1 - g) * t
//           A mood scalar (clamped to 1..=10) adds 0.05 * (mood - 5.5) to
//           every element. Without an emotion id only the mood bias applies.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::{concatenate, Array2, Axis, Zip};
use rand::Rng;

use crate::checkpoint::Checkpoint;
use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};
use crate::math::{random_he, random_normal, sigmoid};

pub const MOOD_MIN: f32 = 1.0;
pub const MOOD_MAX: f32 = 10.0;
const MOOD_CENTER: f32 = 5.5;
const MOOD_SCALE: f32 = 0.05;

/// Per-call conditioning signals from the sibling mood/emotion models.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Conditioning {
    pub emotion: Option<usize>,
    pub mood: Option<f32>,
}

impl Conditioning {
    pub fn new(emotion: Option<usize>, mood: Option<f32>) -> Self {
        Self { emotion, mood }
    }

    pub fn mood_bias(&self) -> Option<f32> {
        self.mood
            .filter(|d| d.is_finite())
            .map(|d| MOOD_SCALE * (d.clamp(MOOD_MIN, MOOD_MAX) - MOOD_CENTER))
    }
}

#[derive(Clone, Debug)]
pub struct EmpathyConditioning {
    emotion_table: Array2<f32>, // [num_emotions, hidden]
    w_transform: Array2<f32>,   // [hidden, hidden]
    b_transform: Array2<f32>,   // [1, hidden]
    w_gate: Array2<f32>,        // [2 * hidden, hidden]
    b_gate: Array2<f32>,        // [1, hidden]
}

impl EmpathyConditioning {
    pub fn random<R: Rng>(cfg: &ModelConfig, rng: &mut R) -> EngineResult<Self> {
        let h = cfg.hidden_dim;
        Ok(Self {
            emotion_table: random_normal(rng, (cfg.num_emotions, h), 0.02)?,
            w_transform: random_he(rng, (h, h))?,
            b_transform: Array2::zeros((1, h)),
            w_gate: random_he(rng, (2 * h, h))?,
            b_gate: Array2::zeros((1, h)),
        })
    }

    pub fn num_emotions(&self) -> usize {
        self.emotion_table.nrows()
    }

    pub fn parameter_count(&self) -> usize {
        self.emotion_table.len()
            + self.w_transform.len()
            + self.b_transform.len()
            + self.w_gate.len()
            + self.b_gate.len()
    }

    pub fn apply(&self, m_x: &Array2<f32>, cond: &Conditioning) -> EngineResult<Array2<f32>> {
        let mut m_out = match cond.emotion {
            Some(i_emotion) => self.blend_emotion(m_x, i_emotion)?,
            None => m_x.clone(),
        };
        if let Some(d_bias) = cond.mood_bias() {
            m_out.mapv_inplace(|v| v + d_bias);
        }
        Ok(m_out)
    }

    fn blend_emotion(&self, m_x: &Array2<f32>, i_emotion: usize) -> EngineResult<Array2<f32>> {
        if i_emotion >= self.num_emotions() {
            return Err(EngineError::UnknownEmotion {
                id: i_emotion,
                count: self.num_emotions(),
            });
        }
        let i_seq = m_x.nrows();
        let v_emotion = self.emotion_table.row(i_emotion);
        let m_e = v_emotion.broadcast((i_seq, v_emotion.len())).ok_or_else(|| {
            EngineError::InvalidConfig("emotion embedding does not match model width".into())
        })?;

        let m_t = (m_x.dot(&self.w_transform) + &self.b_transform).mapv(f32::tanh);
        let m_te = concatenate(Axis(1), &[m_t.view(), m_e.view()])?;
        let m_g = (m_te.dot(&self.w_gate) + &self.b_gate).mapv(sigmoid);

        let mut m_out = m_x.clone();
        Zip::from(&mut m_out)
            .and(&m_g)
            .and(&m_e)
            .and(&m_t)
            .for_each(|o, &g, &e, &t| *o += g * e + (1.0 - g) * t);
        Ok(m_out)
    }

    pub fn write_into(&self, ckpt: &mut Checkpoint) {
        ckpt.put("empathy.emotion", &self.emotion_table);
        ckpt.put("empathy.transform.weight", &self.w_transform);
        ckpt.put("empathy.transform.bias", &self.b_transform);
        ckpt.put("empathy.gate.weight", &self.w_gate);
        ckpt.put("empathy.gate.bias", &self.b_gate);
    }

    pub fn read_from(ckpt: &mut Checkpoint, cfg: &ModelConfig) -> EngineResult<Self> {
        let h = cfg.hidden_dim;
        Ok(Self {
            emotion_table: ckpt.take("empathy.emotion", (cfg.num_emotions, h))?,
            w_transform: ckpt.take("empathy.transform.weight", (h, h))?,
            b_transform: ckpt.take("empathy.transform.bias", (1, h))?,
            w_gate: ckpt.take("empathy.gate.weight", (2 * h, h))?,
            b_gate: ckpt.take("empathy.gate.bias", (1, h))?,
        })
    }
}
