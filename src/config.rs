// src/config.rs
// Central hyper-parameters and the settings object consumed at startup.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const MAX_SEQ_LEN: usize = 256; // position count of the decoder
pub const EMBEDDING_DIM: usize = 128; // width of token/position embeddings
pub const HIDDEN_DIM: usize = 128; // model width inside the blocks
pub const FF_DIM: usize = 512; // hidden width of the gated feed-forward
pub const NUM_LAYERS: usize = 4;
pub const HEADS: usize = 8;
pub const VOCAB_SIZE: usize = 8_000;
pub const MERGE_COUNT: usize = 4_000;
pub const NUM_EMOTIONS: usize = 8;
pub const DROPOUT: f32 = 0.1; // training only, ignored at inference

/// Architecture of the decoder. Must agree with the checkpoint that is loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub ff_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub max_seq_len: usize,
    pub num_emotions: usize,
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: VOCAB_SIZE,
            embedding_dim: EMBEDDING_DIM,
            hidden_dim: HIDDEN_DIM,
            ff_dim: FF_DIM,
            num_layers: NUM_LAYERS,
            num_heads: HEADS,
            max_seq_len: MAX_SEQ_LEN,
            num_emotions: NUM_EMOTIONS,
            dropout: DROPOUT,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.vocab_size == 0 || self.embedding_dim == 0 || self.hidden_dim == 0 {
            return Err(EngineError::InvalidConfig(
                "vocab_size, embedding_dim and hidden_dim must be > 0".into(),
            ));
        }
        if self.ff_dim == 0 || self.num_layers == 0 || self.max_seq_len == 0 {
            return Err(EngineError::InvalidConfig(
                "ff_dim, num_layers and max_seq_len must be > 0".into(),
            ));
        }
        if self.num_heads == 0 || self.hidden_dim % self.num_heads != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "hidden_dim {} is not divisible into {} heads",
                self.hidden_dim, self.num_heads
            )));
        }
        Ok(())
    }
}

/// Tokenizer settings used for training and for the concrete vocabulary bound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub vocab_size: usize,
    pub merge_count: usize,
    /// Number of reserved special tokens (4 ..= 10), see `vocab::SPECIAL_TOKENS`.
    pub special_token_count: usize,
    /// Curated domain words; `None` selects the built-in list.
    pub domain_words: Option<Vec<String>>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            vocab_size: VOCAB_SIZE,
            merge_count: MERGE_COUNT,
            special_token_count: crate::vocab::SPECIAL_TOKENS.len(),
            domain_words: None,
        }
    }
}

/// File locations of the persisted tokenizer state and the decoder weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginePaths {
    pub vocab: PathBuf,
    pub merges: PathBuf,
    pub segment_cache: PathBuf,
    pub checkpoint: PathBuf,
}

impl Default for EnginePaths {
    fn default() -> Self {
        Self {
            vocab: PathBuf::from("data/vocab.json"),
            merges: PathBuf::from("data/merges.json"),
            segment_cache: PathBuf::from("data/segment_cache.json"),
            checkpoint: PathBuf::from("data/decoder.bin"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: ModelConfig,
    pub tokenizer: TokenizerConfig,
    pub paths: EnginePaths,
    /// Start with random weights when the checkpoint file does not exist.
    pub allow_untrained: bool,
}

impl EngineConfig {
    pub fn from_json_file<P: AsRef<Path>>(p_path: P) -> EngineResult<Self> {
        let s_json = fs::read_to_string(p_path.as_ref())?;
        let cfg: EngineConfig = serde_json::from_str(&s_json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.model.validate()?;
        if self.tokenizer.vocab_size != self.model.vocab_size {
            return Err(EngineError::VocabMismatch {
                context: "tokenizer config",
                expected: self.model.vocab_size,
                found: self.tokenizer.vocab_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn heads_must_divide_width() {
        let cfg = ModelConfig {
            hidden_dim: 30,
            num_heads: 8,
            ..ModelConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "model": { "num_layers": 2 }, "allow_untrained": true }"#)
                .expect("parse");
        assert_eq!(cfg.model.num_layers, 2);
        assert_eq!(cfg.model.hidden_dim, HIDDEN_DIM);
        assert!(cfg.allow_untrained);
        assert_eq!(cfg.paths.vocab, PathBuf::from("data/vocab.json"));
    }
}
