// error.rs
// ============================================================================
// Note:     Error taxonomy of the engine. Configuration problems surface while
//           the engine is constructed, call errors only for invalid input.
//           Recoverable situations (unknown pieces, missing optional files,
//           safety exhaustion) never produce an error value.
// ============================================================================

#![forbid(unsafe_code)]

use thiserror::Error;

/// Result type used throughout the library.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint decode error: {0}")]
    CheckpointDecode(#[from] bincode::error::DecodeError),

    #[error("checkpoint encode error: {0}")]
    CheckpointEncode(#[from] bincode::error::EncodeError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("tensor shape error: {0}")]
    Tensor(#[from] ndarray::ShapeError),

    #[error("vocabulary file {0} not found")]
    MissingVocabulary(String),

    #[error("vocabulary size mismatch: {context} expects {expected}, found {found}")]
    VocabMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("checkpoint is missing weight '{0}'")]
    MissingWeight(String),

    #[error("weight '{name}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("special token '{0}' is not part of the vocabulary")]
    MissingSpecialToken(&'static str),

    #[error("sequence of {len} positions exceeds the maximum of {max}")]
    LengthExceeded { len: usize, max: usize },

    #[error("generation needs at least one input token")]
    EmptyInput,

    #[error("token id {id} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange { id: usize, vocab_size: usize },

    #[error("emotion id {id} is outside the {count} known emotions")]
    UnknownEmotion { id: usize, count: usize },

    #[error("invalid sampling configuration: {0}")]
    InvalidSampling(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
