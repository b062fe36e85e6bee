// =============================================
// lib.rs
// =============================================
pub mod config;
pub mod error;

pub mod normalize;
pub mod tokenizer_bpe;
pub mod vocab;

pub mod checkpoint;
pub mod decoder;
pub mod embeddings;
pub mod empathy;
pub mod feed_forward_geglu;
pub mod kv_cache;
pub mod layer_norm;
pub mod layer_output_projection;
pub mod math;
pub mod multi_head_attention;
pub mod transformer_block;

pub mod generation;
pub mod sampling;

pub mod dataset_loader;
pub mod engine;

// Re-export key structs for easier access
pub use config::{EngineConfig, EnginePaths, ModelConfig, TokenizerConfig};
pub use dataset_loader::{Dataset, DatasetType};
pub use decoder::{Decoder, DecoderOutput, ModelStatus};
pub use empathy::Conditioning;
pub use engine::{Engine, ForwardOutput};
pub use error::{EngineError, EngineResult};
pub use generation::{generate, GenerationOutput, GenerationSession, GenerationState};
pub use kv_cache::KvCache;
pub use sampling::SamplingConfig;
pub use tokenizer_bpe::Tokenizer;
