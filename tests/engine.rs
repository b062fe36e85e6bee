use ndarray::array;
use rand::rngs::StdRng;
use rand::SeedableRng;

use empathy_gpt::vocab::{BOS_ID, EOS_ID};
use empathy_gpt::{
    Conditioning, Decoder, Engine, EngineConfig, EngineError, GenerationSession, GenerationState,
    ModelConfig, ModelStatus, SamplingConfig, Tokenizer, TokenizerConfig,
};

const VOCAB: usize = 120;

fn model_config() -> ModelConfig {
    ModelConfig {
        vocab_size: VOCAB,
        embedding_dim: 12,
        hidden_dim: 16,
        ff_dim: 24,
        num_layers: 2,
        num_heads: 4,
        max_seq_len: 24,
        num_emotions: 4,
        dropout: 0.0,
    }
}

fn tokenizer_config() -> TokenizerConfig {
    TokenizerConfig {
        vocab_size: VOCAB,
        ..TokenizerConfig::default()
    }
}

fn corpus() -> Vec<String> {
    [
        "Ich fühle mich heute müde :(",
        "Mir geht es gut :)",
        "Stress 8/10, ich bin überfordert",
        "Danke, das hilft mir sehr!",
        "Ich bin traurig und müde",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn engine(u64_seed: u64) -> Engine {
    let mut tokenizer = Tokenizer::new(&tokenizer_config()).expect("tokenizer");
    tokenizer.train(&corpus());
    let decoder = Decoder::random(&model_config(), u64_seed).expect("decoder");
    Engine::new(tokenizer, decoder).expect("engine")
}

fn open_sampling() -> SamplingConfig {
    SamplingConfig {
        temperature: 1.0,
        top_k: 0,
        top_p: 1.0,
        repetition_penalty: 1.0,
        max_length: 8,
        safety_filter: false,
        safety_threshold: 0.5,
    }
}

#[test]
fn same_seed_gives_same_reply() {
    let eng = engine(3);
    let cond = Conditioning::new(Some(1), Some(4.0));
    let v_prompt = eng.build_prompt("Ich bin müde", &cond);
    let a = eng
        .generate(&v_prompt, &SamplingConfig::default(), cond, 11)
        .expect("first");
    let b = eng
        .generate(&v_prompt, &SamplingConfig::default(), cond, 11)
        .expect("second");
    assert_eq!(a, b);
    assert_eq!(a.generation_length, a.generated_ids.len());
    assert!(a.generated_ids.iter().all(|&id| id < VOCAB));
}

#[test]
fn top_k_one_ignores_the_seed() {
    let eng = engine(4);
    let cfg = SamplingConfig {
        top_k: 1,
        ..open_sampling()
    };
    let v_prompt = eng.build_prompt("Mir geht es gut", &Conditioning::default());
    let reference = eng
        .generate(&v_prompt, &cfg, Conditioning::default(), 0)
        .expect("gen");
    for u64_seed in 1..5 {
        let out = eng
            .generate(&v_prompt, &cfg, Conditioning::default(), u64_seed)
            .expect("gen");
        assert_eq!(out.generated_ids, reference.generated_ids);
    }
}

#[test]
fn unsafe_model_exhausts_the_gate() {
    let mut ckpt = Decoder::random(&model_config(), 9)
        .expect("decoder")
        .to_checkpoint();
    ckpt.put("safety.bias", &array![[-50.0f32, 50.0]]);
    let decoder = Decoder::from_checkpoint(ckpt, &model_config()).expect("reload");

    let cfg = SamplingConfig {
        safety_filter: true,
        safety_threshold: 0.5,
        ..open_sampling()
    };
    let out = empathy_gpt::generate(&decoder, &[BOS_ID, 5, 6], &cfg, Conditioning::default(), 1)
        .expect("gen");
    assert_eq!(out.terminal_state, GenerationState::TerminatedBySafetyExhaustion);
    assert_eq!(out.generated_ids, vec![EOS_ID]);
    assert_eq!(out.unsafe_attempts, 4);
}

#[test]
fn cached_and_recomputed_sessions_agree() {
    let eng = engine(5);
    let cfg = SamplingConfig {
        safety_filter: true,
        safety_threshold: 0.95,
        ..open_sampling()
    };
    let cond = Conditioning::new(Some(2), Some(8.0));
    let v_prompt = eng.build_prompt("Stress 8/10", &cond);
    let cached = GenerationSession::new(eng.decoder(), &v_prompt, &cfg, cond, StdRng::seed_from_u64(6))
        .expect("session")
        .run()
        .expect("cached");
    let full = GenerationSession::new(eng.decoder(), &v_prompt, &cfg, cond, StdRng::seed_from_u64(6))
        .expect("session")
        .without_cache()
        .run()
        .expect("full");
    assert_eq!(cached, full);
}

#[test]
fn overlong_input_is_rejected() {
    let eng = engine(1);
    let v_input = vec![BOS_ID; 25];
    assert!(matches!(
        eng.generate(&v_input, &open_sampling(), Conditioning::default(), 0),
        Err(EngineError::LengthExceeded { len: 25, max: 24 })
    ));
    assert!(matches!(
        eng.forward(&v_input, false),
        Err(EngineError::LengthExceeded { .. })
    ));
}

#[test]
fn unknown_emotion_is_an_error() {
    let eng = engine(1);
    let cond = Conditioning::new(Some(99), None);
    assert!(eng
        .generate(&[BOS_ID], &open_sampling(), cond, 0)
        .is_err());
}

#[test]
fn smiley_is_encoded_and_decoded() {
    let eng = engine(2);
    let v_ids = eng.encode("gut :)");
    assert_eq!(v_ids.len(), 2);
    assert_eq!(eng.decode(&v_ids), "gut 🙂");
}

#[test]
fn engine_loads_persisted_state() {
    let dir = tempfile::tempdir().expect("tmp");
    let mut cfg = EngineConfig {
        model: model_config(),
        tokenizer: tokenizer_config(),
        ..EngineConfig::default()
    };
    cfg.paths.vocab = dir.path().join("vocab.json");
    cfg.paths.merges = dir.path().join("merges.json");
    cfg.paths.segment_cache = dir.path().join("cache.json");
    cfg.paths.checkpoint = dir.path().join("decoder.bin");

    let mut tokenizer = Tokenizer::new(&cfg.tokenizer).expect("tokenizer");
    tokenizer.train(&corpus());
    tokenizer
        .save(&cfg.paths.vocab, &cfg.paths.merges, &cfg.paths.segment_cache)
        .expect("save tokenizer");

    // no checkpoint yet and no opt-in for random weights
    assert!(Engine::load(&cfg).is_err());
    cfg.allow_untrained = true;
    assert_eq!(Engine::load(&cfg).expect("untrained").status(), ModelStatus::Untrained);

    Decoder::random(&cfg.model, 17)
        .expect("decoder")
        .save_checkpoint(&cfg.paths.checkpoint)
        .expect("save decoder");
    let eng = Engine::load(&cfg).expect("load");
    assert_eq!(eng.status(), ModelStatus::Trained);
    assert_eq!(
        eng.encode("Ich bin müde :("),
        tokenizer.encode("Ich bin müde :(")
    );

    let s_reply = eng
        .respond("Ich bin müde", &SamplingConfig::default(), Conditioning::default(), 3)
        .expect("respond");
    assert!(!s_reply.contains("<pad>"));
}
