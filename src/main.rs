// ============================================================================
// main.rs
// ============================================================================
// Note:     Command line front end: tokenizer training, decoder
//           initialisation, streamed generation and a small chat loop.
//           Ctrl+C stops a running generation between two steps.
// ============================================================================

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use empathy_gpt::{
    Conditioning, Dataset, Decoder, Engine, EngineConfig, GenerationState, SamplingConfig,
    Tokenizer,
};

/// Word that ends the chat loop.
const CHAT_EXIT_WORD: &str = "fertig";

#[derive(Parser)]
#[command(name = "empathy-gpt", version, about = "Empathic text generation engine")]
struct Cli {
    /// JSON settings file; missing fields take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Learn vocabulary and merges from JSON / CSV corpora.
    TrainTokenizer {
        #[arg(required = true)]
        corpus: Vec<PathBuf>,
    },
    /// Write a randomly initialised decoder checkpoint.
    InitModel {
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Replace an existing checkpoint.
        #[arg(long)]
        force: bool,
    },
    /// Generate a reply to one prompt, streaming tokens to stdout.
    Generate {
        prompt: String,
        #[command(flatten)]
        opts: GenerateArgs,
    },
    /// Interactive loop; an empty line or "fertig" ends it.
    Chat {
        #[command(flatten)]
        opts: GenerateArgs,
    },
}

#[derive(Args, Clone)]
struct GenerateArgs {
    #[arg(long, default_value_t = 0.8)]
    temperature: f32,
    /// 0 disables top-k.
    #[arg(long, default_value_t = 50)]
    top_k: usize,
    #[arg(long, default_value_t = 0.9)]
    top_p: f32,
    #[arg(long, default_value_t = 1.2)]
    repetition_penalty: f32,
    #[arg(long, default_value_t = 64)]
    max_length: usize,
    #[arg(long)]
    no_safety: bool,
    #[arg(long, default_value_t = 0.5)]
    safety_threshold: f32,
    /// Emotion id used for conditioning.
    #[arg(long)]
    emotion: Option<usize>,
    /// Mood on the 1..=10 scale.
    #[arg(long)]
    mood: Option<f32>,
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

impl GenerateArgs {
    fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            max_length: self.max_length,
            safety_filter: !self.no_safety,
            safety_threshold: self.safety_threshold,
        }
    }

    fn conditioning(&self) -> Conditioning {
        Conditioning::new(self.emotion, self.mood)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(p) => EngineConfig::from_json_file(p)
            .with_context(|| format!("cannot read settings from {}", p.display()))?,
        None => EngineConfig::default(),
    };
    cfg.validate().context("invalid settings")?;

    match cli.command {
        Command::TrainTokenizer { corpus } => train_tokenizer(&cfg, &corpus),
        Command::InitModel { seed, force } => init_model(&cfg, seed, force),
        Command::Generate { prompt, opts } => {
            let engine = Engine::load(&cfg).context("engine startup failed")?;
            let stop = install_stop_flag();
            run_generation(&engine, &prompt, &opts, opts.seed, &stop)?;
            Ok(())
        }
        Command::Chat { opts } => chat(&cfg, &opts),
    }
}

fn ensure_parent(p_path: &Path) -> Result<()> {
    if let Some(p_dir) = p_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(p_dir)
            .with_context(|| format!("cannot create {}", p_dir.display()))?;
    }
    Ok(())
}

fn train_tokenizer(cfg: &EngineConfig, v_corpus: &[PathBuf]) -> Result<()> {
    let dataset = Dataset::load_all(v_corpus).context("corpus could not be loaded")?;
    if dataset.samples.is_empty() {
        bail!("corpus is empty");
    }

    let mut tokenizer = Tokenizer::new(&cfg.tokenizer)?;
    let report = tokenizer.train(&dataset.samples);
    info!(
        "tokenizer trained: {} merges, {} tokens, {} distinct words",
        report.merges, report.vocab_len, report.distinct_words
    );

    let paths = &cfg.paths;
    for p in [&paths.vocab, &paths.merges, &paths.segment_cache] {
        ensure_parent(p)?;
    }
    tokenizer.save(&paths.vocab, &paths.merges, &paths.segment_cache)?;
    println!(
        "tokenizer saved to {}, {}, {}",
        paths.vocab.display(),
        paths.merges.display(),
        paths.segment_cache.display()
    );
    Ok(())
}

fn init_model(cfg: &EngineConfig, u64_seed: u64, b_force: bool) -> Result<()> {
    let p_ckpt = &cfg.paths.checkpoint;
    if p_ckpt.exists() && !b_force {
        bail!("{} exists, pass --force to replace it", p_ckpt.display());
    }
    let decoder = Decoder::random(&cfg.model, u64_seed)?;
    ensure_parent(p_ckpt)?;
    decoder.save_checkpoint(p_ckpt)?;
    let model = decoder.config();
    println!(
        "decoder ({} layers, {} heads, width {}) with {} parameters written to {}",
        model.num_layers,
        model.num_heads,
        model.hidden_dim,
        decoder.parameter_count(),
        p_ckpt.display()
    );
    Ok(())
}

fn install_stop_flag() -> Arc<AtomicBool> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_ctrlc = Arc::clone(&stop_flag);
    if let Err(e) = ctrlc::set_handler(move || {
        stop_flag_ctrlc.store(true, AtomicOrdering::SeqCst);
    }) {
        warn!("Ctrl+C handler not installed: {e}");
    }
    stop_flag
}

/// Streams one reply to stdout and returns the generated text.
fn run_generation(
    engine: &Engine,
    s_prompt: &str,
    opts: &GenerateArgs,
    u64_seed: u64,
    stop: &AtomicBool,
) -> Result<String> {
    stop.store(false, AtomicOrdering::SeqCst);
    let conditioning = opts.conditioning();
    let v_prompt = engine.build_prompt(s_prompt, &conditioning);
    let mut session = engine.session(&v_prompt, &opts.sampling(), conditioning, u64_seed)?;

    let mut stdout = io::stdout();
    let mut s_shown = String::new();
    while let Some(_token) = session.step()? {
        // decode the whole suffix so spacing rules see the neighbours
        let s_text = engine.decode(session.generated_ids());
        if let Some(s_new) = s_text.strip_prefix(s_shown.as_str()) {
            write!(stdout, "{s_new}")?;
        } else {
            write!(stdout, "\r{s_text}")?;
        }
        stdout.flush()?;
        s_shown = s_text;

        if stop.load(AtomicOrdering::SeqCst) {
            warn!("generation interrupted");
            break;
        }
    }
    writeln!(stdout)?;

    match session.state() {
        GenerationState::TerminatedBySafetyExhaustion => {
            warn!("safety gate ended the reply ({} rejected draws)", session.unsafe_attempts())
        }
        state => info!("generation finished: {:?}", state),
    }
    Ok(s_shown)
}

fn chat(cfg: &EngineConfig, opts: &GenerateArgs) -> Result<()> {
    let engine = Engine::load(cfg).context("engine startup failed")?;
    let stop = install_stop_flag();
    let stdin = io::stdin();
    let mut u64_seed = opts.seed;

    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut s_line = String::new();
        if stdin.lock().read_line(&mut s_line)? == 0 {
            break;
        }
        let s_line = s_line.trim();
        if s_line.is_empty() || s_line.eq_ignore_ascii_case(CHAT_EXIT_WORD) {
            break;
        }
        run_generation(&engine, s_line, opts, u64_seed, &stop)?;
        u64_seed = u64_seed.wrapping_add(1);
    }
    Ok(())
}
