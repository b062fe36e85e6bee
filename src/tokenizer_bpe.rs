// tokenizer_bpe.rs
// ============================================================================
// Note:     Domain tokenizer: normalization, whole-token recognition (special
//           tokens, curated domain words, emoticon/scale placeholders,
//           punctuation) and merge-rule subword segmentation for everything
//           else. Word-internal pieces carry the "##" prefix so that decode
//           can glue them back without ambiguity.
// History:
//  - Merge training over word frequencies with first-encounter tie-break.
//  - Shared segmentation cache, JSON persistence of vocab/merges/cache.
// ============================================================================

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use rayon::prelude::*;
use regex::Regex;

use crate::config::TokenizerConfig;
use crate::error::{EngineError, EngineResult};
use crate::normalize::{display_form, is_placeholder, normalize, placeholder_tokens};
use crate::vocab::{Vocabulary, BOS_ID, DEFAULT_DOMAIN_WORDS, EOS_ID, PAD_ID, S_UNK, UNK_ID};

pub const CONTINUATION_PREFIX: &str = "##";

// Minimum pair frequency for a merge to be learned.
const MIN_MERGE_FREQUENCY: usize = 2;

const OPENING_PUNCTUATION: &[char] = &['(', '[', '{', '„', '“', '‚', '«', '¿', '¡'];

lazy_static! {
    static ref PUNCT_RE: Regex = Regex::new(r"^(?:\p{P}|[$+<=>^`|~])+$").expect("punct pattern");
    static ref UNIT_SPLIT_RE: Regex =
        Regex::new(r"[\p{L}\p{N}\p{M}]+|(?:\p{P}|[$+<=>^`|~])+|[^\s\p{L}\p{N}\p{M}\p{P}$+<=>^`|~]+")
            .expect("split pattern");
}

pub fn is_punctuation(s_unit: &str) -> bool {
    PUNCT_RE.is_match(s_unit)
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MergeRule {
    left: String,
    right: String,
    merged: String,
}

impl MergeRule {
    fn new(left: &str, right: &str) -> Self {
        let s_tail = right.strip_prefix(CONTINUATION_PREFIX).unwrap_or(right);
        Self {
            left: left.to_string(),
            right: right.to_string(),
            merged: format!("{left}{s_tail}"),
        }
    }
}

/// Result of one whitespace/regex split before segmentation.
enum Unit<'a> {
    Whole(&'a str),
    Word(&'a str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrainReport {
    pub merges: usize,
    pub vocab_len: usize,
    pub distinct_words: usize,
}

pub struct Tokenizer {
    vocab: Vocabulary,
    merge_count: usize,
    domain_words: Vec<String>,
    domain_set: HashSet<String>,
    merges: Vec<MergeRule>,
    // append-only, insert-if-absent; never cleared except by train()
    segment_cache: RwLock<HashMap<String, Vec<String>>>,
}

impl Tokenizer {
    /// Untrained tokenizer: special tokens plus the seeded domain vocabulary.
    pub fn new(config: &TokenizerConfig) -> EngineResult<Self> {
        let vocab = Vocabulary::with_specials(config.vocab_size, config.special_token_count)?;
        let domain_words: Vec<String> = match &config.domain_words {
            Some(v) => v.iter().map(|s| normalize(s)).filter(|s| !s.is_empty()).collect(),
            None => DEFAULT_DOMAIN_WORDS.iter().map(|s| s.to_string()).collect(),
        };
        let domain_set = domain_words.iter().cloned().collect();
        let mut tok = Self {
            vocab,
            merge_count: config.merge_count,
            domain_words,
            domain_set,
            merges: Vec::new(),
            segment_cache: RwLock::new(HashMap::new()),
        };
        tok.seed_domain();
        Ok(tok)
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.max_size()
    }

    pub fn merge_rules(&self) -> Vec<(String, String)> {
        self.merges
            .iter()
            .map(|m| (m.left.clone(), m.right.clone()))
            .collect()
    }

    pub fn cached_words(&self) -> usize {
        self.segment_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn seed_domain(&mut self) {
        let v_seed: Vec<String> = self
            .domain_words
            .iter()
            .cloned()
            .chain(placeholder_tokens())
            .collect();
        for s_tok in &v_seed {
            if self.vocab.push(s_tok).is_none() {
                break;
            }
        }
    }

    fn is_domain(&self, s_unit: &str) -> bool {
        self.domain_set.contains(s_unit) || is_placeholder(s_unit)
    }

    fn is_whole(&self, s_unit: &str) -> bool {
        self.vocab.is_special(s_unit) || self.is_domain(s_unit) || is_punctuation(s_unit)
    }

    fn units<'a>(&self, s_normalized: &'a str) -> Vec<Unit<'a>> {
        let mut v_units = Vec::new();
        for s_unit in s_normalized.split_whitespace() {
            if self.is_whole(s_unit) {
                v_units.push(Unit::Whole(s_unit));
                continue;
            }
            for m in UNIT_SPLIT_RE.find_iter(s_unit) {
                let s_run = m.as_str();
                if self.is_domain(s_run) || is_punctuation(s_run) {
                    v_units.push(Unit::Whole(s_run));
                } else {
                    v_units.push(Unit::Word(s_run));
                }
            }
        }
        v_units
    }

    // ------------------------------------------------------------------------
    // Segmentation
    // ------------------------------------------------------------------------

    fn initial_pieces(s_word: &str) -> Vec<String> {
        s_word
            .chars()
            .enumerate()
            .map(|(i, c)| {
                if i == 0 {
                    c.to_string()
                } else {
                    format!("{CONTINUATION_PREFIX}{c}")
                }
            })
            .collect()
    }

    fn apply_merge(v_pieces: &mut Vec<String>, rule: &MergeRule) {
        let mut i = 0usize;
        while i + 1 < v_pieces.len() {
            if v_pieces[i] == rule.left && v_pieces[i + 1] == rule.right {
                v_pieces[i] = rule.merged.clone();
                v_pieces.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    fn compute_segments(&self, s_word: &str) -> Vec<String> {
        let mut v_pieces = Self::initial_pieces(s_word);
        for rule in &self.merges {
            if v_pieces.len() < 2 {
                break;
            }
            Self::apply_merge(&mut v_pieces, rule);
        }
        v_pieces
    }

    /// Splits one word into pieces using the learned merges, in learned order.
    pub fn segment(&self, s_word: &str) -> Vec<String> {
        if s_word.is_empty() {
            return Vec::new();
        }
        {
            let cache = self.segment_cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(v_hit) = cache.get(s_word) {
                return v_hit.clone();
            }
        }
        // computed without holding the lock; a racing writer only duplicates work
        let v_pieces = self.compute_segments(s_word);
        self.segment_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(s_word.to_string())
            .or_insert_with(|| v_pieces.clone());
        v_pieces
    }

    // ------------------------------------------------------------------------
    // Text <-> tokens <-> ids
    // ------------------------------------------------------------------------

    pub fn normalize(&self, s_text: &str) -> String {
        normalize(s_text)
    }

    pub fn tokenize(&self, s_text: &str) -> Vec<String> {
        let s_norm = normalize(s_text);
        let mut v_tokens = Vec::new();
        for unit in self.units(&s_norm) {
            match unit {
                Unit::Whole(s) => v_tokens.push(s.to_string()),
                Unit::Word(s) => v_tokens.extend(self.segment(s)),
            }
        }
        v_tokens
    }

    pub fn encode(&self, s_text: &str) -> Vec<usize> {
        self.tokenize(s_text)
            .iter()
            .map(|t| self.vocab.id(t).unwrap_or(UNK_ID))
            .collect()
    }

    /// Encodes every text to exactly `i_max_length` ids: truncated with a
    /// closing eos, or right-padded with pad.
    pub fn encode_batch(&self, v_texts: &[&str], i_max_length: usize) -> Vec<Vec<usize>> {
        v_texts
            .par_iter()
            .map(|s| fit_length(self.encode(s), i_max_length))
            .collect()
    }

    pub fn decode(&self, v_ids: &[usize]) -> String {
        let mut s_out = String::new();
        let mut b_suppress_space = true;

        for &i_id in v_ids {
            if matches!(i_id, PAD_ID | BOS_ID | EOS_ID) {
                continue;
            }
            let s_tok = self.vocab.token(i_id).unwrap_or(S_UNK);

            if let Some(s_tail) = s_tok.strip_prefix(CONTINUATION_PREFIX) {
                s_out.push_str(s_tail);
                b_suppress_space = false;
                continue;
            }

            let s_display = display_form(s_tok).unwrap_or_else(|| s_tok.to_string());
            let b_punct = is_punctuation(s_tok);
            let b_opening = b_punct && s_tok.chars().all(|c| OPENING_PUNCTUATION.contains(&c));

            if !s_out.is_empty() && !b_suppress_space && (!b_punct || b_opening) {
                s_out.push(' ');
            }
            s_out.push_str(&s_display);
            b_suppress_space = b_opening;
        }
        s_out
    }

    // ------------------------------------------------------------------------
    // Training
    // ------------------------------------------------------------------------

    /// Learns merges and rebuilds the vocabulary from the given samples.
    /// Invalidates the segmentation cache.
    pub fn train(&mut self, v_samples: &[String]) -> TrainReport {
        let v_normalized: Vec<String> = v_samples.par_iter().map(|s| normalize(s)).collect();

        // word frequencies in first-encounter order
        let mut v_words: Vec<(String, usize)> = Vec::new();
        let mut m_word_index: HashMap<String, usize> = HashMap::new();
        for s_norm in &v_normalized {
            for unit in self.units(s_norm) {
                if let Unit::Word(s_word) = unit {
                    match m_word_index.get(s_word) {
                        Some(&i_idx) => v_words[i_idx].1 += 1,
                        None => {
                            m_word_index.insert(s_word.to_string(), v_words.len());
                            v_words.push((s_word.to_string(), 1));
                        }
                    }
                }
            }
        }
        let i_distinct = v_words.len();

        self.merges = learn_merges(&v_words, self.merge_count);
        self.segment_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        // token frequencies with the fresh merges, ties by first encounter
        let mut v_counts: Vec<(String, usize)> = Vec::new();
        let mut m_count_index: HashMap<String, usize> = HashMap::new();
        for s_norm in &v_normalized {
            for s_tok in self.tokenize(s_norm) {
                match m_count_index.get(&s_tok) {
                    Some(&i_idx) => v_counts[i_idx].1 += 1,
                    None => {
                        m_count_index.insert(s_tok.clone(), v_counts.len());
                        v_counts.push((s_tok, 1));
                    }
                }
            }
        }
        // stable sort keeps first-encounter order among equal counts
        v_counts.sort_by(|a, b| b.1.cmp(&a.1));

        self.vocab.reset_extension();
        self.seed_domain();
        for (s_tok, _) in &v_counts {
            if self.vocab.push(s_tok).is_none() {
                break;
            }
        }

        let report = TrainReport {
            merges: self.merges.len(),
            vocab_len: self.vocab.len(),
            distinct_words: i_distinct,
        };
        info!(
            "tokenizer trained: {} merges, {} of {} vocabulary slots, {} distinct words",
            report.merges,
            report.vocab_len,
            self.vocab.max_size(),
            report.distinct_words
        );
        report
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn save<P: AsRef<Path>>(&self, p_vocab: P, p_merges: P, p_cache: P) -> EngineResult<()> {
        self.vocab.save(p_vocab)?;

        let mut w = BufWriter::new(File::create(p_merges.as_ref())?);
        serde_json::to_writer(&mut w, &self.merge_rules())?;
        w.flush()?;

        let m_cache: BTreeMap<String, Vec<String>> = self
            .segment_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut w = BufWriter::new(File::create(p_cache.as_ref())?);
        serde_json::to_writer(&mut w, &m_cache)?;
        w.flush()?;
        Ok(())
    }

    /// Loads persisted state. The vocabulary file is mandatory; merges and the
    /// segmentation cache fall back to empty when missing or malformed.
    pub fn load<P: AsRef<Path>>(
        config: &TokenizerConfig,
        p_vocab: P,
        p_merges: P,
        p_cache: P,
    ) -> EngineResult<Self> {
        let vocab = Vocabulary::load(p_vocab)?;
        if vocab.max_size() != config.vocab_size {
            return Err(EngineError::VocabMismatch {
                context: "vocabulary file",
                expected: config.vocab_size,
                found: vocab.max_size(),
            });
        }

        let mut tok = Self::new(&TokenizerConfig {
            special_token_count: vocab.special_count(),
            ..config.clone()
        })?;
        tok.vocab = vocab;

        let v_pairs: Vec<(String, String)> = read_optional_json(p_merges.as_ref(), "merge rules");
        tok.merges = v_pairs.iter().map(|(l, r)| MergeRule::new(l, r)).collect();

        let m_cache: HashMap<String, Vec<String>> =
            read_optional_json(p_cache.as_ref(), "segmentation cache");
        *tok.segment_cache.get_mut().unwrap_or_else(PoisonError::into_inner) = m_cache;

        info!(
            "tokenizer loaded: {} tokens, {} merges, {} cached words",
            tok.vocab.len(),
            tok.merges.len(),
            tok.cached_words()
        );
        Ok(tok)
    }
}

/// Truncates with a closing eos or right-pads with pad to exactly `i_len` ids.
pub fn fit_length(mut v_ids: Vec<usize>, i_len: usize) -> Vec<usize> {
    if v_ids.len() > i_len {
        v_ids.truncate(i_len.saturating_sub(1));
        if i_len > 0 {
            v_ids.push(EOS_ID);
        }
    } else {
        v_ids.resize(i_len, PAD_ID);
    }
    v_ids
}

fn read_optional_json<T: serde::de::DeserializeOwned + Default>(p_path: &Path, s_what: &str) -> T {
    if !p_path.exists() {
        debug!("no {} at {}, starting empty", s_what, p_path.display());
        return T::default();
    }
    let parsed = fs::read_to_string(p_path)
        .map_err(EngineError::from)
        .and_then(|s| serde_json::from_str(&s).map_err(EngineError::from));
    match parsed {
        Ok(value) => value,
        Err(e) => {
            warn!("ignoring {} at {}: {}", s_what, p_path.display(), e);
            T::default()
        }
    }
}

/// Greedy merge learning over weighted words. Ties between equally frequent
/// pairs go to the pair encountered first.
fn learn_merges(v_words: &[(String, usize)], i_limit: usize) -> Vec<MergeRule> {
    let mut v_corpus: Vec<(Vec<String>, usize)> = v_words
        .iter()
        .map(|(s_word, i_freq)| (Tokenizer::initial_pieces(s_word), *i_freq))
        .collect();
    let mut v_rules: Vec<MergeRule> = Vec::new();

    for _ in 0..i_limit {
        // (count, first encounter) per pair
        let mut m_pairs: HashMap<(&str, &str), (usize, usize)> = HashMap::new();
        let mut i_order = 0usize;
        for (v_pieces, i_freq) in &v_corpus {
            for win in v_pieces.windows(2) {
                let entry = m_pairs
                    .entry((win[0].as_str(), win[1].as_str()))
                    .or_insert_with(|| {
                        i_order += 1;
                        (0, i_order)
                    });
                entry.0 += i_freq;
            }
        }

        let Some(((s_left, s_right), (i_count, _))) = m_pairs
            .into_iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
        else {
            break;
        };
        if i_count < MIN_MERGE_FREQUENCY {
            break;
        }

        let rule = MergeRule::new(s_left, s_right);
        for (v_pieces, _) in &mut v_corpus {
            Tokenizer::apply_merge(v_pieces, &rule);
        }
        v_rules.push(rule);
    }
    v_rules
}
