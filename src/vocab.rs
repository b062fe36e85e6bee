// vocab.rs
// ============================================================================
// Note:     Bidirectional token <-> id mapping with a reserved block of special
//           tokens at the low ids and the curated domain vocabulary used to
//           seed the id space during training.
// ============================================================================

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const S_PAD: &str = "<pad>";
pub const S_UNK: &str = "<unk>";
pub const S_BOS: &str = "<bos>";
pub const S_EOS: &str = "<eos>";
pub const S_MOOD: &str = "<mood>";
pub const S_STRESS: &str = "<stress>";
pub const S_EMOTION: &str = "<emotion>";
pub const S_USER: &str = "<user>";
pub const S_ASSISTANT: &str = "<assistant>";
pub const S_CONTEXT: &str = "<context>";

/// Reserved block in id order. The first four entries are mandatory.
pub const SPECIAL_TOKENS: [&str; 10] = [
    S_PAD, S_UNK, S_BOS, S_EOS, S_MOOD, S_STRESS, S_EMOTION, S_USER, S_ASSISTANT, S_CONTEXT,
];
pub const MIN_SPECIAL_TOKENS: usize = 4;

pub const PAD_ID: usize = 0;
pub const UNK_ID: usize = 1;
pub const BOS_ID: usize = 2;
pub const EOS_ID: usize = 3;

/// Curated words of the emotional / mental-health domain (German first, then
/// the English terms that show up in mixed-language conversations).
pub const DEFAULT_DOMAIN_WORDS: &[&str] = &[
    "gut", "schlecht", "traurig", "müde", "angst", "ängstlich", "stress", "gestresst",
    "einsam", "wütend", "wut", "froh", "glücklich", "überfordert", "erschöpft", "ruhig",
    "entspannt", "panik", "sorgen", "schlaf", "schlafen", "gefühl", "gefühle", "stimmung",
    "niedergeschlagen", "nervös", "hoffnung", "hilfe", "unterstützung", "atmen",
    "achtsamkeit", "therapie", "freude", "dankbar", "verzweifelt", "hoffnungslos",
    "zuversichtlich", "gelassen", "unruhig", "kraftlos", "motiviert", "belastet",
    "happy", "sad", "tired", "anxious", "lonely", "stressed", "overwhelmed", "calm",
];

#[derive(Clone, Debug)]
pub struct Vocabulary {
    max_size: usize,
    special_count: usize,
    token_to_id: HashMap<String, usize>,
    id_to_token: Vec<String>,
}

impl Vocabulary {
    /// Creates a vocabulary holding only the first `special_count` special tokens.
    pub fn with_specials(max_size: usize, special_count: usize) -> EngineResult<Self> {
        if !(MIN_SPECIAL_TOKENS..=SPECIAL_TOKENS.len()).contains(&special_count) {
            return Err(EngineError::InvalidConfig(format!(
                "special token count must be within {}..={}, got {}",
                MIN_SPECIAL_TOKENS,
                SPECIAL_TOKENS.len(),
                special_count
            )));
        }
        if max_size < special_count {
            return Err(EngineError::VocabMismatch {
                context: "special token block",
                expected: special_count,
                found: max_size,
            });
        }
        let mut vocab = Self {
            max_size,
            special_count,
            token_to_id: HashMap::with_capacity(max_size),
            id_to_token: Vec::with_capacity(max_size),
        };
        for s_tok in SPECIAL_TOKENS.iter().take(special_count) {
            vocab.push(s_tok);
        }
        Ok(vocab)
    }

    /// Rebuilds a vocabulary from a persisted token -> id map and checks the
    /// invariants: dense ids from 0, bounded by `max_size`, specials first.
    pub fn from_entries(max_size: usize, entries: &BTreeMap<String, usize>) -> EngineResult<Self> {
        if entries.len() > max_size {
            return Err(EngineError::VocabMismatch {
                context: "vocabulary file",
                expected: max_size,
                found: entries.len(),
            });
        }
        let mut v_slots: Vec<Option<String>> = vec![None; entries.len()];
        for (s_tok, &i_id) in entries {
            match v_slots.get_mut(i_id) {
                Some(slot) if slot.is_none() => *slot = Some(s_tok.clone()),
                _ => {
                    return Err(EngineError::InvalidConfig(format!(
                        "vocabulary id {i_id} for '{s_tok}' is duplicated or not dense"
                    )))
                }
            }
        }
        let id_to_token: Vec<String> = v_slots.into_iter().flatten().collect();

        let special_count = id_to_token
            .iter()
            .zip(SPECIAL_TOKENS.iter())
            .take_while(|(a, b)| a.as_str() == **b)
            .count();
        if special_count < MIN_SPECIAL_TOKENS {
            return Err(EngineError::MissingSpecialToken(SPECIAL_TOKENS[special_count]));
        }

        let token_to_id = id_to_token
            .iter()
            .enumerate()
            .map(|(i_id, s_tok)| (s_tok.clone(), i_id))
            .collect();
        Ok(Self {
            max_size,
            special_count,
            token_to_id,
            id_to_token,
        })
    }

    /// Adds a token if missing. Returns `None` once the vocabulary is full.
    pub fn push(&mut self, s_token: &str) -> Option<usize> {
        if let Some(i_id) = self.id(s_token) {
            return Some(i_id);
        }
        if self.is_full() {
            return None;
        }
        let i_new = self.id_to_token.len();
        self.id_to_token.push(s_token.to_string());
        self.token_to_id.insert(s_token.to_string(), i_new);
        Some(i_new)
    }

    pub fn id(&self, s_token: &str) -> Option<usize> {
        self.token_to_id.get(s_token).copied()
    }

    pub fn token(&self, i_id: usize) -> Option<&str> {
        self.id_to_token.get(i_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.id_to_token.len() >= self.max_size
    }

    /// Configured upper bound, also the row count of the embedding table.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn special_count(&self) -> usize {
        self.special_count
    }

    pub fn is_special(&self, s_token: &str) -> bool {
        SPECIAL_TOKENS[..self.special_count].contains(&s_token)
    }

    /// Id of an optional marker token (`<mood>`, `<user>` ...) if reserved.
    pub fn special_id(&self, s_token: &str) -> Option<usize> {
        SPECIAL_TOKENS[..self.special_count]
            .iter()
            .position(|s| *s == s_token)
    }

    pub fn entries(&self) -> BTreeMap<String, usize> {
        self.token_to_id
            .iter()
            .map(|(s_tok, &i_id)| (s_tok.clone(), i_id))
            .collect()
    }

    /// Drops the extension block, keeping the reserved special tokens.
    pub(crate) fn reset_extension(&mut self) {
        for s_tok in self.id_to_token.drain(self.special_count..) {
            self.token_to_id.remove(&s_tok);
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct VocabFile {
    pub vocab_size: usize,
    pub tokens: BTreeMap<String, usize>,
}

impl Vocabulary {
    pub fn save<P: AsRef<Path>>(&self, p_path: P) -> EngineResult<()> {
        let file = VocabFile {
            vocab_size: self.max_size,
            tokens: self.entries(),
        };
        let mut w = BufWriter::new(File::create(p_path.as_ref())?);
        serde_json::to_writer_pretty(&mut w, &file)?;
        w.flush()?;
        Ok(())
    }

    /// Absence of the vocabulary file is fatal.
    pub fn load<P: AsRef<Path>>(p_path: P) -> EngineResult<Self> {
        let p_path = p_path.as_ref();
        if !p_path.exists() {
            return Err(EngineError::MissingVocabulary(p_path.display().to_string()));
        }
        let s_json = fs::read_to_string(p_path)?;
        let file: VocabFile = serde_json::from_str(&s_json)?;
        Self::from_entries(file.vocab_size, &file.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specials_take_the_low_ids() {
        let vocab = Vocabulary::with_specials(32, 10).expect("vocab");
        assert_eq!(vocab.id(S_PAD), Some(PAD_ID));
        assert_eq!(vocab.id(S_UNK), Some(UNK_ID));
        assert_eq!(vocab.id(S_BOS), Some(BOS_ID));
        assert_eq!(vocab.id(S_EOS), Some(EOS_ID));
        assert_eq!(vocab.id(S_CONTEXT), Some(9));
        assert_eq!(vocab.special_id(S_USER), Some(7));
    }

    #[test]
    fn short_special_block_hides_markers() {
        let vocab = Vocabulary::with_specials(10, 4).expect("vocab");
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.special_id(S_MOOD), None);
        assert!(!vocab.is_special(S_USER));
    }

    #[test]
    fn push_stops_at_max_size() {
        let mut vocab = Vocabulary::with_specials(5, 4).expect("vocab");
        assert_eq!(vocab.push("gut"), Some(4));
        assert_eq!(vocab.push("gut"), Some(4));
        assert_eq!(vocab.push("schlecht"), None);
        assert!(vocab.is_full());
    }

    #[test]
    fn from_entries_rejects_gaps() {
        let mut entries = BTreeMap::new();
        for (i, s) in SPECIAL_TOKENS.iter().take(4).enumerate() {
            entries.insert(s.to_string(), i);
        }
        entries.insert("gut".into(), 7);
        assert!(Vocabulary::from_entries(16, &entries).is_err());
    }

    #[test]
    fn from_entries_requires_pad_first() {
        let mut entries = BTreeMap::new();
        entries.insert(S_UNK.to_string(), 0);
        entries.insert(S_PAD.to_string(), 1);
        entries.insert(S_BOS.to_string(), 2);
        entries.insert(S_EOS.to_string(), 3);
        assert!(matches!(
            Vocabulary::from_entries(8, &entries),
            Err(EngineError::MissingSpecialToken(S_PAD))
        ));
    }

    #[test]
    fn save_and_load_keep_ids() {
        let dir = tempfile::tempdir().expect("tmp");
        let p_file = dir.path().join("vocab.json");
        let mut vocab = Vocabulary::with_specials(20, 6).expect("vocab");
        vocab.push("müde");
        vocab.save(&p_file).expect("save");

        let loaded = Vocabulary::load(&p_file).expect("load");
        assert_eq!(loaded.max_size(), 20);
        assert_eq!(loaded.special_count(), 6);
        assert_eq!(loaded.id("müde"), Some(6));
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tmp");
        let err = Vocabulary::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, EngineError::MissingVocabulary(_)));
    }
}
