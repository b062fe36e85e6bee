// normalize.rs
// ============================================================================
// Note:     Text normalization in front of the tokenizer: Unicode NFC,
//           lowercase, numeric scale mentions and emoticons rewritten into
//           single synthetic tokens, whitespace collapsed. The function is
//           pure and idempotent.
// ============================================================================

#![forbid(unsafe_code)]

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use unicode_normalization::UnicodeNormalization;

/// Emoji presentation selector; dropped so that `❤️` and `❤` collapse.
const VARIATION_SELECTOR_16: char = '\u{FE0F}';

pub struct Emoticon {
    pub placeholder: &'static str,
    pub display: &'static str,
    /// Lowercase surface forms. No form is a substring of another form.
    pub forms: &'static [&'static str],
}

pub const EMOTICONS: &[Emoticon] = &[
    Emoticon { placeholder: "<emo_happy>", display: "🙂", forms: &[":-)", ":)", "🙂", "😊"] },
    Emoticon { placeholder: "<emo_laugh>", display: "😄", forms: &[":-d", ":d", "😄", "😀"] },
    Emoticon { placeholder: "<emo_sad>", display: "🙁", forms: &[":-(", ":(", "🙁", "😞"] },
    Emoticon { placeholder: "<emo_cry>", display: "😢", forms: &[":'-(", ":'(", "😢", "😭"] },
    Emoticon { placeholder: "<emo_wink>", display: "😉", forms: &[";-)", ";)", "😉"] },
    Emoticon { placeholder: "<emo_heart>", display: "❤️", forms: &["<3", "❤"] },
    Emoticon { placeholder: "<emo_neutral>", display: "😐", forms: &[":-|", ":|", "😐"] },
    Emoticon { placeholder: "<emo_angry>", display: "😠", forms: &["😠", "😡"] },
];

lazy_static! {
    static ref FORM_TO_PLACEHOLDER: HashMap<&'static str, &'static str> = EMOTICONS
        .iter()
        .flat_map(|e| e.forms.iter().map(move |f| (*f, e.placeholder)))
        .collect();
    static ref EMOTICON_RE: Regex = {
        let v_alts: Vec<String> = EMOTICONS
            .iter()
            .flat_map(|e| e.forms.iter().map(|f| regex::escape(f)))
            .collect();
        Regex::new(&v_alts.join("|")).expect("emoticon pattern")
    };
    static ref STRESS_RE: Regex =
        Regex::new(r"\bstress[\s-]*level\s*:?\s*(10|[0-9])(?:\s*/\s*10)?\b").expect("stress pattern");
    static ref SCALE_SLASH_RE: Regex =
        Regex::new(r"\b(10|[0-9])\s*/\s*10\b").expect("scale pattern");
    static ref SCALE_WORD_RE: Regex =
        Regex::new(r"\b(10|[0-9])\s+(?:von|of|out\s+of)\s+10\b").expect("scale word pattern");
    static ref SYNTHETIC_RE: Regex =
        Regex::new(r"^<(scale|stress)_(10|[0-9])>$").expect("synthetic pattern");
}

pub fn normalize(s_text: &str) -> String {
    let s_lower: String = s_text
        .to_lowercase()
        .nfc()
        .filter(|c| *c != VARIATION_SELECTOR_16)
        .collect();

    let s_stress = STRESS_RE.replace_all(&s_lower, |caps: &Captures| format!(" <stress_{}> ", &caps[1]));
    let s_scale = SCALE_SLASH_RE.replace_all(&s_stress, |caps: &Captures| format!(" <scale_{}> ", &caps[1]));
    let s_scale = SCALE_WORD_RE.replace_all(&s_scale, |caps: &Captures| format!(" <scale_{}> ", &caps[1]));
    let s_emo = replace_emoticons(&s_scale);

    s_emo.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A form ending in a letter or digit (`:d`, `<3`) only counts when no
/// letter or digit follows it, so "status:done" and "<30" stay text.
fn replace_emoticons(s_text: &str) -> String {
    let mut s_out = String::with_capacity(s_text.len());
    let mut i_last = 0usize;
    for m in EMOTICON_RE.find_iter(s_text) {
        let s_form = m.as_str();
        let b_word_end = s_form.chars().last().is_some_and(char::is_alphanumeric);
        let b_glued = s_text[m.end()..].chars().next().is_some_and(char::is_alphanumeric);
        if b_word_end && b_glued {
            continue;
        }
        let Some(s_placeholder) = FORM_TO_PLACEHOLDER.get(s_form) else {
            continue;
        };
        s_out.push_str(&s_text[i_last..m.start()]);
        s_out.push(' ');
        s_out.push_str(s_placeholder);
        s_out.push(' ');
        i_last = m.end();
    }
    s_out.push_str(&s_text[i_last..]);
    s_out
}

/// True for every synthetic token `normalize` can produce.
pub fn is_placeholder(s_token: &str) -> bool {
    EMOTICONS.iter().any(|e| e.placeholder == s_token) || SYNTHETIC_RE.is_match(s_token)
}

/// Display form of a synthetic token, `None` for ordinary tokens.
pub fn display_form(s_token: &str) -> Option<String> {
    if let Some(emo) = EMOTICONS.iter().find(|e| e.placeholder == s_token) {
        return Some(emo.display.to_string());
    }
    let caps = SYNTHETIC_RE.captures(s_token)?;
    match &caps[1] {
        "scale" => Some(format!("{}/10", &caps[2])),
        _ => Some(format!("stress level {}", &caps[2])),
    }
}

pub fn emoticon_placeholders() -> impl Iterator<Item = &'static str> {
    EMOTICONS.iter().map(|e| e.placeholder)
}

/// Every synthetic token: emoticons first, then scale and stress levels 0..=10.
pub fn placeholder_tokens() -> Vec<String> {
    emoticon_placeholders()
        .map(str::to_string)
        .chain((0..=10).map(|i| format!("<scale_{i}>")))
        .chain((0..=10).map(|i| format!("<stress_{i}>")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_collapses_whitespace() {
        assert_eq!(normalize("  Mir geht es   SCHLECHT\n\theute "), "mir geht es schlecht heute");
    }

    #[test]
    fn emoticons_become_placeholders() {
        assert_eq!(normalize("gut :)"), "gut <emo_happy>");
        assert_eq!(normalize("gut:-)"), "gut <emo_happy>");
        assert_eq!(normalize("müde :'( und :("), "müde <emo_cry> und <emo_sad>");
        assert_eq!(normalize("Danke <3"), "danke <emo_heart>");
        assert_eq!(normalize("Danke ❤️"), "danke <emo_heart>");
        assert_eq!(normalize("haha :D"), "haha <emo_laugh>");
        assert_eq!(normalize("super :D!"), "super <emo_laugh> !");
    }

    #[test]
    fn letter_ending_emoticons_need_a_boundary() {
        assert_eq!(normalize("status:done"), "status:done");
        assert_eq!(normalize("<30 minuten"), "<30 minuten");
        assert_eq!(normalize("ok:D"), "ok <emo_laugh>");
        assert_eq!(normalize("gut:)heute"), "gut <emo_happy> heute");
        for s in ["status:done", "<30 minuten", "nach 2:d3"] {
            let s_once = normalize(s);
            assert_eq!(normalize(&s_once), s_once, "input: {s:?}");
        }
    }

    #[test]
    fn numeric_scales_become_single_tokens() {
        assert_eq!(normalize("Heute 7/10"), "heute <scale_7>");
        assert_eq!(normalize("so 3 von 10 würde ich sagen"), "so <scale_3> würde ich sagen");
        assert_eq!(normalize("maybe 10 out of 10"), "maybe <scale_10>");
        assert_eq!(normalize("Stress level 8"), "<stress_8>");
        assert_eq!(normalize("mein stresslevel: 9/10"), "mein <stress_9>");
    }

    #[test]
    fn normalize_is_idempotent() {
        let v_samples = [
            "Ich bin MÜDE :( und gestresst, Stress-Level 9!!",
            "7/10   heute, gestern 3 von 10 ;-) <3",
            "  Café  ❤️ :| 😐 ",
            "",
        ];
        for s in v_samples {
            let s_once = normalize(s);
            assert_eq!(normalize(&s_once), s_once, "input: {s:?}");
        }
    }

    #[test]
    fn display_forms_round_trip_through_normalize() {
        for s_placeholder in emoticon_placeholders() {
            let s_display = display_form(s_placeholder).expect("display");
            assert_eq!(normalize(&s_display), s_placeholder);
        }
        assert_eq!(display_form("<scale_7>").as_deref(), Some("7/10"));
        assert_eq!(normalize("7/10"), "<scale_7>");
        assert_eq!(display_form("<stress_4>").as_deref(), Some("stress level 4"));
        assert_eq!(display_form("gut"), None);
    }

    #[test]
    fn placeholder_detection() {
        assert!(is_placeholder("<emo_sad>"));
        assert!(is_placeholder("<scale_10>"));
        assert!(!is_placeholder("<scale_11>"));
        assert!(!is_placeholder("<user>"));
        let v_all = placeholder_tokens();
        assert_eq!(v_all.len(), EMOTICONS.len() + 22);
        assert!(v_all.iter().all(|s| is_placeholder(s)));
    }
}
