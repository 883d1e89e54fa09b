//! Per-locale phrase tables and the text normalisation they are matched with.
//!
//! All matching is done on normalised tokens: lowercase, typographic
//! apostrophes folded to `'`, surrounding punctuation stripped. Phrases are
//! normalised the same way when a table is compiled, so table authors can
//! write "That's all." or "that’s all" interchangeably.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GrievanceError, Result};

/// Words and phrases the dialogue rules look for, for one locale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhraseTable {
    pub locale: String,
    /// Single-word refusals accepted in the greeting turn ("no", "nothing").
    pub refusals: Vec<String>,
    /// Words that may pad a refusal without making it a statement
    /// ("no thanks", "nothing really").
    pub refusal_fillers: Vec<String>,
    /// Whole-utterance pleasantries that open the conversation.
    pub salutations: Vec<String>,
    /// High-confidence closings, matched near the end of an utterance.
    pub strong_exit_phrases: Vec<String>,
    /// Tokens that close the call when they end an utterance.
    pub farewells: Vec<String>,
    /// Closings only when they are the entire utterance.
    pub gratitude: Vec<String>,
    /// A leading token from this list marks a question.
    pub interrogatives: Vec<String>,
}

impl Default for PhraseTable {
    fn default() -> Self {
        Self::english()
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl PhraseTable {
    pub fn english() -> Self {
        Self {
            locale: "en".into(),
            refusals: owned(&["no", "nothing", "nope", "nah"]),
            refusal_fillers: owned(&[
                "really", "thanks", "thank", "you", "sorry", "not", "now", "right", "at",
                "all", "actually", "just", "um", "uh", "ok", "okay",
            ]),
            salutations: owned(&[
                "hello",
                "hi",
                "hey",
                "hello there",
                "hi there",
                "good morning",
                "good afternoon",
                "good evening",
                "yes",
                "yeah",
                "okay",
                "ok",
            ]),
            strong_exit_phrases: owned(&[
                "that's all",
                "that is all",
                "that's it",
                "that is it",
                "nothing else",
                "nothing more",
                "i'm done",
                "i am done",
                "have a good day",
                "thank you bye",
                "thanks bye",
            ]),
            farewells: owned(&["bye", "goodbye"]),
            gratitude: owned(&["thank you", "thanks", "thank you so much"]),
            interrogatives: owned(&["what", "how", "why", "who", "where", "when", "which"]),
        }
    }

    /// Romanised Hindi, with the English closings callers mix in.
    pub fn hindi() -> Self {
        Self {
            locale: "hi".into(),
            refusals: owned(&["nahi", "nahin", "no", "nothing"]),
            refusal_fillers: owned(&[
                "ji", "kuch", "bhi", "abhi", "sorry", "thanks", "really", "actually",
            ]),
            salutations: owned(&[
                "namaste",
                "namaskar",
                "haan",
                "haan ji",
                "ji",
                "hello",
                "hello ji",
                "hi",
            ]),
            strong_exit_phrases: owned(&[
                "bas itna hi",
                "bas itna",
                "bas yahi",
                "aur kuch nahi",
                "ho gaya",
                "that's all",
                "that's it",
            ]),
            farewells: owned(&["alvida", "bye", "goodbye"]),
            gratitude: owned(&["dhanyavaad", "dhanyavad", "shukriya", "thank you", "thanks"]),
            interrogatives: owned(&["kya", "kaise", "kyun", "kyon", "kaun", "kahan", "kab"]),
        }
    }

    /// Built-in table for a locale tag. Region suffixes are ignored
    /// (`en-IN` resolves to `en`).
    pub fn builtin(locale: &str) -> Option<Self> {
        let lang = locale
            .split(['-', '_'])
            .next()
            .unwrap_or(locale)
            .to_ascii_lowercase();
        match lang.as_str() {
            "en" => Some(Self::english()),
            "hi" => Some(Self::hindi()),
            _ => None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GrievanceError::Config(format!("invalid phrase table: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw).map_err(|e| match e {
            GrievanceError::Config(msg) => {
                GrievanceError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }
}

/// Lowercased tokens with surrounding punctuation removed. Tokens that are
/// pure punctuation are dropped.
pub fn normalize_tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|raw| {
            raw.to_lowercase()
                .replace(['\u{2019}', '\u{2018}'], "'")
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// A `PhraseTable` prepared for matching.
#[derive(Debug, Clone)]
pub(crate) struct CompiledPhrases {
    refusals: HashSet<String>,
    refusal_fillers: HashSet<String>,
    salutations: HashSet<String>,
    strong_exit: Vec<Vec<String>>,
    farewells: HashSet<String>,
    gratitude: HashSet<String>,
    interrogatives: HashSet<String>,
}

fn joined(items: &[String]) -> HashSet<String> {
    items
        .iter()
        .map(|p| normalize_tokens(p).join(" "))
        .filter(|p| !p.is_empty())
        .collect()
}

impl CompiledPhrases {
    pub(crate) fn compile(table: &PhraseTable) -> Self {
        Self {
            refusals: joined(&table.refusals),
            refusal_fillers: joined(&table.refusal_fillers),
            salutations: joined(&table.salutations),
            strong_exit: table
                .strong_exit_phrases
                .iter()
                .map(|p| normalize_tokens(p))
                .filter(|p| !p.is_empty())
                .collect(),
            farewells: joined(&table.farewells),
            gratitude: joined(&table.gratitude),
            interrogatives: joined(&table.interrogatives),
        }
    }

    /// Ends with `?` or opens with an interrogative word.
    pub(crate) fn is_question(&self, raw: &str, tokens: &[String]) -> bool {
        raw.trim_end().ends_with('?')
            || tokens
                .first()
                .is_some_and(|t| self.interrogatives.contains(t))
    }

    /// Short utterance made of refusal words and fillers only, with at
    /// least one refusal.
    pub(crate) fn is_refusal(&self, tokens: &[String], max_words: usize) -> bool {
        tokens.len() < max_words
            && tokens.iter().any(|t| self.refusals.contains(t))
            && tokens
                .iter()
                .all(|t| self.refusals.contains(t) || self.refusal_fillers.contains(t))
    }

    pub(crate) fn is_salutation(&self, tokens: &[String]) -> bool {
        !tokens.is_empty() && self.salutations.contains(&tokens.join(" "))
    }

    /// A strong phrase followed by at most `max_trailing` words.
    pub(crate) fn strong_exit(&self, tokens: &[String], max_trailing: usize) -> Option<String> {
        self.strong_exit.iter().find_map(|phrase| {
            let n = phrase.len();
            if n > tokens.len() {
                return None;
            }
            (0..=tokens.len() - n)
                .filter(|&i| tokens[i..i + n] == phrase[..])
                .any(|i| tokens.len() - (i + n) <= max_trailing)
                .then(|| phrase.join(" "))
        })
    }

    pub(crate) fn ends_with_farewell(&self, tokens: &[String]) -> bool {
        tokens.last().is_some_and(|t| self.farewells.contains(t))
    }

    pub(crate) fn is_solo_gratitude(&self, tokens: &[String]) -> bool {
        !tokens.is_empty() && self.gratitude.contains(&tokens.join(" "))
    }
}
