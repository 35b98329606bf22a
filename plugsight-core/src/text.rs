//! Text normalization for indexing and querying
//!
//! The same normalizer runs on both the document side (TF-IDF postings) and
//! the query side, so matching stays symmetric. It is pure: byte-equal inputs
//! yield byte-equal outputs, and a `Normalizer` can be shared across threads
//! without synchronization.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// The conventional English short stop list: articles, common prepositions,
/// auxiliary verbs, pronouns. Changing this list invalidates every posting,
/// which is why its fingerprint is persisted alongside the index.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// Suffixes stripped by the shallow stemmer, tried in order; at most one is
/// removed. Forgiving matching, not linguistics.
const SUFFIXES: &[&str] = &["ing", "ed", "es", "s", "ly", "er", "est"];

/// Output of one normalization pass. `stems` is aligned with `tokens`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub tokens: Vec<String>,
    pub stems: Vec<String>,
    /// Stop words dropped, reported for diagnostics
    pub stop_words_removed: usize,
}

/// Tokenizer + stemmer with a fixed stop-word set.
#[derive(Debug, Clone)]
pub struct Normalizer {
    stemming: bool,
    stop_words: HashSet<&'static str>,
}

impl Normalizer {
    pub fn new(stemming: bool) -> Self {
        Self {
            stemming,
            stop_words: STOP_WORDS.iter().copied().collect(),
        }
    }

    /// Lowercase, collapse runs of non-alphanumeric characters (hyphens
    /// included, so "auth-agent" indexes as two tokens) into single spaces,
    /// split, drop stop words, and stem what remains.
    pub fn normalize(&self, input: &str) -> Normalized {
        let mut cleaned = String::with_capacity(input.len());
        for ch in input.chars() {
            if ch.is_ascii_alphanumeric() {
                cleaned.push(ch.to_ascii_lowercase());
            } else {
                cleaned.push(' ');
            }
        }

        let mut tokens = Vec::new();
        let mut stems = Vec::new();
        let mut stop_words_removed = 0;

        for token in cleaned.split_whitespace() {
            if self.stop_words.contains(token) {
                stop_words_removed += 1;
                continue;
            }
            tokens.push(token.to_string());
            stems.push(if self.stemming {
                stem(token)
            } else {
                token.to_string()
            });
        }

        Normalized {
            tokens,
            stems,
            stop_words_removed,
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Strip the first matching suffix, at most once, keeping at least two
/// characters of stem.
pub fn stem(token: &str) -> String {
    for suffix in SUFFIXES {
        if token.len() > suffix.len() + 1 && token.ends_with(suffix) {
            return token[..token.len() - suffix.len()].to_string();
        }
    }
    token.to_string()
}

/// SHA-256 fingerprint of the stop-word set. Persisted with the index so a
/// list change forces a reindex instead of silently skewing postings.
pub fn stopword_fingerprint() -> String {
    let mut hasher = Sha256::new();
    hasher.update(STOP_WORDS.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_mixed_separators() {
        let norm = Normalizer::default();
        let out = norm.normalize("  Running-Services_and_More  ");
        assert_eq!(out.tokens, vec!["running", "services", "more"]);
        assert_eq!(out.stems, vec!["runn", "servic", "more"]);
        assert_eq!(out.stop_words_removed, 1);
    }

    #[test]
    fn test_tokenize_hyphenated_names() {
        let norm = Normalizer::default();
        let out = norm.normalize("auth-agent");
        assert_eq!(out.tokens, vec!["auth", "agent"]);
    }

    #[test]
    fn test_stem_suffix_order() {
        // "es" is tried before "s"
        assert_eq!(stem("services"), "servic");
        assert_eq!(stem("running"), "runn");
        assert_eq!(stem("walked"), "walk");
        assert_eq!(stem("quickly"), "quick");
        assert_eq!(stem("plugins"), "plugin");
        // at most one strip
        assert_eq!(stem("testings"), "testing");
    }

    #[test]
    fn test_stem_minimum_remainder() {
        // a strip must leave at least two characters behind
        assert_eq!(stem("es"), "es");
        assert_eq!(stem("as"), "as");
        assert_eq!(stem("gas"), "ga");
        assert_eq!(stem("more"), "more");
    }

    #[test]
    fn test_stemming_disabled() {
        let norm = Normalizer::new(false);
        let out = norm.normalize("running services");
        assert_eq!(out.stems, vec!["running", "services"]);
    }

    #[test]
    fn test_determinism() {
        let norm = Normalizer::default();
        let input = "Kubernetes: The hard way (3rd ed.)";
        assert_eq!(norm.normalize(input), norm.normalize(input));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(stopword_fingerprint(), stopword_fingerprint());
        assert_eq!(stopword_fingerprint().len(), 64);
    }
}
