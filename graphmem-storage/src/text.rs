// Copyright 2025 Graphmem (https://github.com/graphmem)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Query tokenisation and accent folding for graph search.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

static WORD_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{L}+").expect("word pattern"));

/// Tokens extracted from a search query, in raw (lowercased) and
/// accent-folded forms. The two vectors are index-aligned.
#[derive(Debug, Clone, Default)]
pub struct QueryTokens {
    pub raw: Vec<String>,
    pub normalized: Vec<String>,
}

impl QueryTokens {
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Raw and normalized forms, deduplicated, for CONTAINS matching.
    pub fn all_forms(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for token in self.raw.iter().chain(self.normalized.iter()) {
            if seen.insert(token.clone()) {
                out.push(token.clone());
            }
        }
        out
    }
}

/// Lowercase, NFKD-decompose and strip combining marks: `é→e`, `ç→c`, `ü→u`.
pub fn fold(text: &str) -> String {
    text.to_lowercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Tokenise a query: Unicode letter runs, lowercased; stopwords and tokens
/// shorter than two characters are dropped.
pub fn tokenize(query: &str, stopwords: &HashSet<String>) -> QueryTokens {
    let mut tokens = QueryTokens::default();

    for m in WORD_RUNS.find_iter(query) {
        let raw = m.as_str().to_lowercase();
        if raw.chars().count() < 2 {
            continue;
        }
        let normalized = fold(&raw);
        if stopwords.contains(&raw) || stopwords.contains(&normalized) {
            continue;
        }
        tokens.raw.push(raw);
        tokens.normalized.push(normalized);
    }

    tokens
}

/// Escape Lucene query syntax so tokens are treated as literal text.
pub fn escape_lucene(text: &str) -> String {
    let special: &[char] = &[
        '+', '-', '&', '|', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', '*', '?', ':',
        '\\', '/',
    ];
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Build the stopword set for the configured languages.
pub fn build_stopwords(langs: &[String]) -> HashSet<String> {
    let mut set = HashSet::new();
    for lang in langs {
        let language = match lang.to_lowercase().as_str() {
            "french" | "fr" => stop_words::LANGUAGE::French,
            "english" | "en" => stop_words::LANGUAGE::English,
            "german" | "de" => stop_words::LANGUAGE::German,
            "spanish" | "es" => stop_words::LANGUAGE::Spanish,
            "italian" | "it" => stop_words::LANGUAGE::Italian,
            other => {
                tracing::warn!(language = %other, "Unknown stopword language, skipping");
                continue;
            }
        };
        set.extend(stop_words::get(language));
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fr_en() -> HashSet<String> {
        build_stopwords(&["french".to_string(), "english".to_string()])
    }

    #[test]
    fn folding_strips_accents() {
        assert_eq!(fold("Réversibilité"), "reversibilite");
        assert_eq!(fold("Çà et là"), "ca et la");
        assert_eq!(fold("Über"), "uber");
    }

    #[test]
    fn tokenize_drops_stopwords_and_short_tokens() {
        let tokens = tokenize("Quelles sont les conditions de résiliation ?", &fr_en());
        assert!(tokens.raw.contains(&"conditions".to_string()));
        assert!(tokens.raw.contains(&"résiliation".to_string()));
        assert!(tokens.normalized.contains(&"resiliation".to_string()));
        assert!(!tokens.raw.contains(&"les".to_string()));
        assert!(!tokens.raw.contains(&"de".to_string()));
    }

    #[test]
    fn tokenize_keeps_letters_only() {
        let tokens = tokenize("contrat 2024-05-01 №42", &HashSet::new());
        assert_eq!(tokens.raw, vec!["contrat".to_string()]);
    }

    #[test]
    fn folded_and_unfolded_queries_agree() {
        let stopwords = fr_en();
        let folded = tokenize("reversibilite", &stopwords);
        let unfolded = tokenize("réversibilité", &stopwords);
        assert_eq!(folded.normalized, unfolded.normalized);
    }

    #[test]
    fn lucene_escaping_covers_operators() {
        assert_eq!(escape_lucene("a+b"), "a\\+b");
        assert_eq!(escape_lucene("quote\"me"), "quote\\\"me");
        assert_eq!(escape_lucene("plain"), "plain");
    }

    #[test]
    fn all_forms_dedups() {
        let tokens = tokenize("contrat contrat résiliation", &HashSet::new());
        let forms = tokens.all_forms();
        let unique: HashSet<_> = forms.iter().collect();
        assert_eq!(unique.len(), forms.len());
        assert!(forms.contains(&"resiliation".to_string()));
    }
}
