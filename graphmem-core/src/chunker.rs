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

//! Semantic chunker.
//!
//! Splits plain text into retrieval chunks along the text's natural
//! boundaries, in three passes:
//!
//! 1. DETECT - structural sections (numbered articles, Markdown headers,
//!    hierarchical numbering, uppercase titles, paragraph fallback).
//! 2. SPLIT - sentences within each section; the sentence is the atomic
//!    unit and is never cut.
//! 3. MERGE - greedy packing of sentences into chunks of the target token
//!    size, with a sentence-boundary overlap window between adjacent
//!    chunks. If the overlap plus the next sentence would exceed the
//!    target, the overlap is discarded rather than iterated; this bounds
//!    the chunk count.

use crate::types::Chunk;
use regex::Regex;
use std::sync::LazyLock;

// Numbered legal articles: "Article 1", "Article 23.2", "ARTICLE 1er".
static ARTICLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:ARTICLE|Article|article)\s+(\d+(?:\.\d+)*(?:\s*(?:er|ème|eme))?)\s*[:.\s–—-]")
        .expect("article pattern")
});

// Hierarchical numbering: "1.1", "1.1.1", "23.2 –".
static NUMBERED_SECTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\d+(?:\.\d+)+)\s*[:.\s–—-]").expect("numbered pattern"));

// Markdown headers: "## Title".
static MARKDOWN_HEADER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").expect("header pattern"));

// Uppercase titles (long enough to not be an acronym).
static UPPERCASE_TITLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([A-ZÀÂÄÉÈÊËÏÎÔÙÛÜŸÇ][A-ZÀÂÄÉÈÊËÏÎÔÙÛÜŸÇ\s,'-]{15,})$")
        .expect("uppercase pattern")
});

static LIST_ITEM_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-•●▪]\s+|\d+[.)]\s+|[a-z][.)]\s+)").expect("list pattern"));

/// Rough tokenization: about one token per four characters in French prose.
fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug, Clone)]
struct TextSection {
    title: String,
    content: String,
    level: usize,
    article_number: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct SentenceGroup {
    sentences: Vec<String>,
    section_title: Option<String>,
    article_number: Option<String>,
    heading_hierarchy: Vec<String>,
}

impl SentenceGroup {
    fn token_estimate(&self) -> usize {
        estimate_tokens(&self.sentences.join(" "))
    }
}

pub struct SemanticChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl SemanticChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    /// Split a document into retrieval chunks with semantic metadata.
    pub fn chunk_document(&self, text: &str, filename: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let text = text.replace("\r\n", "\n").replace('\r', "\n");

        let sections = self.detect_sections(&text);
        let groups = self.sections_to_sentence_groups(&sections);
        let raw_chunks = self.merge_into_chunks(&groups);

        let total = raw_chunks.len();
        let chunks: Vec<Chunk> = raw_chunks
            .into_iter()
            .enumerate()
            .map(|(i, (group, chunk_text))| {
                let trimmed = chunk_text.trim().to_string();
                Chunk {
                    char_count: trimmed.chars().count(),
                    token_count: estimate_tokens(&trimmed),
                    text: trimmed,
                    sequence: i,
                    total_chunks: total,
                    filename: Some(filename.to_string()),
                    section_title: group.section_title,
                    article_number: group.article_number,
                    section_path: group.heading_hierarchy,
                    ..Default::default()
                }
            })
            .collect();

        tracing::debug!(
            filename = %filename,
            sections = sections.len(),
            chunks = chunks.len(),
            target_tokens = self.chunk_size,
            overlap_tokens = self.chunk_overlap,
            "Chunked document"
        );

        chunks
    }

    // =========================================================================
    // Pass 1: structure detection
    // =========================================================================

    fn detect_sections(&self, text: &str) -> Vec<TextSection> {
        let by_articles = self.detect_by_pattern(text, &ARTICLE_PATTERN, true, "Préambule");
        if by_articles.len() > 1 {
            return by_articles;
        }

        let by_headers = self.detect_markdown_headers(text);
        if by_headers.len() > 1 {
            return by_headers;
        }

        let by_numbering = self.detect_by_pattern(text, &NUMBERED_SECTION_PATTERN, true, "Introduction");
        if by_numbering.len() > 1 {
            return by_numbering;
        }

        let by_titles = self.detect_by_pattern(text, &UPPERCASE_TITLE_PATTERN, false, "Introduction");
        if by_titles.len() > 1 {
            return by_titles;
        }

        self.detect_paragraphs(text)
    }

    /// Generic splitter on a heading regex. `numbered` selects whether the
    /// first capture group is an article/section number.
    fn detect_by_pattern(
        &self,
        text: &str,
        pattern: &Regex,
        numbered: bool,
        preamble_title: &str,
    ) -> Vec<TextSection> {
        let matches: Vec<_> = pattern.find_iter(text).collect();
        if matches.is_empty() {
            return Vec::new();
        }

        let mut sections = Vec::new();

        if matches[0].start() > 0 {
            let preamble = text[..matches[0].start()].trim();
            if !preamble.is_empty() {
                sections.push(TextSection {
                    title: preamble_title.to_string(),
                    content: preamble.to_string(),
                    level: 0,
                    article_number: None,
                });
            }
        }

        for (i, m) in matches.iter().enumerate() {
            let start = m.start();
            let end = matches
                .get(i + 1)
                .map(|next| next.start())
                .unwrap_or(text.len());

            let article_number = if numbered {
                pattern
                    .captures(&text[start..end])
                    .and_then(|c| c.get(1))
                    .map(|g| g.as_str().trim().to_string())
            } else {
                None
            };

            let level = article_number
                .as_deref()
                .map(|n| n.matches('.').count())
                .unwrap_or(0);

            // The section title is its first line.
            let first_line_end = text[start..end]
                .find('\n')
                .map(|off| start + off)
                .unwrap_or(end);
            let title = text[start..first_line_end].trim().to_string();
            let content = text[start..end].trim().to_string();

            sections.push(TextSection {
                title,
                content,
                level,
                article_number,
            });
        }

        sections
    }

    fn detect_markdown_headers(&self, text: &str) -> Vec<TextSection> {
        let matches: Vec<_> = MARKDOWN_HEADER_PATTERN.captures_iter(text).collect();
        if matches.is_empty() {
            return Vec::new();
        }

        let mut sections = Vec::new();

        let first_start = matches[0].get(0).map(|m| m.start()).unwrap_or(0);
        if first_start > 0 {
            let preamble = text[..first_start].trim();
            if !preamble.is_empty() {
                sections.push(TextSection {
                    title: "Introduction".to_string(),
                    content: preamble.to_string(),
                    level: 0,
                    article_number: None,
                });
            }
        }

        for (i, caps) in matches.iter().enumerate() {
            let whole = caps.get(0).expect("match");
            let hashes = caps.get(1).map(|g| g.as_str().len()).unwrap_or(1);
            let title = caps.get(2).map(|g| g.as_str().trim()).unwrap_or_default();
            let start = whole.start();
            let end = matches
                .get(i + 1)
                .and_then(|c| c.get(0))
                .map(|m| m.start())
                .unwrap_or(text.len());

            sections.push(TextSection {
                title: title.to_string(),
                content: text[start..end].trim().to_string(),
                level: hashes.saturating_sub(1),
                article_number: None,
            });
        }

        sections
    }

    fn detect_paragraphs(&self, text: &str) -> Vec<TextSection> {
        text.split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|para| {
                let first_line: String = para
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .chars()
                    .take(80)
                    .collect();
                TextSection {
                    title: first_line,
                    content: para.to_string(),
                    level: 0,
                    article_number: None,
                }
            })
            .collect()
    }

    // =========================================================================
    // Pass 2: sections to sentence groups
    // =========================================================================

    fn sections_to_sentence_groups(&self, sections: &[TextSection]) -> Vec<SentenceGroup> {
        let mut groups = Vec::new();
        let mut heading_stack: Vec<String> = Vec::new();

        for section in sections {
            while heading_stack.len() > section.level {
                heading_stack.pop();
            }
            heading_stack.push(section.title.clone());

            let sentences = split_into_sentences(&section.content);
            if !sentences.is_empty() {
                groups.push(SentenceGroup {
                    sentences,
                    section_title: Some(section.title.clone()),
                    article_number: section.article_number.clone(),
                    heading_hierarchy: heading_stack.clone(),
                });
            }
        }

        groups
    }

    // =========================================================================
    // Pass 3: sentence groups to chunks with overlap
    // =========================================================================

    fn merge_into_chunks(&self, groups: &[SentenceGroup]) -> Vec<(SentenceGroup, String)> {
        let mut chunks = Vec::new();

        for group in groups {
            if group.token_estimate() <= self.chunk_size {
                // A section that fits stays intact, keeping its semantic unity.
                let text = format_chunk_with_context(group);
                chunks.push((group.clone(), text));
            } else {
                chunks.extend(self.split_group_with_overlap(group));
            }
        }

        chunks
    }

    fn split_group_with_overlap(&self, group: &SentenceGroup) -> Vec<(SentenceGroup, String)> {
        let mut chunks = Vec::new();
        let sentences = &group.sentences;
        if sentences.is_empty() {
            return chunks;
        }

        let context_prefix = if let Some(article) = &group.article_number {
            format!("[Article {}] ", article)
        } else if let Some(title) = &group.section_title {
            let truncated: String = title.chars().take(60).collect();
            format!("[{}] ", truncated)
        } else {
            String::new()
        };
        let prefix_tokens = estimate_tokens(&context_prefix);

        let subgroup = |sentences: &[String]| SentenceGroup {
            sentences: sentences.to_vec(),
            section_title: group.section_title.clone(),
            article_number: group.article_number.clone(),
            heading_hierarchy: group.heading_hierarchy.clone(),
        };

        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;

        let mut i = 0;
        while i < sentences.len() {
            let sentence = &sentences[i];
            let sentence_tokens = estimate_tokens(sentence);

            // A lone sentence longer than the target is emitted as-is.
            if current.is_empty() && sentence_tokens + prefix_tokens > self.chunk_size {
                let text = format!("{}{}", context_prefix, sentence);
                chunks.push((subgroup(std::slice::from_ref(sentence)), text));
                i += 1;
                continue;
            }

            if current_tokens + sentence_tokens + prefix_tokens <= self.chunk_size {
                current.push(sentence.clone());
                current_tokens += sentence_tokens;
                i += 1;
            } else {
                let text = format!("{}{}", context_prefix, current.join(" "));
                chunks.push((subgroup(&current), text));

                let overlap = self.compute_overlap(&current);
                let overlap_tokens: usize = overlap.iter().map(|s| estimate_tokens(s)).sum();

                // Termination invariant: if carrying the overlap would push the
                // next sentence past the target, drop the overlap instead of
                // iterating on it.
                if overlap_tokens + sentence_tokens + prefix_tokens > self.chunk_size {
                    current = Vec::new();
                    current_tokens = 0;
                } else {
                    current = overlap;
                    current_tokens = overlap_tokens;
                }
            }
        }

        if !current.is_empty() {
            let text = format!("{}{}", context_prefix, current.join(" "));
            chunks.push((subgroup(&current), text));
        }

        chunks
    }

    /// Last sentences of the previous chunk, up to `chunk_overlap` tokens,
    /// never cutting a sentence.
    fn compute_overlap(&self, sentences: &[String]) -> Vec<String> {
        if sentences.is_empty() || self.chunk_overlap == 0 {
            return Vec::new();
        }

        let mut overlap = Vec::new();
        let mut overlap_tokens = 0usize;

        for sentence in sentences.iter().rev() {
            let tokens = estimate_tokens(sentence);
            if overlap_tokens + tokens > self.chunk_overlap {
                break;
            }
            overlap.insert(0, sentence.clone());
            overlap_tokens += tokens;
        }

        overlap
    }
}

/// Prefix a chunk with its hierarchical context, e.g.
/// `[Article 23.2 - Réversibilité] Le prestataire s'engage...`.
fn format_chunk_with_context(group: &SentenceGroup) -> String {
    let mut parts = Vec::new();

    if let Some(article) = &group.article_number {
        parts.push(format!("Article {}", article));
    }

    if let Some(title) = &group.section_title {
        let redundant = group
            .article_number
            .as_ref()
            .map(|a| title == &format!("Article {}", a))
            .unwrap_or(false);
        if !redundant {
            let clean: String = if title.chars().count() > 80 {
                let mut t: String = title.chars().take(77).collect();
                t.push_str("...");
                t
            } else {
                title.clone()
            };
            parts.push(clean);
        }
    }

    let prefix = if parts.is_empty() {
        String::new()
    } else {
        format!("[{}] ", parts.join(" - "))
    };

    format!("{}{}", prefix, group.sentences.join(" "))
}

/// Split a section's content into sentences.
///
/// Lines are the first cut: list items are sentences of their own, a blank
/// line closes the running sentence, and a line ending in `.`, `!` or `?`
/// closes it too. Sentences still longer than ~375 tokens are re-split on
/// internal sentence endings.
fn split_into_sentences(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut sentences: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for raw_line in text.split('\n') {
        let line = raw_line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                sentences.push(current.join(" "));
                current.clear();
            }
            continue;
        }

        if LIST_ITEM_PATTERN.is_match(line) {
            if !current.is_empty() {
                sentences.push(current.join(" "));
                current.clear();
            }
            sentences.push(line.to_string());
        } else {
            current.push(line.to_string());
            if line.ends_with('.') || line.ends_with('!') || line.ends_with('?') {
                sentences.push(current.join(" "));
                current.clear();
            }
        }
    }

    if !current.is_empty() {
        sentences.push(current.join(" "));
    }

    let mut final_sentences = Vec::new();
    for sentence in sentences {
        if sentence.chars().count() > 1500 {
            final_sentences.extend(split_long_sentence(&sentence));
        } else {
            final_sentences.push(sentence);
        }
    }

    final_sentences
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Re-split an over-long sentence at `[.!?]` + whitespace + uppercase letter.
fn split_long_sentence(sentence: &str) -> Vec<String> {
    let chars: Vec<char> = sentence.chars().collect();
    let mut parts = Vec::new();
    let mut start = 0usize;

    let mut i = 0;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            // Find the end of the following whitespace run.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < chars.len() && chars[j].is_uppercase() {
                parts.push(chars[start..=i].iter().collect::<String>());
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    if start < chars.len() {
        parts.push(chars[start..].iter().collect::<String>());
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> SemanticChunker {
        SemanticChunker::new(500, 50)
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunker().chunk_document("", "empty.txt").is_empty());
        assert!(chunker().chunk_document("   \n\n ", "blank.txt").is_empty());
    }

    #[test]
    fn detects_legal_articles() {
        let text = "Préambule du contrat.\n\n\
                    Article 1 : Objet\nLe présent contrat définit les services.\n\n\
                    Article 23.2 : Réversibilité\nLe prestataire s'engage à restituer les données.";
        let chunks = chunker().chunk_document(text, "cga.txt");
        assert!(chunks.len() >= 3);
        assert!(chunks
            .iter()
            .any(|c| c.article_number.as_deref() == Some("23.2")));
        // Every chunk carries its sequence and totals.
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence, i);
            assert_eq!(c.total_chunks, chunks.len());
        }
    }

    #[test]
    fn detects_markdown_headers() {
        let text = "Intro text.\n\n## Section One\nBody one.\n\n### Subsection\nBody two.";
        let chunks = chunker().chunk_document(text, "doc.md");
        assert!(chunks
            .iter()
            .any(|c| c.section_title.as_deref() == Some("Section One")));
        let sub = chunks
            .iter()
            .find(|c| c.section_title.as_deref() == Some("Subsection"))
            .unwrap();
        assert!(sub.section_path.contains(&"Section One".to_string()));
    }

    #[test]
    fn sentence_is_the_atomic_unit() {
        // 40 sentences of ~25 tokens: sections too large for one chunk.
        let sentence = "Le prestataire garantit la disponibilité du service pendant toute la durée du contrat conclu. ";
        let text = sentence.repeat(40);
        let chunks = SemanticChunker::new(100, 20).chunk_document(&text, "long.txt");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            // Chunks end on sentence boundaries.
            assert!(chunk.text.ends_with('.'), "chunk not on boundary: {}", chunk.text);
        }
    }

    #[test]
    fn chunk_count_is_bounded() {
        // Termination invariant: overlap never re-grows a chunk past the
        // target, so the chunk count stays linear in the sentence count.
        let sentence = "Une phrase de taille moyenne qui sert à remplir le document de test. ";
        let text = sentence.repeat(200);
        let chunks = SemanticChunker::new(60, 50).chunk_document(&text, "dense.txt");
        let sentences = 200;
        assert!(chunks.len() <= sentences, "unbounded chunking: {}", chunks.len());
        assert!(!chunks.is_empty());
    }

    #[test]
    fn oversized_single_sentence_is_kept_whole() {
        let giant = "mot ".repeat(800);
        let chunks = SemanticChunker::new(100, 10).chunk_document(&giant, "giant.txt");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn list_items_are_isolated_sentences() {
        let text = "Les engagements :\n- premier engagement du prestataire\n- second engagement du prestataire\nFin.";
        let sentences = split_into_sentences(text);
        assert!(sentences.contains(&"- premier engagement du prestataire".to_string()));
        assert!(sentences.contains(&"- second engagement du prestataire".to_string()));
    }

    #[test]
    fn long_sentences_resplit_on_endings() {
        let part = "Ceci est une phrase complète qui se termine normalement. ";
        let long = part.repeat(40); // > 1500 chars, no newlines
        let sentences = split_into_sentences(&long);
        assert!(sentences.len() > 1);
    }

    #[test]
    fn article_chunks_carry_context_prefix() {
        let body = "Le prestataire s'engage à restituer les données. ".repeat(30);
        let text = format!("Article 15 : Résiliation\n{}", body);
        let chunks = SemanticChunker::new(80, 10).chunk_document(&text, "cga.txt");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let head: String = chunk.text.chars().take(40).collect();
            assert!(
                chunk.text.starts_with("[Article 15]") || chunk.text.starts_with("[Article 15 -"),
                "missing context prefix: {}",
                head
            );
        }
    }
}
