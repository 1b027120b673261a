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

//! LLM-driven entity/relation extraction.
//!
//! Long documents are cut into extraction chunks (distinct from retrieval
//! chunks) processed strictly in order; each prompt carries a compact
//! cumulative context of what earlier chunks produced, bounded by a
//! character budget with lowest-mention eviction. A chunk whose output
//! cannot be parsed, even after lenient recovery, is skipped: a partial
//! extraction beats a failed ingestion.

use crate::llm::{ChatMessage, LlmClient};
use crate::progress::ProgressSink;
use graphmem_core::error::Result;
use graphmem_core::ontology::Ontology;
use graphmem_core::types::ExtractionResult;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_PROMPT: &str =
    "You are a structured information extraction assistant. You answer only with valid JSON.";

pub struct Extractor {
    llm: Arc<LlmClient>,
    chunk_size: usize,
    context_budget: usize,
    timeout: Duration,
}

/// Outcome of extracting one document.
pub struct ExtractionOutcome {
    pub result: ExtractionResult,
    pub chunks_total: u64,
    pub chunks_failed: u64,
}

impl Extractor {
    pub fn new(
        llm: Arc<LlmClient>,
        chunk_size: usize,
        context_budget: usize,
        timeout_s: u64,
    ) -> Self {
        Self {
            llm,
            chunk_size: chunk_size.max(1),
            context_budget,
            timeout: Duration::from_secs(timeout_s),
        }
    }

    /// Extract entities and relations from a full document text, chunk by
    /// chunk, merging as it goes.
    pub async fn extract_document(
        &self,
        ontology: &Ontology,
        text: &str,
        progress: &ProgressSink,
    ) -> Result<ExtractionOutcome> {
        let chunks = split_extraction_chunks(text, self.chunk_size);
        let total = chunks.len();
        let mut merged = ExtractionResult::default();
        let mut context = CumulativeContext::default();
        let mut failed = 0u64;

        for (index, chunk) in chunks.iter().enumerate() {
            // Cancellation lands between chunks: the chunk in flight always
            // completes so its committed work is preserved.
            if index > 0 && progress.is_cancelled() {
                tracing::info!(
                    chunk = index,
                    chunks_total = total,
                    "Caller gone, stopping extraction after completed chunk"
                );
                break;
            }
            progress.notify(
                "extract",
                json!({
                    "chunk": index + 1,
                    "chunks_total": total,
                    "entities": merged.entities.len(),
                    "relations": merged.relations.len(),
                }),
            );

            let context_json = context.render(self.context_budget);
            let prompt = ontology.build_prompt(
                chunk,
                if context_json.is_empty() {
                    None
                } else {
                    Some(context_json.as_str())
                },
            );
            let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];

            let started = std::time::Instant::now();
            let response = match self.llm.chat(&messages, self.timeout).await {
                Ok(response) => response,
                Err(e) => {
                    // Timeouts and hard failures on one chunk skip the chunk.
                    tracing::warn!(
                        chunk = index + 1,
                        chunks_total = total,
                        error = %e,
                        "Extraction chunk failed, skipping"
                    );
                    failed += 1;
                    continue;
                }
            };

            match parse_extraction(&response.content, ontology) {
                Some(result) => {
                    tracing::info!(
                        chunk = index + 1,
                        chunks_total = total,
                        entities = result.entities.len(),
                        relations = result.relations.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Extraction chunk done"
                    );
                    context.absorb(&result);
                    merge_into(&mut merged, result);
                }
                None => {
                    tracing::warn!(
                        chunk = index + 1,
                        chunks_total = total,
                        "Extraction output unparseable, skipping chunk"
                    );
                    failed += 1;
                }
            }
        }

        Ok(ExtractionOutcome {
            result: merged,
            chunks_total: total as u64,
            chunks_failed: failed,
        })
    }
}

// =============================================================================
// Extraction chunking (distinct from the retrieval chunker: fixed size,
// zero overlap)
// =============================================================================

/// Cut text into extraction chunks of at most `size` characters, on char
/// boundaries.
pub fn split_extraction_chunks(text: &str, size: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse the LLM's JSON answer. Strict parse first; on failure, lenient
/// recovery locates the outermost `{...}`. Entity types are normalised
/// against the ontology here, not later.
pub fn parse_extraction(content: &str, ontology: &Ontology) -> Option<ExtractionResult> {
    let parsed: ExtractionResult = match serde_json::from_str(content.trim()) {
        Ok(result) => result,
        Err(_) => {
            let start = content.find('{')?;
            let end = content.rfind('}')?;
            if end <= start {
                return None;
            }
            serde_json::from_str(&content[start..=end]).ok()?
        }
    };

    let entities = parsed
        .entities
        .into_iter()
        .filter(|e| !e.name.trim().is_empty())
        .map(|mut e| {
            e.name = e.name.trim().to_string();
            e.entity_type = ontology.canonical_entity_type(&e.entity_type);
            e
        })
        .collect();

    let relations = parsed
        .relations
        .into_iter()
        .filter(|r| !r.from_entity.trim().is_empty() && !r.to_entity.trim().is_empty())
        .map(|mut r| {
            r.from_entity = r.from_entity.trim().to_string();
            r.to_entity = r.to_entity.trim().to_string();
            r.relation_type = r.relation_type.trim().to_string();
            r
        })
        .collect();

    Some(ExtractionResult {
        entities,
        relations,
        summary: parsed.summary,
        key_topics: parsed.key_topics,
    })
}

// =============================================================================
// Cross-chunk merge
// =============================================================================

fn merge_key(name: &str, entity_type: &str) -> (String, String) {
    (name.trim().to_lowercase(), entity_type.trim().to_lowercase())
}

/// Merge a chunk's extraction into the accumulated result.
///
/// Entities deduplicate on normalised `(name, type)`: mentions sum,
/// descriptions join with `" | "` (deduplicated by equality). Relations
/// deduplicate on `(from, to, type)`. Summaries concatenate; topics union.
pub fn merge_into(accumulated: &mut ExtractionResult, new: ExtractionResult) {
    for entity in new.entities {
        let key = merge_key(&entity.name, &entity.entity_type);
        if let Some(existing) = accumulated
            .entities
            .iter_mut()
            .find(|e| merge_key(&e.name, &e.entity_type) == key)
        {
            existing.mentions += entity.mentions;
            if let Some(description) = entity.description {
                match &mut existing.description {
                    Some(current) => {
                        let already = current.split(" | ").any(|part| part == description);
                        if !already {
                            current.push_str(" | ");
                            current.push_str(&description);
                        }
                    }
                    None => existing.description = Some(description),
                }
            }
            for alias in entity.aliases {
                if !existing.aliases.contains(&alias) {
                    existing.aliases.push(alias);
                }
            }
        } else {
            accumulated.entities.push(entity);
        }
    }

    for relation in new.relations {
        let exists = accumulated.relations.iter().any(|r| {
            r.from_entity.eq_ignore_ascii_case(&relation.from_entity)
                && r.to_entity.eq_ignore_ascii_case(&relation.to_entity)
                && r.relation_type == relation.relation_type
        });
        if !exists {
            accumulated.relations.push(relation);
        }
    }

    if let Some(summary) = new.summary {
        match &mut accumulated.summary {
            Some(current) => {
                current.push(' ');
                current.push_str(&summary);
            }
            None => accumulated.summary = Some(summary),
        }
    }

    for topic in new.key_topics {
        if !accumulated.key_topics.contains(&topic) {
            accumulated.key_topics.push(topic);
        }
    }
}

// =============================================================================
// Cumulative context
// =============================================================================

/// Bounded record of what earlier chunks extracted, rendered into the
/// prompt as compact JSON. Deterministic: entries are kept in sorted maps
/// and eviction removes lowest-mention entities first.
#[derive(Debug, Default)]
pub struct CumulativeContext {
    entities: BTreeMap<(String, String), ContextEntity>,
    relations: BTreeSet<(String, String, String)>,
}

#[derive(Debug, Clone)]
struct ContextEntity {
    name: String,
    entity_type: String,
    mentions: u64,
}

impl CumulativeContext {
    pub fn absorb(&mut self, result: &ExtractionResult) {
        for entity in &result.entities {
            let key = merge_key(&entity.name, &entity.entity_type);
            self.entities
                .entry(key)
                .and_modify(|e| e.mentions += entity.mentions)
                .or_insert_with(|| ContextEntity {
                    name: entity.name.clone(),
                    entity_type: entity.entity_type.clone(),
                    mentions: entity.mentions,
                });
        }
        for relation in &result.relations {
            self.relations.insert((
                relation.from_entity.clone(),
                relation.relation_type.clone(),
                relation.to_entity.clone(),
            ));
        }
    }

    /// Render as compact JSON within `budget` characters. When over budget,
    /// lowest-mention entities are evicted first (ties broken by name for
    /// determinism), then relations are truncated.
    pub fn render(&self, budget: usize) -> String {
        if self.entities.is_empty() && self.relations.is_empty() {
            return String::new();
        }

        let mut entities: Vec<&ContextEntity> = self.entities.values().collect();
        entities.sort_by(|a, b| {
            b.mentions
                .cmp(&a.mentions)
                .then_with(|| a.name.cmp(&b.name))
        });
        let mut relations: Vec<&(String, String, String)> = self.relations.iter().collect();

        loop {
            let rendered = json!({
                "entities": entities
                    .iter()
                    .map(|e| json!({ "name": e.name, "type": e.entity_type }))
                    .collect::<Vec<_>>(),
                "relations": relations
                    .iter()
                    .map(|(from, rel, to)| json!([from, rel, to]))
                    .collect::<Vec<_>>(),
            })
            .to_string();

            if rendered.chars().count() <= budget {
                return rendered;
            }
            if !relations.is_empty() {
                relations.pop();
            } else if entities.len() > 1 {
                entities.pop();
            } else {
                return rendered.chars().take(budget).collect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphmem_core::ontology::{EntityTypeDef, ExtractionRules, Ontology};
    use graphmem_core::types::{ExtractedEntity, ExtractedRelation};

    fn ontology() -> Ontology {
        Ontology {
            name: "legal".into(),
            version: "1.0".into(),
            description: String::new(),
            context: String::new(),
            entity_types: vec![
                EntityTypeDef {
                    name: "Organization".into(),
                    description: String::new(),
                    examples: vec![],
                    priority: "high".into(),
                },
                EntityTypeDef {
                    name: "Date".into(),
                    description: String::new(),
                    examples: vec![],
                    priority: "normal".into(),
                },
            ],
            relation_types: vec![],
            extraction_rules: ExtractionRules::default(),
        }
    }

    #[test]
    fn extraction_chunks_respect_char_boundaries() {
        let text = "é".repeat(10);
        let chunks = split_extraction_chunks(&text, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 4);
        assert_eq!(chunks[2].chars().count(), 2);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn strict_parse_and_type_coercion() {
        let content = r#"{"entities": [{"name": "Cloud Temple", "type": "organization"},
                          {"name": "Atlantis", "type": "Spaceship"}],
                          "relations": [], "summary": "s", "key_topics": ["t"]}"#;
        let result = parse_extraction(content, &ontology()).unwrap();
        assert_eq!(result.entities[0].entity_type, "Organization");
        assert_eq!(result.entities[1].entity_type, "Other");
    }

    #[test]
    fn lenient_parse_recovers_fenced_json() {
        let content = "Here is the result:\n```json\n{\"entities\": [{\"name\": \"Acme\", \"type\": \"Organization\"}], \"relations\": []}\n```";
        let result = parse_extraction(content, &ontology()).unwrap();
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].name, "Acme");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_extraction("no json here", &ontology()).is_none());
        assert!(parse_extraction("{broken", &ontology()).is_none());
    }

    #[test]
    fn merge_dedups_entities_by_name_and_type() {
        let mut accumulated = ExtractionResult::default();
        merge_into(
            &mut accumulated,
            ExtractionResult {
                entities: vec![ExtractedEntity {
                    name: "Cloud Temple".into(),
                    entity_type: "Organization".into(),
                    description: Some("Provider".into()),
                    aliases: vec![],
                    mentions: 1,
                }],
                ..Default::default()
            },
        );
        merge_into(
            &mut accumulated,
            ExtractionResult {
                entities: vec![
                    ExtractedEntity {
                        name: "cloud temple".into(),
                        entity_type: "organization".into(),
                        description: Some("French cloud operator".into()),
                        aliases: vec![],
                        mentions: 2,
                    },
                    ExtractedEntity {
                        name: "Cloud Temple".into(),
                        entity_type: "Location".into(),
                        description: None,
                        aliases: vec![],
                        mentions: 1,
                    },
                ],
                ..Default::default()
            },
        );

        // Same (name, type) merged; different type kept apart.
        assert_eq!(accumulated.entities.len(), 2);
        let merged = &accumulated.entities[0];
        assert_eq!(merged.mentions, 3);
        assert_eq!(
            merged.description.as_deref(),
            Some("Provider | French cloud operator")
        );
        // Case of the first sighting is preserved.
        assert_eq!(merged.name, "Cloud Temple");
    }

    #[test]
    fn merge_dedups_descriptions_by_equality() {
        let entity = |desc: &str| ExtractedEntity {
            name: "Acme".into(),
            entity_type: "Organization".into(),
            description: Some(desc.into()),
            aliases: vec![],
            mentions: 1,
        };
        let mut accumulated = ExtractionResult::default();
        merge_into(
            &mut accumulated,
            ExtractionResult {
                entities: vec![entity("Supplier")],
                ..Default::default()
            },
        );
        merge_into(
            &mut accumulated,
            ExtractionResult {
                entities: vec![entity("Supplier")],
                ..Default::default()
            },
        );
        assert_eq!(accumulated.entities[0].description.as_deref(), Some("Supplier"));
    }

    #[test]
    fn merge_dedups_relations() {
        let relation = ExtractedRelation {
            from_entity: "Acme".into(),
            to_entity: "Cloud Temple".into(),
            relation_type: "SIGNED_BY".into(),
            description: None,
            weight: 1.0,
        };
        let mut accumulated = ExtractionResult::default();
        merge_into(
            &mut accumulated,
            ExtractionResult {
                relations: vec![relation.clone()],
                ..Default::default()
            },
        );
        merge_into(
            &mut accumulated,
            ExtractionResult {
                relations: vec![relation],
                ..Default::default()
            },
        );
        assert_eq!(accumulated.relations.len(), 1);
    }

    #[test]
    fn context_render_is_bounded_and_deterministic() {
        let mut context = CumulativeContext::default();
        let result = ExtractionResult {
            entities: (0..50)
                .map(|i| ExtractedEntity {
                    name: format!("Entity numéro {:03}", i),
                    entity_type: "Concept".into(),
                    description: None,
                    aliases: vec![],
                    mentions: (i % 7) + 1,
                })
                .collect(),
            relations: (0..30)
                .map(|i| ExtractedRelation {
                    from_entity: format!("Entity numéro {:03}", i),
                    to_entity: format!("Entity numéro {:03}", i + 1),
                    relation_type: "RELATED_TO".into(),
                    description: None,
                    weight: 1.0,
                })
                .collect(),
            ..Default::default()
        };
        context.absorb(&result);

        let budget = 800;
        let first = context.render(budget);
        let second = context.render(budget);
        assert_eq!(first, second);
        assert!(first.chars().count() <= budget);

        // Highest-mention entities survive eviction.
        let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        let kept = parsed["entities"].as_array().unwrap();
        assert!(!kept.is_empty());
    }

    #[test]
    fn empty_context_renders_empty() {
        assert_eq!(CumulativeContext::default().render(1000), "");
    }
}
