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

//! Graph-Guided RAG engine.
//!
//! Graph search narrows the candidate documents; vector retrieval runs
//! restricted to those documents, or across the whole memory when the
//! graph finds nothing (RAG-only fallback). Chunks under the score
//! threshold are dropped. `question_answer` composes a cited answer with
//! the chat model; `memory_query` returns the raw structured bundle.

use crate::embedder::Embedder;
use crate::llm::{ChatMessage, LlmClient};
use graphmem_core::error::Result;
use graphmem_core::types::{DocumentRef, EntityContext, EntityHit, ScoredChunk};
use graphmem_storage::{GraphStore, VectorStore};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetrievalMode {
    GraphGuided,
    RagOnly,
}

/// One matched entity with its 1-hop context.
#[derive(Debug, Clone, Serialize)]
pub struct EntityBundle {
    #[serde(flatten)]
    pub hit: EntityHit,
    pub context: EntityContext,
}

/// Shared retrieval result of both query entry points.
#[derive(Debug, Clone, Serialize)]
pub struct Retrieval {
    pub mode: RetrievalMode,
    pub entities: Vec<EntityBundle>,
    pub chunks: Vec<ScoredChunk>,
    pub source_documents: Vec<DocumentRef>,
}

/// Final answer of `question_answer`.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub entities: Vec<String>,
    pub source_documents: Vec<DocumentRef>,
    pub mode: RetrievalMode,
}

pub struct QueryEngine {
    graph: Arc<GraphStore>,
    vector: Arc<VectorStore>,
    embedder: Arc<Embedder>,
    llm: Arc<LlmClient>,
    score_threshold: f32,
    chunk_limit: usize,
}

impl QueryEngine {
    pub fn new(
        graph: Arc<GraphStore>,
        vector: Arc<VectorStore>,
        embedder: Arc<Embedder>,
        llm: Arc<LlmClient>,
        score_threshold: f32,
        chunk_limit: usize,
    ) -> Self {
        Self {
            graph,
            vector,
            embedder,
            llm,
            score_threshold,
            chunk_limit,
        }
    }

    /// The retrieval core shared by `question_answer` and `memory_query`.
    pub async fn retrieve(
        &self,
        memory_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Retrieval> {
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT);

        let hits = self.graph.search_entities(memory_id, query, limit).await?;

        let mut entities = Vec::with_capacity(hits.len());
        for hit in hits {
            let context = self.graph.entity_context(memory_id, &hit.name).await?;
            entities.push(EntityBundle { hit, context });
        }

        let doc_ids = entity_document_ids(&entities);
        let mode = if doc_ids.is_empty() {
            RetrievalMode::RagOnly
        } else {
            RetrievalMode::GraphGuided
        };

        let query_vector = self.embedder.embed_query(query).await?;
        let raw_chunks = self
            .vector
            .search(
                memory_id,
                &query_vector,
                if doc_ids.is_empty() {
                    None
                } else {
                    Some(doc_ids.as_slice())
                },
                self.chunk_limit,
            )
            .await?;

        let (chunks, rejected) = filter_by_threshold(raw_chunks, self.score_threshold);
        for chunk in &chunks {
            tracing::debug!(score = chunk.score, accepted = true, "RAG chunk");
        }
        for chunk in &rejected {
            tracing::debug!(score = chunk.score, accepted = false, "RAG chunk");
        }

        let source_documents = aggregate_source_documents(&entities, &chunks);

        tracing::info!(
            memory_id = %memory_id,
            query = %query,
            graph_hits = entities.len(),
            mode = ?mode,
            chunks_retained = chunks.len(),
            chunks_rejected = rejected.len(),
            "Retrieval complete"
        );

        Ok(Retrieval {
            mode,
            entities,
            chunks,
            source_documents,
        })
    }

    /// Prose answer with citations, composed by the chat model.
    pub async fn question_answer(
        &self,
        memory_id: &str,
        question: &str,
        limit: Option<usize>,
    ) -> Result<Answer> {
        let retrieval = self.retrieve(memory_id, question, limit).await?;

        // Both retrieval paths came back empty: say so without a model call.
        if retrieval.entities.is_empty() && retrieval.chunks.is_empty() {
            return Ok(Answer {
                answer: "No relevant information was found in this memory for the question."
                    .to_string(),
                entities: Vec::new(),
                source_documents: Vec::new(),
                mode: retrieval.mode,
            });
        }

        let prompt = build_answer_prompt(&retrieval, question);
        tracing::info!(
            memory_id = %memory_id,
            prompt_chars = prompt.chars().count(),
            "Composing answer"
        );

        let messages = [
            ChatMessage::system(
                "You answer questions using only the provided graph context and document \
                 excerpts. Cite the source filenames you used. If the context does not \
                 contain the answer, say so explicitly.",
            ),
            ChatMessage::user(prompt),
        ];
        let response = self.llm.chat(&messages, Duration::from_secs(120)).await?;

        Ok(Answer {
            answer: response.content,
            entities: retrieval
                .entities
                .iter()
                .map(|e| e.hit.name.clone())
                .collect(),
            source_documents: retrieval.source_documents,
            mode: retrieval.mode,
        })
    }

    /// Raw structured retrieval, no LLM call.
    pub async fn memory_query(
        &self,
        memory_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<serde_json::Value> {
        let retrieval = self.retrieve(memory_id, query, limit).await?;
        Ok(json!({
            "query": query,
            "memory_id": memory_id,
            "mode": retrieval.mode,
            "entities": retrieval.entities,
            "chunks": retrieval.chunks,
            "source_documents": retrieval.source_documents,
        }))
    }
}

/// Documents reachable from the matched entities (the graph-guided scope).
pub fn entity_document_ids(entities: &[EntityBundle]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for entity in entities {
        for doc in &entity.hit.source_docs {
            if seen.insert(doc.clone()) {
                ids.push(doc.clone());
            }
        }
        for doc in &entity.context.documents {
            if seen.insert(doc.id.clone()) {
                ids.push(doc.id.clone());
            }
        }
    }
    ids
}

/// Split chunks into (retained, rejected) by the cosine threshold,
/// preserving descending-score order of the retained set.
pub fn filter_by_threshold(
    mut chunks: Vec<ScoredChunk>,
    threshold: f32,
) -> (Vec<ScoredChunk>, Vec<ScoredChunk>) {
    chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let (retained, rejected): (Vec<_>, Vec<_>) =
        chunks.into_iter().partition(|c| c.score >= threshold);
    (retained, rejected)
}

/// Source documents of the answer: documents of retained chunks plus
/// documents reachable from matched entities, deduplicated by id.
pub fn aggregate_source_documents(
    entities: &[EntityBundle],
    chunks: &[ScoredChunk],
) -> Vec<DocumentRef> {
    let mut seen = HashSet::new();
    let mut documents = Vec::new();

    for entity in entities {
        for doc in &entity.context.documents {
            if seen.insert(doc.id.clone()) {
                documents.push(doc.clone());
            }
        }
    }

    for chunk in chunks {
        if let Some(doc_id) = &chunk.chunk.document_id {
            if seen.insert(doc_id.clone()) {
                documents.push(DocumentRef {
                    id: doc_id.clone(),
                    filename: chunk.chunk.filename.clone().unwrap_or_default(),
                    uri: String::new(),
                });
            }
        }
    }

    documents
}

/// Assemble the answer prompt: entity neighbourhoods, retained chunks with
/// their source files, then the question and the citation contract.
pub fn build_answer_prompt(retrieval: &Retrieval, question: &str) -> String {
    let mut prompt = String::new();

    if !retrieval.entities.is_empty() {
        prompt.push_str("KNOWLEDGE GRAPH CONTEXT:\n");
        for entity in &retrieval.entities {
            prompt.push_str(&format!(
                "- {} ({})",
                entity.hit.name, entity.hit.entity_type
            ));
            if let Some(description) = &entity.hit.description {
                prompt.push_str(&format!(": {}", description));
            }
            if !entity.context.related_entities.is_empty() {
                let neighbours: Vec<&str> = entity
                    .context
                    .related_entities
                    .iter()
                    .take(5)
                    .map(|r| r.name.as_str())
                    .collect();
                prompt.push_str(&format!(" [related: {}]", neighbours.join(", ")));
            }
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    if !retrieval.chunks.is_empty() {
        prompt.push_str("DOCUMENT EXCERPTS:\n");
        for chunk in &retrieval.chunks {
            prompt.push_str(&chunk.context_text());
            prompt.push_str("\n\n");
        }
    }

    prompt.push_str(&format!("QUESTION: {}\n\n", question));
    prompt.push_str(
        "Answer in the language of the question, citing the source filenames for every \
         claim. If the context above is empty or does not answer the question, state \
         clearly that no relevant information was found.",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphmem_core::types::Chunk;

    fn chunk(document_id: &str, filename: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                text: format!("chunk of {}", filename),
                document_id: Some(document_id.to_string()),
                filename: Some(filename.to_string()),
                ..Default::default()
            },
            score,
        }
    }

    fn bundle(name: &str, source_docs: &[&str]) -> EntityBundle {
        EntityBundle {
            hit: EntityHit {
                name: name.to_string(),
                entity_type: "Concept".to_string(),
                description: None,
                mentions: 1,
                source_docs: source_docs.iter().map(|s| s.to_string()).collect(),
                score: None,
            },
            context: EntityContext {
                entity_name: name.to_string(),
                documents: source_docs
                    .iter()
                    .map(|id| DocumentRef {
                        id: id.to_string(),
                        filename: format!("{}.pdf", id),
                        uri: format!("s3://bucket/memories/m/documents/{}", id),
                    })
                    .collect(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn threshold_filter_drops_low_scores_and_keeps_order() {
        let chunks = vec![
            chunk("d1", "a.pdf", 0.51),
            chunk("d2", "b.pdf", 0.91),
            chunk("d3", "c.pdf", 0.62),
        ];
        let (retained, rejected) = filter_by_threshold(chunks, 0.58);
        assert_eq!(retained.len(), 2);
        assert!(retained[0].score >= retained[1].score);
        assert!(retained.iter().all(|c| c.score >= 0.58));
        assert_eq!(rejected.len(), 1);
        assert!((rejected[0].score - 0.51).abs() < 1e-6);
    }

    #[test]
    fn entity_documents_define_graph_guided_scope() {
        let entities = vec![bundle("Réversibilité", &["d1", "d2"]), bundle("SLA", &["d2"])];
        let ids = entity_document_ids(&entities);
        assert_eq!(ids, vec!["d1".to_string(), "d2".to_string()]);
        assert!(entity_document_ids(&[]).is_empty());
    }

    #[test]
    fn source_documents_union_entities_and_chunks() {
        let entities = vec![bundle("Réversibilité", &["d1"])];
        let chunks = vec![chunk("d1", "d1.pdf", 0.8), chunk("d9", "other.pdf", 0.7)];
        let documents = aggregate_source_documents(&entities, &chunks);
        let ids: Vec<&str> = documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d9"]);
    }

    #[test]
    fn answer_prompt_carries_context_and_contract() {
        let retrieval = Retrieval {
            mode: RetrievalMode::GraphGuided,
            entities: vec![bundle("Article 15", &["d1"])],
            chunks: vec![chunk("d1", "cga.pdf", 0.8)],
            source_documents: vec![],
        };
        let prompt = build_answer_prompt(&retrieval, "Quelles sont les conditions de résiliation ?");
        assert!(prompt.contains("KNOWLEDGE GRAPH CONTEXT:"));
        assert!(prompt.contains("Article 15"));
        assert!(prompt.contains("DOCUMENT EXCERPTS:"));
        assert!(prompt.contains("cga.pdf"));
        assert!(prompt.contains("QUESTION: Quelles sont les conditions de résiliation ?"));
        assert!(prompt.contains("citing the source filenames"));
    }
}
