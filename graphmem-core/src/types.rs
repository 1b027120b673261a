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

//! Domain types shared by the pipeline, the stores and the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Extraction (LLM output)
// =============================================================================

/// An entity extracted by the LLM from one extraction chunk.
///
/// `entity_type` is a free string: ontology-unknown types are coerced to
/// `"Other"` at parse time; known types are recorded with the ontology's
/// spelling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", default = "default_entity_type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// How many chunks mentioned this entity (accumulated by the merge pass).
    #[serde(default = "one")]
    pub mentions: u64,
}

/// A directed relation extracted by the LLM.
///
/// Relation types are recorded verbatim; ontology-unknown types are accepted
/// as free strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub from_entity: String,
    pub to_entity: String,
    #[serde(rename = "type", default = "default_relation_type")]
    pub relation_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "one_f64")]
    pub weight: f64,
}

/// Complete result of extracting one document (possibly over many chunks).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
}

fn default_entity_type() -> String {
    "Other".to_string()
}

fn default_relation_type() -> String {
    "RELATED_TO".to_string()
}

fn one() -> u64 {
    1
}

fn one_f64() -> f64 {
    1.0
}

// =============================================================================
// Memories & documents
// =============================================================================

/// A memory: tenant namespace owning documents, entities and chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub ontology: String,
    #[serde(default)]
    pub ontology_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-memory counts returned by `memory_stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub memory_id: String,
    pub document_count: u64,
    pub entity_count: u64,
    pub relation_count: u64,
    pub chunk_count: u64,
    #[serde(default)]
    pub top_entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySummary {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub mentions: u64,
}

/// A raw ingested artifact, addressed by content hash within a memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: String,
    pub memory_id: String,
    pub filename: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub text_length: u64,
    pub content_type: String,
    pub object_uri: String,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub source_modified_at: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

// =============================================================================
// Chunks (retrieval)
// =============================================================================

/// A contiguous passage of a document's text, packaged for embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// Position of the chunk in the document, 0-based.
    pub sequence: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub memory_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub section_title: Option<String>,
    #[serde(default)]
    pub article_number: Option<String>,
    /// Heading hierarchy from the document root down to this chunk's section.
    #[serde(default)]
    pub section_path: Vec<String>,
    pub char_count: usize,
    pub token_count: usize,
}

/// A chunk retrieved from the vector store with its cosine score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

impl ScoredChunk {
    /// Text formatted for inclusion in a chat prompt, with its provenance.
    pub fn context_text(&self) -> String {
        let mut header = String::new();
        if let Some(filename) = &self.chunk.filename {
            header.push_str(&format!("[Source: {}", filename));
            if let Some(section) = &self.chunk.section_title {
                header.push_str(&format!(" > {}", section));
            }
            if let Some(article) = &self.chunk.article_number {
                header.push_str(&format!(" > Art. {}", article));
            }
            header.push(']');
        }
        if header.is_empty() {
            self.chunk.text.clone()
        } else {
            format!("{}\n{}", header, self.chunk.text)
        }
    }
}

// =============================================================================
// Graph search
// =============================================================================

/// An entity matched by graph search, with its stored attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityHit {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    pub mentions: u64,
    #[serde(default)]
    pub source_docs: Vec<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Full 1-hop context of an entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityContext {
    pub entity_name: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub documents: Vec<DocumentRef>,
    #[serde(default)]
    pub related_entities: Vec<RelatedEntity>,
    #[serde(default)]
    pub relations: Vec<RelationRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub filename: String,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationRef {
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Full graph of a memory, shaped for the visualizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<serde_json::Value>,
    pub edges: Vec<serde_json::Value>,
    pub documents: Vec<serde_json::Value>,
}

// =============================================================================
// Tokens
// =============================================================================

/// Metadata of an access token. The raw token is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token_hash: String,
    pub client_name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub permissions: Vec<String>,
    /// Memories this token may touch; empty means all.
    #[serde(default)]
    pub memory_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl TokenInfo {
    /// A token is active if it has not been revoked and has not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expires) => expires > now,
            None => true,
        }
    }
}

// =============================================================================
// Ingestion result
// =============================================================================

/// Outcome of `memory_ingest`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub filename: String,
    pub object_uri: String,
    pub already_existed: bool,
    pub size_bytes: u64,
    pub text_length: u64,
    pub entities_new: u64,
    pub entities_merged: u64,
    pub relations_new: u64,
    pub relations_merged: u64,
    pub chunks_stored: u64,
    pub extraction_chunks: u64,
    pub extraction_chunks_failed: u64,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
}

/// Counters returned by graph-side merge of one extraction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MergeCounts {
    pub entities_created: u64,
    pub entities_merged: u64,
    pub relations_created: u64,
    pub relations_merged: u64,
}

/// Counters returned by graph replay during restore.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ImportCounts {
    pub memories: u64,
    pub documents: u64,
    pub entities: u64,
    pub relations: u64,
    pub mentions: u64,
}

/// Per-dependency status for `system_health` and `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl DependencyStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok".into(),
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            message: message.into(),
            details: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn extraction_defaults_apply() {
        let entity: ExtractedEntity =
            serde_json::from_str(r#"{"name": "Cloud Temple"}"#).unwrap();
        assert_eq!(entity.entity_type, "Other");
        assert_eq!(entity.mentions, 1);

        let relation: ExtractedRelation = serde_json::from_str(
            r#"{"from_entity": "A", "to_entity": "B"}"#,
        )
        .unwrap();
        assert_eq!(relation.relation_type, "RELATED_TO");
        assert!((relation.weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn token_activity_window() {
        let now = Utc::now();
        let mut token = TokenInfo {
            token_hash: "abc".into(),
            client_name: "client".into(),
            email: None,
            permissions: vec!["read".into()],
            memory_ids: vec![],
            created_at: now,
            expires_at: Some(now + Duration::days(1)),
            revoked_at: None,
        };
        assert!(token.is_active(now));

        token.expires_at = Some(now - Duration::seconds(1));
        assert!(!token.is_active(now));

        token.expires_at = None;
        token.revoked_at = Some(now);
        assert!(!token.is_active(now));
    }

    #[test]
    fn scored_chunk_context_carries_provenance() {
        let scored = ScoredChunk {
            chunk: Chunk {
                text: "Le prestataire s'engage.".into(),
                filename: Some("CGA.pdf".into()),
                section_title: Some("Réversibilité".into()),
                article_number: Some("23.2".into()),
                ..Default::default()
            },
            score: 0.8,
        };
        let text = scored.context_text();
        assert!(text.starts_with("[Source: CGA.pdf > Réversibilité > Art. 23.2]"));
        assert!(text.ends_with("Le prestataire s'engage."));
    }
}
