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

//! Ingestion pipeline.
//!
//! decode -> dedup -> upload -> extract -> merge -> persist graph ->
//! chunk -> embed -> write vectors. The upload is the commit point for the
//! raw artifact; later stages are best-effort-forward and `storage_check`
//! detects divergence if one of them fails.

use crate::decode;
use crate::embedder::Embedder;
use crate::extract::Extractor;
use crate::progress::ProgressSink;
use chrono::Utc;
use graphmem_core::chunker::SemanticChunker;
use graphmem_core::config::ServerConfig;
use graphmem_core::error::{MemoryError, Result};
use graphmem_core::ontology::OntologyRegistry;
use graphmem_core::types::{DocumentInfo, IngestReport};
use graphmem_storage::{GraphStore, ObjectStore, VectorStore};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

pub struct IngestRequest {
    pub memory_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub force: bool,
    pub source_path: Option<String>,
    pub source_modified_at: Option<String>,
}

pub struct IngestService {
    graph: Arc<GraphStore>,
    vector: Arc<VectorStore>,
    objects: Arc<ObjectStore>,
    ontologies: Arc<OntologyRegistry>,
    extractor: Arc<Extractor>,
    embedder: Arc<Embedder>,
    chunker: SemanticChunker,
    max_document_size_bytes: u64,
    max_text_length: usize,
}

impl IngestService {
    pub fn new(
        config: &ServerConfig,
        graph: Arc<GraphStore>,
        vector: Arc<VectorStore>,
        objects: Arc<ObjectStore>,
        ontologies: Arc<OntologyRegistry>,
        extractor: Arc<Extractor>,
        embedder: Arc<Embedder>,
    ) -> Self {
        Self {
            graph,
            vector,
            objects,
            ontologies,
            extractor,
            embedder,
            chunker: SemanticChunker::new(config.limits.chunk_size, config.limits.chunk_overlap),
            max_document_size_bytes: config.max_document_size_bytes(),
            max_text_length: config.limits.max_text_length,
        }
    }

    pub async fn ingest(
        &self,
        request: IngestRequest,
        progress: &ProgressSink,
    ) -> Result<IngestReport> {
        let memory_id = &request.memory_id;
        let started = std::time::Instant::now();

        if request.bytes.len() as u64 > self.max_document_size_bytes {
            return Err(MemoryError::QuotaExceeded(format!(
                "document '{}' is {} bytes, limit is {} bytes",
                request.filename,
                request.bytes.len(),
                self.max_document_size_bytes
            )));
        }

        let memory = self
            .graph
            .get_memory(memory_id)
            .await?
            .ok_or_else(|| MemoryError::not_found(format!("memory '{}' not found", memory_id)))?;
        // Extraction cannot run without the memory's ontology.
        let ontology = self.ontologies.get_or_err(&memory.ontology)?;

        // === Stage 1: decode ===
        progress.notify("decode", json!({ "filename": request.filename }));
        let text = decode::decode_document(&request.bytes, &request.filename)?;
        if text.chars().count() > self.max_text_length {
            return Err(MemoryError::QuotaExceeded(format!(
                "decoded text is {} chars, limit is {}",
                text.chars().count(),
                self.max_text_length
            )));
        }

        // === Stage 2: dedup ===
        let content_hash = hash_bytes(&request.bytes);
        let existing = self
            .graph
            .get_document_by_hash(memory_id, &content_hash)
            .await?;
        if let Some(existing) = &existing {
            if !request.force {
                tracing::info!(
                    memory_id = %memory_id,
                    document_id = %existing.id,
                    "Document already ingested, short-circuiting"
                );
                return Ok(IngestReport {
                    document_id: existing.id.clone(),
                    filename: existing.filename.clone(),
                    object_uri: existing.object_uri.clone(),
                    already_existed: true,
                    size_bytes: existing.size_bytes,
                    text_length: existing.text_length,
                    ..Default::default()
                });
            }
        }

        // Re-ingestion keeps the document identity.
        let document_id = existing
            .as_ref()
            .map(|d| d.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // === Stage 3: upload (commit point for the raw artifact) ===
        progress.notify("upload", json!({ "document_id": document_id }));
        let key = ObjectStore::document_key(memory_id, &document_id);
        let content_type = decode::guess_content_type(&request.filename);
        self.objects.put(&key, &request.bytes, content_type).await?;
        let object_uri = self.objects.uri_for(&key);

        let document = DocumentInfo {
            id: document_id.clone(),
            memory_id: memory_id.clone(),
            filename: request.filename.clone(),
            content_hash: content_hash.clone(),
            size_bytes: request.bytes.len() as u64,
            text_length: text.chars().count() as u64,
            content_type: content_type.to_string(),
            object_uri: object_uri.clone(),
            source_path: request.source_path.clone(),
            source_modified_at: request.source_modified_at.clone(),
            ingested_at: Utc::now(),
        };
        self.graph.upsert_document(&document).await?;

        // === Stages 4-5: chunked extraction with cumulative context ===
        let outcome = self
            .extractor
            .extract_document(&ontology, &text, progress)
            .await?;

        // === Stage 6: persist graph ===
        progress.notify(
            "persist",
            json!({
                "entities": outcome.result.entities.len(),
                "relations": outcome.result.relations.len(),
            }),
        );
        let counts = self
            .graph
            .merge_extraction(memory_id, &document_id, &outcome.result)
            .await?;

        // === Stage 7: retrieval chunking ===
        progress.notify("chunk", json!({}));
        let chunks = self.chunker.chunk_document(&text, &request.filename);

        // === Stage 8: embed ===
        progress.notify("embed", json!({ "chunks": chunks.len() }));
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_texts(&texts).await?;

        // === Stage 9: write vectors ===
        progress.notify("store_vectors", json!({ "chunks": chunks.len() }));
        self.vector.ensure_collection(memory_id).await?;
        if request.force && existing.is_some() {
            // Replaced documents must not leave stale chunks behind.
            self.vector
                .delete_document_chunks(memory_id, &document_id)
                .await?;
        }
        let stored = self
            .vector
            .upsert_chunks(memory_id, &document_id, &request.filename, &chunks, &embeddings)
            .await?;

        let report = IngestReport {
            document_id,
            filename: request.filename,
            object_uri,
            already_existed: false,
            size_bytes: document.size_bytes,
            text_length: document.text_length,
            entities_new: counts.entities_created,
            entities_merged: counts.entities_merged,
            relations_new: counts.relations_created,
            relations_merged: counts.relations_merged,
            chunks_stored: stored as u64,
            extraction_chunks: outcome.chunks_total,
            extraction_chunks_failed: outcome.chunks_failed,
            summary: outcome.result.summary,
            key_topics: outcome.result.key_topics,
        };

        progress.notify(
            "done",
            json!({
                "document_id": report.document_id,
                "entities_new": report.entities_new,
                "relations_new": report.relations_new,
                "chunks": report.chunks_stored,
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
        tracing::info!(
            memory_id = %memory_id,
            document_id = %report.document_id,
            entities_new = report.entities_new,
            entities_merged = report.entities_merged,
            chunks = report.chunks_stored,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ingestion complete"
        );

        Ok(report)
    }

    /// Delete a document everywhere: vector chunks, object, graph node with
    /// orphan cascade.
    pub async fn delete_document(
        &self,
        memory_id: &str,
        document_id: &str,
    ) -> Result<serde_json::Value> {
        let document = self
            .graph
            .get_document(memory_id, document_id)
            .await?
            .ok_or_else(|| {
                MemoryError::not_found(format!(
                    "document '{}' not found in memory '{}'",
                    document_id, memory_id
                ))
            })?;

        let chunks_deleted = self
            .vector
            .delete_document_chunks(memory_id, document_id)
            .await?;

        let key = ObjectStore::parse_key(&document.object_uri)?;
        self.objects.delete(&key).await?;

        let (mentions_deleted, entities_deleted) =
            self.graph.delete_document(memory_id, document_id).await?;

        Ok(json!({
            "document_id": document_id,
            "chunks_deleted": chunks_deleted,
            "mentions_deleted": mentions_deleted,
            "entities_deleted": entities_deleted,
        }))
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256_of_bytes() {
        // Hash of the decoded upload bytes, not of extracted text.
        assert_eq!(
            hash_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }
}
