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

//! Vector store adapter (Qdrant REST API).
//!
//! One collection per memory, cosine distance. Chunks are points carrying
//! their text and provenance as payload, so a search result reconstructs
//! the chunk without touching any other store.

use graphmem_core::config::VectorStoreConfig;
use graphmem_core::error::{MemoryError, Result};
use graphmem_core::types::{Chunk, DependencyStatus, ScoredChunk};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

const DEPENDENCY: &str = "vector-store";

/// One exported Qdrant point: id, payload and raw vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: Value,
    pub vector: Vec<f32>,
    pub payload: Value,
}

pub struct VectorStore {
    http: reqwest::Client,
    base_url: String,
    prefix: String,
    dimensions: usize,
}

impl VectorStore {
    pub fn new(config: &VectorStoreConfig, dimensions: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            prefix: config.collection_prefix.clone(),
            dimensions,
        }
    }

    /// Collection name for a memory; non-alphanumeric characters are
    /// replaced so memory ids stay valid collection names.
    pub fn collection_name(&self, memory_id: &str) -> String {
        let safe: String = memory_id
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}{}", self.prefix, safe)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(reqwest::StatusCode, Value)> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| MemoryError::dependency(DEPENDENCY, e))?;
        let status = response.status();
        let payload = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, payload))
    }

    fn fail(status: reqwest::StatusCode, payload: &Value, action: &str) -> MemoryError {
        let detail = payload["status"]["error"]
            .as_str()
            .unwrap_or("unknown error");
        MemoryError::dependency(DEPENDENCY, format!("{}: HTTP {} ({})", action, status, detail))
    }

    // =========================================================================
    // Collections
    // =========================================================================

    /// Create the memory's collection and its payload indexes if absent.
    /// Idempotent.
    pub async fn ensure_collection(&self, memory_id: &str) -> Result<()> {
        let name = self.collection_name(memory_id);

        let (status, _) = self
            .request(reqwest::Method::GET, &format!("/collections/{}", name), None)
            .await?;
        if status.is_success() {
            return Ok(());
        }

        let (status, payload) = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{}", name),
                Some(json!({
                    "vectors": { "size": self.dimensions, "distance": "Cosine" }
                })),
            )
            .await?;
        if !status.is_success() {
            return Err(Self::fail(status, &payload, "create collection"));
        }

        for field in ["document_id", "memory_id"] {
            let (status, payload) = self
                .request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}/index", name),
                    Some(json!({ "field_name": field, "field_schema": "keyword" })),
                )
                .await?;
            if !status.is_success() {
                return Err(Self::fail(status, &payload, "create payload index"));
            }
        }

        tracing::info!(collection = %name, dimensions = self.dimensions, "Collection created");
        Ok(())
    }

    /// Drop the memory's collection. Returns false if it did not exist.
    pub async fn delete_collection(&self, memory_id: &str) -> Result<bool> {
        let name = self.collection_name(memory_id);
        let (status, payload) = self
            .request(
                reqwest::Method::DELETE,
                &format!("/collections/{}", name),
                None,
            )
            .await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(Self::fail(status, &payload, "delete collection"));
        }
        tracing::info!(collection = %name, "Collection deleted");
        Ok(true)
    }

    pub async fn collection_count(&self, memory_id: &str) -> Result<u64> {
        let name = self.collection_name(memory_id);
        let (status, payload) = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/count", name),
                Some(json!({ "exact": true })),
            )
            .await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !status.is_success() {
            return Err(Self::fail(status, &payload, "count points"));
        }
        Ok(payload["result"]["count"].as_u64().unwrap_or(0))
    }

    // =========================================================================
    // Chunks
    // =========================================================================

    /// Upsert a document's chunks with their embeddings.
    pub async fn upsert_chunks(
        &self,
        memory_id: &str,
        document_id: &str,
        filename: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        if chunks.len() != embeddings.len() {
            return Err(MemoryError::Internal(format!(
                "chunk/embedding mismatch: {} vs {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let name = self.collection_name(memory_id);
        let points: Vec<Value> = chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, vector)| {
                json!({
                    "id": Uuid::new_v4().to_string(),
                    "vector": vector,
                    "payload": {
                        "memory_id": memory_id,
                        "document_id": document_id,
                        "filename": filename,
                        "text": chunk.text,
                        "sequence": chunk.sequence,
                        "total_chunks": chunk.total_chunks,
                        "section_title": chunk.section_title,
                        "article_number": chunk.article_number,
                        "section_path": chunk.section_path,
                        "char_count": chunk.char_count,
                        "token_count": chunk.token_count,
                    }
                })
            })
            .collect();

        let (status, payload) = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{}/points?wait=true", name),
                Some(json!({ "points": points })),
            )
            .await?;
        if !status.is_success() {
            return Err(Self::fail(status, &payload, "upsert points"));
        }

        tracing::info!(
            collection = %name,
            document_id = %document_id,
            points = chunks.len(),
            "Chunks stored"
        );
        Ok(chunks.len())
    }

    /// Cosine search over a memory, optionally restricted to a document set
    /// (the graph-guided path).
    pub async fn search(
        &self,
        memory_id: &str,
        query_vector: &[f32],
        document_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let name = self.collection_name(memory_id);

        let mut body = json!({
            "vector": query_vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(ids) = document_ids {
            body["filter"] = json!({
                "must": [{ "key": "document_id", "match": { "any": ids } }]
            });
        }

        let (status, payload) = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/search", name),
                Some(body),
            )
            .await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            // No collection yet: the memory has no chunks.
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Self::fail(status, &payload, "search points"));
        }

        let results = payload["result"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|point| ScoredChunk {
                score: point["score"].as_f64().unwrap_or(0.0) as f32,
                chunk: payload_to_chunk(&point["payload"]),
            })
            .collect();

        Ok(results)
    }

    /// Delete every chunk of one document. Returns the count removed.
    pub async fn delete_document_chunks(
        &self,
        memory_id: &str,
        document_id: &str,
    ) -> Result<u64> {
        let name = self.collection_name(memory_id);
        let filter = json!({
            "must": [{ "key": "document_id", "match": { "value": document_id } }]
        });

        let (status, payload) = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/count", name),
                Some(json!({ "filter": filter, "exact": true })),
            )
            .await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !status.is_success() {
            return Err(Self::fail(status, &payload, "count points"));
        }
        let count = payload["result"]["count"].as_u64().unwrap_or(0);
        if count == 0 {
            return Ok(0);
        }

        let (status, payload) = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete?wait=true", name),
                Some(json!({ "filter": filter })),
            )
            .await?;
        if !status.is_success() {
            return Err(Self::fail(status, &payload, "delete points"));
        }

        tracing::info!(collection = %name, document_id = %document_id, count, "Chunks deleted");
        Ok(count)
    }

    // =========================================================================
    // Export / import (backup)
    // =========================================================================

    /// Export every point of a memory's collection via the scroll API.
    pub async fn export_points(&self, memory_id: &str) -> Result<Vec<VectorPoint>> {
        let name = self.collection_name(memory_id);
        let mut points = Vec::new();
        let mut offset: Option<Value> = None;

        loop {
            let mut body = json!({
                "limit": 100,
                "with_payload": true,
                "with_vector": true,
            });
            if let Some(offset_value) = &offset {
                body["offset"] = offset_value.clone();
            }

            let (status, payload) = self
                .request(
                    reqwest::Method::POST,
                    &format!("/collections/{}/points/scroll", name),
                    Some(body),
                )
                .await?;
            if status == reqwest::StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            if !status.is_success() {
                return Err(Self::fail(status, &payload, "scroll points"));
            }

            for point in payload["result"]["points"].as_array().cloned().unwrap_or_default() {
                points.push(VectorPoint {
                    id: point["id"].clone(),
                    vector: vector_from_value(&point["vector"]),
                    payload: point["payload"].clone(),
                });
            }

            match &payload["result"]["next_page_offset"] {
                Value::Null => break,
                next => offset = Some(next.clone()),
            }
        }

        tracing::info!(collection = %name, points = points.len(), "Points exported");
        Ok(points)
    }

    /// Replay exported points into the memory's collection, in batches.
    pub async fn import_points(&self, memory_id: &str, points: &[VectorPoint]) -> Result<u64> {
        if points.is_empty() {
            return Ok(0);
        }
        self.ensure_collection(memory_id).await?;
        let name = self.collection_name(memory_id);

        let mut imported = 0u64;
        for batch in points.chunks(100) {
            let body_points: Vec<Value> = batch
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id,
                        "vector": p.vector,
                        "payload": p.payload,
                    })
                })
                .collect();
            let (status, payload) = self
                .request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}/points?wait=true", name),
                    Some(json!({ "points": body_points })),
                )
                .await?;
            if !status.is_success() {
                return Err(Self::fail(status, &payload, "import points"));
            }
            imported += batch.len() as u64;
        }

        tracing::info!(collection = %name, imported, "Points imported");
        Ok(imported)
    }

    pub async fn probe(&self) -> DependencyStatus {
        match self.request(reqwest::Method::GET, "/collections", None).await {
            Ok((status, payload)) if status.is_success() => {
                let count = payload["result"]["collections"]
                    .as_array()
                    .map(|c| c.len())
                    .unwrap_or(0);
                DependencyStatus::ok(format!("vector store reachable ({} collections)", count))
            }
            Ok((status, _)) => DependencyStatus::error(format!("HTTP {}", status)),
            Err(e) => DependencyStatus::error(e.to_string()),
        }
    }
}

/// Rebuild a chunk from a point payload.
pub fn payload_to_chunk(payload: &Value) -> Chunk {
    Chunk {
        text: payload["text"].as_str().unwrap_or_default().to_string(),
        sequence: payload["sequence"].as_u64().unwrap_or(0) as usize,
        total_chunks: payload["total_chunks"].as_u64().unwrap_or(0) as usize,
        document_id: payload["document_id"].as_str().map(str::to_string),
        memory_id: payload["memory_id"].as_str().map(str::to_string),
        filename: payload["filename"].as_str().map(str::to_string),
        section_title: payload["section_title"].as_str().map(str::to_string),
        article_number: payload["article_number"].as_str().map(str::to_string),
        section_path: payload["section_path"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        char_count: payload["char_count"].as_u64().unwrap_or(0) as usize,
        token_count: payload["token_count"].as_u64().unwrap_or(0) as usize,
    }
}

fn vector_from_value(value: &Value) -> Vec<f32> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect())
        .unwrap_or_default()
}

/// L2-normalise a vector in place if it is not already unit length.
/// Cosine scores are only meaningful on normalised vectors.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && (norm - 1.0).abs() > 1e-3 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_are_sanitised() {
        let store = VectorStore::new(
            &graphmem_core::config::VectorStoreConfig {
                url: "http://qdrant:6333".into(),
                collection_prefix: "memory_".into(),
            },
            1024,
        );
        assert_eq!(store.collection_name("legal"), "memory_legal");
        assert_eq!(store.collection_name("quoteflow-legal"), "memory_quoteflow_legal");
    }

    #[test]
    fn payload_roundtrip() {
        let payload = json!({
            "text": "Le prestataire s'engage.",
            "sequence": 3,
            "total_chunks": 10,
            "document_id": "doc-1",
            "memory_id": "legal",
            "filename": "cga.pdf",
            "section_title": "Réversibilité",
            "article_number": "23.2",
            "section_path": ["Titre III", "Article 23"],
            "char_count": 24,
            "token_count": 6,
        });
        let chunk = payload_to_chunk(&payload);
        assert_eq!(chunk.sequence, 3);
        assert_eq!(chunk.document_id.as_deref(), Some("doc-1"));
        assert_eq!(chunk.section_path.len(), 2);
    }

    #[test]
    fn normalisation_is_idempotent() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let snapshot = v.clone();
        l2_normalize(&mut v);
        assert_eq!(v, snapshot);

        let mut zero = vec![0.0f32; 4];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 4]);
    }
}
