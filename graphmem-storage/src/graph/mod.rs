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

//! Graph store adapter (Neo4j, HTTP transactional Cypher API).
//!
//! Every statement is parameterised; identifiers never reach Cypher through
//! string concatenation. Temporal properties are stored as RFC 3339 strings
//! so rows deserialize without driver-specific temporal types.

mod backup;
mod search;
mod tokens;

pub use backup::GraphExport;

use chrono::{DateTime, Utc};
use graphmem_core::config::{GraphStoreConfig, Limits};
use graphmem_core::error::{MemoryError, Result};
use graphmem_core::types::{
    DependencyStatus, DocumentInfo, EntitySummary, ExtractionResult, MemoryInfo, MemoryStats,
    MergeCounts,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;

const DEPENDENCY: &str = "graph-store";

pub struct GraphStore {
    http: reqwest::Client,
    commit_url: String,
    user: String,
    password: String,
    fulltext_ready: AtomicBool,
    stopwords: HashSet<String>,
}

impl GraphStore {
    pub fn new(config: &GraphStoreConfig, limits: &Limits) -> Self {
        let commit_url = format!(
            "{}/db/{}/tx/commit",
            config.uri.trim_end_matches('/'),
            config.database
        );
        Self {
            http: reqwest::Client::new(),
            commit_url,
            user: config.user.clone(),
            password: config.password.clone(),
            fulltext_ready: AtomicBool::new(false),
            stopwords: crate::text::build_stopwords(&limits.stopword_langs),
        }
    }

    /// Run one Cypher statement and return its rows.
    pub(crate) async fn run(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>> {
        let mut results = self
            .run_many(vec![(statement.to_string(), parameters)])
            .await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Run several statements in one transaction; returns rows per statement.
    pub(crate) async fn run_many(
        &self,
        statements: Vec<(String, Value)>,
    ) -> Result<Vec<Vec<Vec<Value>>>> {
        let body = json!({
            "statements": statements
                .iter()
                .map(|(stmt, params)| json!({ "statement": stmt, "parameters": params }))
                .collect::<Vec<_>>()
        });

        let response = self
            .http
            .post(&self.commit_url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::dependency(DEPENDENCY, e))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| MemoryError::dependency(DEPENDENCY, e))?;

        if let Some(errors) = payload["errors"].as_array() {
            if let Some(first) = errors.first() {
                let code = first["code"].as_str().unwrap_or("Neo.Unknown");
                let message = first["message"].as_str().unwrap_or("unknown error");
                return Err(MemoryError::dependency(
                    DEPENDENCY,
                    format!("{}: {}", code, message),
                ));
            }
        }
        if !status.is_success() {
            return Err(MemoryError::dependency(
                DEPENDENCY,
                format!("HTTP {}", status),
            ));
        }

        let results = payload["results"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|result| {
                result["data"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|entry| entry["row"].as_array().cloned().unwrap_or_default())
                    .collect()
            })
            .collect();

        Ok(results)
    }

    pub async fn probe(&self) -> DependencyStatus {
        match self.run("RETURN 1", json!({})).await {
            Ok(_) => DependencyStatus::ok("graph store reachable"),
            Err(e) => DependencyStatus::error(e.to_string()),
        }
    }

    // =========================================================================
    // Memories
    // =========================================================================

    pub async fn create_memory(
        &self,
        memory_id: &str,
        name: &str,
        description: Option<&str>,
        ontology: &str,
        ontology_uri: Option<&str>,
    ) -> Result<MemoryInfo> {
        if self.get_memory(memory_id).await?.is_some() {
            return Err(MemoryError::AlreadyExists(format!(
                "memory '{}' already exists",
                memory_id
            )));
        }

        let created_at = Utc::now();
        self.run(
            "CREATE (m:Memory {id: $id, name: $name, description: $description, \
             ontology: $ontology, ontology_uri: $ontology_uri, created_at: $created_at})",
            json!({
                "id": memory_id,
                "name": name,
                "description": description,
                "ontology": ontology,
                "ontology_uri": ontology_uri,
                "created_at": created_at.to_rfc3339(),
            }),
        )
        .await?;

        tracing::info!(memory_id = %memory_id, ontology = %ontology, "Memory created");

        Ok(MemoryInfo {
            id: memory_id.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            ontology: ontology.to_string(),
            ontology_uri: ontology_uri.map(str::to_string),
            created_at,
        })
    }

    pub async fn get_memory(&self, memory_id: &str) -> Result<Option<MemoryInfo>> {
        let rows = self
            .run(
                "MATCH (m:Memory {id: $id}) RETURN m.id, m.name, m.description, \
                 m.ontology, m.ontology_uri, m.created_at",
                json!({ "id": memory_id }),
            )
            .await?;

        Ok(rows.first().map(|row| memory_from_row(row)))
    }

    pub async fn list_memories(&self) -> Result<Vec<MemoryInfo>> {
        let rows = self
            .run(
                "MATCH (m:Memory) RETURN m.id, m.name, m.description, m.ontology, \
                 m.ontology_uri, m.created_at ORDER BY m.created_at DESC",
                json!({}),
            )
            .await?;

        Ok(rows.iter().map(|row| memory_from_row(row)).collect())
    }

    /// Delete a memory and every node owned by it. Returns cascade counts
    /// (documents, entities).
    pub async fn delete_memory(&self, memory_id: &str) -> Result<(u64, u64)> {
        if self.get_memory(memory_id).await?.is_none() {
            return Err(MemoryError::not_found(format!(
                "memory '{}' not found",
                memory_id
            )));
        }

        let rows = self
            .run(
                "OPTIONAL MATCH (d:Document {memory_id: $id}) WITH count(d) as docs \
                 OPTIONAL MATCH (e:Entity {memory_id: $id}) RETURN docs, count(e)",
                json!({ "id": memory_id }),
            )
            .await?;
        let (documents, entities) = rows
            .first()
            .map(|row| (as_u64(&row[0]), as_u64(&row[1])))
            .unwrap_or((0, 0));

        self.run_many(vec![
            (
                "MATCH (n) WHERE n.memory_id = $id DETACH DELETE n".to_string(),
                json!({ "id": memory_id }),
            ),
            (
                "MATCH (m:Memory {id: $id}) DETACH DELETE m".to_string(),
                json!({ "id": memory_id }),
            ),
        ])
        .await?;

        tracing::info!(memory_id = %memory_id, documents, entities, "Memory deleted");
        Ok((documents, entities))
    }

    pub async fn memory_stats(&self, memory_id: &str) -> Result<MemoryStats> {
        let rows = self
            .run(
                "OPTIONAL MATCH (d:Document {memory_id: $id}) \
                 WITH count(d) as docs \
                 OPTIONAL MATCH (e:Entity {memory_id: $id}) \
                 WITH docs, count(e) as ents \
                 OPTIONAL MATCH (:Entity {memory_id: $id})-[r:RELATED_TO]->(:Entity {memory_id: $id}) \
                 RETURN docs, ents, count(r)",
                json!({ "id": memory_id }),
            )
            .await?;

        let (document_count, entity_count, relation_count) = rows
            .first()
            .map(|row| (as_u64(&row[0]), as_u64(&row[1]), as_u64(&row[2])))
            .unwrap_or_default();

        let top_rows = self
            .run(
                "MATCH (e:Entity {memory_id: $id}) \
                 RETURN e.name, e.type, e.mention_count \
                 ORDER BY e.mention_count DESC LIMIT 10",
                json!({ "id": memory_id }),
            )
            .await?;

        let top_entities = top_rows
            .iter()
            .map(|row| EntitySummary {
                name: as_string(&row[0]),
                entity_type: as_string(&row[1]),
                mentions: as_u64(&row[2]),
            })
            .collect();

        Ok(MemoryStats {
            memory_id: memory_id.to_string(),
            document_count,
            entity_count,
            relation_count,
            chunk_count: 0,
            top_entities,
        })
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Upsert a document keyed by `(memory_id, content_hash)`.
    pub async fn upsert_document(&self, doc: &DocumentInfo) -> Result<()> {
        self.run(
            "MERGE (d:Document {memory_id: $memory_id, content_hash: $content_hash}) \
             SET d.id = $id, d.filename = $filename, d.size_bytes = $size_bytes, \
                 d.text_length = $text_length, d.content_type = $content_type, \
                 d.object_uri = $object_uri, d.source_path = $source_path, \
                 d.source_modified_at = $source_modified_at, d.ingested_at = $ingested_at",
            json!({
                "memory_id": doc.memory_id,
                "content_hash": doc.content_hash,
                "id": doc.id,
                "filename": doc.filename,
                "size_bytes": doc.size_bytes,
                "text_length": doc.text_length,
                "content_type": doc.content_type,
                "object_uri": doc.object_uri,
                "source_path": doc.source_path.clone().unwrap_or_default(),
                "source_modified_at": doc.source_modified_at.clone().unwrap_or_default(),
                "ingested_at": doc.ingested_at.to_rfc3339(),
            }),
        )
        .await?;

        tracing::info!(memory_id = %doc.memory_id, document_id = %doc.id, filename = %doc.filename, "Document upserted");
        Ok(())
    }

    pub async fn get_document_by_hash(
        &self,
        memory_id: &str,
        content_hash: &str,
    ) -> Result<Option<DocumentInfo>> {
        let rows = self
            .run(
                &format!(
                    "MATCH (d:Document {{memory_id: $memory_id, content_hash: $hash}}) {}",
                    DOCUMENT_RETURN
                ),
                json!({ "memory_id": memory_id, "hash": content_hash }),
            )
            .await?;
        Ok(rows.first().map(|row| document_from_row(row)))
    }

    pub async fn get_document(
        &self,
        memory_id: &str,
        document_id: &str,
    ) -> Result<Option<DocumentInfo>> {
        let rows = self
            .run(
                &format!(
                    "MATCH (d:Document {{memory_id: $memory_id, id: $id}}) {}",
                    DOCUMENT_RETURN
                ),
                json!({ "memory_id": memory_id, "id": document_id }),
            )
            .await?;
        Ok(rows.first().map(|row| document_from_row(row)))
    }

    pub async fn list_documents(&self, memory_id: &str) -> Result<Vec<DocumentInfo>> {
        let rows = self
            .run(
                &format!(
                    "MATCH (d:Document {{memory_id: $memory_id}}) {} ORDER BY d.ingested_at DESC",
                    DOCUMENT_RETURN
                ),
                json!({ "memory_id": memory_id }),
            )
            .await?;
        Ok(rows.iter().map(|row| document_from_row(row)).collect())
    }

    /// Object URIs of every document across all memories. Used by storage
    /// consistency checks: a document of another memory is never an orphan.
    pub async fn all_document_uris(&self) -> Result<HashSet<String>> {
        let rows = self
            .run("MATCH (d:Document) RETURN d.object_uri", json!({}))
            .await?;
        Ok(rows.iter().map(|row| as_string(&row[0])).collect())
    }

    /// Delete a document, its MENTIONS edges, and any entity left without a
    /// source document (orphan cascade). Returns (mentions, entities) deleted.
    pub async fn delete_document(&self, memory_id: &str, document_id: &str) -> Result<(u64, u64)> {
        let mentions_rows = self
            .run(
                "MATCH (d:Document {id: $id, memory_id: $memory_id})-[r:MENTIONS]->() \
                 RETURN count(r)",
                json!({ "id": document_id, "memory_id": memory_id }),
            )
            .await?;
        let mentions = mentions_rows.first().map(|r| as_u64(&r[0])).unwrap_or(0);

        // Entities mentioned only by this document become orphans.
        let orphan_rows = self
            .run(
                "MATCH (d:Document {id: $id, memory_id: $memory_id})-[:MENTIONS]->(e:Entity) \
                 WHERE NOT EXISTS { \
                     MATCH (other:Document)-[:MENTIONS]->(e) WHERE other.id <> $id \
                 } \
                 RETURN collect(e.name)",
                json!({ "id": document_id, "memory_id": memory_id }),
            )
            .await?;
        let orphan_names: Vec<String> = orphan_rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(|v| as_string(v)).collect())
            .unwrap_or_default();

        let mut entities_deleted = 0u64;
        if !orphan_names.is_empty() {
            let deleted_rows = self
                .run(
                    "MATCH (e:Entity {memory_id: $memory_id}) WHERE e.name IN $names \
                     DETACH DELETE e RETURN count(e)",
                    json!({ "memory_id": memory_id, "names": orphan_names }),
                )
                .await?;
            entities_deleted = deleted_rows.first().map(|r| as_u64(&r[0])).unwrap_or(0);
        }

        // Remaining entities keep their mention history; only drop this
        // document from their source lists.
        self.run(
            "MATCH (e:Entity {memory_id: $memory_id}) WHERE $id IN coalesce(e.source_docs, []) \
             SET e.source_docs = [doc IN e.source_docs WHERE doc <> $id]",
            json!({ "memory_id": memory_id, "id": document_id }),
        )
        .await?;

        let deleted_rows = self
            .run(
                "MATCH (d:Document {id: $id, memory_id: $memory_id}) \
                 DETACH DELETE d RETURN count(d)",
                json!({ "id": document_id, "memory_id": memory_id }),
            )
            .await?;
        let deleted = deleted_rows.first().map(|r| as_u64(&r[0])).unwrap_or(0);
        if deleted == 0 {
            return Err(MemoryError::not_found(format!(
                "document '{}' not found in memory '{}'",
                document_id, memory_id
            )));
        }

        tracing::info!(
            memory_id = %memory_id,
            document_id = %document_id,
            mentions_deleted = mentions,
            entities_deleted,
            "Document deleted"
        );
        Ok((mentions, entities_deleted))
    }

    // =========================================================================
    // Entities & relations
    // =========================================================================

    /// Merge one document's extraction into the graph.
    ///
    /// Entities merge on `(memory_id, name, type)`: mentions accumulate,
    /// descriptions append (deduplicated by substring), source documents
    /// union. Relations merge on `(memory_id, from, to, type)` with a
    /// cumulative weight. Every entity gets a MENTIONS edge from the
    /// document.
    pub async fn merge_extraction(
        &self,
        memory_id: &str,
        document_id: &str,
        extraction: &ExtractionResult,
    ) -> Result<MergeCounts> {
        let mut counts = MergeCounts::default();
        let now = Utc::now().to_rfc3339();

        for entity in &extraction.entities {
            let rows = self
                .run(
                    "MERGE (e:Entity {name: $name, type: $type, memory_id: $memory_id}) \
                     ON CREATE SET \
                         e.description = $description, \
                         e.source_docs = [$doc_id], \
                         e.created_at = $now, \
                         e.updated_at = $now, \
                         e.mention_count = $mentions \
                     ON MATCH SET \
                         e.mention_count = e.mention_count + $mentions, \
                         e.updated_at = $now, \
                         e.source_docs = CASE \
                             WHEN NOT $doc_id IN coalesce(e.source_docs, []) \
                             THEN coalesce(e.source_docs, []) + $doc_id \
                             ELSE e.source_docs END, \
                         e.description = CASE \
                             WHEN $description IS NULL THEN e.description \
                             WHEN e.description IS NULL THEN $description \
                             WHEN e.description CONTAINS $description THEN e.description \
                             ELSE e.description + ' | ' + $description END \
                     WITH e, (e.created_at = $now) as was_created \
                     MATCH (d:Document {id: $doc_id, memory_id: $memory_id}) \
                     MERGE (d)-[r:MENTIONS]->(e) \
                     ON CREATE SET r.count = $mentions \
                     ON MATCH SET r.count = r.count + $mentions \
                     RETURN was_created",
                    json!({
                        "name": entity.name,
                        "type": entity.entity_type,
                        "memory_id": memory_id,
                        "description": entity.description,
                        "doc_id": document_id,
                        "mentions": entity.mentions,
                        "now": now,
                    }),
                )
                .await?;

            match rows.first().and_then(|row| row.first()).and_then(Value::as_bool) {
                Some(true) => counts.entities_created += 1,
                _ => counts.entities_merged += 1,
            }
        }

        for relation in &extraction.relations {
            let rows = self
                .run(
                    "MATCH (from:Entity {name: $from_name, memory_id: $memory_id}) \
                     MATCH (to:Entity {name: $to_name, memory_id: $memory_id}) \
                     MERGE (from)-[r:RELATED_TO {type: $rel_type}]->(to) \
                     ON CREATE SET \
                         r.description = $description, \
                         r.weight = $weight, \
                         r.source_doc = $doc_id, \
                         r.created_at = $now \
                     ON MATCH SET \
                         r.weight = r.weight + $weight, \
                         r.description = CASE \
                             WHEN $description IS NULL THEN r.description \
                             WHEN r.description IS NULL THEN $description \
                             WHEN r.description CONTAINS $description THEN r.description \
                             ELSE r.description + ' | ' + $description END \
                     RETURN (r.created_at = $now) as was_created",
                    json!({
                        "from_name": relation.from_entity,
                        "to_name": relation.to_entity,
                        "memory_id": memory_id,
                        "rel_type": relation.relation_type,
                        "description": relation.description,
                        "weight": relation.weight,
                        "doc_id": document_id,
                        "now": now,
                    }),
                )
                .await?;

            match rows.first().and_then(|row| row.first()).and_then(Value::as_bool) {
                Some(true) => counts.relations_created += 1,
                Some(false) => counts.relations_merged += 1,
                // Both endpoints must already exist in the memory; otherwise
                // the relation is dropped.
                None => tracing::debug!(
                    from = %relation.from_entity,
                    to = %relation.to_entity,
                    "Relation endpoints missing, skipped"
                ),
            }
        }

        tracing::info!(
            memory_id = %memory_id,
            document_id = %document_id,
            entities_created = counts.entities_created,
            entities_merged = counts.entities_merged,
            relations_created = counts.relations_created,
            relations_merged = counts.relations_merged,
            "Extraction merged into graph"
        );

        Ok(counts)
    }
}

const DOCUMENT_RETURN: &str = "RETURN d.id, d.memory_id, d.filename, d.content_hash, \
     d.size_bytes, d.text_length, d.content_type, d.object_uri, d.source_path, \
     d.source_modified_at, d.ingested_at";

pub(crate) fn as_string(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

pub(crate) fn as_opt_string(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

pub(crate) fn as_u64(value: &Value) -> u64 {
    value.as_u64().unwrap_or(0)
}

pub(crate) fn as_datetime(value: &Value) -> DateTime<Utc> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn memory_from_row(row: &[Value]) -> MemoryInfo {
    MemoryInfo {
        id: as_string(&row[0]),
        name: as_string(&row[1]),
        description: as_opt_string(&row[2]),
        ontology: as_opt_string(&row[3]).unwrap_or_else(|| "default".to_string()),
        ontology_uri: as_opt_string(&row[4]),
        created_at: as_datetime(&row[5]),
    }
}

fn document_from_row(row: &[Value]) -> DocumentInfo {
    DocumentInfo {
        id: as_string(&row[0]),
        memory_id: as_string(&row[1]),
        filename: as_string(&row[2]),
        content_hash: as_string(&row[3]),
        size_bytes: as_u64(&row[4]),
        text_length: as_u64(&row[5]),
        content_type: as_string(&row[6]),
        object_uri: as_string(&row[7]),
        source_path: as_opt_string(&row[8]),
        source_modified_at: as_opt_string(&row[9]),
        ingested_at: as_datetime(&row[10]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_conversion_handles_nulls() {
        let row = vec![
            json!("mem"),
            json!("Name"),
            Value::Null,
            Value::Null,
            Value::Null,
            json!("2024-05-01T12:00:00+00:00"),
        ];
        let memory = memory_from_row(&row);
        assert_eq!(memory.id, "mem");
        assert_eq!(memory.description, None);
        assert_eq!(memory.ontology, "default");
        assert_eq!(memory.created_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn document_row_roundtrip() {
        let row = vec![
            json!("doc-1"),
            json!("mem"),
            json!("cga.pdf"),
            json!("abcd"),
            json!(1024),
            json!(2048),
            json!("application/pdf"),
            json!("s3://bucket/memories/mem/documents/doc-1"),
            json!(""),
            json!(""),
            json!("2024-05-01T12:00:00+00:00"),
        ];
        let doc = document_from_row(&row);
        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.size_bytes, 1024);
        assert_eq!(doc.source_path, None);
    }
}
