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

//! Entity search: accent-insensitive fulltext tier with a CONTAINS
//! fallback, plus entity context and full-graph export.

use super::{as_opt_string, as_string, as_u64, GraphStore};
use crate::text::{self, QueryTokens};
use graphmem_core::error::Result;
use graphmem_core::types::{
    DocumentRef, EntityContext, EntityHit, GraphSnapshot, RelatedEntity, RelationRef,
};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

impl GraphStore {
    /// Create the accent-folding fulltext index. Lazy and idempotent: runs
    /// once per process, on the first search.
    pub async fn ensure_fulltext_index(&self) -> Result<()> {
        if self.fulltext_ready.load(Ordering::Relaxed) {
            return Ok(());
        }
        let outcome = self
            .run(
                "CREATE FULLTEXT INDEX entity_fulltext IF NOT EXISTS \
                 FOR (n:Entity) ON EACH [n.name, n.description, n.type] \
                 OPTIONS {indexConfig: {`fulltext.analyzer`: 'standard-folding'}}",
                json!({}),
            )
            .await;
        match outcome {
            Ok(_) => {
                self.fulltext_ready.store(true, Ordering::Relaxed);
                tracing::info!("Fulltext index entity_fulltext ready (standard-folding)");
                Ok(())
            }
            Err(e) => {
                // Search degrades to the CONTAINS tier.
                tracing::warn!(error = %e, "Could not create fulltext index");
                Ok(())
            }
        }
    }

    /// Two-tier entity search (spec tokenisation, fulltext tier, CONTAINS
    /// union when the fulltext tier comes back thin).
    pub async fn search_entities(
        &self,
        memory_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<EntityHit>> {
        let tokens = text::tokenize(query, &self.stopwords);
        tracing::debug!(
            memory_id = %memory_id,
            query = %query,
            raw = ?tokens.raw,
            normalized = ?tokens.normalized,
            "Search tokenised"
        );
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_fulltext_index().await?;

        let mut hits = self.search_fulltext(memory_id, &tokens, limit).await?;

        // Thin fulltext results: union with the substring tier.
        if hits.len() < limit.div_ceil(2) {
            let contains = self.search_contains(memory_id, &tokens, limit).await?;
            for hit in contains {
                if !hits.iter().any(|h| h.name == hit.name) {
                    hits.push(hit);
                }
            }
            hits.truncate(limit);
        }

        tracing::debug!(memory_id = %memory_id, hits = hits.len(), "Search complete");
        Ok(hits)
    }

    /// Tier 1: scored Lucene query against the accent-folding index.
    async fn search_fulltext(
        &self,
        memory_id: &str,
        tokens: &QueryTokens,
        limit: usize,
    ) -> Result<Vec<EntityHit>> {
        let lucene_query = tokens
            .raw
            .iter()
            .map(|t| text::escape_lucene(t))
            .collect::<Vec<_>>()
            .join(" OR ");

        let result = self
            .run(
                "CALL db.index.fulltext.queryNodes('entity_fulltext', $query) \
                 YIELD node, score \
                 WHERE node.memory_id = $memory_id \
                 RETURN node.name, node.type, node.description, node.mention_count, \
                        coalesce(node.source_docs, []), score \
                 ORDER BY score DESC LIMIT $limit",
                json!({
                    "query": lucene_query,
                    "memory_id": memory_id,
                    "limit": limit,
                }),
            )
            .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                // Index may be missing on older deployments; the CONTAINS
                // tier still answers.
                tracing::warn!(error = %e, "Fulltext tier failed");
                return Ok(Vec::new());
            }
        };

        Ok(rows
            .iter()
            .map(|row| EntityHit {
                name: as_string(&row[0]),
                entity_type: as_string(&row[1]),
                description: as_opt_string(&row[2]),
                mentions: as_u64(&row[3]),
                source_docs: string_array(&row[4]),
                score: row[5].as_f64(),
            })
            .collect())
    }

    /// Tier 2: substring scan over entity names, raw and folded token forms,
    /// ordered by (tokens matched desc, mentions desc).
    async fn search_contains(
        &self,
        memory_id: &str,
        tokens: &QueryTokens,
        limit: usize,
    ) -> Result<Vec<EntityHit>> {
        let all_forms = tokens.all_forms();

        let rows = self
            .run(
                "MATCH (e:Entity {memory_id: $memory_id}) \
                 WITH e, size([t IN $tokens WHERE toLower(e.name) CONTAINS t]) as matched \
                 WHERE matched > 0 \
                 RETURN e.name, e.type, e.description, e.mention_count, \
                        coalesce(e.source_docs, []), matched \
                 ORDER BY matched DESC, e.mention_count DESC LIMIT $limit",
                json!({
                    "memory_id": memory_id,
                    "tokens": all_forms,
                    "limit": limit,
                }),
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| EntityHit {
                name: as_string(&row[0]),
                entity_type: as_string(&row[1]),
                description: as_opt_string(&row[2]),
                mentions: as_u64(&row[3]),
                source_docs: string_array(&row[4]),
                score: None,
            })
            .collect())
    }

    /// Full 1-hop context of an entity: mentioning documents, neighbours and
    /// incident relations. Falls back to a tolerant CONTAINS match when the
    /// exact name is unknown.
    pub async fn entity_context(&self, memory_id: &str, entity_name: &str) -> Result<EntityContext> {
        if let Some(context) = self.context_query(memory_id, entity_name, true).await? {
            return Ok(context);
        }
        let tolerant = self.context_query(memory_id, entity_name, false).await?;
        Ok(tolerant.unwrap_or_else(|| EntityContext {
            entity_name: entity_name.to_string(),
            ..Default::default()
        }))
    }

    async fn context_query(
        &self,
        memory_id: &str,
        entity_name: &str,
        exact: bool,
    ) -> Result<Option<EntityContext>> {
        let statement = if exact {
            "MATCH (e:Entity {name: $name, memory_id: $memory_id}) \
             OPTIONAL MATCH (d:Document)-[:MENTIONS]->(e) \
             OPTIONAL MATCH (e)-[r:RELATED_TO]-(other:Entity) \
             RETURN e.name, e.type, \
                    collect(DISTINCT {id: d.id, filename: d.filename, uri: d.object_uri}), \
                    collect(DISTINCT {name: other.name, type: other.type}), \
                    collect(DISTINCT {type: r.type, description: r.description}) \
             LIMIT 1"
        } else {
            "MATCH (e:Entity {memory_id: $memory_id}) \
             WHERE toLower(e.name) CONTAINS toLower($name) \
             OPTIONAL MATCH (d:Document)-[:MENTIONS]->(e) \
             OPTIONAL MATCH (e)-[r:RELATED_TO]-(other:Entity) \
             RETURN e.name, e.type, \
                    collect(DISTINCT {id: d.id, filename: d.filename, uri: d.object_uri}), \
                    collect(DISTINCT {name: other.name, type: other.type}), \
                    collect(DISTINCT {type: r.type, description: r.description}) \
             LIMIT 1"
        };

        let rows = self
            .run(statement, json!({ "name": entity_name, "memory_id": memory_id }))
            .await?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let documents = row[2]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|v| v["id"].is_string())
                    .map(|v| DocumentRef {
                        id: as_string(&v["id"]),
                        filename: as_string(&v["filename"]),
                        uri: as_string(&v["uri"]),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let related_entities = row[3]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|v| v["name"].is_string())
                    .map(|v| RelatedEntity {
                        name: as_string(&v["name"]),
                        entity_type: as_opt_string(&v["type"]),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let relations = row[4]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|v| v["type"].is_string())
                    .map(|v| RelationRef {
                        relation_type: as_string(&v["type"]),
                        description: as_opt_string(&v["description"]),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(EntityContext {
            entity_name: as_string(&row[0]),
            entity_type: as_opt_string(&row[1]),
            documents,
            related_entities,
            relations,
        }))
    }

    /// Full graph of a memory, shaped for the visualizer: entity and
    /// document nodes, RELATED_TO and MENTIONS edges, plus a flat document
    /// list with object URIs.
    pub async fn full_graph(&self, memory_id: &str) -> Result<GraphSnapshot> {
        let mut snapshot = GraphSnapshot::default();

        let entity_rows = self
            .run(
                "MATCH (e:Entity {memory_id: $memory_id}) \
                 RETURN e.name, e.type, e.description, e.mention_count, \
                        coalesce(e.source_docs, []) \
                 ORDER BY e.mention_count DESC",
                json!({ "memory_id": memory_id }),
            )
            .await?;

        for row in &entity_rows {
            snapshot.nodes.push(json!({
                "id": as_string(&row[0]),
                "label": as_string(&row[0]),
                "type": as_string(&row[1]),
                "description": as_string(&row[2]),
                "mentions": as_u64(&row[3]),
                "source_docs": row[4].clone(),
                "node_type": "entity",
            }));
        }

        let doc_rows = self
            .run(
                "MATCH (d:Document {memory_id: $memory_id}) \
                 RETURN d.id, d.filename, d.object_uri, d.content_hash, d.ingested_at \
                 ORDER BY d.ingested_at DESC",
                json!({ "memory_id": memory_id }),
            )
            .await?;

        for row in &doc_rows {
            let id = as_string(&row[0]);
            snapshot.documents.push(json!({
                "id": id,
                "filename": as_string(&row[1]),
                "uri": as_string(&row[2]),
                "hash": as_string(&row[3]),
                "ingested_at": as_string(&row[4]),
            }));
            snapshot.nodes.push(json!({
                "id": format!("doc:{}", id),
                "label": as_string(&row[1]),
                "type": "Document",
                "uri": as_string(&row[2]),
                "node_type": "document",
            }));
        }

        let edge_rows = self
            .run(
                "MATCH (from:Entity {memory_id: $memory_id})-[r:RELATED_TO]->(to:Entity {memory_id: $memory_id}) \
                 RETURN from.name, to.name, r.type, r.description, r.weight",
                json!({ "memory_id": memory_id }),
            )
            .await?;

        for row in &edge_rows {
            snapshot.edges.push(json!({
                "from": as_string(&row[0]),
                "to": as_string(&row[1]),
                "type": as_string(&row[2]),
                "description": as_string(&row[3]),
                "weight": row[4].as_f64().unwrap_or(1.0),
            }));
        }

        let mention_rows = self
            .run(
                "MATCH (d:Document {memory_id: $memory_id})-[r:MENTIONS]->(e:Entity {memory_id: $memory_id}) \
                 RETURN d.id, e.name, r.count",
                json!({ "memory_id": memory_id }),
            )
            .await?;

        for row in &mention_rows {
            snapshot.edges.push(json!({
                "from": format!("doc:{}", as_string(&row[0])),
                "to": as_string(&row[1]),
                "type": "MENTIONS",
                "weight": as_u64(&row[2]).max(1),
            }));
        }

        Ok(snapshot)
    }
}

pub(crate) fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|v| as_string(v)).collect())
        .unwrap_or_default()
}
