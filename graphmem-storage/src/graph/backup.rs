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

//! Snapshot export and replay of a memory's subgraph, used by backups.

use super::{as_string, GraphStore};
use graphmem_core::error::{MemoryError, Result};
use graphmem_core::types::ImportCounts;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Canonical JSON structure of one memory's subgraph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphExport {
    pub memory: Value,
    pub documents: Vec<Value>,
    pub entities: Vec<Value>,
    pub relations: Vec<Value>,
    pub mentions: Vec<Value>,
}

impl GraphStore {
    /// Export the complete subgraph rooted at a memory.
    pub async fn export_memory(&self, memory_id: &str) -> Result<GraphExport> {
        let memory_rows = self
            .run(
                "MATCH (m:Memory {id: $id}) RETURN properties(m)",
                json!({ "id": memory_id }),
            )
            .await?;
        let memory = memory_rows
            .first()
            .and_then(|row| row.first())
            .cloned()
            .ok_or_else(|| {
                MemoryError::not_found(format!("memory '{}' not found", memory_id))
            })?;

        let documents = self
            .run(
                "MATCH (d:Document {memory_id: $id}) RETURN properties(d) \
                 ORDER BY d.ingested_at",
                json!({ "id": memory_id }),
            )
            .await?
            .into_iter()
            .filter_map(|mut row| row.pop())
            .collect::<Vec<_>>();

        let entities = self
            .run(
                "MATCH (e:Entity {memory_id: $id}) RETURN properties(e) ORDER BY e.name",
                json!({ "id": memory_id }),
            )
            .await?
            .into_iter()
            .filter_map(|mut row| row.pop())
            .collect::<Vec<_>>();

        let relations = self
            .run(
                "MATCH (from:Entity {memory_id: $id})-[r:RELATED_TO]->(to:Entity {memory_id: $id}) \
                 RETURN from.name, from.type, to.name, to.type, properties(r)",
                json!({ "id": memory_id }),
            )
            .await?
            .into_iter()
            .map(|row| {
                let mut props = row
                    .get(4)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_else(Map::new);
                props.insert("from_name".to_string(), row[0].clone());
                props.insert("from_type".to_string(), row[1].clone());
                props.insert("to_name".to_string(), row[2].clone());
                props.insert("to_type".to_string(), row[3].clone());
                Value::Object(props)
            })
            .collect::<Vec<_>>();

        let mentions = self
            .run(
                "MATCH (d:Document {memory_id: $id})-[r:MENTIONS]->(e:Entity {memory_id: $id}) \
                 RETURN d.id, e.name, e.type, r.count",
                json!({ "id": memory_id }),
            )
            .await?
            .into_iter()
            .map(|row| {
                json!({
                    "doc_id": row[0],
                    "entity_name": row[1],
                    "entity_type": row[2],
                    "count": row[3],
                })
            })
            .collect::<Vec<_>>();

        tracing::info!(
            memory_id = %memory_id,
            documents = documents.len(),
            entities = entities.len(),
            relations = relations.len(),
            mentions = mentions.len(),
            "Graph exported"
        );

        Ok(GraphExport {
            memory,
            documents,
            entities,
            relations,
            mentions,
        })
    }

    /// Replay an exported subgraph. The target memory must not exist.
    pub async fn import_memory(&self, export: &GraphExport) -> Result<ImportCounts> {
        let memory_id = as_string(&export.memory["id"]);
        if memory_id.is_empty() {
            return Err(MemoryError::invalid("export has no memory id"));
        }
        if self.get_memory(&memory_id).await?.is_some() {
            return Err(MemoryError::AlreadyExists(format!(
                "memory '{}' already exists; delete it before restoring",
                memory_id
            )));
        }

        let mut counts = ImportCounts::default();

        self.run(
            "CREATE (m:Memory) SET m = $props",
            json!({ "props": export.memory }),
        )
        .await?;
        counts.memories = 1;

        for doc in &export.documents {
            self.run("CREATE (d:Document) SET d = $props", json!({ "props": doc }))
                .await?;
            counts.documents += 1;
        }

        for entity in &export.entities {
            self.run("CREATE (e:Entity) SET e = $props", json!({ "props": entity }))
                .await?;
            counts.entities += 1;
        }

        for relation in &export.relations {
            let mut props = relation.as_object().cloned().unwrap_or_default();
            let from_name = props.remove("from_name").unwrap_or(Value::Null);
            let from_type = props.remove("from_type").unwrap_or(Value::Null);
            let to_name = props.remove("to_name").unwrap_or(Value::Null);
            let to_type = props.remove("to_type").unwrap_or(Value::Null);

            self.run(
                "MATCH (from:Entity {name: $from_name, type: $from_type, memory_id: $memory_id}) \
                 MATCH (to:Entity {name: $to_name, type: $to_type, memory_id: $memory_id}) \
                 CREATE (from)-[r:RELATED_TO]->(to) SET r = $props",
                json!({
                    "from_name": from_name,
                    "from_type": from_type,
                    "to_name": to_name,
                    "to_type": to_type,
                    "memory_id": memory_id,
                    "props": Value::Object(props),
                }),
            )
            .await?;
            counts.relations += 1;
        }

        for mention in &export.mentions {
            self.run(
                "MATCH (d:Document {id: $doc_id, memory_id: $memory_id}) \
                 MATCH (e:Entity {name: $entity_name, type: $entity_type, memory_id: $memory_id}) \
                 CREATE (d)-[r:MENTIONS {count: $count}]->(e)",
                json!({
                    "doc_id": mention["doc_id"],
                    "entity_name": mention["entity_name"],
                    "entity_type": mention["entity_type"],
                    "memory_id": memory_id,
                    "count": mention["count"],
                }),
            )
            .await?;
            counts.mentions += 1;
        }

        tracing::info!(
            memory_id = %memory_id,
            documents = counts.documents,
            entities = counts.entities,
            relations = counts.relations,
            mentions = counts.mentions,
            "Graph imported"
        );

        Ok(counts)
    }
}
