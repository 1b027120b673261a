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

//! Tool dispatcher.
//!
//! Binds the per-request principal and progress sink, enforces the tool's
//! declared permission and memory scope, serialises conflicting operations
//! on the same memory, and marshals arguments into component calls.

use crate::auth::{Principal, ScopeAction};
use crate::ingest::IngestRequest;
use crate::mcp::protocol::*;
use crate::mcp::tools::{find_tool, tool_definitions};
use crate::progress::ProgressSink;
use crate::AppState;
use base64::Engine;
use graphmem_core::error::{MemoryError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct McpHandler {
    state: AppState,
}

impl McpHandler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        principal: &Principal,
        progress: &ProgressSink,
    ) -> JsonRpcResponse {
        tracing::info!(method = %request.method, client = %principal.client_name, "MCP request");

        match request.method.as_str() {
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            "initialize" => self.handle_initialize(request.id),
            "initialized" | "notifications/initialized" => {
                JsonRpcResponse::success(request.id, json!({}))
            }
            "tools/list" => {
                let result = ListToolsResult {
                    tools: tool_definitions().iter().map(|d| d.to_tool()).collect(),
                };
                JsonRpcResponse::success(request.id, serde_json::to_value(result).unwrap_or_default())
            }
            "tools/call" => self.handle_tools_call(request, principal, progress).await,
            other => {
                tracing::warn!(method = %other, "Unknown MCP method");
                JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(other))
            }
        }
    }

    fn handle_initialize(&self, id: JsonRpcId) -> JsonRpcResponse {
        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                logging: Some(LoggingCapability {}),
            },
            server_info: ServerInfo {
                name: "graphmem".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
    }

    async fn handle_tools_call(
        &self,
        request: JsonRpcRequest,
        principal: &Principal,
        progress: &ProgressSink,
    ) -> JsonRpcResponse {
        let params: CallToolParams = match request.params {
            Some(params) => match serde_json::from_value(params) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::invalid_params(format!("invalid tool params: {}", e)),
                    )
                }
            },
            None => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::invalid_params("missing tool params"),
                )
            }
        };

        let outcome = self
            .dispatch_tool(&params.name, &params.arguments, principal, progress)
            .await;

        let result = match outcome {
            Ok(value) => CallToolResult::json(&value),
            Err(error) => {
                let body = error_body(&error);
                // Errors terminate the caller's progress view too.
                progress.notify("error", body.clone());
                tracing::warn!(tool = %params.name, kind = error.kind(), error = %error, "Tool failed");
                CallToolResult::error(&body)
            }
        };

        JsonRpcResponse::success(
            request.id,
            serde_json::to_value(result).unwrap_or_default(),
        )
    }

    /// Authorisation, memory-scope enforcement, conflict serialisation, then
    /// the component call.
    pub async fn dispatch_tool(
        &self,
        name: &str,
        args: &HashMap<String, Value>,
        principal: &Principal,
        progress: &ProgressSink,
    ) -> Result<Value> {
        let def = find_tool(name)
            .ok_or_else(|| MemoryError::not_found(format!("unknown tool '{}'", name)))?;

        if !def.permission.allowed(principal) {
            return Err(MemoryError::Forbidden(format!(
                "tool '{}' requires the '{}' permission",
                name,
                def.permission.as_str()
            )));
        }

        if let Some(scope_arg) = def.memory_scope_arg {
            if let Some(memory_id) = args.get(scope_arg).and_then(Value::as_str) {
                if !principal.allows_memory(memory_id) {
                    return Err(MemoryError::Forbidden(format!(
                        "token of '{}' is not allowed on memory '{}'",
                        principal.client_name, memory_id
                    )));
                }
            }
        }

        // A memory being backed up must not be concurrently ingested.
        let _guard = match name {
            "memory_ingest" | "backup_create" => {
                let memory_id = required_str(args, "memory_id")?;
                Some(self.state.memory_lock(&memory_id).lock_owned().await)
            }
            _ => None,
        };

        self.execute_tool(name, args, principal, progress).await
    }

    async fn execute_tool(
        &self,
        name: &str,
        args: &HashMap<String, Value>,
        principal: &Principal,
        progress: &ProgressSink,
    ) -> Result<Value> {
        let state = &self.state;
        match name {
            // ================================================================
            // Memories
            // ================================================================
            "memory_create" => {
                let memory_id = required_str(args, "memory_id")?;
                let display_name = required_str(args, "name")?;
                let description = opt_str(args, "description");
                let ontology_name = required_str(args, "ontology")?;
                let ontology = state.ontologies.get_or_err(&ontology_name)?;
                if state.graph.get_memory(&memory_id).await?.is_some() {
                    return Err(MemoryError::AlreadyExists(format!(
                        "memory '{}' already exists",
                        memory_id
                    )));
                }

                // Keep a copy of the ontology next to the memory's documents.
                let ontology_toml = toml::to_string(ontology.as_ref())
                    .map_err(|e| MemoryError::Internal(e.to_string()))?;
                let ontology_key = format!("memories/{}/ontology.toml", memory_id);
                state
                    .objects
                    .put(&ontology_key, ontology_toml.as_bytes(), "application/toml")
                    .await?;
                let ontology_uri = state.objects.uri_for(&ontology_key);

                let memory = state
                    .graph
                    .create_memory(
                        &memory_id,
                        &display_name,
                        description.as_deref(),
                        &ontology_name,
                        Some(ontology_uri.as_str()),
                    )
                    .await?;
                Ok(json!({ "created": true, "memory": memory }))
            }
            "memory_delete" => {
                let memory_id = required_str(args, "memory_id")?;
                let (documents, entities) = state.graph.delete_memory(&memory_id).await?;
                let collection_deleted = state.vector.delete_collection(&memory_id).await?;
                let objects_deleted = state
                    .objects
                    .delete_prefix(&graphmem_storage::ObjectStore::memory_prefix(&memory_id))
                    .await?;
                Ok(json!({
                    "memory_id": memory_id,
                    "documents_deleted": documents,
                    "entities_deleted": entities,
                    "collection_deleted": collection_deleted,
                    "objects_deleted": objects_deleted,
                }))
            }
            "memory_list" => {
                let memories = state.graph.list_memories().await?;
                // A scoped token only sees its own memories.
                let visible: Vec<_> = memories
                    .into_iter()
                    .filter(|m| principal.allows_memory(&m.id))
                    .collect();
                Ok(json!({ "count": visible.len(), "memories": visible }))
            }
            "memory_stats" => {
                let memory_id = required_str(args, "memory_id")?;
                if state.graph.get_memory(&memory_id).await?.is_none() {
                    return Err(MemoryError::not_found(format!(
                        "memory '{}' not found",
                        memory_id
                    )));
                }
                let mut stats = state.graph.memory_stats(&memory_id).await?;
                stats.chunk_count = state.vector.collection_count(&memory_id).await?;
                Ok(serde_json::to_value(stats).unwrap_or_default())
            }
            "memory_graph" => {
                let memory_id = required_str(args, "memory_id")?;
                let snapshot = state.graph.full_graph(&memory_id).await?;
                Ok(serde_json::to_value(snapshot).unwrap_or_default())
            }

            // ================================================================
            // Ingestion & documents
            // ================================================================
            "memory_ingest" => {
                let memory_id = required_str(args, "memory_id")?;
                let filename = required_str(args, "filename")?;
                let content_base64 = required_str(args, "content_base64")?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(content_base64.trim())
                    .map_err(|e| MemoryError::invalid(format!("invalid base64 content: {}", e)))?;

                let report = state
                    .ingest
                    .ingest(
                        IngestRequest {
                            memory_id,
                            filename,
                            bytes,
                            force: opt_bool(args, "force"),
                            source_path: opt_str(args, "source_path"),
                            source_modified_at: opt_str(args, "source_modified_at"),
                        },
                        progress,
                    )
                    .await?;
                Ok(serde_json::to_value(report).unwrap_or_default())
            }
            "document_list" => {
                let memory_id = required_str(args, "memory_id")?;
                let documents = state.graph.list_documents(&memory_id).await?;
                Ok(json!({ "count": documents.len(), "documents": documents }))
            }
            "document_get" => {
                let memory_id = required_str(args, "memory_id")?;
                let document_id = required_str(args, "document_id")?;
                let document = state
                    .graph
                    .get_document(&memory_id, &document_id)
                    .await?
                    .ok_or_else(|| {
                        MemoryError::not_found(format!("document '{}' not found", document_id))
                    })?;
                Ok(serde_json::to_value(document).unwrap_or_default())
            }
            "document_delete" => {
                let memory_id = required_str(args, "memory_id")?;
                let document_id = required_str(args, "document_id")?;
                state.ingest.delete_document(&memory_id, &document_id).await
            }

            // ================================================================
            // Search & query
            // ================================================================
            "memory_search" => {
                let memory_id = required_str(args, "memory_id")?;
                let query = required_str(args, "query")?;
                let limit = opt_usize(args, "limit").unwrap_or(10);
                let hits = state.graph.search_entities(&memory_id, &query, limit).await?;

                let mut results = Vec::with_capacity(hits.len());
                for hit in hits {
                    let context = state.graph.entity_context(&memory_id, &hit.name).await?;
                    results.push(json!({ "entity": hit, "context": context }));
                }
                Ok(json!({ "query": query, "count": results.len(), "results": results }))
            }
            "memory_get_context" => {
                let memory_id = required_str(args, "memory_id")?;
                let entity_name = required_str(args, "entity_name")?;
                let context = state.graph.entity_context(&memory_id, &entity_name).await?;
                Ok(serde_json::to_value(context).unwrap_or_default())
            }
            "question_answer" => {
                let memory_id = required_str(args, "memory_id")?;
                let question = required_str(args, "question")?;
                let answer = state
                    .query
                    .question_answer(&memory_id, &question, opt_usize(args, "limit"))
                    .await?;
                Ok(serde_json::to_value(answer).unwrap_or_default())
            }
            "memory_query" => {
                let memory_id = required_str(args, "memory_id")?;
                let query = required_str(args, "query")?;
                state
                    .query
                    .memory_query(&memory_id, &query, opt_usize(args, "limit"))
                    .await
            }

            // ================================================================
            // Ontologies
            // ================================================================
            "ontology_list" => Ok(json!({ "ontologies": state.ontologies.list() })),

            // ================================================================
            // Storage consistency
            // ================================================================
            "storage_check" => {
                let report = state.checker.check(opt_str(args, "memory_id").as_deref()).await?;
                Ok(serde_json::to_value(report).unwrap_or_default())
            }
            "storage_cleanup" => {
                let dry_run = args
                    .get("dry_run")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                state.checker.cleanup(dry_run).await
            }

            // ================================================================
            // Backups
            // ================================================================
            "backup_create" => {
                let memory_id = required_str(args, "memory_id")?;
                state
                    .backup
                    .create(&memory_id, opt_str(args, "description").as_deref(), progress)
                    .await
            }
            "backup_list" => {
                let backups = state.backup.list(opt_str(args, "memory_id").as_deref()).await?;
                Ok(json!({ "count": backups.len(), "backups": backups }))
            }
            "backup_restore" => {
                let backup_id = required_str(args, "backup_id")?;
                state.backup.restore(&backup_id, progress).await
            }
            "backup_download" => {
                let backup_id = required_str(args, "backup_id")?;
                let include_documents = opt_bool(args, "include_documents");
                let (bytes, digest) = state
                    .backup
                    .download(&backup_id, include_documents, progress)
                    .await?;
                Ok(json!({
                    "backup_id": backup_id,
                    "archive_base64": base64::engine::general_purpose::STANDARD.encode(&bytes),
                    "archive_sha256": digest,
                    "size_bytes": bytes.len(),
                    "include_documents": include_documents,
                }))
            }
            "backup_delete" => {
                let backup_id = required_str(args, "backup_id")?;
                state.backup.delete(&backup_id).await
            }
            "backup_restore_archive" => {
                let archive_base64 = required_str(args, "archive_base64")?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(archive_base64.trim())
                    .map_err(|e| MemoryError::invalid(format!("invalid base64 archive: {}", e)))?;
                state.backup.restore_archive(&bytes, progress).await
            }

            // ================================================================
            // Tokens
            // ================================================================
            "admin_create_token" => {
                let client_name = required_str(args, "client_name")?;
                let (raw, token) = state
                    .tokens
                    .create(
                        &client_name,
                        opt_str(args, "email"),
                        opt_str_vec(args, "permissions"),
                        opt_str_vec(args, "memory_ids"),
                        args.get("expires_in_days").and_then(Value::as_i64),
                    )
                    .await?;
                Ok(json!({
                    "token": raw,
                    "client_name": token.client_name,
                    "permissions": token.permissions,
                    "memory_ids": token.memory_ids,
                    "expires_at": token.expires_at,
                    "note": "store this token now; it will not be shown again",
                }))
            }
            "admin_list_tokens" => {
                let include_revoked = opt_bool(args, "include_revoked");
                let tokens = state.tokens.list(include_revoked).await?;
                let summaries: Vec<Value> = tokens
                    .iter()
                    .map(|t| {
                        json!({
                            "token_hash_prefix": &t.token_hash[..t.token_hash.len().min(8)],
                            "client_name": t.client_name,
                            "email": t.email,
                            "permissions": t.permissions,
                            "memory_ids": t.memory_ids,
                            "created_at": t.created_at,
                            "expires_at": t.expires_at,
                            "revoked_at": t.revoked_at,
                        })
                    })
                    .collect();
                Ok(json!({ "count": summaries.len(), "tokens": summaries }))
            }
            "admin_revoke_token" => {
                let prefix = required_str(args, "token_hash_prefix")?;
                let token = state.tokens.revoke(&prefix).await?;
                Ok(json!({ "revoked": true, "client_name": token.client_name }))
            }
            "admin_update_token" => {
                let prefix = required_str(args, "token_hash_prefix")?;
                let action = ScopeAction::parse(&required_str(args, "action")?)?;
                let memory_ids = opt_str_vec(args, "memory_ids");
                let token = state
                    .tokens
                    .update_memories(&prefix, action, &memory_ids)
                    .await?;
                Ok(json!({
                    "client_name": token.client_name,
                    "memory_ids": token.memory_ids,
                }))
            }

            // ================================================================
            // Health
            // ================================================================
            "system_health" => Ok(state.health_report().await),

            other => Err(MemoryError::not_found(format!("unknown tool '{}'", other))),
        }
    }
}

/// Client-facing error body: machine-readable kind, human message, and the
/// dependency name for dependency failures.
pub fn error_body(error: &MemoryError) -> Value {
    let mut body = json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    });
    if let Some(dependency) = error.dependency_name() {
        body["error"]["dependency"] = json!(dependency);
    }
    body
}

fn required_str(args: &HashMap<String, Value>, key: &str) -> Result<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| MemoryError::invalid(format!("missing required argument '{}'", key)))
}

fn opt_str(args: &HashMap<String, Value>, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn opt_bool(args: &HashMap<String, Value>, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn opt_usize(args: &HashMap<String, Value>, key: &str) -> Option<usize> {
    args.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

fn opt_str_vec(args: &HashMap<String, Value>, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_carries_kind_and_dependency() {
        let body = error_body(&MemoryError::dependency("graph-store", "down"));
        assert_eq!(body["error"]["kind"], "dependency_failure");
        assert_eq!(body["error"]["dependency"], "graph-store");

        let body = error_body(&MemoryError::Forbidden("nope".into()));
        assert_eq!(body["error"]["kind"], "forbidden");
        assert!(body["error"].get("dependency").is_none());
    }

    #[test]
    fn argument_extraction() {
        let mut args = HashMap::new();
        args.insert("memory_id".to_string(), json!("legal"));
        args.insert("limit".to_string(), json!(5));
        args.insert("force".to_string(), json!(true));
        args.insert("ids".to_string(), json!(["a", "b"]));

        assert_eq!(required_str(&args, "memory_id").unwrap(), "legal");
        assert!(required_str(&args, "missing").is_err());
        assert_eq!(opt_usize(&args, "limit"), Some(5));
        assert!(opt_bool(&args, "force"));
        assert!(!opt_bool(&args, "absent"));
        assert_eq!(opt_str_vec(&args, "ids"), vec!["a", "b"]);
    }

    #[test]
    fn empty_strings_are_missing_arguments() {
        let mut args = HashMap::new();
        args.insert("memory_id".to_string(), json!(""));
        assert!(required_str(&args, "memory_id").is_err());
        assert_eq!(opt_str(&args, "memory_id"), None);
    }
}
