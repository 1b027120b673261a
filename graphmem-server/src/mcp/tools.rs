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

//! Tool registry: every tool's name, argument schema, required permission
//! and optional memory-scope argument. The dispatcher consults this table
//! before touching any component.

use crate::auth::Principal;
use crate::mcp::protocol::Tool;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }

    pub fn allowed(&self, principal: &Principal) -> bool {
        principal.has_permission(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub permission: Permission,
    /// Name of the argument holding the memory scope, when the tool has one.
    pub memory_scope_arg: Option<&'static str>,
    pub input_schema: Value,
}

impl ToolDef {
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.name.to_string(),
            description: Some(self.description.to_string()),
            input_schema: self.input_schema.clone(),
        }
    }
}

fn schema(required: &[&str], properties: Value) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub fn tool_definitions() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "memory_create",
            description: "Create a new memory (isolated namespace) bound to an ontology",
            permission: Permission::Write,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id", "name", "ontology"],
                json!({
                    "memory_id": { "type": "string" },
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "ontology": { "type": "string" },
                }),
            ),
        },
        ToolDef {
            name: "memory_delete",
            description: "Delete a memory and everything it owns",
            permission: Permission::Admin,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(&["memory_id"], json!({ "memory_id": { "type": "string" } })),
        },
        ToolDef {
            name: "memory_list",
            description: "List memories visible to the caller",
            permission: Permission::Read,
            memory_scope_arg: None,
            input_schema: schema(&[], json!({})),
        },
        ToolDef {
            name: "memory_stats",
            description: "Counts of documents, entities, relations and chunks in a memory",
            permission: Permission::Read,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(&["memory_id"], json!({ "memory_id": { "type": "string" } })),
        },
        ToolDef {
            name: "memory_graph",
            description: "Full graph of a memory (nodes, edges, documents)",
            permission: Permission::Read,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(&["memory_id"], json!({ "memory_id": { "type": "string" } })),
        },
        ToolDef {
            name: "memory_ingest",
            description: "Ingest a document: store, extract its graph, chunk and embed it",
            permission: Permission::Write,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id", "filename", "content_base64"],
                json!({
                    "memory_id": { "type": "string" },
                    "filename": { "type": "string" },
                    "content_base64": { "type": "string" },
                    "force": { "type": "boolean" },
                    "source_path": { "type": "string" },
                    "source_modified_at": { "type": "string" },
                }),
            ),
        },
        ToolDef {
            name: "memory_search",
            description: "Accent-insensitive entity search with graph context",
            permission: Permission::Read,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id", "query"],
                json!({
                    "memory_id": { "type": "string" },
                    "query": { "type": "string" },
                    "limit": { "type": "integer" },
                }),
            ),
        },
        ToolDef {
            name: "memory_get_context",
            description: "Everything known about one entity: documents, neighbours, relations",
            permission: Permission::Read,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id", "entity_name"],
                json!({
                    "memory_id": { "type": "string" },
                    "entity_name": { "type": "string" },
                }),
            ),
        },
        ToolDef {
            name: "question_answer",
            description: "Graph-Guided RAG: answer a question with cited sources",
            permission: Permission::Read,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id", "question"],
                json!({
                    "memory_id": { "type": "string" },
                    "question": { "type": "string" },
                    "limit": { "type": "integer" },
                }),
            ),
        },
        ToolDef {
            name: "memory_query",
            description: "Graph-Guided retrieval returning the raw entities and chunks",
            permission: Permission::Read,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id", "query"],
                json!({
                    "memory_id": { "type": "string" },
                    "query": { "type": "string" },
                    "limit": { "type": "integer" },
                }),
            ),
        },
        ToolDef {
            name: "document_list",
            description: "List the documents of a memory",
            permission: Permission::Read,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(&["memory_id"], json!({ "memory_id": { "type": "string" } })),
        },
        ToolDef {
            name: "document_get",
            description: "Metadata of one document",
            permission: Permission::Read,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id", "document_id"],
                json!({
                    "memory_id": { "type": "string" },
                    "document_id": { "type": "string" },
                }),
            ),
        },
        ToolDef {
            name: "document_delete",
            description: "Delete a document, its chunks, and orphaned entities",
            permission: Permission::Write,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id", "document_id"],
                json!({
                    "memory_id": { "type": "string" },
                    "document_id": { "type": "string" },
                }),
            ),
        },
        ToolDef {
            name: "ontology_list",
            description: "List the loaded extraction ontologies",
            permission: Permission::Read,
            memory_scope_arg: None,
            input_schema: schema(&[], json!({})),
        },
        ToolDef {
            name: "storage_check",
            description: "Compare object-store keys against the graph and report orphans",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(&[], json!({ "memory_id": { "type": "string" } })),
        },
        ToolDef {
            name: "storage_cleanup",
            description: "Delete orphaned objects (dry-run by default)",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(&[], json!({ "dry_run": { "type": "boolean" } })),
        },
        ToolDef {
            name: "backup_create",
            description: "Snapshot a memory (graph + vectors + document references)",
            permission: Permission::Admin,
            memory_scope_arg: Some("memory_id"),
            input_schema: schema(
                &["memory_id"],
                json!({
                    "memory_id": { "type": "string" },
                    "description": { "type": "string" },
                }),
            ),
        },
        ToolDef {
            name: "backup_list",
            description: "List backups, optionally for one memory",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(&[], json!({ "memory_id": { "type": "string" } })),
        },
        ToolDef {
            name: "backup_restore",
            description: "Restore a memory from a backup in the object store",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(&["backup_id"], json!({ "backup_id": { "type": "string" } })),
        },
        ToolDef {
            name: "backup_download",
            description: "Build a tar.gz archive of a backup, optionally with raw documents",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(
                &["backup_id"],
                json!({
                    "backup_id": { "type": "string" },
                    "include_documents": { "type": "boolean" },
                }),
            ),
        },
        ToolDef {
            name: "backup_delete",
            description: "Delete a backup from the object store",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(&["backup_id"], json!({ "backup_id": { "type": "string" } })),
        },
        ToolDef {
            name: "backup_restore_archive",
            description: "Restore a memory from an uploaded tar.gz archive",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(
                &["archive_base64"],
                json!({ "archive_base64": { "type": "string" } }),
            ),
        },
        ToolDef {
            name: "admin_create_token",
            description: "Create an access token (shown once)",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(
                &["client_name"],
                json!({
                    "client_name": { "type": "string" },
                    "email": { "type": "string" },
                    "permissions": { "type": "array", "items": { "type": "string" } },
                    "memory_ids": { "type": "array", "items": { "type": "string" } },
                    "expires_in_days": { "type": "integer" },
                }),
            ),
        },
        ToolDef {
            name: "admin_list_tokens",
            description: "List token metadata (never the tokens themselves)",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(&[], json!({ "include_revoked": { "type": "boolean" } })),
        },
        ToolDef {
            name: "admin_revoke_token",
            description: "Revoke a token by hash prefix",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(
                &["token_hash_prefix"],
                json!({ "token_hash_prefix": { "type": "string" } }),
            ),
        },
        ToolDef {
            name: "admin_update_token",
            description: "Add, remove or set a token's allowed memories",
            permission: Permission::Admin,
            memory_scope_arg: None,
            input_schema: schema(
                &["token_hash_prefix", "action"],
                json!({
                    "token_hash_prefix": { "type": "string" },
                    "action": { "type": "string", "enum": ["add", "remove", "set"] },
                    "memory_ids": { "type": "array", "items": { "type": "string" } },
                }),
            ),
        },
        ToolDef {
            name: "system_health",
            description: "Connectivity status of every dependency",
            permission: Permission::Read,
            memory_scope_arg: None,
            input_schema: schema(&[], json!({})),
        },
    ]
}

pub fn find_tool(name: &str) -> Option<ToolDef> {
    tool_definitions().into_iter().find(|def| def.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_the_tool_table() {
        let names: Vec<&str> = tool_definitions().iter().map(|d| d.name).collect();
        for expected in [
            "memory_create",
            "memory_delete",
            "memory_list",
            "memory_stats",
            "memory_graph",
            "memory_ingest",
            "memory_search",
            "memory_get_context",
            "question_answer",
            "memory_query",
            "document_list",
            "document_get",
            "document_delete",
            "ontology_list",
            "storage_check",
            "storage_cleanup",
            "backup_create",
            "backup_list",
            "backup_restore",
            "backup_download",
            "backup_delete",
            "backup_restore_archive",
            "admin_create_token",
            "admin_list_tokens",
            "admin_revoke_token",
            "admin_update_token",
            "system_health",
        ] {
            assert!(names.contains(&expected), "missing tool {}", expected);
        }
    }

    #[test]
    fn permissions_match_the_spec_table() {
        assert_eq!(find_tool("memory_delete").unwrap().permission, Permission::Admin);
        assert_eq!(find_tool("memory_ingest").unwrap().permission, Permission::Write);
        assert_eq!(find_tool("memory_search").unwrap().permission, Permission::Read);
        assert_eq!(find_tool("backup_create").unwrap().permission, Permission::Admin);
        assert_eq!(find_tool("storage_cleanup").unwrap().permission, Permission::Admin);
        assert_eq!(find_tool("system_health").unwrap().permission, Permission::Read);
    }

    #[test]
    fn permission_checks_delegate_to_principal() {
        let reader = Principal {
            client_name: "r".into(),
            permissions: vec!["read".into()],
            memory_ids: vec![],
            bootstrap: false,
        };
        assert!(Permission::Read.allowed(&reader));
        assert!(!Permission::Write.allowed(&reader));
        assert!(!Permission::Admin.allowed(&reader));
        assert!(Permission::Admin.allowed(&Principal::bootstrap()));
    }

    #[test]
    fn scoped_tools_declare_their_memory_argument() {
        assert_eq!(
            find_tool("memory_ingest").unwrap().memory_scope_arg,
            Some("memory_id")
        );
        assert_eq!(find_tool("memory_list").unwrap().memory_scope_arg, None);
        assert_eq!(find_tool("backup_restore").unwrap().memory_scope_arg, None);
    }

    #[test]
    fn schemas_declare_required_arguments() {
        let ingest = find_tool("memory_ingest").unwrap();
        let required: Vec<&str> = ingest.input_schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(required, vec!["memory_id", "filename", "content_base64"]);
    }
}
