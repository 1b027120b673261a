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

//! Backup and restore of memories.
//!
//! A backup is four files under `_backups/{memory_id}/{timestamp}/`:
//! `manifest.json`, `graph_data.json`, `vectors.jsonl`,
//! `document_keys.json`. The manifest carries a SHA-256 checksum over the
//! concatenation of (graph, vectors, keys) in that order. Restores require
//! the target memory to be absent; a failed replay deletes the partially
//! created memory. Backups can also travel as a tar.gz archive, optionally
//! embedding the raw documents.

use crate::progress::ProgressSink;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use graphmem_core::error::{MemoryError, Result};
use graphmem_storage::{GraphExport, GraphStore, ObjectStore, VectorPoint, VectorStore};
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, LazyLock};

pub const SCHEMA_VERSION: &str = "1.0";

/// Hard cap on uploaded archives.
const MAX_ARCHIVE_SIZE_BYTES: usize = 100 * 1024 * 1024;

static SAFE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("safe id pattern"));

pub struct BackupService {
    graph: Arc<GraphStore>,
    vector: Arc<VectorStore>,
    objects: Arc<ObjectStore>,
    retention_count: usize,
}

impl BackupService {
    pub fn new(
        graph: Arc<GraphStore>,
        vector: Arc<VectorStore>,
        objects: Arc<ObjectStore>,
        retention_count: usize,
    ) -> Self {
        Self {
            graph,
            vector,
            objects,
            retention_count,
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    pub async fn create(
        &self,
        memory_id: &str,
        description: Option<&str>,
        progress: &ProgressSink,
    ) -> Result<Value> {
        let started = std::time::Instant::now();
        let memory = self
            .graph
            .get_memory(memory_id)
            .await?
            .ok_or_else(|| MemoryError::not_found(format!("memory '{}' not found", memory_id)))?;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let backup_id = format!("{}/{}", memory_id, timestamp);
        let prefix = ObjectStore::backup_prefix(memory_id, &timestamp);

        progress.notify("backup", json!({ "step": "export_graph", "backup_id": backup_id }));
        let export = self.graph.export_memory(memory_id).await?;
        let graph_json = serde_json::to_string_pretty(&export)
            .map_err(|e| MemoryError::Internal(e.to_string()))?;

        progress.notify("backup", json!({ "step": "export_vectors" }));
        let points = self.vector.export_points(memory_id).await?;
        let vectors_jsonl = points_to_jsonl(&points)?;

        let document_keys = document_keys_from_export(&export);
        let keys_json = serde_json::to_string_pretty(&document_keys)
            .map_err(|e| MemoryError::Internal(e.to_string()))?;

        let checksum = combined_checksum(&graph_json, &vectors_jsonl, &keys_json);

        let manifest = json!({
            "schema_version": SCHEMA_VERSION,
            "backup_id": backup_id,
            "memory_id": memory_id,
            "memory_name": memory.name,
            "memory_ontology": memory.ontology,
            "created_at": Utc::now().to_rfc3339(),
            "description": description,
            "counts": {
                "entities": export.entities.len(),
                "relations": export.relations.len(),
                "documents": export.documents.len(),
                "chunks": points.len(),
            },
            "checksum_sha256": checksum,
        });
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| MemoryError::Internal(e.to_string()))?;

        progress.notify("backup", json!({ "step": "upload" }));
        let files: [(&str, &str, &str); 4] = [
            ("manifest.json", &manifest_json, "application/json"),
            ("graph_data.json", &graph_json, "application/json"),
            ("vectors.jsonl", &vectors_jsonl, "application/x-ndjson"),
            ("document_keys.json", &keys_json, "application/json"),
        ];
        for (filename, content, content_type) in files {
            let key = format!("{}/{}", prefix, filename);
            self.objects
                .put(&key, content.as_bytes(), content_type)
                .await?;
        }

        let retention_deleted = self.apply_retention(memory_id).await?;

        tracing::info!(
            backup_id = %backup_id,
            entities = export.entities.len(),
            chunks = points.len(),
            retention_deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backup created"
        );

        Ok(json!({
            "backup_id": backup_id,
            "memory_id": memory_id,
            "created_at": manifest["created_at"],
            "counts": manifest["counts"],
            "checksum_sha256": manifest["checksum_sha256"],
            "retention_deleted": retention_deleted,
        }))
    }

    // =========================================================================
    // List
    // =========================================================================

    pub async fn list(&self, memory_id: Option<&str>) -> Result<Vec<Value>> {
        let prefix = match memory_id {
            Some(id) => format!("{}/{}/", graphmem_storage::BACKUP_PREFIX, id),
            None => format!("{}/", graphmem_storage::BACKUP_PREFIX),
        };

        let entries = self.objects.list_prefix(&prefix).await?;
        let mut manifests = Vec::new();
        for entry in entries {
            if !entry.key.ends_with("/manifest.json") {
                continue;
            }
            match self.objects.get(&entry.key).await {
                Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(manifest) => manifests.push(manifest),
                    Err(e) => {
                        tracing::warn!(key = %entry.key, error = %e, "Unreadable backup manifest")
                    }
                },
                Err(e) => tracing::warn!(key = %entry.key, error = %e, "Manifest fetch failed"),
            }
        }

        manifests.sort_by(|a, b| {
            let a_created = a["created_at"].as_str().unwrap_or_default();
            let b_created = b["created_at"].as_str().unwrap_or_default();
            b_created.cmp(a_created)
        });
        Ok(manifests)
    }

    // =========================================================================
    // Restore (from the object store)
    // =========================================================================

    pub async fn restore(&self, backup_id: &str, progress: &ProgressSink) -> Result<Value> {
        let (memory_id, timestamp) = validate_backup_id(backup_id)?;
        let prefix = ObjectStore::backup_prefix(&memory_id, &timestamp);

        if self.graph.get_memory(&memory_id).await?.is_some() {
            return Err(MemoryError::AlreadyExists(format!(
                "memory '{}' already exists; delete it before restoring",
                memory_id
            )));
        }

        progress.notify("restore", json!({ "step": "download", "backup_id": backup_id }));
        let manifest: Value = self.get_json(&format!("{}/manifest.json", prefix)).await?;
        check_schema_version(&manifest)?;

        let graph_json = self.get_text(&format!("{}/graph_data.json", prefix)).await?;
        let vectors_jsonl = self.get_text(&format!("{}/vectors.jsonl", prefix)).await?;
        let keys_json = self
            .get_text(&format!("{}/document_keys.json", prefix))
            .await?;

        verify_checksum(&manifest, &graph_json, &vectors_jsonl, &keys_json)?;

        let export: GraphExport = serde_json::from_str(&graph_json)
            .map_err(|e| MemoryError::invalid(format!("corrupt graph_data.json: {}", e)))?;
        let points = jsonl_to_points(&vectors_jsonl)?;

        self.replay(&memory_id, &export, &points, progress).await?;

        Ok(json!({
            "backup_id": backup_id,
            "memory_id": memory_id,
            "entities": export.entities.len(),
            "relations": export.relations.len(),
            "documents": export.documents.len(),
            "chunks": points.len(),
        }))
    }

    /// Replay graph then vectors. Strict coupling: any failure deletes the
    /// partially created memory.
    async fn replay(
        &self,
        memory_id: &str,
        export: &GraphExport,
        points: &[VectorPoint],
        progress: &ProgressSink,
    ) -> Result<()> {
        progress.notify("restore", json!({ "step": "replay_graph" }));
        if let Err(e) = self.graph.import_memory(export).await {
            self.cleanup_partial(memory_id).await;
            return Err(e);
        }

        progress.notify("restore", json!({ "step": "replay_vectors", "points": points.len() }));
        if let Err(e) = self.vector.import_points(memory_id, points).await {
            self.cleanup_partial(memory_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn cleanup_partial(&self, memory_id: &str) {
        tracing::warn!(memory_id = %memory_id, "Restore failed, removing partial memory");
        if let Err(e) = self.graph.delete_memory(memory_id).await {
            tracing::error!(memory_id = %memory_id, error = %e, "Partial memory cleanup failed");
        }
        if let Err(e) = self.vector.delete_collection(memory_id).await {
            tracing::error!(memory_id = %memory_id, error = %e, "Partial collection cleanup failed");
        }
    }

    // =========================================================================
    // Download (tar.gz archive)
    // =========================================================================

    /// Build the archive and return `(bytes, sha256_of_the_byte_stream)`.
    /// The digest is also recorded on the stored manifest.
    pub async fn download(
        &self,
        backup_id: &str,
        include_documents: bool,
        progress: &ProgressSink,
    ) -> Result<(Vec<u8>, String)> {
        let (memory_id, timestamp) = validate_backup_id(backup_id)?;
        let prefix = ObjectStore::backup_prefix(&memory_id, &timestamp);
        let archive_dir = format!("backup-{}-{}", memory_id, timestamp);

        let mut manifest: Value = self.get_json(&format!("{}/manifest.json", prefix)).await?;
        manifest["documents_included"] = json!(include_documents);
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| MemoryError::Internal(e.to_string()))?;

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

        append_entry(
            &mut builder,
            &format!("{}/manifest.json", archive_dir),
            manifest_json.as_bytes(),
        )?;
        for filename in ["graph_data.json", "vectors.jsonl", "document_keys.json"] {
            let content = self.objects.get(&format!("{}/{}", prefix, filename)).await?;
            append_entry(&mut builder, &format!("{}/{}", archive_dir, filename), &content)?;
        }

        if include_documents {
            progress.notify("download", json!({ "step": "documents" }));
            let keys: Vec<Value> = self
                .get_json(&format!("{}/document_keys.json", prefix))
                .await?;
            for entry in &keys {
                let doc_id = entry["doc_id"].as_str().unwrap_or_default();
                let key = entry["key"].as_str().unwrap_or_default();
                if doc_id.is_empty() || key.is_empty() {
                    continue;
                }
                match self.objects.get(key).await {
                    Ok(bytes) => append_entry(
                        &mut builder,
                        &format!("{}/documents/{}", archive_dir, doc_id),
                        &bytes,
                    )?,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Document missing from object store")
                    }
                }
            }
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| MemoryError::Internal(e.to_string()))?;
        let bytes = encoder
            .finish()
            .map_err(|e| MemoryError::Internal(e.to_string()))?;

        let digest = sha256_hex(&bytes);
        manifest["archive_sha256"] = json!(digest);
        let updated = serde_json::to_string_pretty(&manifest)
            .map_err(|e| MemoryError::Internal(e.to_string()))?;
        self.objects
            .put(
                &format!("{}/manifest.json", prefix),
                updated.as_bytes(),
                "application/json",
            )
            .await?;

        tracing::info!(
            backup_id = %backup_id,
            include_documents,
            size_bytes = bytes.len(),
            "Archive built"
        );
        Ok((bytes, digest))
    }

    // =========================================================================
    // Restore from archive
    // =========================================================================

    pub async fn restore_archive(
        &self,
        archive_bytes: &[u8],
        progress: &ProgressSink,
    ) -> Result<Value> {
        if archive_bytes.len() > MAX_ARCHIVE_SIZE_BYTES {
            return Err(MemoryError::QuotaExceeded(format!(
                "archive is {} bytes, limit is {}",
                archive_bytes.len(),
                MAX_ARCHIVE_SIZE_BYTES
            )));
        }

        let entries = read_archive(archive_bytes)?;

        let manifest_bytes = find_entry(&entries, "manifest.json")
            .ok_or_else(|| MemoryError::invalid("manifest.json missing from archive"))?;
        let manifest: Value = serde_json::from_slice(manifest_bytes)
            .map_err(|e| MemoryError::invalid(format!("corrupt manifest: {}", e)))?;
        check_schema_version(&manifest)?;

        let memory_id = manifest["memory_id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MemoryError::invalid("manifest has no memory_id"))?
            .to_string();

        if self.graph.get_memory(&memory_id).await?.is_some() {
            return Err(MemoryError::AlreadyExists(format!(
                "memory '{}' already exists; delete it before restoring",
                memory_id
            )));
        }

        let graph_json = text_entry(&entries, "graph_data.json")?;
        let vectors_jsonl = text_entry(&entries, "vectors.jsonl")?;
        let keys_json = text_entry(&entries, "document_keys.json")?;
        verify_checksum(&manifest, &graph_json, &vectors_jsonl, &keys_json)?;

        let export: GraphExport = serde_json::from_str(&graph_json)
            .map_err(|e| MemoryError::invalid(format!("corrupt graph_data.json: {}", e)))?;
        let points = jsonl_to_points(&vectors_jsonl)?;

        // Re-upload embedded documents onto their original keys.
        let document_entries: Vec<(&String, &Vec<u8>)> = entries
            .iter()
            .filter(|(path, _)| path.contains("/documents/") && !path.ends_with('/'))
            .map(|(path, bytes)| (path, bytes))
            .collect();

        if manifest["documents_included"].as_bool() == Some(true) && document_entries.is_empty() {
            return Err(MemoryError::invalid(
                "manifest claims embedded documents but the archive has none",
            ));
        }

        let document_keys: Vec<Value> = serde_json::from_str(&keys_json)
            .map_err(|e| MemoryError::invalid(format!("corrupt document_keys.json: {}", e)))?;
        let key_by_doc_id: HashMap<&str, &str> = document_keys
            .iter()
            .filter_map(|entry| {
                Some((entry["doc_id"].as_str()?, entry["key"].as_str()?))
            })
            .collect();

        let mut documents_uploaded = 0u64;
        for (path, bytes) in document_entries {
            let doc_id = path.rsplit('/').next().unwrap_or_default();
            // Leaf names come from an external archive; anything that is not
            // a plain id is rejected.
            if doc_id.is_empty() || doc_id.contains("..") {
                tracing::warn!(path = %path, "Suspicious archive entry, skipped");
                continue;
            }
            let Some(key) = key_by_doc_id.get(doc_id) else {
                tracing::warn!(doc_id = %doc_id, "Archive document has no key mapping, skipped");
                continue;
            };
            progress.notify("restore", json!({ "step": "upload_document", "doc_id": doc_id }));
            self.objects.put(key, bytes, "application/octet-stream").await?;
            documents_uploaded += 1;
        }

        self.replay(&memory_id, &export, &points, progress).await?;

        tracing::info!(
            memory_id = %memory_id,
            entities = export.entities.len(),
            chunks = points.len(),
            documents_uploaded,
            "Archive restored"
        );

        Ok(json!({
            "memory_id": memory_id,
            "source": "archive",
            "entities": export.entities.len(),
            "relations": export.relations.len(),
            "documents": export.documents.len(),
            "documents_uploaded": documents_uploaded,
            "chunks": points.len(),
        }))
    }

    // =========================================================================
    // Delete & retention
    // =========================================================================

    pub async fn delete(&self, backup_id: &str) -> Result<Value> {
        let (memory_id, timestamp) = validate_backup_id(backup_id)?;
        let prefix = format!("{}/", ObjectStore::backup_prefix(&memory_id, &timestamp));
        let deleted = self.objects.delete_prefix(&prefix).await?;
        if deleted == 0 {
            return Err(MemoryError::not_found(format!(
                "backup '{}' not found",
                backup_id
            )));
        }
        Ok(json!({ "backup_id": backup_id, "files_deleted": deleted }))
    }

    /// Keep the `retention_count` most recent backups of a memory.
    async fn apply_retention(&self, memory_id: &str) -> Result<usize> {
        if self.retention_count == 0 {
            return Ok(0);
        }
        let backups = self.list(Some(memory_id)).await?;
        if backups.len() <= self.retention_count {
            return Ok(0);
        }

        let mut deleted = 0usize;
        for manifest in &backups[self.retention_count..] {
            if let Some(backup_id) = manifest["backup_id"].as_str() {
                match self.delete(backup_id).await {
                    Ok(_) => deleted += 1,
                    Err(e) => {
                        tracing::warn!(backup_id = %backup_id, error = %e, "Retention delete failed")
                    }
                }
            }
        }
        Ok(deleted)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn get_text(&self, key: &str) -> Result<String> {
        let bytes = self.objects.get(key).await?;
        String::from_utf8(bytes)
            .map_err(|e| MemoryError::invalid(format!("non-UTF8 backup file {}: {}", key, e)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let text = self.get_text(key).await?;
        serde_json::from_str(&text)
            .map_err(|e| MemoryError::invalid(format!("corrupt backup file {}: {}", key, e)))
    }
}

// =============================================================================
// Pure pieces
// =============================================================================

/// Validate and split a backup id into `(memory_id, timestamp)`. Both parts
/// must be plain identifiers: backup ids feed object-store key construction
/// and must not traverse paths.
pub fn validate_backup_id(backup_id: &str) -> Result<(String, String)> {
    let (memory_id, timestamp) = backup_id.split_once('/').ok_or_else(|| {
        MemoryError::invalid(format!(
            "invalid backup id '{}', expected 'memory_id/timestamp'",
            backup_id
        ))
    })?;
    if !SAFE_ID.is_match(memory_id) || !SAFE_ID.is_match(timestamp) {
        return Err(MemoryError::invalid(format!(
            "backup id '{}' contains invalid characters",
            backup_id
        )));
    }
    Ok((memory_id.to_string(), timestamp.to_string()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Checksum over the concatenation of (graph, vectors, keys), fixed order.
pub fn combined_checksum(graph_json: &str, vectors_jsonl: &str, keys_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(graph_json.as_bytes());
    hasher.update(vectors_jsonl.as_bytes());
    hasher.update(keys_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn verify_checksum(
    manifest: &Value,
    graph_json: &str,
    vectors_jsonl: &str,
    keys_json: &str,
) -> Result<()> {
    let expected = manifest["checksum_sha256"].as_str().unwrap_or_default();
    if expected.is_empty() {
        return Err(MemoryError::invalid("manifest has no checksum"));
    }
    let actual = combined_checksum(graph_json, vectors_jsonl, keys_json);
    if actual != expected {
        return Err(MemoryError::invalid(format!(
            "backup checksum mismatch: expected {}..., got {}...",
            &expected[..16.min(expected.len())],
            &actual[..16]
        )));
    }
    Ok(())
}

fn check_schema_version(manifest: &Value) -> Result<()> {
    let version = manifest["schema_version"].as_str().unwrap_or_default();
    if version != SCHEMA_VERSION {
        return Err(MemoryError::invalid(format!(
            "unsupported backup schema version '{}', expected '{}'",
            version, SCHEMA_VERSION
        )));
    }
    Ok(())
}

fn points_to_jsonl(points: &[VectorPoint]) -> Result<String> {
    let mut lines = Vec::with_capacity(points.len());
    for point in points {
        lines.push(
            serde_json::to_string(point).map_err(|e| MemoryError::Internal(e.to_string()))?,
        );
    }
    Ok(lines.join("\n"))
}

fn jsonl_to_points(jsonl: &str) -> Result<Vec<VectorPoint>> {
    let mut points = Vec::new();
    for line in jsonl.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        points.push(
            serde_json::from_str(line)
                .map_err(|e| MemoryError::invalid(format!("corrupt vectors.jsonl: {}", e)))?,
        );
    }
    Ok(points)
}

fn document_keys_from_export(export: &GraphExport) -> Vec<Value> {
    export
        .documents
        .iter()
        .filter_map(|doc| {
            let uri = doc["object_uri"].as_str().unwrap_or_default();
            let key = ObjectStore::parse_key(uri).ok()?;
            Some(json!({
                "doc_id": doc["id"],
                "filename": doc["filename"],
                "uri": uri,
                "key": key,
                "hash": doc["content_hash"],
                "size_bytes": doc["size_bytes"],
            }))
        })
        .collect()
}

fn append_entry(
    builder: &mut tar::Builder<GzEncoder<Vec<u8>>>,
    path: &str,
    content: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, content)
        .map_err(|e| MemoryError::Internal(format!("archive write failed: {}", e)))
}

fn read_archive(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    let mut entries = Vec::new();

    let iterator = archive
        .entries()
        .map_err(|e| MemoryError::invalid(format!("invalid tar.gz archive: {}", e)))?;
    for entry in iterator {
        let mut entry =
            entry.map_err(|e| MemoryError::invalid(format!("invalid archive entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| MemoryError::invalid(format!("invalid archive path: {}", e)))?
            .to_string_lossy()
            .into_owned();
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| MemoryError::invalid(format!("unreadable archive entry: {}", e)))?;
        entries.push((path, content));
    }
    Ok(entries)
}

/// Find an entry by filename, with or without a leading directory.
fn find_entry<'a>(entries: &'a [(String, Vec<u8>)], filename: &str) -> Option<&'a Vec<u8>> {
    entries
        .iter()
        .find(|(path, _)| path == filename || path.ends_with(&format!("/{}", filename)))
        .map(|(_, content)| content)
}

fn text_entry(entries: &[(String, Vec<u8>)], filename: &str) -> Result<String> {
    let bytes = find_entry(entries, filename)
        .ok_or_else(|| MemoryError::invalid(format!("{} missing from archive", filename)))?;
    String::from_utf8(bytes.clone())
        .map_err(|e| MemoryError::invalid(format!("non-UTF8 {}: {}", filename, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_ids_reject_path_traversal() {
        assert!(validate_backup_id("legal/20240501T120000Z").is_ok());
        assert!(validate_backup_id("legal").is_err());
        assert!(validate_backup_id("../etc/passwd").is_err());
        assert!(validate_backup_id("legal/../../other").is_err());
        assert!(validate_backup_id("legal/2024 05 01").is_err());
    }

    #[test]
    fn checksum_is_order_sensitive() {
        let a = combined_checksum("graph", "vectors", "keys");
        let b = combined_checksum("vectors", "graph", "keys");
        assert_ne!(a, b);
        assert_eq!(a, combined_checksum("graph", "vectors", "keys"));
    }

    #[test]
    fn checksum_verification_detects_tampering() {
        let manifest = json!({
            "schema_version": SCHEMA_VERSION,
            "checksum_sha256": combined_checksum("g", "v", "k"),
        });
        assert!(verify_checksum(&manifest, "g", "v", "k").is_ok());
        assert!(verify_checksum(&manifest, "g", "v-tampered", "k").is_err());
    }

    #[test]
    fn jsonl_roundtrip_preserves_vectors() {
        let points = vec![
            VectorPoint {
                id: json!("11111111-1111-1111-1111-111111111111"),
                vector: vec![0.25, -0.5, 1.0],
                payload: json!({ "document_id": "d1", "text": "chunk" }),
            },
            VectorPoint {
                id: json!("22222222-2222-2222-2222-222222222222"),
                vector: vec![0.0, 0.125],
                payload: json!({}),
            },
        ];
        let jsonl = points_to_jsonl(&points).unwrap();
        let back = jsonl_to_points(&jsonl).unwrap();
        assert_eq!(back.len(), 2);
        // Vectors survive byte-identical through the jsonl roundtrip.
        assert_eq!(back[0].vector, points[0].vector);
        assert_eq!(back[1].vector, points[1].vector);
        assert_eq!(back[0].payload["document_id"], "d1");
    }

    #[test]
    fn empty_jsonl_is_no_points() {
        assert!(jsonl_to_points("").unwrap().is_empty());
        assert!(jsonl_to_points("\n\n").unwrap().is_empty());
    }

    #[test]
    fn archive_roundtrip_in_memory() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append_entry(&mut builder, "backup-m-t/manifest.json", b"{\"a\":1}").unwrap();
        append_entry(&mut builder, "backup-m-t/documents/doc-1", b"raw bytes").unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let entries = read_archive(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            find_entry(&entries, "manifest.json").unwrap(),
            &b"{\"a\":1}".to_vec()
        );
        let docs: Vec<_> = entries
            .iter()
            .filter(|(path, _)| path.contains("/documents/"))
            .collect();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].1, b"raw bytes");
    }

    #[test]
    fn schema_version_is_enforced() {
        assert!(check_schema_version(&json!({ "schema_version": "1.0" })).is_ok());
        assert!(check_schema_version(&json!({ "schema_version": "9.9" })).is_err());
        assert!(check_schema_version(&json!({})).is_err());
    }
}
