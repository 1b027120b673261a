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

//! Storage consistency: compare object-store keys against the graph's
//! `object_uri` set and report or delete orphans.
//!
//! The known-URI set is always the union across all memories, so a
//! document belonging to another memory is never an orphan of a scoped
//! check. Backup keys are never orphan candidates.

use graphmem_core::error::Result;
use graphmem_storage::{GraphStore, ObjectStore};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub scanned_keys: usize,
    pub known_documents: usize,
    pub orphans: Vec<String>,
}

pub struct StorageChecker {
    graph: Arc<GraphStore>,
    objects: Arc<ObjectStore>,
}

impl StorageChecker {
    pub fn new(graph: Arc<GraphStore>, objects: Arc<ObjectStore>) -> Self {
        Self { graph, objects }
    }

    /// Compare object keys under `memories/{memory_id}/` (or all memories)
    /// against every document URI known to the graph.
    pub async fn check(&self, memory_id: Option<&str>) -> Result<ConsistencyReport> {
        let prefix = match memory_id {
            Some(id) => ObjectStore::memory_prefix(id),
            None => "memories/".to_string(),
        };

        let entries = self.objects.list_prefix(&prefix).await?;
        let known_uris = self.graph.all_document_uris().await?;
        let known_keys: HashSet<String> = known_uris
            .iter()
            .filter_map(|uri| ObjectStore::parse_key(uri).ok())
            .collect();

        let orphans = find_orphans(
            entries.iter().map(|e| e.key.as_str()),
            &known_keys,
        );

        tracing::info!(
            scope = memory_id.unwrap_or("*"),
            scanned = entries.len(),
            known = known_keys.len(),
            orphans = orphans.len(),
            "Storage check complete"
        );

        Ok(ConsistencyReport {
            scanned_keys: entries.len(),
            known_documents: known_keys.len(),
            orphans,
        })
    }

    /// Delete detected orphans. Dry-run by default; idempotent either way.
    pub async fn cleanup(&self, dry_run: bool) -> Result<serde_json::Value> {
        let report = self.check(None).await?;
        if dry_run {
            return Ok(serde_json::json!({
                "dry_run": true,
                "orphans": report.orphans,
                "would_delete": report.orphans.len(),
            }));
        }

        let mut deleted = 0usize;
        for key in &report.orphans {
            self.objects.delete(key).await?;
            deleted += 1;
        }

        tracing::info!(deleted, "Storage cleanup complete");
        Ok(serde_json::json!({
            "dry_run": false,
            "deleted": deleted,
            "orphans": report.orphans,
        }))
    }
}

/// Keys present in the object store but unknown to any memory's graph.
/// Backup keys are excluded outright.
pub fn find_orphans<'a>(
    scanned: impl Iterator<Item = &'a str>,
    known_keys: &HashSet<String>,
) -> Vec<String> {
    scanned
        .filter(|key| !key.starts_with(graphmem_storage::BACKUP_PREFIX))
        .filter(|key| !known_keys.contains(*key))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_detection_respects_known_set_and_backups() {
        let known: HashSet<String> = ["memories/m1/documents/d1", "memories/m2/documents/d2"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let scanned = vec![
            "memories/m1/documents/d1",      // known, belongs to m1
            "memories/m2/documents/d2",      // known, belongs to another memory
            "memories/m1/documents/leaked",  // orphan
            "_backups/m1/20240101T000000Z/manifest.json", // never a candidate
        ];

        let orphans = find_orphans(scanned.into_iter(), &known);
        assert_eq!(orphans, vec!["memories/m1/documents/leaked".to_string()]);
    }

    #[test]
    fn clean_store_reports_no_orphans() {
        let known: HashSet<String> =
            ["memories/m/documents/d".to_string()].into_iter().collect();
        let orphans = find_orphans(["memories/m/documents/d"].into_iter(), &known);
        assert!(orphans.is_empty());
    }
}
