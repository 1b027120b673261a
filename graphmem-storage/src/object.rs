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

//! Object store adapter (S3-compatible).
//!
//! Raw documents live under `memories/{memory_id}/documents/{document_id}`;
//! backups live under `_backups/{memory_id}/{timestamp}/...`. All
//! operations are idempotent on keys.

use graphmem_core::config::ObjectStoreConfig;
use graphmem_core::error::{MemoryError, Result};
use graphmem_core::types::DependencyStatus;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

const DEPENDENCY: &str = "object-store";

/// Key prefix for backups; never considered during orphan detection.
pub const BACKUP_PREFIX: &str = "_backups";

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

pub struct ObjectStore {
    bucket: Box<Bucket>,
    bucket_name: String,
}

impl ObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        };
        let credentials = Credentials::new(
            Some(config.access_key.as_str()),
            Some(config.secret_key.as_str()),
            None,
            None,
            None,
        )
        .map_err(|e| MemoryError::dependency(DEPENDENCY, e))?;

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| MemoryError::dependency(DEPENDENCY, e))?
            .with_path_style();

        Ok(Self {
            bucket,
            bucket_name: config.bucket.clone(),
        })
    }

    // =========================================================================
    // Key layout
    // =========================================================================

    pub fn document_key(memory_id: &str, document_id: &str) -> String {
        format!("memories/{}/documents/{}", memory_id, document_id)
    }

    pub fn memory_prefix(memory_id: &str) -> String {
        format!("memories/{}/", memory_id)
    }

    pub fn backup_prefix(memory_id: &str, timestamp: &str) -> String {
        format!("{}/{}/{}", BACKUP_PREFIX, memory_id, timestamp)
    }

    /// `s3://bucket/key` URI for a key.
    pub fn uri_for(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket_name, key)
    }

    /// Extract the key from an `s3://bucket/key` URI, or pass a key through.
    pub fn parse_key(key_or_uri: &str) -> Result<String> {
        if let Some(rest) = key_or_uri.strip_prefix("s3://") {
            match rest.split_once('/') {
                Some((_bucket, key)) if !key.is_empty() => Ok(key.to_string()),
                _ => Err(MemoryError::invalid(format!(
                    "invalid object URI: {}",
                    key_or_uri
                ))),
            }
        } else {
            Ok(key_or_uri.to_string())
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.bucket
            .put_object_with_content_type(key, bytes, content_type)
            .await
            .map_err(map_err)?;
        tracing::debug!(key = %key, size = bytes.len(), "Object stored");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self.bucket.get_object(key).await.map_err(|e| map_get_err(key, e))?;
        if response.status_code() == 404 {
            return Err(MemoryError::not_found(format!("object not found: {}", key)));
        }
        Ok(response.bytes().to_vec())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.bucket.delete_object(key).await.map_err(map_err)?;
        tracing::debug!(key = %key, "Object deleted");
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.bucket.head_object(key).await {
            Ok((_, code)) => Ok(code == 200),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }

    /// Size in bytes of an object.
    pub async fn head(&self, key: &str) -> Result<u64> {
        match self.bucket.head_object(key).await {
            Ok((head, 200)) => Ok(head.content_length.unwrap_or(0).max(0) as u64),
            Ok((_, _)) => Err(MemoryError::not_found(format!("object not found: {}", key))),
            Err(e) if is_not_found(&e) => {
                Err(MemoryError::not_found(format!("object not found: {}", key)))
            }
            Err(e) => Err(map_err(e)),
        }
    }

    /// All keys under a prefix, paginated internally.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(map_err)?;

        let mut entries = Vec::new();
        for page in pages {
            for object in page.contents {
                entries.push(ObjectEntry {
                    key: object.key,
                    size: object.size,
                });
            }
        }
        Ok(entries)
    }

    /// Delete every object under a prefix. Returns the number deleted.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let entries = self.list_prefix(prefix).await?;
        let mut deleted = 0usize;
        for entry in &entries {
            self.delete(&entry.key).await?;
            deleted += 1;
        }
        if deleted > 0 {
            tracing::info!(prefix = %prefix, deleted, "Prefix cleared");
        }
        Ok(deleted)
    }

    /// Connectivity self-test: put, read back and delete a probe object.
    pub async fn probe(&self) -> DependencyStatus {
        let key = "_health_check/probe.txt";
        let payload = b"health check";

        let outcome = async {
            self.put(key, payload, "text/plain").await?;
            let read = self.get(key).await?;
            self.delete(key).await?;
            if read == payload {
                Ok(())
            } else {
                Err(MemoryError::dependency(DEPENDENCY, "probe read mismatch"))
            }
        }
        .await;

        match outcome {
            Ok(()) => DependencyStatus::ok(format!("bucket '{}' reachable", self.bucket_name)),
            Err(e) => DependencyStatus::error(e.to_string()),
        }
    }
}

fn is_not_found(err: &S3Error) -> bool {
    matches!(err, S3Error::HttpFailWithBody(404, _))
}

fn map_err(err: S3Error) -> MemoryError {
    MemoryError::dependency(DEPENDENCY, err)
}

fn map_get_err(key: &str, err: S3Error) -> MemoryError {
    if is_not_found(&err) {
        MemoryError::not_found(format!("object not found: {}", key))
    } else {
        map_err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(
            ObjectStore::document_key("legal", "doc-1"),
            "memories/legal/documents/doc-1"
        );
        assert_eq!(ObjectStore::memory_prefix("legal"), "memories/legal/");
        assert_eq!(
            ObjectStore::backup_prefix("legal", "20240501T120000Z"),
            "_backups/legal/20240501T120000Z"
        );
    }

    #[test]
    fn uri_parsing() {
        assert_eq!(
            ObjectStore::parse_key("s3://bucket/memories/m/documents/d").unwrap(),
            "memories/m/documents/d"
        );
        assert_eq!(
            ObjectStore::parse_key("memories/m/documents/d").unwrap(),
            "memories/m/documents/d"
        );
        assert!(ObjectStore::parse_key("s3://bucket-only").is_err());
    }
}
