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

//! Token lifecycle. Tokens are stored in the graph store as `:Token` nodes
//! keyed by SHA-256 hex; the raw token is returned exactly once at
//! creation. No token cache: every request performs a fresh lookup.

use chrono::{Duration, Utc};
use graphmem_core::error::{MemoryError, Result};
use graphmem_core::types::TokenInfo;
use graphmem_storage::GraphStore;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

const VALID_PERMISSIONS: [&str; 3] = ["read", "write", "admin"];

/// How `admin_update_token` mutates the memory scope list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeAction {
    Add,
    Remove,
    Set,
}

impl ScopeAction {
    pub fn parse(action: &str) -> Result<Self> {
        match action {
            "add" => Ok(ScopeAction::Add),
            "remove" => Ok(ScopeAction::Remove),
            "set" => Ok(ScopeAction::Set),
            other => Err(MemoryError::invalid(format!(
                "unknown action '{}', expected add, remove or set",
                other
            ))),
        }
    }

    pub fn apply(self, current: &[String], memory_ids: &[String]) -> Vec<String> {
        match self {
            ScopeAction::Set => memory_ids.to_vec(),
            ScopeAction::Add => {
                let mut updated = current.to_vec();
                for id in memory_ids {
                    if !updated.contains(id) {
                        updated.push(id.clone());
                    }
                }
                updated
            }
            ScopeAction::Remove => current
                .iter()
                .filter(|id| !memory_ids.contains(id))
                .cloned()
                .collect(),
        }
    }
}

pub struct TokenManager {
    graph: Arc<GraphStore>,
}

impl TokenManager {
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self { graph }
    }

    pub fn hash_token(raw: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn generate_token() -> String {
        let random: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(43)
            .map(char::from)
            .collect();
        format!("gm_{}", random)
    }

    /// Create a token. Returns the raw token (shown once) and its metadata.
    pub async fn create(
        &self,
        client_name: &str,
        email: Option<String>,
        permissions: Vec<String>,
        memory_ids: Vec<String>,
        expires_in_days: Option<i64>,
    ) -> Result<(String, TokenInfo)> {
        if client_name.trim().is_empty() {
            return Err(MemoryError::invalid("client_name is required"));
        }
        let permissions = if permissions.is_empty() {
            vec!["read".to_string(), "write".to_string()]
        } else {
            permissions
        };
        for permission in &permissions {
            if !VALID_PERMISSIONS.contains(&permission.as_str()) {
                return Err(MemoryError::invalid(format!(
                    "unknown permission '{}', expected one of {:?}",
                    permission, VALID_PERMISSIONS
                )));
            }
        }

        let raw = Self::generate_token();
        let token = TokenInfo {
            token_hash: Self::hash_token(&raw),
            client_name: client_name.to_string(),
            email,
            permissions,
            memory_ids,
            created_at: Utc::now(),
            expires_at: expires_in_days.map(|days| Utc::now() + Duration::days(days)),
            revoked_at: None,
        };
        self.graph.insert_token(&token).await?;
        Ok((raw, token))
    }

    /// Look up an active token by its raw value. Revoked or expired tokens
    /// resolve to nothing.
    pub async fn validate(&self, raw: &str) -> Result<Option<TokenInfo>> {
        let hash = Self::hash_token(raw);
        let Some(token) = self.graph.find_token(&hash).await? else {
            return Ok(None);
        };
        if !token.is_active(Utc::now()) {
            tracing::debug!(client = %token.client_name, "Inactive token rejected");
            return Ok(None);
        }
        Ok(Some(token))
    }

    pub async fn list(&self, include_revoked: bool) -> Result<Vec<TokenInfo>> {
        self.graph.list_tokens(include_revoked).await
    }

    /// Revoke a token by hash or unambiguous hash prefix (8+ characters).
    pub async fn revoke(&self, hash_prefix: &str) -> Result<TokenInfo> {
        if hash_prefix.len() < 8 {
            return Err(MemoryError::invalid(
                "token hash prefix must be at least 8 characters",
            ));
        }
        let tokens = self.graph.list_tokens(false).await?;
        let matching: Vec<&TokenInfo> = tokens
            .iter()
            .filter(|t| t.token_hash.starts_with(hash_prefix))
            .collect();

        match matching.as_slice() {
            [] => Err(MemoryError::not_found("no token matches that prefix")),
            [token] => {
                self.graph.revoke_token(&token.token_hash).await?;
                Ok((*token).clone())
            }
            _ => Err(MemoryError::invalid(
                "ambiguous token prefix, provide more characters",
            )),
        }
    }

    /// Mutate a token's memory scope list.
    pub async fn update_memories(
        &self,
        hash_prefix: &str,
        action: ScopeAction,
        memory_ids: &[String],
    ) -> Result<TokenInfo> {
        let tokens = self.graph.list_tokens(false).await?;
        let matching: Vec<&TokenInfo> = tokens
            .iter()
            .filter(|t| t.token_hash.starts_with(hash_prefix))
            .collect();

        let token = match matching.as_slice() {
            [] => return Err(MemoryError::not_found("no token matches that prefix")),
            [token] => (*token).clone(),
            _ => {
                return Err(MemoryError::invalid(
                    "ambiguous token prefix, provide more characters",
                ))
            }
        };

        let updated = action.apply(&token.memory_ids, memory_ids);
        self.graph
            .set_token_memories(&token.token_hash, &updated)
            .await?;

        Ok(TokenInfo {
            memory_ids: updated,
            ..token
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_sha256_hex() {
        let hash = TokenManager::hash_token("gm_example");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, TokenManager::hash_token("gm_example"));
        assert_ne!(hash, TokenManager::hash_token("gm_other"));
    }

    #[test]
    fn generated_tokens_are_prefixed_and_unique() {
        let a = TokenManager::generate_token();
        let b = TokenManager::generate_token();
        assert!(a.starts_with("gm_"));
        assert_eq!(a.len(), 46);
        assert_ne!(a, b);
    }

    #[test]
    fn scope_actions_compose() {
        let current = vec!["legal".to_string(), "cloud".to_string()];

        let added = ScopeAction::Add.apply(&current, &["hr".to_string(), "legal".to_string()]);
        assert_eq!(added, vec!["legal", "cloud", "hr"]);

        let removed = ScopeAction::Remove.apply(&current, &["cloud".to_string()]);
        assert_eq!(removed, vec!["legal"]);

        let set = ScopeAction::Set.apply(&current, &[]);
        assert!(set.is_empty());
    }

    #[test]
    fn scope_action_parsing() {
        assert_eq!(ScopeAction::parse("add").unwrap(), ScopeAction::Add);
        assert_eq!(ScopeAction::parse("set").unwrap(), ScopeAction::Set);
        assert!(ScopeAction::parse("merge").is_err());
    }
}
