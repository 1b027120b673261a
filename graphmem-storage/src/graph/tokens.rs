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

//! Token sub-store: access credentials persisted as `:Token` nodes, keyed
//! by the SHA-256 hex of the raw token. The raw token is never stored.

use super::{as_opt_string, as_string, GraphStore};
use crate::graph::search::string_array;
use chrono::{DateTime, Utc};
use graphmem_core::error::Result;
use graphmem_core::types::TokenInfo;
use serde_json::{json, Value};

const TOKEN_RETURN: &str = "RETURN t.hash, t.client_name, t.email, t.permissions, \
     t.memory_ids, t.created_at, t.expires_at, t.revoked_at";

impl GraphStore {
    pub async fn insert_token(&self, token: &TokenInfo) -> Result<()> {
        self.run(
            "CREATE (t:Token {hash: $hash, client_name: $client_name, email: $email, \
             permissions: $permissions, memory_ids: $memory_ids, created_at: $created_at, \
             expires_at: $expires_at, revoked_at: $revoked_at})",
            json!({
                "hash": token.token_hash,
                "client_name": token.client_name,
                "email": token.email,
                "permissions": token.permissions,
                "memory_ids": token.memory_ids,
                "created_at": token.created_at.to_rfc3339(),
                "expires_at": token.expires_at.map(|t| t.to_rfc3339()),
                "revoked_at": Value::Null,
            }),
        )
        .await?;
        tracing::info!(client = %token.client_name, "Token created");
        Ok(())
    }

    pub async fn find_token(&self, token_hash: &str) -> Result<Option<TokenInfo>> {
        let rows = self
            .run(
                &format!("MATCH (t:Token {{hash: $hash}}) {}", TOKEN_RETURN),
                json!({ "hash": token_hash }),
            )
            .await?;
        Ok(rows.first().map(|row| token_from_row(row)))
    }

    pub async fn list_tokens(&self, include_revoked: bool) -> Result<Vec<TokenInfo>> {
        let statement = if include_revoked {
            format!("MATCH (t:Token) {} ORDER BY t.created_at DESC", TOKEN_RETURN)
        } else {
            format!(
                "MATCH (t:Token) WHERE t.revoked_at IS NULL {} ORDER BY t.created_at DESC",
                TOKEN_RETURN
            )
        };
        let rows = self.run(&statement, json!({})).await?;
        Ok(rows.iter().map(|row| token_from_row(row)).collect())
    }

    /// Mark a token revoked. Returns false when the hash is unknown.
    pub async fn revoke_token(&self, token_hash: &str) -> Result<bool> {
        let rows = self
            .run(
                "MATCH (t:Token {hash: $hash}) SET t.revoked_at = $now RETURN t.hash",
                json!({ "hash": token_hash, "now": Utc::now().to_rfc3339() }),
            )
            .await?;
        let revoked = !rows.is_empty();
        if revoked {
            tracing::info!(hash_prefix = %&token_hash[..token_hash.len().min(8)], "Token revoked");
        }
        Ok(revoked)
    }

    /// Replace a token's memory scope list.
    pub async fn set_token_memories(
        &self,
        token_hash: &str,
        memory_ids: &[String],
    ) -> Result<bool> {
        let rows = self
            .run(
                "MATCH (t:Token {hash: $hash}) SET t.memory_ids = $memory_ids RETURN t.hash",
                json!({ "hash": token_hash, "memory_ids": memory_ids }),
            )
            .await?;
        Ok(!rows.is_empty())
    }
}

fn token_from_row(row: &[Value]) -> TokenInfo {
    TokenInfo {
        token_hash: as_string(&row[0]),
        client_name: as_string(&row[1]),
        email: as_opt_string(&row[2]),
        permissions: string_array(&row[3]),
        memory_ids: string_array(&row[4]),
        created_at: parse_datetime(&row[5]).unwrap_or_else(Utc::now),
        expires_at: parse_datetime(&row[6]),
        revoked_at: parse_datetime(&row[7]),
    }
}

fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_row_parses_optional_fields() {
        let row = vec![
            json!("deadbeef"),
            json!("quoteflow"),
            Value::Null,
            json!(["read", "write"]),
            json!(["legal"]),
            json!("2024-05-01T12:00:00+00:00"),
            Value::Null,
            Value::Null,
        ];
        let token = token_from_row(&row);
        assert_eq!(token.client_name, "quoteflow");
        assert_eq!(token.permissions, vec!["read", "write"]);
        assert_eq!(token.memory_ids, vec!["legal"]);
        assert!(token.expires_at.is_none());
        assert!(token.is_active(Utc::now()));
    }
}
