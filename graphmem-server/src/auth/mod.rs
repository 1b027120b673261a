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

//! Authentication: bearer-token middleware deriving an explicit
//! [`Principal`] attached to the request.
//!
//! `/health` is public. The MCP streaming endpoints keep a loopback
//! carve-out for intra-host tooling; it never applies to `/api/*`.

pub mod tokens;

pub use tokens::{ScopeAction, TokenManager};

use crate::AppState;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{body::Body, Json};
use graphmem_core::types::TokenInfo;
use serde::Serialize;
use std::net::SocketAddr;

/// The authenticated caller.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub client_name: String,
    pub permissions: Vec<String>,
    /// Memories this principal may touch; empty means all.
    pub memory_ids: Vec<String>,
    pub bootstrap: bool,
}

impl Principal {
    pub fn bootstrap() -> Self {
        Self {
            client_name: "admin".to_string(),
            permissions: vec!["admin".into(), "read".into(), "write".into()],
            memory_ids: Vec::new(),
            bootstrap: true,
        }
    }

    /// Loopback caller on the streaming endpoint, pre-token era tooling.
    pub fn local() -> Self {
        Self {
            client_name: "local".to_string(),
            ..Self::bootstrap()
        }
    }

    pub fn from_token(token: &TokenInfo) -> Self {
        Self {
            client_name: token.client_name.clone(),
            permissions: token.permissions.clone(),
            memory_ids: token.memory_ids.clone(),
            bootstrap: false,
        }
    }

    /// Admin implies every permission.
    pub fn has_permission(&self, required: &str) -> bool {
        self.permissions.iter().any(|p| p == required)
            || self.permissions.iter().any(|p| p == "admin")
    }

    /// A non-empty scope list restricts the principal to those memories.
    pub fn allows_memory(&self, memory_id: &str) -> bool {
        self.memory_ids.is_empty() || self.memory_ids.iter().any(|id| id == memory_id)
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": { "kind": "unauthorized", "message": message }
        })),
    )
        .into_response()
}

fn is_public(path: &str) -> bool {
    path == "/health" || path.starts_with("/static/")
}

fn is_streaming(path: &str) -> bool {
    path == "/sse" || path == "/messages"
}

/// Axum middleware: authenticate the request and attach a [`Principal`].
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if is_public(&path) {
        return next.run(request).await;
    }

    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let principal = match bearer {
        Some(raw) => {
            if !state.config.auth.bootstrap_key.is_empty()
                && raw == state.config.auth.bootstrap_key
            {
                Principal::bootstrap()
            } else {
                match state.tokens.validate(&raw).await {
                    Ok(Some(token)) => Principal::from_token(&token),
                    Ok(None) => return unauthorized("invalid, expired or revoked token"),
                    Err(e) => {
                        tracing::error!(error = %e, "Token validation failed");
                        return unauthorized("authentication backend unavailable");
                    }
                }
            }
        }
        None => {
            // Historical carve-out: intra-host tooling may use the streaming
            // endpoint without a token. Never for /api/*.
            let loopback = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().is_loopback())
                .unwrap_or(false);
            if is_streaming(&path) && loopback {
                Principal::local()
            } else {
                return unauthorized("Authorization: Bearer <token> required");
            }
        }
    };

    tracing::debug!(client = %principal.client_name, path = %path, "Authenticated");
    request.extensions_mut().insert(principal);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn admin_grants_everything() {
        let principal = Principal::bootstrap();
        assert!(principal.has_permission("read"));
        assert!(principal.has_permission("write"));
        assert!(principal.has_permission("admin"));
        assert!(principal.allows_memory("anything"));
    }

    #[test]
    fn scoped_token_restricts_memories() {
        let token = TokenInfo {
            token_hash: "h".into(),
            client_name: "quoteflow".into(),
            email: None,
            permissions: vec!["read".into()],
            memory_ids: vec!["legal".into()],
            created_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
        };
        let principal = Principal::from_token(&token);
        assert!(principal.allows_memory("legal"));
        assert!(!principal.allows_memory("cloud"));
        assert!(principal.has_permission("read"));
        assert!(!principal.has_permission("write"));
        assert!(!principal.has_permission("admin"));
    }

    #[test]
    fn unscoped_token_reaches_all_memories() {
        let principal = Principal {
            client_name: "c".into(),
            permissions: vec!["read".into()],
            memory_ids: vec![],
            bootstrap: false,
        };
        assert!(principal.allows_memory("any"));
    }

    #[test]
    fn public_and_streaming_path_classification() {
        assert!(is_public("/health"));
        assert!(is_public("/static/app.js"));
        assert!(!is_public("/api/memories"));
        assert!(is_streaming("/sse"));
        assert!(is_streaming("/messages"));
        // The carve-out never applies to the REST surface.
        assert!(!is_streaming("/api/ask"));
    }
}
