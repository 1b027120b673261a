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

//! REST surface for the visualizer: `/health` (public) and the
//! Bearer-authenticated `/api/*` routes.

use crate::auth::Principal;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use graphmem_core::error::MemoryError;
use serde::Deserialize;
use serde_json::json;

/// REST error wrapper mapping error kinds onto HTTP statuses.
pub struct ApiError(pub MemoryError);

impl From<MemoryError> for ApiError {
    fn from(error: MemoryError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "not_found" => StatusCode::NOT_FOUND,
            "already_exists" | "conflict" => StatusCode::CONFLICT,
            "invalid_argument" => StatusCode::BAD_REQUEST,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "forbidden" => StatusCode::FORBIDDEN,
            "quota_exceeded" => StatusCode::PAYLOAD_TOO_LARGE,
            "dependency_failure" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(crate::mcp::handlers::error_body(&self.0))).into_response()
    }
}

fn check_scope(principal: &Principal, memory_id: &str) -> Result<(), ApiError> {
    if principal.allows_memory(memory_id) {
        Ok(())
    } else {
        Err(ApiError(MemoryError::Forbidden(format!(
            "token of '{}' is not allowed on memory '{}'",
            principal.client_name, memory_id
        ))))
    }
}

/// GET /health - public liveness + per-dependency status.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.health_report().await)
}

/// GET /api/memories
pub async fn list_memories(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let memories = state.graph.list_memories().await?;
    let visible: Vec<_> = memories
        .into_iter()
        .filter(|m| principal.allows_memory(&m.id))
        .collect();
    Ok(Json(json!({ "count": visible.len(), "memories": visible })))
}

/// GET /api/graph/:memory_id
pub async fn memory_graph(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(memory_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_scope(&principal, &memory_id)?;
    if state.graph.get_memory(&memory_id).await?.is_none() {
        return Err(ApiError(MemoryError::not_found(format!(
            "memory '{}' not found",
            memory_id
        ))));
    }
    let snapshot = state.graph.full_graph(&memory_id).await?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub memory_id: String,
    pub question: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// POST /api/ask - Graph-Guided RAG with LLM-composed answer.
pub async fn ask(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<AskRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_scope(&principal, &request.memory_id)?;
    let answer = state
        .query
        .question_answer(&request.memory_id, &request.question, request.limit)
        .await?;
    Ok(Json(serde_json::to_value(answer).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub memory_id: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// POST /api/query - structured retrieval without an LLM call.
pub async fn query(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_scope(&principal, &request.memory_id)?;
    let result = state
        .query
        .memory_query(&request.memory_id, &request.query, request.limit)
        .await?;
    Ok(Json(result))
}
