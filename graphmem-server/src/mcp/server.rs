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

//! MCP transport over SSE.
//!
//! A client opens `GET /sse`; the server assigns a session id and pushes an
//! `endpoint` event carrying the URL the client must POST its JSON-RPC
//! messages to. Responses and progress notifications travel back on the
//! same stream as `message` events. The per-session channel is bounded;
//! slow consumers lose notifications, never stall work.

use crate::mcp::handlers::McpHandler;
use crate::mcp::protocol::JsonRpcRequest;
use crate::progress::ProgressSink;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use dashmap::DashMap;
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Per-connection outbound channel capacity.
const SESSION_CHANNEL_CAPACITY: usize = 256;

pub type SessionMap = Arc<DashMap<String, mpsc::Sender<serde_json::Value>>>;

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub session_id: String,
}

/// GET /sse - open the server-push stream for a new session.
pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<serde_json::Value>(SESSION_CHANNEL_CAPACITY);
    state.sessions.insert(session_id.clone(), tx);
    tracing::info!(session_id = %session_id, "MCP session opened");

    let endpoint_event = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={}", session_id));

    let stream = SessionStream {
        inner: ReceiverStream::new(rx),
        sessions: state.sessions.clone(),
        session_id,
        endpoint: Some(endpoint_event),
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}

/// POST /messages?session_id=... - submit one JSON-RPC message for a
/// session. The response is pushed on the session's SSE stream; the POST
/// itself acknowledges with 202.
pub async fn messages_handler(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    Extension(principal): Extension<crate::auth::Principal>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let Some(tx) = state
        .sessions
        .get(&query.session_id)
        .map(|entry| entry.value().clone())
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": { "kind": "not_found", "message": "unknown session" }
            })),
        )
            .into_response();
    };

    let handler = McpHandler::new(state.clone());
    let progress = ProgressSink::new(tx.clone());

    // The dispatch runs on its own task: long tools (ingestion, backup)
    // must not hold the POST open.
    tokio::spawn(async move {
        let response = handler.handle_request(request, &principal, &progress).await;
        if let Ok(value) = serde_json::to_value(&response) {
            if tx.send(value).await.is_err() {
                tracing::debug!("Session closed before response delivery");
            }
        }
    });

    StatusCode::ACCEPTED.into_response()
}

/// The SSE stream of one session: the `endpoint` event first, then every
/// queued response/notification as a `message` event. Dropping the stream
/// (client disconnect) unregisters the session.
struct SessionStream {
    inner: ReceiverStream<serde_json::Value>,
    sessions: SessionMap,
    session_id: String,
    endpoint: Option<Event>,
}

impl Stream for SessionStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(endpoint) = self.endpoint.take() {
            return Poll::Ready(Some(Ok(endpoint)));
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(value)) => Poll::Ready(Some(Ok(Event::default()
                .event("message")
                .data(value.to_string())))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.sessions.remove(&self.session_id);
        tracing::info!(session_id = %self.session_id, "MCP session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn session_stream_leads_with_endpoint_event() {
        let sessions: SessionMap = Arc::new(DashMap::new());
        let (tx, rx) = mpsc::channel(4);
        sessions.insert("s1".to_string(), tx.clone());

        let mut stream = SessionStream {
            inner: ReceiverStream::new(rx),
            sessions: sessions.clone(),
            session_id: "s1".to_string(),
            endpoint: Some(
                Event::default()
                    .event("endpoint")
                    .data("/messages?session_id=s1"),
            ),
        };

        // First poll yields the endpoint event.
        let first = stream.next().await.unwrap().unwrap();
        drop(first);

        tx.send(serde_json::json!({"jsonrpc": "2.0"})).await.unwrap();
        let second = stream.next().await.unwrap();
        assert!(second.is_ok());

        // Dropping the stream unregisters the session.
        drop(stream);
        assert!(sessions.get("s1").is_none());
    }
}
