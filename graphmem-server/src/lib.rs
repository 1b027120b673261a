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

//! Graphmem server: knowledge-graph memory service exposing an MCP tool
//! protocol over SSE and a small REST surface, backed by an object store,
//! a property graph and a vector store.

pub mod api;
pub mod auth;
pub mod backup;
pub mod consistency;
pub mod decode;
pub mod embedder;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod mcp;
pub mod progress;
pub mod query;

use anyhow::Result;
use auth::TokenManager;
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use backup::BackupService;
use consistency::StorageChecker;
use dashmap::DashMap;
use embedder::Embedder;
use extract::Extractor;
use graphmem_core::{OntologyRegistry, ServerConfig};
use graphmem_storage::{GraphStore, ObjectStore, VectorStore};
use ingest::IngestService;
use llm::LlmClient;
use mcp::SessionMap;
use query::QueryEngine;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application context threaded through every tool invocation. Built once
/// at startup; no hidden globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub ontologies: Arc<OntologyRegistry>,
    pub graph: Arc<GraphStore>,
    pub vector: Arc<VectorStore>,
    pub objects: Arc<ObjectStore>,
    pub llm: Arc<LlmClient>,
    pub tokens: Arc<TokenManager>,
    pub ingest: Arc<IngestService>,
    pub query: Arc<QueryEngine>,
    pub backup: Arc<BackupService>,
    pub checker: Arc<StorageChecker>,
    pub sessions: SessionMap,
    memory_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn build(config: ServerConfig, ontologies: OntologyRegistry) -> Result<Self> {
        let config = Arc::new(config);
        let ontologies = Arc::new(ontologies);

        let objects = Arc::new(ObjectStore::new(&config.object_store)?);
        let graph = Arc::new(GraphStore::new(&config.graph, &config.limits));
        let vector = Arc::new(VectorStore::new(
            &config.vector,
            config.llm.embedding_dimensions,
        ));
        let llm = Arc::new(LlmClient::new(&config.llm));

        let embedder = Arc::new(Embedder::new(
            llm.clone(),
            config.limits.embedding_batch_size,
            config.limits.embedding_concurrency,
        ));
        let extractor = Arc::new(Extractor::new(
            llm.clone(),
            config.limits.extraction_chunk_size,
            config.limits.context_budget_chars,
            config.limits.extraction_timeout_s,
        ));
        let ingest = Arc::new(IngestService::new(
            &config,
            graph.clone(),
            vector.clone(),
            objects.clone(),
            ontologies.clone(),
            extractor,
            embedder.clone(),
        ));
        let query = Arc::new(QueryEngine::new(
            graph.clone(),
            vector.clone(),
            embedder,
            llm.clone(),
            config.limits.rag_score_threshold,
            config.limits.rag_chunk_limit,
        ));
        let backup = Arc::new(BackupService::new(
            graph.clone(),
            vector.clone(),
            objects.clone(),
            config.limits.backup_retention_count,
        ));
        let checker = Arc::new(StorageChecker::new(graph.clone(), objects.clone()));
        let tokens = Arc::new(TokenManager::new(graph.clone()));

        Ok(Self {
            config,
            ontologies,
            graph,
            vector,
            objects,
            llm,
            tokens,
            ingest,
            query,
            backup,
            checker,
            sessions: Arc::new(DashMap::new()),
            memory_locks: Arc::new(DashMap::new()),
            started_at: std::time::Instant::now(),
        })
    }

    /// Per-memory mutex serialising conflicting operations (`memory_ingest`
    /// vs `backup_create` on the same memory).
    pub fn memory_lock(&self, memory_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.memory_locks
            .entry(memory_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Version and per-dependency status, used by `/health` and
    /// `system_health`.
    pub async fn health_report(&self) -> serde_json::Value {
        let (objects, graph, vector, llm) = tokio::join!(
            self.objects.probe(),
            self.graph.probe(),
            self.vector.probe(),
            self.llm.probe(),
        );

        let all_ok = [&objects, &graph, &vector, &llm]
            .iter()
            .all(|status| status.status == "ok");

        json!({
            "status": if all_ok { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "dependencies": {
                "object_store": objects,
                "graph_store": graph,
                "vector_store": vector,
                "llm": llm,
            }
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut cors = CorsLayer::new();
    if state.config.server.enable_cors {
        cors = cors.allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }

    Router::new()
        .route("/health", get(api::health))
        // MCP transport: stream plus per-session message endpoint.
        .route("/sse", get(mcp::sse_handler))
        .route("/messages", post(mcp::messages_handler))
        // REST surface for the visualizer.
        .route("/api/memories", get(api::list_memories))
        .route("/api/graph/:memory_id", get(api::memory_graph))
        .route("/api/ask", post(api::ask))
        .route("/api/query", post(api::query))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graphmem_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Graphmem server");
    config.validate()?;

    let ontologies = OntologyRegistry::load_dir(&config.limits.ontology_dir)
        .map_err(|e| anyhow::anyhow!("ontology load failed: {}", e))?;
    if ontologies.is_empty() {
        anyhow::bail!(
            "no ontologies found in {}; at least one is required",
            config.limits.ontology_dir.display()
        );
    }
    tracing::info!(count = ontologies.len(), "Ontologies loaded");

    let addr = config.socket_addr()?;
    let state = AppState::build(config, ontologies)?;
    let app = build_router(state);

    tracing::info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Shutdown signal handler failed");
    }
    tracing::info!("Shutdown signal received");
}
