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

//! Service configuration.
//!
//! Loaded with priority: TOML file > environment > defaults. Mandatory
//! settings (object-store credentials, graph password, LLM endpoint,
//! bootstrap admin key) are enforced by [`ServerConfig::validate`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub graph: GraphStoreConfig,
    #[serde(default)]
    pub vector: VectorStoreConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// HTTP listen address (e.g. "0.0.0.0:8002").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObjectStoreConfig {
    /// S3-compatible endpoint URL.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphStoreConfig {
    /// Neo4j HTTP endpoint (transactional Cypher API).
    #[serde(default = "default_graph_uri")]
    pub uri: String,
    #[serde(default = "default_graph_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_graph_database")]
    pub database: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorStoreConfig {
    /// Qdrant REST endpoint.
    #[serde(default = "default_vector_url")]
    pub url: String,
    /// Prefix for per-memory collection names.
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL, including the /v1 segment.
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Admin key honoured before any token exists. Mandatory.
    #[serde(default)]
    pub bootstrap_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Limits {
    #[serde(default = "default_max_document_size_mb")]
    pub max_document_size_mb: u64,
    #[serde(default = "default_extraction_chunk_size")]
    pub extraction_chunk_size: usize,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_rag_score_threshold")]
    pub rag_score_threshold: f32,
    #[serde(default = "default_rag_chunk_limit")]
    pub rag_chunk_limit: usize,
    #[serde(default = "default_backup_retention_count")]
    pub backup_retention_count: usize,
    #[serde(default = "default_extraction_timeout_s")]
    pub extraction_timeout_s: u64,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
    /// Character budget for the cumulative-context JSON in extraction prompts.
    #[serde(default = "default_context_budget_chars")]
    pub context_budget_chars: usize,
    #[serde(default = "default_stopword_langs")]
    pub stopword_langs: Vec<String>,
    #[serde(default = "default_ontology_dir")]
    pub ontology_dir: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            enable_cors: true,
        }
    }
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            uri: default_graph_uri(),
            user: default_graph_user(),
            password: String::new(),
            database: default_graph_database(),
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: default_vector_url(),
            collection_prefix: default_collection_prefix(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_document_size_mb: default_max_document_size_mb(),
            extraction_chunk_size: default_extraction_chunk_size(),
            max_text_length: default_max_text_length(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            rag_score_threshold: default_rag_score_threshold(),
            rag_chunk_limit: default_rag_chunk_limit(),
            backup_retention_count: default_backup_retention_count(),
            extraction_timeout_s: default_extraction_timeout_s(),
            embedding_batch_size: default_embedding_batch_size(),
            embedding_concurrency: default_embedding_concurrency(),
            context_budget_chars: default_context_budget_chars(),
            stopword_langs: default_stopword_langs(),
            ontology_dir: default_ontology_dir(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8002".to_string()
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_graph_uri() -> String {
    "http://neo4j:7474".to_string()
}

fn default_graph_user() -> String {
    "neo4j".to_string()
}

fn default_graph_database() -> String {
    "neo4j".to_string()
}

fn default_vector_url() -> String {
    "http://qdrant:6333".to_string()
}

fn default_collection_prefix() -> String {
    "memory_".to_string()
}

fn default_llm_model() -> String {
    "gpt-oss:120b".to_string()
}

fn default_llm_max_tokens() -> u32 {
    60_000
}

fn default_llm_temperature() -> f64 {
    1.0
}

fn default_embedding_model() -> String {
    "bge-m3:567m".to_string()
}

fn default_embedding_dimensions() -> usize {
    1024
}

fn default_max_document_size_mb() -> u64 {
    50
}

fn default_extraction_chunk_size() -> usize {
    25_000
}

fn default_max_text_length() -> usize {
    950_000
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_rag_score_threshold() -> f32 {
    0.58
}

fn default_rag_chunk_limit() -> usize {
    8
}

fn default_backup_retention_count() -> usize {
    5
}

fn default_extraction_timeout_s() -> u64 {
    600
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_embedding_concurrency() -> usize {
    2
}

fn default_context_budget_chars() -> usize {
    6_000
}

fn default_stopword_langs() -> Vec<String> {
    vec!["french".to_string(), "english".to_string()]
}

fn default_ontology_dir() -> PathBuf {
    PathBuf::from("./ontologies")
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GRAPHMEM_HTTP_ADDR") {
            config.server.listen_addr = addr;
        }
        if let Ok(cors) = std::env::var("GRAPHMEM_ENABLE_CORS") {
            config.server.enable_cors = cors.parse().unwrap_or(true);
        }

        if let Ok(v) = std::env::var("GRAPHMEM_S3_ENDPOINT") {
            config.object_store.endpoint = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_S3_ACCESS_KEY") {
            config.object_store.access_key = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_S3_SECRET_KEY") {
            config.object_store.secret_key = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_S3_BUCKET") {
            config.object_store.bucket = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_S3_REGION") {
            config.object_store.region = v;
        }

        if let Ok(v) = std::env::var("GRAPHMEM_NEO4J_URI") {
            config.graph.uri = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_NEO4J_USER") {
            config.graph.user = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_NEO4J_PASSWORD") {
            config.graph.password = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_NEO4J_DATABASE") {
            config.graph.database = v;
        }

        if let Ok(v) = std::env::var("GRAPHMEM_QDRANT_URL") {
            config.vector.url = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_QDRANT_COLLECTION_PREFIX") {
            config.vector.collection_prefix = v;
        }

        if let Ok(v) = std::env::var("GRAPHMEM_LLM_API_URL") {
            config.llm.api_url = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_LLM_API_KEY") {
            config.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_LLM_MODEL") {
            config.llm.model = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_LLM_MAX_TOKENS") {
            if let Ok(parsed) = v.parse() {
                config.llm.max_tokens = parsed;
            }
        }
        if let Ok(v) = std::env::var("GRAPHMEM_EMBEDDING_MODEL") {
            config.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("GRAPHMEM_EMBEDDING_DIMENSIONS") {
            if let Ok(parsed) = v.parse() {
                config.llm.embedding_dimensions = parsed;
            }
        }

        if let Ok(v) = std::env::var("GRAPHMEM_BOOTSTRAP_KEY") {
            config.auth.bootstrap_key = v;
        }

        if let Ok(v) = std::env::var("GRAPHMEM_ONTOLOGY_DIR") {
            config.limits.ontology_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GRAPHMEM_STOPWORD_LANGS") {
            config.limits.stopword_langs =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }

        macro_rules! env_limit {
            ($var:literal, $field:ident) => {
                if let Ok(v) = std::env::var($var) {
                    if let Ok(parsed) = v.parse() {
                        config.limits.$field = parsed;
                    }
                }
            };
        }
        env_limit!("GRAPHMEM_MAX_DOCUMENT_SIZE_MB", max_document_size_mb);
        env_limit!("GRAPHMEM_EXTRACTION_CHUNK_SIZE", extraction_chunk_size);
        env_limit!("GRAPHMEM_MAX_TEXT_LENGTH", max_text_length);
        env_limit!("GRAPHMEM_CHUNK_SIZE", chunk_size);
        env_limit!("GRAPHMEM_CHUNK_OVERLAP", chunk_overlap);
        env_limit!("GRAPHMEM_RAG_SCORE_THRESHOLD", rag_score_threshold);
        env_limit!("GRAPHMEM_RAG_CHUNK_LIMIT", rag_chunk_limit);
        env_limit!("GRAPHMEM_BACKUP_RETENTION_COUNT", backup_retention_count);
        env_limit!("GRAPHMEM_EXTRACTION_TIMEOUT_S", extraction_timeout_s);
        env_limit!("GRAPHMEM_EMBEDDING_BATCH_SIZE", embedding_batch_size);

        config
    }

    /// Load configuration with priority: file > env > defaults.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::from_env();

        if let Some(path) = config_file {
            if path.exists() {
                tracing::info!(path = %path.display(), "Loading configuration file");
                let file_config = Self::from_file(&path)?;
                config = file_config.overlaid_on(config);
            } else {
                tracing::warn!(path = %path.display(), "Config file not found, using env/defaults");
            }
        }

        Ok(config)
    }

    /// Overlay file-provided sections on an env-derived base.
    ///
    /// File values win wherever the file sets a non-empty value.
    fn overlaid_on(self, base: Self) -> Self {
        let mut merged = self;
        if merged.object_store.endpoint.is_empty() {
            merged.object_store = base.object_store;
        }
        if merged.graph.password.is_empty() {
            merged.graph = base.graph;
        }
        if merged.llm.api_url.is_empty() {
            merged.llm = base.llm;
        }
        if merged.auth.bootstrap_key.is_empty() {
            merged.auth = base.auth;
        }
        merged
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    pub fn max_document_size_bytes(&self) -> u64 {
        self.limits.max_document_size_mb * 1024 * 1024
    }

    /// Validate the configuration; mandatory settings must be present.
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.object_store.endpoint.is_empty()
            || self.object_store.access_key.is_empty()
            || self.object_store.secret_key.is_empty()
            || self.object_store.bucket.is_empty()
        {
            anyhow::bail!(
                "object store configuration incomplete: set GRAPHMEM_S3_ENDPOINT, \
                 GRAPHMEM_S3_ACCESS_KEY, GRAPHMEM_S3_SECRET_KEY and GRAPHMEM_S3_BUCKET"
            );
        }
        if self.graph.password.is_empty() {
            anyhow::bail!("graph store password missing: set GRAPHMEM_NEO4J_PASSWORD");
        }
        if self.llm.api_url.is_empty() || self.llm.api_key.is_empty() {
            anyhow::bail!(
                "LLM configuration incomplete: set GRAPHMEM_LLM_API_URL and GRAPHMEM_LLM_API_KEY"
            );
        }
        if self.auth.bootstrap_key.is_empty() {
            anyhow::bail!("bootstrap admin key missing: set GRAPHMEM_BOOTSTRAP_KEY");
        }
        if self.limits.chunk_overlap >= self.limits.chunk_size {
            anyhow::bail!("chunk_overlap must be smaller than chunk_size");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.object_store.endpoint = "http://minio:9000".into();
        config.object_store.access_key = "ak".into();
        config.object_store.secret_key = "sk".into();
        config.object_store.bucket = "graphmem".into();
        config.graph.password = "secret".into();
        config.llm.api_url = "https://api.example.com/v1".into();
        config.llm.api_key = "key".into();
        config.auth.bootstrap_key = "bootstrap".into();
        config
    }

    #[test]
    fn defaults_match_spec() {
        let limits = Limits::default();
        assert_eq!(limits.max_document_size_mb, 50);
        assert_eq!(limits.extraction_chunk_size, 25_000);
        assert_eq!(limits.max_text_length, 950_000);
        assert_eq!(limits.chunk_size, 500);
        assert_eq!(limits.chunk_overlap, 50);
        assert!((limits.rag_score_threshold - 0.58).abs() < 1e-6);
        assert_eq!(limits.rag_chunk_limit, 8);
        assert_eq!(limits.backup_retention_count, 5);
        assert_eq!(limits.extraction_timeout_s, 600);
    }

    #[test]
    fn validate_requires_mandatory_settings() {
        assert!(ServerConfig::default().validate().is_err());
        assert!(configured().validate().is_ok());

        let mut missing_bootstrap = configured();
        missing_bootstrap.auth.bootstrap_key.clear();
        assert!(missing_bootstrap.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlap_at_or_above_chunk_size() {
        let mut config = configured();
        config.limits.chunk_overlap = config.limits.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_config_parses() {
        let toml = r#"
            [server]
            listen_addr = "127.0.0.1:9999"

            [limits]
            chunk_size = 256
            rag_score_threshold = 0.7
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.limits.chunk_size, 256);
        assert!((config.limits.rag_score_threshold - 0.7).abs() < 1e-6);
        // Untouched sections keep their defaults.
        assert_eq!(config.limits.rag_chunk_limit, 8);
    }
}
