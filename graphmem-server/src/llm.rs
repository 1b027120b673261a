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

//! Client for the OpenAI-compatible LLM endpoint (chat completions and
//! embeddings). 429 and 5xx responses are retried with jittered
//! exponential backoff, capped at three attempts.

use graphmem_core::config::LlmConfig;
use graphmem_core::error::{MemoryError, Result};
use graphmem_core::types::DependencyStatus;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

const DEPENDENCY: &str = "llm";
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub duration_ms: u64,
}

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    max_tokens: u32,
    temperature: f64,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One chat completion. `timeout` bounds the individual call; within an
    /// ingestion a timeout skips the chunk rather than aborting the run.
    pub async fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<ChatResponse> {
        let start = Instant::now();
        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let payload = self
            .post_with_retry("/chat/completions", &body, timeout)
            .await?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if content.is_empty() {
            return Err(MemoryError::dependency(DEPENDENCY, "empty chat completion"));
        }

        Ok(ChatResponse {
            content,
            model: payload["model"]
                .as_str()
                .unwrap_or(&self.model)
                .to_string(),
            input_tokens: payload["usage"]["prompt_tokens"].as_u64(),
            output_tokens: payload["usage"]["completion_tokens"].as_u64(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Embed a batch of texts. Vectors come back in input order.
    pub async fn embed(&self, texts: &[String], timeout: Duration) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let payload = self.post_with_retry("/embeddings", &body, timeout).await?;

        let data = payload["data"]
            .as_array()
            .ok_or_else(|| MemoryError::dependency(DEPENDENCY, "embeddings response has no data"))?;
        if data.len() != texts.len() {
            return Err(MemoryError::dependency(
                DEPENDENCY,
                format!("expected {} embeddings, got {}", texts.len(), data.len()),
            ));
        }

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let vector: Vec<f32> = item["embedding"]
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect())
                .unwrap_or_default();
            if vector.is_empty() {
                return Err(MemoryError::dependency(DEPENDENCY, "empty embedding vector"));
            }
            vectors.push(vector);
        }
        Ok(vectors)
    }

    async fn post_with_retry(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .timeout(timeout)
                .json(body)
                .send()
                .await;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| MemoryError::dependency(DEPENDENCY, e));
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    let detail = response.text().await.unwrap_or_default();
                    if retryable && attempt < MAX_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        tracing::warn!(
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "LLM call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(MemoryError::dependency(
                        DEPENDENCY,
                        format!("HTTP {}: {}", status, truncate(&detail, 300)),
                    ));
                }
                Err(e) if e.is_timeout() => {
                    return Err(MemoryError::dependency(
                        DEPENDENCY,
                        format!("timeout after {:?}", timeout),
                    ));
                }
                Err(e) => {
                    if attempt < MAX_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        tracing::warn!(error = %e, attempt, "LLM request error, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(MemoryError::dependency(DEPENDENCY, e));
                }
            }
        }
    }

    pub async fn probe(&self) -> DependencyStatus {
        let messages = [ChatMessage::user("Reply with OK")];
        match self.chat(&messages, Duration::from_secs(30)).await {
            Ok(_) => DependencyStatus::ok(format!("model '{}' reachable", self.model)),
            Err(e) => DependencyStatus::error(e.to_string()),
        }
    }
}

/// Exponential backoff with jitter: 2^attempt seconds, +-50%, capped at 10s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = (1u64 << attempt.min(4)) * 1000;
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    let delay_ms = ((base_ms as f64) * jitter).min(10_000.0);
    Duration::from_millis(delay_ms as u64)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_stays_capped() {
        for attempt in 1..=6 {
            let delay = backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("short", 300), "short");
        let long = "x".repeat(400);
        let cut = truncate(&long, 300);
        assert_eq!(cut.chars().count(), 303);
    }
}
