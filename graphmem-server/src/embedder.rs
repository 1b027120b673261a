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

//! Batched embedding with bounded in-flight parallelism.
//!
//! Batches keep their input order; resulting vectors are L2-normalised
//! before they reach the vector store so cosine scores stay meaningful.

use crate::llm::LlmClient;
use futures::stream::{self, StreamExt, TryStreamExt};
use graphmem_core::error::Result;
use graphmem_storage::l2_normalize;
use std::sync::Arc;
use std::time::Duration;

pub struct Embedder {
    llm: Arc<LlmClient>,
    batch_size: usize,
    concurrency: usize,
    timeout: Duration,
}

impl Embedder {
    pub fn new(llm: Arc<LlmClient>, batch_size: usize, concurrency: usize) -> Self {
        Self {
            llm,
            batch_size: batch_size.max(1),
            concurrency: concurrency.clamp(1, 4),
            timeout: Duration::from_secs(60),
        }
    }

    /// Embed chunk texts in order. Each batch is retried inside the LLM
    /// client; a failed batch fails the whole call.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<Vec<String>> = texts
            .chunks(self.batch_size)
            .map(|batch| batch.to_vec())
            .collect();
        let total_batches = batches.len();

        let llm = self.llm.clone();
        let timeout = self.timeout;
        let results: Vec<Vec<Vec<f32>>> = stream::iter(batches.into_iter().enumerate().map(
            move |(index, batch)| {
                let llm = llm.clone();
                async move {
                    tracing::debug!(batch = index + 1, total = total_batches, size = batch.len(), "Embedding batch");
                    llm.embed(&batch, timeout).await
                }
            },
        ))
        // buffered() preserves input order, so vectors line up with texts.
        .buffered(self.concurrency)
        .try_collect()
        .await?;

        let mut vectors: Vec<Vec<f32>> = results.into_iter().flatten().collect();
        for vector in vectors.iter_mut() {
            l2_normalize(vector);
        }
        Ok(vectors)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = self.llm.embed(&[query.to_string()], self.timeout).await?;
        let mut vector = vectors.pop().unwrap_or_default();
        l2_normalize(&mut vector);
        Ok(vector)
    }
}
