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

//! Bounded progress notification sink.
//!
//! Long-running tools push phase notifications here; the MCP transport
//! drains them onto the caller's SSE stream. The channel is bounded and
//! sends never block: a slow consumer drops notifications, it does not
//! stall ingestion. Order is preserved for whatever is delivered.

use serde_json::json;
use tokio::sync::mpsc;

/// A progress notification as pushed on the wire (JSON-RPC notification).
pub type ProgressNotification = serde_json::Value;

#[derive(Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressNotification>>,
}

impl ProgressSink {
    /// A sink bound to a session channel.
    pub fn new(tx: mpsc::Sender<ProgressNotification>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything (REST calls, tests).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// True when the originating connection is gone. Long tools poll this
    /// between units of work and stop after the current one.
    pub fn is_cancelled(&self) -> bool {
        self.tx.as_ref().map(|tx| tx.is_closed()).unwrap_or(false)
    }

    /// Emit a progress notification. Never blocks; drops when the channel
    /// is full or closed.
    pub fn notify(&self, phase: &str, detail: serde_json::Value) {
        let Some(tx) = &self.tx else { return };
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {
                "phase": phase,
                "detail": detail,
            }
        });
        if tx.try_send(notification).is_err() {
            tracing::trace!(phase = %phase, "Progress notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifications_flow_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = ProgressSink::new(tx);
        sink.notify("decode", json!({"step": 1}));
        sink.notify("extract", json!({"step": 2}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first["params"]["phase"], "decode");
        let second = rx.recv().await.unwrap();
        assert_eq!(second["params"]["phase"], "extract");
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = ProgressSink::new(tx);
        sink.notify("a", json!({}));
        // Second send hits a full channel; it must return immediately.
        sink.notify("b", json!({}));
    }

    #[test]
    fn disabled_sink_is_a_no_op() {
        ProgressSink::disabled().notify("anything", json!({}));
    }
}
