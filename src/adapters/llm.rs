//! Reference LLM adapter (§4.4): a canned-response stub. Streams its
//! reply one word at a time so the kernel's sentence-segmentation logic
//! has real deltas to chew on, and optionally emits a tool call first if
//! the session has any MCP tools registered — exercising the
//! LLM-pauses-for-MCP path without a real model.

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use super::{CancelToken, HistoryTurn, LlmAdapter, LlmEvent, LlmStream};
use crate::mcp::ToolDescriptor;

pub struct StubLlmAdapter {
    reply: String,
}

impl Default for StubLlmAdapter {
    fn default() -> Self {
        Self { reply: "I heard you, how can I help?".to_string() }
    }
}

#[async_trait]
impl LlmAdapter for StubLlmAdapter {
    async fn generate(
        &self,
        prompt: String,
        _history: Vec<HistoryTurn>,
        tools: Vec<ToolDescriptor>,
        cancel: CancelToken,
    ) -> LlmStream {
        let (tx, rx) = mpsc::channel(16);
        let reply = self.reply.clone();

        tokio::spawn(async move {
            if prompt.is_empty() {
                let _ = tx.send(Ok(LlmEvent::Done)).await;
                return;
            }

            if let Some(tool) = tools.first() {
                let (result_tx, result_rx) = tokio::sync::oneshot::channel();
                if tx
                    .send(Ok(LlmEvent::ToolCall {
                        name: tool.name.clone(),
                        arguments: json!({}),
                        result_tx,
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = result_rx => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }

            for word in reply.split(' ') {
                if cancel.is_cancelled() {
                    return;
                }
                if tx.send(Ok(LlmEvent::TextDelta(format!("{word} ")))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(LlmEvent::Done)).await;
        });

        rx
    }
}
