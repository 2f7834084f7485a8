//! The device-side MCP sub-session (§4.6): a JSON-RPC 2.0 *client*
//! carried over `{type:"mcp", payload:{...}}` envelopes on the same
//! WebSocket. The gateway issues the requests here — `initialize`,
//! paginated `tools/list`, `tools/call` — and the device answers them,
//! the inverse of a conventional MCP server role.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::McpError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool as discovered from `tools/list`, merged into the session's
/// tool set and handed to the LLM adapter on each `generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// An outstanding request (§3: `McpPending`). `resolver` is consumed
/// exactly once, either by a matching response or by the timeout/cancel
/// path at session close.
struct Pending {
    method: String,
    sent_at: Instant,
    resolver: oneshot::Sender<Result<Value, McpError>>,
}

/// Result of a completed `tools/list` page fetch.
pub struct ToolsPage {
    pub tools: Vec<ToolDescriptor>,
    pub next_cursor: Option<String>,
}

/// Per-session JSON-RPC client state: the id allocator and pending table
/// (§3, §4.6). Owns no transport — callers hand it outbound envelopes to
/// send and feed it inbound envelopes to resolve against.
pub struct McpSubsession {
    next_id: u64,
    pending: HashMap<u64, Pending>,
    default_timeout: Duration,
    pub tools: Vec<ToolDescriptor>,
}

impl McpSubsession {
    pub fn new(default_timeout: Duration) -> Self {
        Self { next_id: 1, pending: HashMap::new(), default_timeout, tools: Vec::new() }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Builds the `initialize` request and registers its pending entry.
    pub fn build_initialize(
        &mut self,
        client_name: &str,
        client_version: &str,
    ) -> (JsonRpcRequest, oneshot::Receiver<Result<Value, McpError>>) {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { method: "initialize".to_string(), sent_at: Instant::now(), resolver: tx });
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method: "initialize".to_string(),
            params: Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": client_name, "version": client_version },
            })),
        };
        (request, rx)
    }

    /// Builds one page of `tools/list`.
    pub fn build_tools_list(
        &mut self,
        cursor: &str,
    ) -> (JsonRpcRequest, oneshot::Receiver<Result<Value, McpError>>) {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { method: "tools/list".to_string(), sent_at: Instant::now(), resolver: tx });
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method: "tools/list".to_string(),
            params: Some(json!({ "cursor": cursor })),
        };
        (request, rx)
    }

    pub fn build_tools_call(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> (JsonRpcRequest, oneshot::Receiver<Result<Value, McpError>>) {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { method: "tools/call".to_string(), sent_at: Instant::now(), resolver: tx });
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method: "tools/call".to_string(),
            params: Some(json!({ "name": name, "arguments": arguments })),
        };
        (request, rx)
    }

    /// Resolves a pending request against an inbound JSON-RPC response.
    /// An unknown id or malformed payload is logged and dropped (§4.6) —
    /// it never fails the session.
    pub fn resolve(&mut self, response: JsonRpcResponse) {
        let Some(id) = response.id else {
            debug!("dropping mcp response with no id");
            return;
        };
        let Some(pending) = self.pending.remove(&id) else {
            warn!(id, "mcp response id has no matching pending request");
            return;
        };
        let result = match (response.result, response.error) {
            (Some(result), None) => Ok(result),
            (_, Some(error)) => Err(McpError::Remote { code: error.code, message: error.message }),
            (None, None) => Err(McpError::Malformed(format!("response to '{}' had neither result nor error", pending.method))),
        };
        let _ = pending.resolver.send(result);
    }

    /// Parses a raw inbound `mcp` payload. Malformed payloads are logged
    /// and dropped rather than tearing the session down.
    pub fn handle_inbound(&mut self, payload: Value) {
        match serde_json::from_value::<JsonRpcResponse>(payload) {
            Ok(response) => self.resolve(response),
            Err(e) => warn!(error = %e, "malformed mcp payload, dropping"),
        }
    }

    /// Sweeps pendings older than their timeout, resolving each with
    /// `McpError::Timeout`. Should be polled periodically by the kernel.
    pub fn sweep_timeouts(&mut self) {
        let timeout = self.default_timeout;
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.resolver.send(Err(McpError::Timeout(id)));
            }
        }
    }

    /// Cancels every outstanding pending request, e.g. on session close
    /// (§4.6, §3 invariant: the table must be empty at session close).
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.resolver.send(Err(McpError::Remote { code: -1, message: "session closed".to_string() }));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Merges a parsed page of tools/list into the session tool set.
    pub fn merge_tools(&mut self, page: &ToolsPage) {
        for tool in &page.tools {
            if !self.tools.iter().any(|t| t.name == tool.name) {
                self.tools.push(tool.clone());
            }
        }
    }
}

pub fn parse_tools_page(result: Value) -> Result<ToolsPage, McpError> {
    let tools: Vec<ToolDescriptor> = serde_json::from_value(
        result.get("tools").cloned().ok_or_else(|| McpError::Malformed("tools/list result missing 'tools'".to_string()))?,
    )
    .map_err(|e| McpError::Malformed(e.to_string()))?;
    let next_cursor = result.get("nextCursor").and_then(Value::as_str).map(str::to_string);
    Ok(ToolsPage { tools, next_cursor })
}
