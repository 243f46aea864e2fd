//! MCP tool families.
//!
//! [`McpExecutor`] speaks JSON-RPC (`initialize`, `tools/list`, `tools/call`)
//! over an [`McpTransport`]. The device transport tunnels requests through
//! the session websocket as `{"type":"mcp","payload":…}` and correlates
//! replies by id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{
    ToolArgs, ToolCategory, ToolContext, ToolDefinition, ToolError, ToolExecutor, ToolOutput,
    ToolResult, args_to_json,
};

const MAX_LIST_PAGES: usize = 16;

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send one JSON-RPC request and wait for its `result`.
    async fn request(&self, ctx: &ToolContext, method: &str, params: Value) -> ToolResult<Value>;
}

type PendingReply = oneshot::Sender<Result<Value, String>>;

/// JSON-RPC over the device websocket.
pub struct DeviceMcpTransport {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    timeout: Duration,
}

impl DeviceMcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Route a `payload` received from the device to its waiting request.
    ///
    /// Returns false when no request is waiting for this id.
    pub fn handle_response(&self, payload: &Value) -> bool {
        let Some(id) = payload.get("id").and_then(Value::as_u64) else {
            return false;
        };
        let Some(reply) = self.pending.lock().remove(&id) else {
            debug!("MCP reply for unknown id {}", id);
            return false;
        };
        let outcome = match payload.get("error") {
            Some(error) => Err(error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string())),
            None => Ok(payload.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = reply.send(outcome);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl McpTransport for DeviceMcpTransport {
    async fn request(&self, ctx: &ToolContext, method: &str, params: Value) -> ToolResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let message = json!({
            "type": "mcp",
            "payload": {"jsonrpc": "2.0", "id": id, "method": method, "params": params},
        });
        if let Err(e) = ctx.send_to_device(message).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(ToolError::Execution(message)),
            Ok(Err(_)) => Err(ToolError::Cancelled),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ToolError::Timeout(format!("mcp {}", method)))
            }
        }
    }
}

/// Replace characters function-calling APIs reject.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

pub struct McpExecutor {
    category: ToolCategory,
    transport: Arc<dyn McpTransport>,
    tools: RwLock<Vec<ToolDefinition>>,
    /// Sanitized name → name used on the wire
    wire_names: RwLock<HashMap<String, String>>,
}

impl McpExecutor {
    pub fn new(category: ToolCategory, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            category,
            transport,
            tools: RwLock::new(Vec::new()),
            wire_names: RwLock::new(HashMap::new()),
        }
    }

    /// Initialize the peer and fetch its tool list. Returns the tool names.
    pub async fn refresh(&self, ctx: &ToolContext) -> ToolResult<Vec<String>> {
        let init = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
        });
        if let Err(e) = self.transport.request(ctx, "initialize", init).await {
            warn!(session_id = %ctx.session_id, "MCP initialize failed: {}", e);
            return Err(e);
        }

        let mut definitions = Vec::new();
        let mut wire_names = HashMap::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(c) => json!({"cursor": c}),
                None => json!({}),
            };
            let result = self.transport.request(ctx, "tools/list", params).await?;
            let tools = result.get("tools").and_then(Value::as_array).cloned().unwrap_or_default();
            for tool in tools {
                let Some(wire) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let name = sanitize_name(wire);
                let description = tool.get("description").and_then(Value::as_str).unwrap_or_default();
                let schema = tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                wire_names.insert(name.clone(), wire.to_string());
                definitions.push(ToolDefinition::new(name, description, schema, self.category));
            }
            cursor = result.get("nextCursor").and_then(Value::as_str).map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        let names: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
        info!(session_id = %ctx.session_id, "MCP peer offers {} tools", names.len());
        *self.tools.write() = definitions;
        *self.wire_names.write() = wire_names;
        Ok(names)
    }
}

#[async_trait]
impl ToolExecutor for McpExecutor {
    fn category(&self) -> ToolCategory {
        self.category
    }

    async fn execute(&self, ctx: &ToolContext, name: &str, args: &ToolArgs) -> ToolResult<ToolOutput> {
        let wire = self
            .wire_names
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let result = self
            .transport
            .request(ctx, "tools/call", json!({"name": wire, "arguments": args_to_json(args)}))
            .await?;

        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| result.to_string());

        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(ToolOutput::error(text));
        }
        Ok(ToolOutput::req_llm(text))
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools.read().clone()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.wire_names.read().contains_key(name)
    }
}
