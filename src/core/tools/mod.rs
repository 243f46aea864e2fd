//! # Tool Registry
//!
//! Every tool family implements [`ToolExecutor`]. A per-session
//! [`ToolRegistry`] presents the union of the executors, and every call is
//! vetted by the [`SecurityGuard`] before it runs.
//!
//! Arguments arrive from the model as raw JSON and are normalized into
//! [`ToolArg`] at the registry boundary.

mod iot;
mod mcp;
mod plugin;
mod registry;
mod security;

pub use iot::{IotDescriptor, IotExecutor, IotMethod, IotProperty};
pub use mcp::{DeviceMcpTransport, McpExecutor, McpTransport};
pub use plugin::{PluginExecutor, PluginFuture, PluginHandler};
pub use registry::ToolRegistry;
pub use security::{
    ConfirmationChannel, DENIAL_MESSAGE, SecurityAction, SecurityConfig, SecurityDecision,
    SecurityEvent, SecurityGuard, Severity, confirmation_prompt, is_positive_reply, redact,
};

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::dialogue::ToolCallRequest;
use crate::core::llm::FunctionSpec;
use crate::core::types::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Denied: {0}")]
    Denied(String),
    #[error("Tool timed out: {0}")]
    Timeout(String),
    #[error("Device channel unavailable")]
    DeviceUnavailable,
    #[error("Execution failed: {0}")]
    Execution(String),
    #[error("Cancelled")]
    Cancelled,
}

pub type ToolResult<T> = Result<T, ToolError>;

/// Normalized tool argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ToolArg>),
    Map(BTreeMap<String, ToolArg>),
}

pub type ToolArgs = BTreeMap<String, ToolArg>;

impl ToolArg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Visit every string contained in this value.
    pub fn for_each_text<'a>(&'a self, f: &mut dyn FnMut(&'a str)) {
        match self {
            Self::Text(s) => f(s),
            Self::List(items) => items.iter().for_each(|i| i.for_each_text(f)),
            Self::Map(map) => map.values().for_each(|v| v.for_each_text(f)),
            _ => {}
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<&str> for ToolArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Render arguments as a JSON object.
pub fn args_to_json(args: &ToolArgs) -> Value {
    serde_json::to_value(args).unwrap_or(Value::Null)
}

/// A model-requested call after argument normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: ToolArgs,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: ToolArgs) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// Parse the raw JSON arguments of a model request.
    pub fn from_request(request: &ToolCallRequest) -> ToolResult<Self> {
        let raw = request.arguments.trim();
        let args = if raw.is_empty() {
            ToolArgs::new()
        } else {
            match serde_json::from_str::<ToolArg>(raw) {
                Ok(ToolArg::Map(map)) => map,
                Ok(ToolArg::Null) => ToolArgs::new(),
                Ok(_) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "arguments of {} must be an object",
                        request.name
                    )));
                }
                Err(e) => return Err(ToolError::InvalidArguments(e.to_string())),
            }
        };
        Ok(Self::new(request.id.clone(), request.name.clone(), args))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    ServerPlugin,
    ServerMcp,
    DeviceIot,
    DeviceMcp,
    McpEndpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
    pub category: ToolCategory,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        category: ToolCategory,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            category,
        }
    }

    pub fn to_function_spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// What the dialogue loop should do with a tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAction {
    /// Speak `content` directly; the model is not consulted again
    Response,
    /// Feed `content` back to the model
    ReqLlm,
    Error,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub action: ToolAction,
    pub content: String,
}

impl ToolOutput {
    pub fn response(content: impl Into<String>) -> Self {
        Self {
            action: ToolAction::Response,
            content: content.into(),
        }
    }

    pub fn req_llm(content: impl Into<String>) -> Self {
        Self {
            action: ToolAction::ReqLlm,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            action: ToolAction::Error,
            content: content.into(),
        }
    }

    pub fn not_found(name: &str) -> Self {
        Self {
            action: ToolAction::NotFound,
            content: format!("tool {} not found", name),
        }
    }
}

/// Outbound JSON path to the connected device.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    async fn send_json(&self, message: Value) -> ToolResult<()>;
}

/// Per-call context handed to executors.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub device_id: String,
    pub device: Weak<dyn DeviceChannel>,
    pub confirmer: Option<Arc<dyn ConfirmationChannel>>,
}

impl ToolContext {
    pub fn new(session_id: SessionId, device_id: impl Into<String>, device: Weak<dyn DeviceChannel>) -> Self {
        Self {
            session_id,
            device_id: device_id.into(),
            device,
            confirmer: None,
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn ConfirmationChannel>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    /// Context without a device, for tests and server-only tools.
    pub fn detached(session_id: SessionId) -> Self {
        let device: Weak<dyn DeviceChannel> = Weak::<NullDevice>::new();
        Self::new(session_id, "", device)
    }

    pub async fn send_to_device(&self, message: Value) -> ToolResult<()> {
        let device = self.device.upgrade().ok_or(ToolError::DeviceUnavailable)?;
        device.send_json(message).await
    }
}

struct NullDevice;

#[async_trait]
impl DeviceChannel for NullDevice {
    async fn send_json(&self, _message: Value) -> ToolResult<()> {
        Err(ToolError::DeviceUnavailable)
    }
}

/// One tool family.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn category(&self) -> ToolCategory;

    async fn execute(&self, ctx: &ToolContext, name: &str, args: &ToolArgs) -> ToolResult<ToolOutput>;

    fn list_tools(&self) -> Vec<ToolDefinition>;

    fn has_tool(&self, name: &str) -> bool {
        self.list_tools().iter().any(|t| t.name == name)
    }
}
