use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use super::{ToolArgs, ToolCategory, ToolContext, ToolDefinition, ToolError, ToolExecutor, ToolOutput, ToolResult};

pub type PluginFuture = Pin<Box<dyn Future<Output = ToolResult<ToolOutput>> + Send>>;

/// Server-side plugin function.
pub type PluginHandler = Arc<dyn Fn(ToolContext, ToolArgs) -> PluginFuture + Send + Sync>;

struct Plugin {
    definition: ToolDefinition,
    handler: PluginHandler,
}

/// Plugin functions registered at startup and shared by all sessions.
#[derive(Default)]
pub struct PluginExecutor {
    plugins: RwLock<HashMap<String, Plugin>>,
    order: RwLock<Vec<String>>,
}

impl PluginExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. A second registration under the same name is ignored.
    pub fn register(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: PluginHandler,
    ) -> bool {
        let name = name.into();
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&name) {
            warn!("Plugin {} already registered, keeping the first", name);
            return false;
        }
        let definition = ToolDefinition::new(name.clone(), description, parameters, ToolCategory::ServerPlugin);
        plugins.insert(name.clone(), Plugin { definition, handler });
        self.order.write().push(name);
        true
    }

    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.order.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.read().is_empty()
    }
}

#[async_trait]
impl ToolExecutor for PluginExecutor {
    fn category(&self) -> ToolCategory {
        ToolCategory::ServerPlugin
    }

    async fn execute(&self, ctx: &ToolContext, name: &str, args: &ToolArgs) -> ToolResult<ToolOutput> {
        let handler = self
            .plugins
            .read()
            .get(name)
            .map(|p| p.handler.clone())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        handler(ctx.clone(), args.clone()).await
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        let plugins = self.plugins.read();
        self.order
            .read()
            .iter()
            .filter_map(|name| plugins.get(name).map(|p| p.definition.clone()))
            .collect()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.plugins.read().contains_key(name)
    }
}
