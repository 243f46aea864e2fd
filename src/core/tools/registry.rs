use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{
    SecurityDecision, SecurityGuard, ToolCall, ToolCategory, ToolContext, ToolDefinition,
    ToolError, ToolExecutor, ToolOutput, ToolResult,
};

/// Union view over the executors available to one session.
///
/// Executors are consulted in registration order; when two expose the same
/// tool name the first one wins.
pub struct ToolRegistry {
    executors: RwLock<Vec<Arc<dyn ToolExecutor>>>,
    guard: Arc<SecurityGuard>,
}

impl ToolRegistry {
    pub fn new(guard: Arc<SecurityGuard>) -> Self {
        Self {
            executors: RwLock::new(Vec::new()),
            guard,
        }
    }

    pub fn add_executor(&self, executor: Arc<dyn ToolExecutor>) {
        debug!("Adding {:?} tool executor", executor.category());
        self.executors.write().push(executor);
    }

    pub fn guard(&self) -> &Arc<SecurityGuard> {
        &self.guard
    }

    /// Deduplicated tool list, collisions logged.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        for executor in self.executors.read().iter() {
            for tool in executor.list_tools() {
                if !seen.insert(tool.name.clone()) {
                    warn!(
                        "Tool name collision: {} from {:?} ignored",
                        tool.name,
                        executor.category()
                    );
                    continue;
                }
                tools.push(tool);
            }
        }
        tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.executors.read().iter().any(|e| e.has_tool(name))
    }

    pub fn category_of(&self, name: &str) -> Option<ToolCategory> {
        self.find(name).map(|e| e.category())
    }

    fn find(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.executors
            .read()
            .iter()
            .find(|e| e.has_tool(name))
            .cloned()
    }

    /// Security check only; used by the orchestrator before dispatch.
    pub async fn vet(&self, ctx: &ToolContext, call: &ToolCall) -> ToolResult<()> {
        match self.guard.check(ctx, call).await {
            SecurityDecision::Allow => Ok(()),
            SecurityDecision::Deny(reason) => Err(ToolError::Denied(reason)),
        }
    }

    /// Run a call that has already been vetted.
    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(executor) = self.find(&call.name) else {
            warn!(session_id = %ctx.session_id, "Model requested unknown tool {}", call.name);
            return ToolOutput::not_found(&call.name);
        };
        match executor.execute(ctx, &call.name, &call.args).await {
            Ok(output) => output,
            Err(ToolError::NotFound(_)) => ToolOutput::not_found(&call.name),
            Err(e) => {
                warn!(session_id = %ctx.session_id, "Tool {} failed: {}", call.name, e);
                ToolOutput::error(e.to_string())
            }
        }
    }

    /// Vet then run.
    pub async fn execute_guarded(&self, ctx: &ToolContext, call: &ToolCall) -> ToolResult<ToolOutput> {
        self.vet(ctx, call).await?;
        Ok(self.execute(ctx, call).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::{
        PluginExecutor, PluginFuture, PluginHandler, SecurityConfig, ToolAction, ToolArgs,
    };
    use crate::core::types::SessionId;
    use serde_json::json;

    fn handler(reply: &'static str) -> PluginHandler {
        Arc::new(move |_ctx: ToolContext, _args: ToolArgs| {
            Box::pin(async move { Ok(ToolOutput::req_llm(reply)) }) as PluginFuture
        })
    }

    fn registry(strict: bool) -> ToolRegistry {
        let guard = Arc::new(SecurityGuard::new(SecurityConfig {
            strict,
            ..Default::default()
        }));
        let registry = ToolRegistry::new(guard);

        let first = Arc::new(PluginExecutor::new());
        first.register("get_time", "time", json!({}), handler("first"));
        let second = Arc::new(PluginExecutor::new());
        second.register("get_time", "time", json!({}), handler("second"));
        second.register("get_date", "date", json!({}), handler("date"));

        registry.add_executor(first);
        registry.add_executor(second);
        registry
    }

    #[tokio::test]
    async fn test_union_view_keeps_first() {
        let registry = registry(false);
        let names: Vec<String> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["get_time", "get_date"]);

        let ctx = ToolContext::detached(SessionId::new());
        let out = registry
            .execute(&ctx, &ToolCall::new("1", "get_time", ToolArgs::new()))
            .await;
        assert_eq!(out.content, "first");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let registry = registry(false);
        let ctx = ToolContext::detached(SessionId::new());
        let out = registry
            .execute(&ctx, &ToolCall::new("1", "fly", ToolArgs::new()))
            .await;
        assert_eq!(out.action, ToolAction::NotFound);
    }

    #[tokio::test]
    async fn test_guarded_execution_denies_in_strict_mode() {
        let registry = registry(true);
        let ctx = ToolContext::detached(SessionId::new());
        let err = registry
            .execute_guarded(&ctx, &ToolCall::new("1", "get_time", ToolArgs::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Denied(_)));
    }
}
