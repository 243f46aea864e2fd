//! Guardrails around tool execution.
//!
//! Every call passes, in order:
//!
//! 1. allow-list (static names, dynamic prefixes, names registered at runtime)
//! 2. parameter validation against dangerous patterns
//! 3. spoken confirmation for critical operations
//!
//! Each decision lands in a bounded audit log with sensitive fields redacted.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{ToolArgs, ToolCall, ToolContext, args_to_json};
use crate::core::types::SessionClock;

const AUDIT_CAPACITY: usize = 1000;
const MAX_PARAM_LEN: usize = 10_000;
const DYNAMIC_PREFIXES: &[&str] = &["iot_", "device_", "mcp_"];
const CRITICAL_OPERATIONS: &[&str] = &["cancel", "refund", "delete", "reset"];

const NEGATIVE_REPLIES: &[&str] = &["不", "别", "算了", "no", "don't", "dont", "nope"];
const POSITIVE_REPLIES: &[&str] = &["确认", "确定", "是的", "是", "对", "好的", "好", "可以", "yes", "confirm", "sure", "ok"];

pub const DENIAL_MESSAGE: &str = "抱歉，该操作不被允许";

static DANGEROUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"rm\s+-rf",
        r"(?i)drop\s+table",
        r"(?i)delete\s+from",
        r"(?i)truncate\s+table",
        r"exec\s*\(",
        r"eval\s*\(",
        r"__import__",
        r"os\.system",
        r"subprocess",
        r"(?i)<script",
        r";\s*shutdown",
        r"\$\(",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static SENSITIVE_KEY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)password|token|secret|key|auth").ok());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Deny tools that are not on the allow-list
    pub strict: bool,
    pub allowed_tools: Vec<String>,
    pub confirm_timeout_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            strict: false,
            allowed_tools: Vec::new(),
            confirm_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityAction {
    Allow,
    Deny,
    Confirm,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEvent {
    pub tool: String,
    pub action: SecurityAction,
    pub level: Severity,
    pub reason: String,
    /// Arguments with sensitive fields redacted
    pub parameters: Value,
    pub timestamp_ms: u64,
    pub user_confirmed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityDecision {
    Allow,
    Deny(String),
}

impl SecurityDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Asks the user a yes/no question and returns their reply.
#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn confirm(&self, prompt: &str, timeout: Duration) -> Option<String>;
}

/// Replace values of sensitive keys with `***`.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let sensitive = SENSITIVE_KEY.as_ref().is_some_and(|re| re.is_match(k));
                    let v = if sensitive {
                        Value::String("***".to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn critical_operation(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    CRITICAL_OPERATIONS.iter().copied().find(|op| lower.contains(op))
}

/// Spoken prompt for a critical operation, e.g. "确认要取消订单吗？".
pub fn confirmation_prompt(name: &str) -> String {
    let lower = name.to_lowercase();
    let verb = match critical_operation(&lower) {
        Some("cancel") => "取消",
        Some("refund") => "退款",
        Some("delete") => "删除",
        Some("reset") => "重置",
        _ => "执行",
    };
    let target = if lower.contains("order") {
        "订单"
    } else if lower.contains("account") || lower.contains("user") {
        "账户"
    } else if lower.contains("payment") || lower.contains("pay") {
        "支付"
    } else if lower.contains("appointment") || lower.contains("meeting") {
        "预约"
    } else {
        "该操作"
    };
    format!("确认要{}{}吗？请说确认或者不用。", verb, target)
}

/// Interpret the user's reply to a confirmation prompt.
pub fn is_positive_reply(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    if NEGATIVE_REPLIES.iter().any(|k| lower.contains(k)) {
        return false;
    }
    POSITIVE_REPLIES.iter().any(|k| lower.contains(k))
}

pub struct SecurityGuard {
    config: SecurityConfig,
    clock: SessionClock,
    allowed: RwLock<HashSet<String>>,
    audit: Mutex<VecDeque<SecurityEvent>>,
}

impl SecurityGuard {
    pub fn new(config: SecurityConfig) -> Self {
        let allowed = config.allowed_tools.iter().cloned().collect();
        Self {
            config,
            clock: SessionClock::new(),
            allowed: RwLock::new(allowed),
            audit: Mutex::new(VecDeque::with_capacity(AUDIT_CAPACITY)),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Add names discovered at runtime (plugins, IoT and MCP tools).
    pub fn register_dynamic<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allowed = self.allowed.write();
        allowed.extend(names.into_iter().map(Into::into));
    }

    pub fn is_allowed_name(&self, name: &str) -> bool {
        DYNAMIC_PREFIXES.iter().any(|p| name.starts_with(p)) || self.allowed.read().contains(name)
    }

    /// Vet one call. Critical operations wait for the user's confirmation.
    pub async fn check(&self, ctx: &ToolContext, call: &ToolCall) -> SecurityDecision {
        let parameters = redact(&args_to_json(&call.args));

        if !self.is_allowed_name(&call.name) {
            if self.config.strict {
                let reason = format!("{} is not on the allow-list", call.name);
                self.audit(call, SecurityAction::Deny, Severity::Warning, &reason, &parameters, None);
                return SecurityDecision::Deny(reason);
            }
            warn!(session_id = %ctx.session_id, "Tool {} is not on the allow-list, allowing", call.name);
            self.audit(
                call,
                SecurityAction::Log,
                Severity::Info,
                "not on allow-list (non-strict)",
                &parameters,
                None,
            );
        }

        if let Some(reason) = self.validate_parameters(&call.args) {
            warn!(session_id = %ctx.session_id, "Tool {} rejected: {}", call.name, reason);
            self.audit(call, SecurityAction::Deny, Severity::High, &reason, &parameters, None);
            return SecurityDecision::Deny(reason);
        }

        if critical_operation(&call.name).is_some() {
            return self.confirm(ctx, call, &parameters).await;
        }

        self.audit(call, SecurityAction::Allow, Severity::Info, "allowed", &parameters, None);
        SecurityDecision::Allow
    }

    fn validate_parameters(&self, args: &ToolArgs) -> Option<String> {
        let mut violation = None;
        for value in args.values() {
            value.for_each_text(&mut |text| {
                if violation.is_some() {
                    return;
                }
                if text.len() > MAX_PARAM_LEN {
                    warn!("Tool parameter of {} bytes exceeds {}", text.len(), MAX_PARAM_LEN);
                }
                if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|re| re.is_match(text)) {
                    violation = Some(format!("dangerous parameter matches {}", pattern.as_str()));
                }
            });
        }
        violation
    }

    async fn confirm(&self, ctx: &ToolContext, call: &ToolCall, parameters: &Value) -> SecurityDecision {
        let prompt = confirmation_prompt(&call.name);
        self.audit(call, SecurityAction::Confirm, Severity::Critical, &prompt, parameters, None);

        let timeout = Duration::from_secs(self.config.confirm_timeout_secs);
        let reply = match ctx.confirmer.as_ref() {
            Some(confirmer) => confirmer.confirm(&prompt, timeout).await,
            None => None,
        };

        match reply {
            Some(reply) if is_positive_reply(&reply) => {
                info!(session_id = %ctx.session_id, "User confirmed {}", call.name);
                self.audit(
                    call,
                    SecurityAction::Allow,
                    Severity::Critical,
                    "confirmed by user",
                    parameters,
                    Some(true),
                );
                SecurityDecision::Allow
            }
            reply => {
                let reason = match reply {
                    Some(_) => "user declined",
                    None => "no confirmation received",
                };
                warn!(session_id = %ctx.session_id, "Critical tool {} denied: {}", call.name, reason);
                self.audit(call, SecurityAction::Deny, Severity::Critical, reason, parameters, Some(false));
                SecurityDecision::Deny(reason.to_string())
            }
        }
    }

    fn audit(
        &self,
        call: &ToolCall,
        action: SecurityAction,
        level: Severity,
        reason: &str,
        parameters: &Value,
        user_confirmed: Option<bool>,
    ) {
        let mut audit = self.audit.lock();
        if audit.len() == AUDIT_CAPACITY {
            audit.pop_front();
        }
        audit.push_back(SecurityEvent {
            tool: call.name.clone(),
            action,
            level,
            reason: reason.to_string(),
            parameters: parameters.clone(),
            timestamp_ms: self.clock.now_ms(),
            user_confirmed,
        });
    }

    pub fn audit_log(&self) -> Vec<SecurityEvent> {
        self.audit.lock().iter().cloned().collect()
    }

    pub fn last_event(&self) -> Option<SecurityEvent> {
        self.audit.lock().back().cloned()
    }
}

impl Default for SecurityGuard {
    fn default() -> Self {
        Self::new(SecurityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionId;
    use serde_json::json;
    use std::sync::Arc;

    struct ScriptedConfirmer(Option<&'static str>);

    #[async_trait]
    impl ConfirmationChannel for ScriptedConfirmer {
        async fn confirm(&self, _prompt: &str, _timeout: Duration) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        let args: ToolArgs = serde_json::from_value(args).unwrap();
        ToolCall::new("c1", name, args)
    }

    fn ctx(reply: Option<&'static str>) -> ToolContext {
        ToolContext::detached(SessionId::new()).with_confirmer(Arc::new(ScriptedConfirmer(reply)))
    }

    #[tokio::test]
    async fn test_strict_mode_denies_unknown_tools() {
        let guard = SecurityGuard::new(SecurityConfig {
            strict: true,
            allowed_tools: vec!["get_weather".into()],
            ..Default::default()
        });
        let c = ctx(None);
        assert!(guard.check(&c, &call("get_weather", json!({}))).await.is_allowed());
        assert!(guard.check(&c, &call("iot_light_on", json!({}))).await.is_allowed());
        assert!(!guard.check(&c, &call("launch_rocket", json!({}))).await.is_allowed());

        guard.register_dynamic(["launch_rocket"]);
        assert!(guard.check(&c, &call("launch_rocket", json!({}))).await.is_allowed());
    }

    #[tokio::test]
    async fn test_lenient_mode_allows_unknown_tools() {
        let guard = SecurityGuard::default();
        let decision = guard.check(&ctx(None), &call("anything", json!({}))).await;
        assert!(decision.is_allowed());
        assert!(guard.audit_log().iter().any(|e| e.action == SecurityAction::Log));
    }

    #[tokio::test]
    async fn test_dangerous_parameters_are_denied() {
        let guard = SecurityGuard::default();
        let decision = guard
            .check(&ctx(None), &call("run", json!({"cmd": {"inner": "rm -rf /"}})))
            .await;
        assert!(!decision.is_allowed());
        assert_eq!(guard.last_event().unwrap().level, Severity::High);
    }

    #[tokio::test]
    async fn test_critical_operation_needs_confirmation() {
        let guard = SecurityGuard::default();
        let order = json!({"order_id": "A1"});

        let denied = guard.check(&ctx(None), &call("order_cancel", order.clone())).await;
        assert!(!denied.is_allowed());
        let event = guard.last_event().unwrap();
        assert_eq!(event.action, SecurityAction::Deny);
        assert_eq!(event.level, Severity::Critical);

        let declined = guard.check(&ctx(Some("不用了")), &call("order_cancel", order.clone())).await;
        assert!(!declined.is_allowed());

        let allowed = guard.check(&ctx(Some("确认")), &call("order_cancel", order)).await;
        assert!(allowed.is_allowed());
        assert_eq!(guard.last_event().unwrap().user_confirmed, Some(true));
    }

    #[test]
    fn test_confirmation_prompt() {
        assert!(confirmation_prompt("order_cancel").starts_with("确认要取消订单吗？"));
        assert!(confirmation_prompt("delete_account").starts_with("确认要删除账户吗？"));
    }

    #[test]
    fn test_redaction() {
        let redacted = redact(&json!({"user": "bob", "api_key": "abc", "nested": {"Password": "x"}}));
        assert_eq!(redacted["user"], "bob");
        assert_eq!(redacted["api_key"], "***");
        assert_eq!(redacted["nested"]["Password"], "***");
    }

    #[tokio::test]
    async fn test_audit_log_is_bounded() {
        let guard = SecurityGuard::default();
        let c = ctx(None);
        for _ in 0..(AUDIT_CAPACITY + 10) {
            guard.check(&c, &call("iot_x", json!({}))).await;
        }
        assert_eq!(guard.audit_log().len(), AUDIT_CAPACITY);
    }
}
