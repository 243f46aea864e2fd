//! Planner and dispatcher: tool calls to dependency-ordered stages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::tools::{ToolCall, ToolOutput};
use crate::core::transition::TransitionGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct ToolTask {
    pub id: String,
    pub call: ToolCall,
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub result: Option<ToolOutput>,
    pub error: Option<String>,
}

impl ToolTask {
    pub fn new(id: impl Into<String>, call: ToolCall) -> Self {
        Self {
            id: id.into(),
            call,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        Some(self.ended_at?.duration_since(self.started_at?))
    }

    fn name_has(&self, needles: &[&str]) -> bool {
        let name = self.call.name.to_lowercase();
        needles.iter().any(|n| name.contains(n))
    }

    pub fn is_verification(&self) -> bool {
        self.name_has(&["verify", "auth"])
    }

    pub fn is_query(&self) -> bool {
        self.name_has(&["query", "get", "search", "check"])
    }
}

/// Coarse intent label derived from the first tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Payment,
    Order,
    Weather,
    Media,
    Iot,
    Other,
}

impl Intent {
    pub fn from_tool_name(name: &str) -> Self {
        let name = name.to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| name.contains(k));
        if has(&["pay", "refund", "bill"]) {
            Self::Payment
        } else if has(&["order", "purchase"]) {
            Self::Order
        } else if has(&["weather", "forecast"]) {
            Self::Weather
        } else if has(&["music", "song", "play", "video", "radio"]) {
            Self::Media
        } else if has(&["iot", "device", "light", "switch", "volume"]) {
            Self::Iot
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub query: String,
    pub intent: Intent,
    pub tasks: Vec<ToolTask>,
    /// Each stage holds task ids that may run concurrently
    pub stages: Vec<Vec<String>>,
    /// True when a dependency cycle forced a trailing stage
    pub forced_stage: bool,
    pub transition: Option<String>,
}

impl ExecutionPlan {
    pub fn task(&self, id: &str) -> Option<&ToolTask> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

pub struct Planner {
    transitions: Arc<TransitionGenerator>,
}

impl Planner {
    pub fn new(transitions: Arc<TransitionGenerator>) -> Self {
        Self { transitions }
    }

    /// Build the plan. The transition utterance is only generated when asked.
    pub async fn plan(&self, query: &str, calls: Vec<ToolCall>, with_transition: bool) -> ExecutionPlan {
        let intent = calls
            .first()
            .map(|c| Intent::from_tool_name(&c.name))
            .unwrap_or(Intent::Other);

        let mut seen = HashSet::new();
        let mut tasks: Vec<ToolTask> = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                let id = if call.id.is_empty() || !seen.insert(call.id.clone()) {
                    format!("task_{}", index)
                } else {
                    call.id.clone()
                };
                ToolTask::new(id, call)
            })
            .collect();

        assign_dependencies(&mut tasks);
        let (stages, forced_stage) = topological_stages(&tasks);
        if forced_stage {
            warn!("Tool plan has a dependency cycle; remaining tasks run in a forced stage");
        }

        let transition = match (with_transition, tasks.first()) {
            (true, Some(first)) => Some(self.transitions.generate(&first.call.name, &first.call.args).await),
            _ => None,
        };

        debug!(
            "Planned {} tasks in {} stages, intent {:?}",
            tasks.len(),
            stages.len(),
            intent
        );
        ExecutionPlan {
            query: query.to_string(),
            intent,
            tasks,
            stages,
            forced_stage,
            transition,
        }
    }
}

/// Verification tasks run first; every other task waits for all of them.
pub fn assign_dependencies(tasks: &mut [ToolTask]) {
    let verify_ids: Vec<String> = tasks
        .iter()
        .filter(|t| t.is_verification())
        .map(|t| t.id.clone())
        .collect();
    for task in tasks.iter_mut() {
        if !task.is_verification() {
            task.dependencies = verify_ids.clone();
        }
    }
}

/// Kahn's algorithm over task ids. Dependencies on unknown ids are ignored.
/// Tasks left over because of a cycle form one final forced stage.
pub fn topological_stages(tasks: &[ToolTask]) -> (Vec<Vec<String>>, bool) {
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        let deps: Vec<&str> = task
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|d| known.contains(d) && *d != task.id)
            .collect();
        indegree.insert(task.id.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(task.id.as_str());
        }
    }

    let mut stages = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut ready: Vec<&str> = tasks
        .iter()
        .map(|t| t.id.as_str())
        .filter(|id| indegree.get(id) == Some(&0))
        .collect();

    while !ready.is_empty() {
        let mut next = Vec::new();
        for id in &ready {
            placed.insert(id);
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        stages.push(ready.iter().map(|id| id.to_string()).collect());
        // keep dispatch order stable: plan order within a stage
        next.sort_by_key(|id| tasks.iter().position(|t| t.id == *id));
        ready = next;
    }

    let forced: Vec<String> = tasks
        .iter()
        .filter(|t| !placed.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect();
    let has_forced = !forced.is_empty();
    if has_forced {
        stages.push(forced);
    }
    (stages, has_forced)
}

/// Turns a plan into the stage list actually executed.
pub struct Dispatcher;

impl Dispatcher {
    /// With parallel execution off every task gets its own stage, in
    /// topological order.
    pub fn dispatch(plan: &ExecutionPlan, parallel: bool) -> Vec<Vec<String>> {
        if parallel {
            plan.stages.clone()
        } else {
            plan.stages
                .iter()
                .flatten()
                .map(|id| vec![id.clone()])
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::ToolArgs;
    use crate::core::transition::TransitionConfig;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall::new(id, name, ToolArgs::new())
    }

    fn planner() -> Planner {
        Planner::new(Arc::new(TransitionGenerator::new(TransitionConfig::default())))
    }

    #[tokio::test]
    async fn test_independent_calls_share_a_stage() {
        let plan = planner()
            .plan(
                "查一下北京天气并播放一首音乐",
                vec![call("a", "get_weather"), call("b", "play_music")],
                true,
            )
            .await;
        assert_eq!(plan.intent, Intent::Weather);
        assert_eq!(plan.stages, vec![vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(plan.transition.as_deref(), Some("正在查询天气"));
        assert!(!plan.forced_stage);
    }

    #[tokio::test]
    async fn test_verification_runs_first() {
        let plan = planner()
            .plan(
                "取消订单",
                vec![
                    call("q", "query_order"),
                    call("v", "verify_user"),
                    call("c", "order_cancel"),
                ],
                false,
            )
            .await;
        assert_eq!(plan.intent, Intent::Order);
        assert_eq!(
            plan.stages,
            vec![vec!["v".to_string()], vec!["q".to_string(), "c".to_string()]]
        );
        assert_eq!(plan.task("c").unwrap().dependencies, vec!["v".to_string()]);
        assert!(plan.transition.is_none());
    }

    #[test]
    fn test_cycle_goes_to_forced_stage() {
        let mut a = ToolTask::new("a", call("a", "x"));
        let mut b = ToolTask::new("b", call("b", "y"));
        let c = ToolTask::new("c", call("c", "z"));
        a.dependencies = vec!["b".into()];
        b.dependencies = vec!["a".into()];
        let (stages, forced) = topological_stages(&[a, b, c]);
        assert!(forced);
        assert_eq!(stages, vec![vec!["c".to_string()], vec!["a".to_string(), "b".to_string()]]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_renamed() {
        let plan = planner()
            .plan("", vec![call("x", "get_time"), call("x", "get_date"), call("", "get_news")], false)
            .await;
        let ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "task_1", "task_2"]);
    }

    #[tokio::test]
    async fn test_sequential_dispatch() {
        let plan = planner()
            .plan("", vec![call("a", "get_weather"), call("b", "play_music")], false)
            .await;
        assert_eq!(
            Dispatcher::dispatch(&plan, false),
            vec![vec!["a".to_string()], vec!["b".to_string()]]
        );
        assert_eq!(Dispatcher::dispatch(&plan, true).len(), 1);
    }
}
