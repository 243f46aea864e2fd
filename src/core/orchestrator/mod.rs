//! # LLMCompiler Orchestrator
//!
//! Runs the tool calls of one model round:
//!
//! 1. [`Planner`] labels the intent, assigns dependencies and computes
//!    stages with Kahn's algorithm
//! 2. [`Dispatcher`] decides whether stages run concurrently
//! 3. [`ParallelExecutor`] runs each stage, vetting every task first
//!
//! While the executor runs, the transition utterance is played through the
//! `on_transition` callback; both are awaited together.

mod executor;
mod planner;

pub use executor::{ExecutorConfig, ParallelExecutor, StageReport};
pub use planner::{
    Dispatcher, ExecutionPlan, Intent, Planner, TaskStatus, ToolTask, assign_dependencies,
    topological_stages,
};

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::observability::{Feature, FeatureFlags, PerformanceTracer, Phase};
use crate::core::tools::{ToolCall, ToolContext};

/// Plays the transition utterance; resolves once its audio is queued.
pub type TransitionCallback = Box<dyn FnOnce(String) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub intent: Intent,
    pub tasks: Vec<ToolTask>,
    pub errors: Vec<String>,
    pub stages: usize,
    pub parallel_factor: f64,
    pub total: Duration,
    /// From the start of `execute` until transition audio was queued
    pub ttfr: Option<Duration>,
    pub transition: Option<String>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub tasks: usize,
    pub stages: usize,
    pub parallel_factor: f64,
    pub total_ms: u128,
}

impl ExecutionResult {
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            tasks: self.tasks.len(),
            stages: self.stages,
            parallel_factor: self.parallel_factor,
            total_ms: self.total.as_millis(),
        }
    }
}

/// Sum of task durations over the wall clock of the whole execution.
pub fn parallel_factor(tasks: &[ToolTask], wall: Duration) -> f64 {
    let busy: f64 = tasks
        .iter()
        .filter_map(ToolTask::duration)
        .map(|d| d.as_secs_f64())
        .sum();
    let wall = wall.as_secs_f64();
    if wall <= f64::EPSILON { 0.0 } else { busy / wall }
}

pub struct LlmCompiler {
    planner: Planner,
    executor: ParallelExecutor,
    flags: Arc<FeatureFlags>,
    tracer: Option<Arc<PerformanceTracer>>,
}

impl LlmCompiler {
    pub fn new(planner: Planner, executor: ParallelExecutor, flags: Arc<FeatureFlags>) -> Self {
        Self {
            planner,
            executor,
            flags,
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<PerformanceTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    fn trace(&self, ctx: &ToolContext, phase: Phase, elapsed: Duration) {
        if let Some(tracer) = self.tracer.as_ref() {
            tracer.record(ctx.session_id, phase, elapsed);
        }
    }

    pub async fn execute(
        &self,
        ctx: &ToolContext,
        query: &str,
        calls: Vec<ToolCall>,
        on_transition: Option<TransitionCallback>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let compiled = self.flags.is_enabled(Feature::LlmCompiler);
        let parallel = compiled && self.flags.is_enabled(Feature::ParallelExecution);
        let wants_transition =
            on_transition.is_some() && self.flags.is_enabled(Feature::TransitionResponse);
        let guarded = self.flags.is_enabled(Feature::SecurityGuardrails);

        let plan = self.planner.plan(query, calls, wants_transition).await;
        self.trace(ctx, Phase::ToolPlanning, started.elapsed());

        // without the compiler the calls simply run one after another in order
        let stages = if compiled {
            Dispatcher::dispatch(&plan, parallel)
        } else {
            plan.tasks.iter().map(|t| vec![t.id.clone()]).collect()
        };

        let ExecutionPlan {
            intent,
            mut tasks,
            transition,
            ..
        } = plan;

        let has_tasks = !tasks.is_empty();
        let transition_job = match (transition.clone(), on_transition) {
            (Some(text), Some(play)) if has_tasks => Some((text, play)),
            _ => None,
        };

        let (ttfr, report) = if has_tasks {
            // both futures end with this branch, releasing `tasks` for the summary below
            let transition_play = async move {
                let (text, play) = transition_job?;
                let begun = Instant::now();
                play(text).await;
                self.trace(ctx, Phase::TransitionResponse, begun.elapsed());
                Some(started.elapsed())
            };
            let execution = async {
                let begun = Instant::now();
                let report = self.executor.run(ctx, &mut tasks, &stages, guarded, cancel).await;
                self.trace(ctx, Phase::ToolExecution, begun.elapsed());
                report
            };
            tokio::join!(transition_play, execution)
        } else {
            (None, StageReport::default())
        };

        let total = started.elapsed();
        let factor = parallel_factor(&tasks, total);
        info!(
            session_id = %ctx.session_id,
            "Executed {} tools in {} stages: {:.2}x parallel, {} ms",
            tasks.len(),
            stages.len(),
            factor,
            total.as_millis()
        );

        ExecutionResult {
            success: report.errors.is_empty() && !report.cancelled,
            intent,
            errors: report.errors,
            stages: stages.len(),
            parallel_factor: factor,
            total,
            ttfr,
            transition,
            cancelled: report.cancelled,
            tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::{
        PluginExecutor, PluginFuture, PluginHandler, SecurityConfig, SecurityGuard, ToolArgs,
        ToolOutput, ToolRegistry,
    };
    use crate::core::transition::{TransitionConfig, TransitionGenerator};
    use crate::core::types::SessionId;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use serde_json::json;

    fn sleeper(ms: u64, reply: &'static str) -> PluginHandler {
        Arc::new(move |_ctx: ToolContext, _args: ToolArgs| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ToolOutput::req_llm(reply))
            }) as PluginFuture
        })
    }

    fn compiler(flags: Arc<FeatureFlags>, timeout_secs: u64) -> LlmCompiler {
        let plugins = Arc::new(PluginExecutor::new());
        plugins.register("get_weather", "weather", json!({}), sleeper(200, "北京晴"));
        plugins.register("play_music", "music", json!({}), sleeper(200, "已播放"));
        plugins.register("slow_tool", "slow", json!({}), sleeper(5_000, "late"));

        let registry = Arc::new(ToolRegistry::new(Arc::new(SecurityGuard::new(SecurityConfig::default()))));
        registry.add_executor(plugins);
        let executor = ParallelExecutor::new(
            registry,
            ExecutorConfig {
                max_concurrency: None,
                task_timeout_secs: timeout_secs,
            },
        );
        let planner = Planner::new(Arc::new(TransitionGenerator::new(TransitionConfig::default())));
        LlmCompiler::new(planner, executor, flags)
    }

    fn calls() -> Vec<ToolCall> {
        vec![
            ToolCall::new("a", "get_weather", ToolArgs::new()),
            ToolCall::new("b", "play_music", ToolArgs::new()),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_execution_with_transition() {
        let compiler = compiler(Arc::new(FeatureFlags::all_enabled()), 30);
        let played = Arc::new(Mutex::new(Vec::new()));
        let sink = played.clone();
        let on_transition: TransitionCallback = Box::new(move |text| {
            async move {
                sink.lock().push(text);
            }
            .boxed()
        });

        let ctx = ToolContext::detached(SessionId::new());
        let result = compiler
            .execute(&ctx, "查一下北京天气并播放一首音乐", calls(), Some(on_transition), &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.stages, 1);
        assert!(result.parallel_factor >= 1.5, "factor {}", result.parallel_factor);
        assert_eq!(*played.lock(), vec!["正在查询天气".to_string()]);
        assert!(result.ttfr.is_some());
        assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_flag_off_runs_sequentially() {
        let flags = Arc::new(FeatureFlags::all_enabled());
        flags.set_mask(&[Feature::ParallelExecution, Feature::TransitionResponse]);
        let compiler = compiler(flags, 30);
        let ctx = ToolContext::detached(SessionId::new());
        let result = compiler
            .execute(&ctx, "", calls(), None, &CancellationToken::new())
            .await;
        assert_eq!(result.stages, 2);
        assert!(result.parallel_factor < 1.1);
        assert!(result.transition.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_recorded_and_stage_continues() {
        let compiler = compiler(Arc::new(FeatureFlags::all_enabled()), 1);
        let ctx = ToolContext::detached(SessionId::new());
        let calls = vec![
            ToolCall::new("s", "slow_tool", ToolArgs::new()),
            ToolCall::new("w", "get_weather", ToolArgs::new()),
        ];
        let result = compiler
            .execute(&ctx, "", calls, None, &CancellationToken::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.tasks[0].status, TaskStatus::Failed);
        assert_eq!(result.tasks[1].status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let compiler = compiler(Arc::new(FeatureFlags::all_enabled()), 30);
        let ctx = ToolContext::detached(SessionId::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = compiler.execute(&ctx, "", calls(), None, &cancel).await;
        assert!(result.cancelled);
        assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cyclic_tasks_run_in_forced_stage() {
        let compiler = compiler(Arc::new(FeatureFlags::all_enabled()), 30);
        let mut tasks: Vec<ToolTask> = calls()
            .into_iter()
            .map(|call| ToolTask::new(call.id.clone(), call))
            .collect();
        tasks[0].dependencies = vec!["b".into()];
        tasks[1].dependencies = vec!["a".into()];
        let (stages, forced) = topological_stages(&tasks);
        assert!(forced);

        let ctx = ToolContext::detached(SessionId::new());
        let report = compiler
            .executor
            .run(&ctx, &mut tasks, &stages, false, &CancellationToken::new())
            .await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

        // a failed dependency still blocks its dependents
        let mut tasks = vec![
            ToolTask::new("s", ToolCall::new("s", "slow_tool", ToolArgs::new())),
            ToolTask::new("w", ToolCall::new("w", "get_weather", ToolArgs::new())),
        ];
        tasks[1].dependencies = vec!["s".into()];
        let short = ParallelExecutor::new(
            compiler.executor.registry().clone(),
            ExecutorConfig {
                max_concurrency: None,
                task_timeout_secs: 1,
            },
        );
        let stages = vec![vec!["s".to_string()], vec!["w".to_string()]];
        let report = short
            .run(&ctx, &mut tasks, &stages, false, &CancellationToken::new())
            .await;
        assert_eq!(report.errors.len(), 2);
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert_eq!(tasks[1].error.as_deref(), Some("dependency s did not complete"));
    }

    #[test]
    fn test_parallel_factor_of_empty_wall() {
        assert_eq!(parallel_factor(&[], Duration::ZERO), 0.0);
    }
}
