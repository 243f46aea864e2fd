//! Stage-by-stage tool execution with bounded concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::planner::{TaskStatus, ToolTask};
use crate::core::observability::{DegradationManager, RequestOutcome};
use crate::core::tools::{DENIAL_MESSAGE, ToolAction, ToolContext, ToolError, ToolOutput, ToolRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Concurrent tasks per stage; `None` is unbounded
    pub max_concurrency: Option<usize>,
    pub task_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            task_timeout_secs: 30,
        }
    }
}

/// Outcome of running every stage.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub errors: Vec<String>,
    pub cancelled: bool,
}

pub struct ParallelExecutor {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
    degradation: Option<Arc<DegradationManager>>,
}

impl ParallelExecutor {
    pub fn new(registry: Arc<ToolRegistry>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            config,
            degradation: None,
        }
    }

    /// Report every task outcome to the degradation manager.
    pub fn with_degradation(mut self, degradation: Arc<DegradationManager>) -> Self {
        self.degradation = Some(degradation);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run `stages` over `tasks` in place. A failed task never aborts its
    /// stage; once `cancel` fires, every task not yet started is cancelled.
    pub async fn run(
        &self,
        ctx: &ToolContext,
        tasks: &mut [ToolTask],
        stages: &[Vec<String>],
        guarded: bool,
        cancel: &CancellationToken,
    ) -> StageReport {
        let mut report = StageReport::default();
        let index: HashMap<String, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let semaphore = self.config.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));

        for (stage_no, stage) in stages.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let mut runnable = Vec::new();
            for id in stage {
                let Some(&i) = index.get(id) else {
                    continue;
                };
                if let Some(blocker) = unmet_dependency(tasks, &index, i).map(str::to_string) {
                    let task = &mut tasks[i];
                    task.status = TaskStatus::Failed;
                    task.error = Some(format!("dependency {} did not complete", blocker));
                    report.errors.push(format!("{}: {}", task.call.name, task.error.as_deref().unwrap_or_default()));
                    continue;
                }
                runnable.push(i);
            }

            debug!(session_id = %ctx.session_id, "Stage {}: {} tasks", stage_no, runnable.len());
            let futures = runnable.iter().map(|&i| {
                let task = tasks[i].clone();
                let semaphore = semaphore.clone();
                async move {
                    let _permit = match semaphore {
                        Some(s) => s.acquire_owned().await.ok(),
                        None => None,
                    };
                    self.run_task(ctx, task, guarded, cancel).await
                }
            });
            let finished = join_all(futures).await;

            for (i, task) in runnable.into_iter().zip(finished) {
                if task.status == TaskStatus::Failed {
                    report.errors.push(format!(
                        "{}: {}",
                        task.call.name,
                        task.error.as_deref().unwrap_or("failed")
                    ));
                }
                tasks[i] = task;
            }
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                task.status = TaskStatus::Cancelled;
            }
        }
        report
    }

    async fn run_task(&self, ctx: &ToolContext, mut task: ToolTask, guarded: bool, cancel: &CancellationToken) -> ToolTask {
        if cancel.is_cancelled() {
            task.status = TaskStatus::Cancelled;
            return task;
        }

        if guarded && let Err(e) = self.registry.vet(ctx, &task.call).await {
            warn!(session_id = %ctx.session_id, "Tool {} rejected: {}", task.call.name, e);
            task.status = TaskStatus::Failed;
            task.error = Some(e.to_string());
            task.result = Some(ToolOutput::response(DENIAL_MESSAGE));
            return task;
        }
        if cancel.is_cancelled() {
            task.status = TaskStatus::Cancelled;
            return task;
        }

        task.status = TaskStatus::Running;
        let started = Instant::now();
        task.started_at = Some(started);
        let timeout = Duration::from_secs(self.config.task_timeout_secs);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(timeout, self.registry.execute(ctx, &task.call)) => {
                result.map_err(|_| ToolError::Timeout(format!("{} exceeded {:?}", task.call.name, timeout)))
            }
        };
        let ended = Instant::now();
        task.ended_at = Some(ended);
        let latency = ended.duration_since(started);

        let observed = match outcome {
            Ok(output) => {
                let ok = matches!(output.action, ToolAction::Response | ToolAction::ReqLlm);
                if ok {
                    task.status = TaskStatus::Completed;
                } else {
                    task.status = TaskStatus::Failed;
                    task.error = Some(output.content.clone());
                }
                task.result = Some(output);
                Some(if ok {
                    RequestOutcome::success(latency)
                } else {
                    RequestOutcome::failure(latency)
                })
            }
            Err(ToolError::Cancelled) => {
                task.status = TaskStatus::Cancelled;
                None
            }
            Err(e) => {
                warn!(session_id = %ctx.session_id, "Tool {} failed: {}", task.call.name, e);
                let timed_out = matches!(e, ToolError::Timeout(_));
                task.status = TaskStatus::Failed;
                task.error = Some(e.to_string());
                Some(if timed_out {
                    RequestOutcome::timeout(latency)
                } else {
                    RequestOutcome::failure(latency)
                })
            }
        };

        if let (Some(outcome), Some(degradation)) = (observed, self.degradation.as_ref())
            && let Some(change) = degradation.observe(outcome)
        {
            info!("Degradation level changed {:?} -> {:?}", change.from, change.to);
        }
        task
    }
}

/// A dependency blocks only once it finished without completing. One that
/// never ran shares a forced stage with the task through a cycle.
fn unmet_dependency<'a>(tasks: &'a [ToolTask], index: &HashMap<String, usize>, i: usize) -> Option<&'a str> {
    tasks[i]
        .dependencies
        .iter()
        .filter_map(|dep| index.get(dep).map(|&j| &tasks[j]))
        .find(|dep| dep.status.is_terminal() && dep.status != TaskStatus::Completed)
        .map(|dep| dep.id.as_str())
}
