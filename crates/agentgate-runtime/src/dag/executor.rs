//! Dependency-ordered execution of a [`TaskPlan`].
//!
//! The executor repeatedly takes the scheduler's ready set and runs it as one
//! batch through the bounded pool. Every task is admitted against the shared
//! capacity ceilings and wrapped by the resilience layer before the host's
//! [`TaskRunner`] sees it. A failed task never aborts the plan by default;
//! its transitive dependents are reported `Skipped` instead.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agentgate_core::ParallelismScope;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::plan::{PlanError, TaskNode, TaskPlan};
use super::scheduler::DagScheduler;
use crate::admission::{AdmissionController, AdmissionRequest};
use crate::pool::{PoolError, PoolOptions, run_bounded};
use crate::resilience::{Resilience, WorkError};
use crate::unit::execute_unit;

/// Host callback performing one task (the actual agent invocation).
///
/// May be called more than once per task when the resilience layer retries
/// a transient failure.
pub trait TaskRunner: Send + Sync + 'static {
    fn run(
        &self,
        input: TaskInput,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<String, WorkError>> + Send;
}

impl<F, Fut> TaskRunner for F
where
    F: Fn(TaskInput, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, WorkError>> + Send,
{
    fn run(
        &self,
        input: TaskInput,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<String, WorkError>> + Send {
        self(input, cancel)
    }
}

/// What a runner receives for one task.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub task: TaskNode,
    /// `(dependency id, output)` for each direct dependency, in the order the
    /// task lists them.
    pub dependency_outputs: Vec<(String, String)>,
}

impl TaskInput {
    fn for_task(task: &TaskNode, outputs: &HashMap<String, String>) -> Self {
        let mut dependency_outputs: Vec<(String, String)> = Vec::new();
        for dep in &task.dependencies {
            if dependency_outputs.iter().any(|(id, _)| id == dep) {
                continue;
            }
            if let Some(output) = outputs.get(dep) {
                dependency_outputs.push((dep.clone(), output.clone()));
            }
        }
        Self {
            task: task.clone(),
            dependency_outputs,
        }
    }

    pub fn output_of(&self, dependency: &str) -> Option<&str> {
        self.dependency_outputs
            .iter()
            .find(|(id, _)| id == dependency)
            .map(|(_, output)| output.as_str())
    }

    /// Dependency outputs concatenated, each under a `### <id>` heading.
    /// Empty for tasks without dependencies.
    pub fn render_context(&self) -> String {
        let mut context = String::new();
        for (id, output) in &self.dependency_outputs {
            if !context.is_empty() {
                context.push('\n');
            }
            let _ = writeln!(context, "### {id}");
            context.push_str(output.trim_end());
            context.push('\n');
        }
        context
    }
}

/// How a plan run behaves.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Requested parallelism per batch, clamped to `[1, max_parallel_subagents_per_run]`.
    pub limit: i64,
    /// Cancel all remaining work on the first task failure.
    pub abort_on_failure: bool,
    /// Capacity each task asks for. Its priority is replaced by the task's.
    pub request: AdmissionRequest,
    /// Resilience key (breaker and throttle) shared by all tasks.
    pub dependency_key: String,
    pub cancel: CancellationToken,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            limit: i64::MAX,
            abort_on_failure: false,
            request: AdmissionRequest::agent_run(),
            dependency_key: "llm".to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

impl ExecutorOptions {
    #[must_use]
    pub const fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub const fn abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_dependency_key(mut self, key: impl Into<String>) -> Self {
        self.dependency_key = key.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    Failed,
    /// Never ran to completion: a dependency failed, or the run was
    /// cancelled or aborted first.
    Skipped,
}

/// Outcome of one task. Exactly one per task in the plan.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl TaskResult {
    fn skipped(task_id: &str, reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    /// Every task completed.
    Completed,
    /// Some tasks completed, some did not.
    Partial,
    /// No task completed.
    Failed,
}

#[derive(Debug, Clone)]
pub struct PlanReport {
    pub status: PlanStatus,
    /// Per-task results in plan order.
    pub results: Vec<TaskResult>,
    pub duration: Duration,
    /// The caller's token fired before the plan finished.
    pub cancelled: bool,
}

impl PlanReport {
    pub fn result(&self, task_id: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

struct TaskSuccess {
    output: String,
    duration: Duration,
}

struct TaskFailure {
    message: String,
    duration: Duration,
    cancelled: bool,
}

/// Runs validated plans on top of the pool, admission and resilience layers.
#[derive(Debug, Clone)]
pub struct DagExecutor {
    admission: AdmissionController,
    resilience: Arc<Resilience>,
}

impl DagExecutor {
    pub const fn new(admission: AdmissionController, resilience: Arc<Resilience>) -> Self {
        Self {
            admission,
            resilience,
        }
    }

    /// Validate `plan`, then execute it batch by batch.
    ///
    /// Only validation errors are returned as `Err`; task failures are part
    /// of the report.
    #[allow(clippy::too_many_lines)]
    pub async fn run<R: TaskRunner>(
        &self,
        plan: &TaskPlan,
        runner: Arc<R>,
        options: ExecutorOptions,
    ) -> Result<PlanReport, PlanError> {
        let started = Instant::now();
        let mut scheduler = DagScheduler::new(plan)?;
        let nodes: HashMap<&str, &TaskNode> = plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let limit = self
            .admission
            .clamp_parallelism(ParallelismScope::Subagents, options.limit);
        info!(
            tasks = plan.len(),
            limit,
            abort_on_failure = options.abort_on_failure,
            "Plan execution started"
        );

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut halted = false;

        while !halted && !options.cancel.is_cancelled() {
            let ready = scheduler.next_ready();
            if ready.is_empty() {
                break;
            }
            let batch: Vec<TaskInput> = ready
                .iter()
                .filter_map(|id| nodes.get(id.as_str()))
                .map(|task| TaskInput::for_task(task, &outputs))
                .collect();
            let ids: Vec<String> = batch.iter().map(|input| input.task.id.clone()).collect();
            for id in &ids {
                scheduler.mark_running(id);
            }
            debug!(batch = ?ids, "Running ready batch");

            let pool_options = PoolOptions::with_limit(i64::try_from(limit).unwrap_or(i64::MAX))
                .abort_on_error(options.abort_on_failure)
                .with_parent(options.cancel.clone());
            let worker = {
                let admission = self.admission.clone();
                let resilience = Arc::clone(&self.resilience);
                let runner = Arc::clone(&runner);
                let key = options.dependency_key.clone();
                let request = options.request;
                move |_index: usize, input: TaskInput, token: CancellationToken| {
                    let admission = admission.clone();
                    let resilience = Arc::clone(&resilience);
                    let runner = Arc::clone(&runner);
                    let key = key.clone();
                    let request = request.with_priority(input.task.priority);
                    async move {
                        let began = Instant::now();
                        let outcome = execute_unit(&admission, &resilience, &request, &key, &token, |_| {
                            runner.run(input.clone(), token.clone())
                        })
                        .await;
                        let duration = began.elapsed();
                        match outcome {
                            Ok(output) => Ok(TaskSuccess { output, duration }),
                            Err(e) => Err(TaskFailure {
                                cancelled: e.is_cancelled() || token.is_cancelled(),
                                message: e.to_string(),
                                duration,
                            }),
                        }
                    }
                }
            };

            let (mut report, first_failure) = match run_bounded(batch, pool_options, worker).await {
                Ok(report) => (report, None),
                Err(PoolError::Aborted { index, error, report }) => {
                    halted = true;
                    (report, Some((index, error)))
                }
                Err(PoolError::Cancelled { report }) => {
                    halted = true;
                    (report, None)
                }
            };
            if let Some((index, error)) = first_failure
                && let Some(slot) = report.results.get_mut(index)
            {
                *slot = Some(Err(error));
            }

            for (id, slot) in ids.iter().zip(report.results) {
                match slot {
                    Some(Ok(done)) => {
                        let unblocked = scheduler.mark_completed(id);
                        debug!(task_id = %id, unblocked = unblocked.len(), "Task completed");
                        outputs.insert(id.clone(), done.output.clone());
                        results.insert(
                            id.clone(),
                            TaskResult {
                                task_id: id.clone(),
                                status: TaskStatus::Completed,
                                output: Some(done.output),
                                error: None,
                                duration: done.duration,
                            },
                        );
                    }
                    Some(Err(failure)) if failure.cancelled => {
                        scheduler.mark_skipped(id);
                        results.insert(id.clone(), TaskResult::skipped(id, "cancelled", failure.duration));
                    }
                    Some(Err(failure)) => {
                        let skipped = scheduler.mark_failed(id);
                        warn!(task_id = %id, error = %failure.message, skipped = skipped.len(), "Task failed");
                        for dependent in skipped {
                            let reason = format!("dependency '{id}' failed");
                            results.insert(dependent.clone(), TaskResult::skipped(&dependent, reason, Duration::ZERO));
                        }
                        results.insert(
                            id.clone(),
                            TaskResult {
                                task_id: id.clone(),
                                status: TaskStatus::Failed,
                                output: None,
                                error: Some(failure.message),
                                duration: failure.duration,
                            },
                        );
                    }
                    None => {
                        scheduler.mark_skipped(id);
                        results.insert(id.clone(), TaskResult::skipped(id, "not started", Duration::ZERO));
                    }
                }
            }
        }

        let cancelled = options.cancel.is_cancelled();
        let reason = if cancelled {
            "plan cancelled"
        } else if halted {
            "plan aborted after a failure"
        } else {
            "not reachable"
        };
        for id in scheduler.skip_unstarted() {
            results
                .entry(id.clone())
                .or_insert_with(|| TaskResult::skipped(&id, reason, Duration::ZERO));
        }

        let results: Vec<TaskResult> = plan
            .tasks
            .iter()
            .map(|t| {
                results
                    .remove(&t.id)
                    .unwrap_or_else(|| TaskResult::skipped(&t.id, reason, Duration::ZERO))
            })
            .collect();
        let completed = results.iter().filter(|r| r.status == TaskStatus::Completed).count();
        let status = if completed == results.len() {
            PlanStatus::Completed
        } else if completed == 0 {
            PlanStatus::Failed
        } else {
            PlanStatus::Partial
        };

        let duration = started.elapsed();
        info!(
            status = ?status,
            completed,
            total = results.len(),
            cancelled,
            duration_ms = duration.as_millis(),
            "Plan execution finished"
        );
        Ok(PlanReport {
            status,
            results,
            duration,
            cancelled,
        })
    }
}
