//! Dependency-aware task scheduling for one goal
//!
//! Tasks move `pending -> running -> completed | failed`. A task is ready when
//! it is pending and every dependency has completed. Ready tasks launch in
//! plan order up to `max_concurrent_tasks`; the scheduler then waits for
//! whichever in-flight task settles first and records it before launching more.
//!
//! All in-flight task futures live in one `FuturesUnordered` polled from
//! [`Scheduler::run`], so the bookkeeping maps are only touched between awaits.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use troupe_agent::{
    wait_for_run, ExecuteRequest, RunKind, META_ATTEMPT, META_GOAL_ID, META_TASK_ID,
};
use troupe_core::fail_open::fail_open;
use troupe_core::{
    EventKind, Plan, Result, RuntimeEvent, Task, TaskResult, TaskStatus, TroupeError,
};
use troupe_metrics::MetricEvent;
use troupe_planning::prompts::build_task_prompt;

use crate::kernel::Kernel;

/// Everything a task attempt needs to know about the goal it belongs to
#[derive(Clone, Copy)]
pub(crate) struct GoalRun<'k> {
    pub kernel: &'k Kernel,
    pub goal_id: &'k str,
    pub goal: &'k str,
    pub plan: &'k Plan,
}

impl GoalRun<'_> {
    async fn emit(&self, kind: EventKind, task: &Task, agent_id: Option<&str>, extra: serde_json::Value) {
        let mut payload = json!({
            "goalId": self.goal_id,
            "taskId": task.id,
            "role": task.role,
        });
        if let (Some(map), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            map.extend(extra);
        }

        let mut event = RuntimeEvent::new(kind, payload);
        if let Some(agent_id) = agent_id {
            event = event.with_agent_id(agent_id);
        }
        self.kernel.events.emit(event).await;
    }
}

/// Drives one plan to completion
pub(crate) struct Scheduler<'k> {
    run: GoalRun<'k>,
    results: HashMap<String, TaskResult>,
    outputs: HashMap<String, String>,
    halted: bool,
}

impl<'k> Scheduler<'k> {
    pub fn new(run: GoalRun<'k>) -> Self {
        let results = run
            .plan
            .tasks
            .iter()
            .map(|t| (t.id.clone(), TaskResult::pending(t)))
            .collect();
        Self {
            run,
            results,
            outputs: HashMap::new(),
            halted: false,
        }
    }

    /// Run until every task is terminal, fail-fast stops launches, or no
    /// progress is possible
    #[instrument(skip(self), fields(goal_id = %self.run.goal_id))]
    pub async fn run(&mut self) -> Result<()> {
        let max_concurrent = self.run.kernel.config.max_concurrent_tasks.max(1);
        let fail_fast = self.run.kernel.config.fail_fast;
        let mut in_flight = FuturesUnordered::new();

        loop {
            if !self.has_unresolved() {
                return Ok(());
            }

            if fail_fast && !self.halted && self.results.values().any(|r| r.is_failed()) {
                warn!("A task failed with fail-fast enabled, launching nothing new");
                self.halted = true;
            }

            if !self.halted {
                for task in self.ready_tasks() {
                    if in_flight.len() >= max_concurrent {
                        break;
                    }
                    let inputs = self.dependency_outputs(&task);
                    self.mark_running(&task.id);
                    debug!("Launching task {}", task.id);
                    in_flight.push(execute_task_with_retries(self.run, task, inputs));
                }
            }

            match in_flight.next().await {
                Some(result) => self.record(result),
                None => {
                    let stuck = self.pending_ids();
                    if self.halted {
                        info!("Fail-fast left {} tasks unstarted", stuck.len());
                        return Ok(());
                    }
                    warn!("No runnable tasks remain: {:?}", stuck);
                    return Err(TroupeError::SchedulingDeadlock { stuck });
                }
            }
        }
    }

    /// One result per plan task, in plan order
    ///
    /// Tasks that never started stay `pending` with the reason in `error`.
    pub fn into_results(mut self) -> Vec<TaskResult> {
        let plan = self.run.plan;
        let reasons: HashMap<String, String> = plan
            .tasks
            .iter()
            .filter(|t| self.status(&t.id) == TaskStatus::Pending)
            .map(|t| (t.id.clone(), self.not_started_reason(t)))
            .collect();

        plan.tasks
            .iter()
            .filter_map(|t| {
                let mut result = self.results.remove(&t.id)?;
                if let Some(reason) = reasons.get(&t.id) {
                    result.error = Some(reason.clone());
                }
                Some(result)
            })
            .collect()
    }

    fn status(&self, task_id: &str) -> TaskStatus {
        self.results
            .get(task_id)
            .map(|r| r.status)
            .unwrap_or(TaskStatus::Pending)
    }

    fn has_unresolved(&self) -> bool {
        self.results.values().any(|r| !r.status.is_terminal())
    }

    fn ready_tasks(&self) -> Vec<Task> {
        self.run
            .plan
            .tasks
            .iter()
            .filter(|t| self.status(&t.id) == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|d| self.status(d) == TaskStatus::Completed)
            })
            .cloned()
            .collect()
    }

    fn pending_ids(&self) -> Vec<String> {
        self.run
            .plan
            .tasks
            .iter()
            .filter(|t| self.status(&t.id) == TaskStatus::Pending)
            .map(|t| t.id.clone())
            .collect()
    }

    fn dependency_outputs(&self, task: &Task) -> Vec<(String, String)> {
        task.depends_on
            .iter()
            .map(|d| (d.clone(), self.outputs.get(d).cloned().unwrap_or_default()))
            .collect()
    }

    fn mark_running(&mut self, task_id: &str) {
        if let Some(result) = self.results.get_mut(task_id) {
            result.status = TaskStatus::Running;
            result.started_at = Some(Utc::now());
        }
    }

    fn record(&mut self, result: TaskResult) {
        info!(
            "Task {} {} after {} attempt(s)",
            result.task_id, result.status, result.attempts
        );
        if result.is_completed() {
            self.outputs.insert(
                result.task_id.clone(),
                result.output.clone().unwrap_or_default(),
            );
        }
        self.results.insert(result.task_id.clone(), result);
    }

    fn not_started_reason(&self, task: &Task) -> String {
        let blocker = task
            .depends_on
            .iter()
            .find(|d| self.status(d) != TaskStatus::Completed);

        match blocker {
            Some(dep) if self.status(dep) == TaskStatus::Failed => {
                format!("blocked by failed dependency: {}", dep)
            }
            Some(dep) => format!("blocked: dependency {} never completed", dep),
            None if self.halted => {
                "not started: fail-fast stopped scheduling after a task failed".to_string()
            }
            None => "not started".to_string(),
        }
    }
}

struct AttemptFailure {
    run_id: Option<String>,
    error: TroupeError,
}

/// Run one task on its role's agent, retrying failed or timed-out attempts
///
/// Never returns an error; failures are recorded on the [`TaskResult`].
pub(crate) async fn execute_task_with_retries(
    run: GoalRun<'_>,
    task: Task,
    inputs: Vec<(String, String)>,
) -> TaskResult {
    let kernel = run.kernel;
    let mut result = TaskResult::pending(&task);
    result.status = TaskStatus::Running;
    result.started_at = Some(Utc::now());

    let agent_id = match kernel.resolve_role(&task.role, run.goal).await {
        Ok(agent_id) => agent_id,
        Err(e) => {
            warn!("No agent for role {} of task {}: {}", task.role, task.id, e);
            result.status = TaskStatus::Failed;
            result.error = Some(e.to_string());
            result.finished_at = Some(Utc::now());
            run.emit(EventKind::TaskFailed, &task, None, json!({ "error": e.to_string(), "attempt": 0 }))
                .await;
            kernel
                .metrics
                .record(MetricEvent::TaskFailed {
                    role: task.role.clone(),
                    duration_ms: 0,
                })
                .await;
            return result;
        }
    };
    result.agent_id = Some(agent_id.clone());

    let profile = fail_open("agent_profile_lookup", || kernel.runtime.get_agent(&agent_id))
        .await
        .flatten();
    let max_retries = profile
        .as_ref()
        .and_then(|p| p.max_retries)
        .unwrap_or(kernel.config.max_task_retries);
    let timeout_ms = profile
        .as_ref()
        .and_then(|p| p.timeout_ms)
        .unwrap_or(kernel.config.task_timeout_ms);
    let max_attempts = max_retries.saturating_add(1);

    let prompt = build_task_prompt(run.goal, run.plan, &task, &inputs);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        result.attempts = attempt;
        kernel
            .metrics
            .record(MetricEvent::TaskAttempt {
                role: task.role.clone(),
                attempt,
            })
            .await;
        run.emit(EventKind::TaskStarted, &task, Some(&agent_id), json!({ "attempt": attempt }))
            .await;

        match run_attempt(run, &agent_id, &task, &prompt, attempt, timeout_ms).await {
            Ok((run_id, output)) => {
                result.status = TaskStatus::Completed;
                result.run_id = Some(run_id.clone());
                result.output = Some(output);
                result.error = None;
                result.finished_at = Some(Utc::now());

                run.emit(
                    EventKind::TaskCompleted,
                    &task,
                    Some(&agent_id),
                    json!({ "attempt": attempt, "runId": run_id }),
                )
                .await;
                kernel
                    .metrics
                    .record(MetricEvent::TaskCompleted {
                        role: task.role.clone(),
                        duration_ms: result.duration_ms().unwrap_or(0),
                    })
                    .await;
                return result;
            }
            Err(failure) => {
                last_error = failure.error.to_string();
                result.run_id = failure.run_id.clone();
                let retryable = failure.error.is_retryable();
                let will_retry = retryable && attempt < max_attempts;

                run.emit(
                    EventKind::TaskFailed,
                    &task,
                    Some(&agent_id),
                    json!({
                        "attempt": attempt,
                        "runId": failure.run_id,
                        "error": last_error,
                        "willRetry": will_retry,
                    }),
                )
                .await;

                if !will_retry {
                    break;
                }
                warn!(
                    "Task {} attempt {}/{} failed, retrying: {}",
                    task.id, attempt, max_attempts, last_error
                );
            }
        }
    }

    result.status = TaskStatus::Failed;
    result.output = None;
    result.error = Some(last_error);
    result.finished_at = Some(Utc::now());
    kernel
        .metrics
        .record(MetricEvent::TaskFailed {
            role: task.role.clone(),
            duration_ms: result.duration_ms().unwrap_or(0),
        })
        .await;
    result
}

async fn run_attempt(
    run: GoalRun<'_>,
    agent_id: &str,
    task: &Task,
    prompt: &str,
    attempt: u32,
    timeout_ms: u64,
) -> std::result::Result<(String, String), AttemptFailure> {
    let kernel = run.kernel;
    let request = ExecuteRequest::new(agent_id, prompt, timeout_ms)
        .with_kind(RunKind::Task)
        .with_metadata(META_GOAL_ID, run.goal_id)
        .with_metadata(META_TASK_ID, task.id.as_str())
        .with_metadata(META_ATTEMPT, attempt.to_string());

    let handle = kernel
        .runtime
        .execute(request)
        .await
        .map_err(|error| AttemptFailure {
            run_id: None,
            error,
        })?;

    let failed = |error: TroupeError| AttemptFailure {
        run_id: Some(handle.run_id.clone()),
        error,
    };
    let snapshot = wait_for_run(
        kernel.runtime.as_ref(),
        &handle.run_id,
        Duration::from_millis(timeout_ms),
        kernel.poll_interval(),
    )
    .await
    .map_err(failed)?;

    let output = snapshot.into_output().map_err(failed)?;
    Ok((handle.run_id.clone(), output))
}
