//! Orchestrator kernel
//!
//! Coordinates the full lifecycle of a goal:
//! 1. Ask the controller for a plan, repairing it when it does not validate
//! 2. Schedule the plan's tasks on role workers
//! 3. Ask the controller for a closing summary (best effort)
//!
//! [`Kernel::execute`] never fails. Every outcome, including a fatal planning
//! or scheduling error, is reported on the returned [`GoalResult`].

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use troupe_agent::{wait_for_run, ExecuteRequest, RunKind, Runtime, WorkerProfile, META_GOAL_ID};
use troupe_core::fail_open::fail_open;
use troupe_core::{
    Clock, EventKind, GoalResult, GoalStatus, KernelConfig, Plan, Result, RuntimeEvent,
    SystemClock, TaskResult, TroupeError,
};
use troupe_metrics::{KernelMetrics, MetricEvent};
use troupe_planning::parse_plan;
use troupe_planning::prompts::{build_planning_prompt, build_repair_prompt, build_summary_prompt};
use uuid::Uuid;

use crate::events::{EventBus, Subscription};
use crate::mailbox::Mailbox;
use crate::messaging_tools::messaging_tools;
use crate::roles::RoleRegistry;
use crate::scheduler::{GoalRun, Scheduler};

/// System prompt of the controller agent
pub const CONTROLLER_PROMPT: &str = "You are the controller of a multi-agent team. You break goals \
into plans of role-specific tasks, repair plans that fail validation, write system prompts for \
new roles and summarize finished work. Follow the requested output format exactly.";

/// The orchestrator kernel
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) metrics: Arc<KernelMetrics>,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) roles: RoleRegistry,
}

impl Kernel {
    /// Create a kernel on the system clock
    pub async fn with_runtime(config: KernelConfig, runtime: Arc<dyn Runtime>) -> Result<Self> {
        Self::with_clock(config, runtime, Arc::new(SystemClock)).await
    }

    /// Create a kernel with an explicit mailbox clock
    ///
    /// Registers the controller and every configured role template.
    pub async fn with_clock(
        config: KernelConfig,
        runtime: Arc<dyn Runtime>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(KernelMetrics::new());
        let mailbox = Arc::new(Mailbox::new(
            config.mailbox.clone(),
            clock,
            events.clone(),
            metrics.clone(),
        ));

        let kernel = Self {
            config,
            runtime,
            events,
            metrics,
            mailbox,
            roles: RoleRegistry::new(),
        };

        kernel
            .register_worker(WorkerProfile::new(
                kernel.config.controller_agent_id.as_str(),
                "controller",
                CONTROLLER_PROMPT,
            ))
            .await?;

        for template in kernel.config.roles.clone() {
            kernel
                .register_worker(WorkerProfile::new(
                    template.agent_id.as_str(),
                    template.role.as_str(),
                    template.system_prompt,
                ))
                .await?;
            kernel.roles.insert(template.role, template.agent_id).await;
        }

        info!(
            "Kernel ready: controller {}, {} template roles",
            kernel.config.controller_agent_id,
            kernel.config.roles.len()
        );
        Ok(kernel)
    }

    /// Register or replace a worker
    ///
    /// The messaging tools are added to the profile's tool set unless a tool
    /// with the same name is already there.
    pub async fn register_worker(&self, mut profile: WorkerProfile) -> Result<()> {
        for tool in messaging_tools(self.mailbox.clone(), self.runtime.clone()) {
            profile.tools.insert(tool);
        }
        self.mailbox.register_agent(profile.agent_id.as_str()).await;
        debug!(
            "Registering worker {} ({}) with tools {:?}",
            profile.agent_id,
            profile.role,
            profile.tools.names()
        );
        self.runtime.upsert_agent(profile).await
    }

    /// Listen to every kernel and mailbox event
    pub async fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RuntimeEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener).await
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn metrics(&self) -> &Arc<KernelMetrics> {
        &self.metrics
    }

    /// Current role to agent mapping, templates and synthesized roles alike
    pub async fn role_agents(&self) -> HashMap<String, String> {
        self.roles.snapshot().await
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// Plan, run and summarize a goal
    #[instrument(skip(self, goal))]
    pub async fn execute(&self, goal: &str) -> GoalResult {
        let goal_id = format!("goal-{}", Uuid::new_v4().simple());
        let started_at = Utc::now();

        info!("Starting goal {}", goal_id);
        self.metrics.record(MetricEvent::GoalStarted).await;
        self.events
            .emit(RuntimeEvent::new(
                EventKind::GoalStarted,
                json!({ "goalId": goal_id, "goal": goal }),
            ))
            .await;

        let plan = match self.acquire_plan(&goal_id, goal).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Planning failed for goal {}: {}", goal_id, e);
                return self
                    .finish(goal_id, goal, None, Vec::new(), None, Some(e), started_at)
                    .await;
            }
        };

        info!(
            "Goal {} planned with {} tasks: {}",
            goal_id,
            plan.tasks.len(),
            plan.summary
        );
        self.events
            .emit(RuntimeEvent::new(
                EventKind::GoalPlanned,
                json!({
                    "goalId": goal_id,
                    "summary": plan.summary,
                    "taskIds": plan.tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
                }),
            ))
            .await;

        let (tasks, fatal) = {
            let mut scheduler = Scheduler::new(GoalRun {
                kernel: self,
                goal_id: &goal_id,
                goal,
                plan: &plan,
            });
            let outcome = scheduler.run().await;
            (scheduler.into_results(), outcome.err())
        };

        let summary_prompt = build_summary_prompt(goal, &plan, &tasks);
        let summary = fail_open("goal_summary", || {
            self.run_controller(RunKind::Summary, Some(&goal_id), summary_prompt)
        })
        .await;

        self.finish(goal_id, goal, Some(plan), tasks, summary, fatal, started_at)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        goal_id: String,
        goal: &str,
        plan: Option<Plan>,
        tasks: Vec<TaskResult>,
        summary: Option<String>,
        fatal: Option<TroupeError>,
        started_at: DateTime<Utc>,
    ) -> GoalResult {
        let failed = fatal.is_some() || plan.is_none() || tasks.iter().any(|t| !t.is_completed());
        let status = if failed {
            GoalStatus::Failed
        } else {
            GoalStatus::Completed
        };
        let error = fatal.map(|e| e.to_string()).or_else(|| {
            let failed_ids: Vec<&str> = tasks
                .iter()
                .filter(|t| t.is_failed())
                .map(|t| t.task_id.as_str())
                .collect();
            (!failed_ids.is_empty()).then(|| format!("tasks failed: {}", failed_ids.join(", ")))
        });

        let completed = tasks.iter().filter(|t| t.is_completed()).count();
        let (kind, metric) = match status {
            GoalStatus::Completed => (EventKind::GoalCompleted, MetricEvent::GoalCompleted),
            GoalStatus::Failed => (EventKind::GoalFailed, MetricEvent::GoalFailed),
        };
        info!(
            "Goal {} {}: {}/{} tasks completed",
            goal_id,
            status,
            completed,
            tasks.len()
        );
        self.metrics.record(metric).await;
        self.events
            .emit(RuntimeEvent::new(
                kind,
                json!({
                    "goalId": goal_id,
                    "status": status,
                    "completed": completed,
                    "total": tasks.len(),
                    "error": error,
                }),
            ))
            .await;

        GoalResult {
            goal_id,
            goal: goal.to_string(),
            status,
            plan,
            tasks,
            summary,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Get a valid plan from the controller, repairing bounded times
    async fn acquire_plan(&self, goal_id: &str, goal: &str) -> Result<Plan> {
        let prompt = build_planning_prompt(goal, &self.roles.roles().await);
        let mut raw = self
            .run_controller(RunKind::Plan, Some(goal_id), prompt)
            .await?;
        let mut repairs = 0;

        loop {
            let error = match parse_plan(&raw) {
                Ok(plan) => return Ok(plan),
                Err(e) => e.to_string(),
            };

            if repairs >= self.config.max_plan_repair_attempts {
                return Err(TroupeError::PlanRepairExhausted {
                    attempts: repairs,
                    last_error: error,
                });
            }
            repairs += 1;
            warn!(
                "Plan for {} rejected ({}), repair {}/{}",
                goal_id, error, repairs, self.config.max_plan_repair_attempts
            );
            self.metrics.record(MetricEvent::PlanRepair).await;

            let prompt = build_repair_prompt(goal, &raw, &error);
            raw = self
                .run_controller(RunKind::PlanRepair, Some(goal_id), prompt)
                .await?;
        }
    }

    /// Run a prompt on the controller and return its output
    pub(crate) async fn run_controller(
        &self,
        kind: RunKind,
        goal_id: Option<&str>,
        prompt: String,
    ) -> Result<String> {
        let mut request = ExecuteRequest::new(
            self.config.controller_agent_id.as_str(),
            prompt,
            self.config.controller_timeout_ms,
        )
        .with_kind(kind);
        if let Some(goal_id) = goal_id {
            request = request.with_metadata(META_GOAL_ID, goal_id);
        }

        let handle = self.runtime.execute(request).await?;
        debug!("Controller {} run {}", kind, handle.run_id);
        let snapshot = wait_for_run(
            self.runtime.as_ref(),
            &handle.run_id,
            Duration::from_millis(self.config.controller_timeout_ms),
            self.poll_interval(),
        )
        .await?;
        snapshot.into_output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_agent::{ScriptedReply, ScriptedRuntime, ToolSet};
    use troupe_core::{MailboxConfig, RoleTemplate};

    use crate::mailbox::SendRequest;
    use crate::messaging_tools::MESSAGING_TOOL_NAMES;

    #[tokio::test]
    async fn test_with_runtime_registers_controller_and_templates() {
        let runtime = Arc::new(ScriptedRuntime::new(|_| ScriptedReply::complete("")));
        let config = KernelConfig::default()
            .with_role(RoleTemplate::new("writer", "writer-1", "You write."));
        let kernel = Kernel::with_runtime(config, runtime.clone()).await.unwrap();

        assert_eq!(runtime.agent_ids().await, vec!["controller", "writer-1"]);
        assert_eq!(
            kernel.role_agents().await.get("writer").map(String::as_str),
            Some("writer-1")
        );
        assert!(kernel.mailbox().is_registered("controller").await);

        let writer = runtime.get_agent("writer-1").await.unwrap().unwrap();
        assert_eq!(writer.tools.len(), 5);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let runtime = Arc::new(ScriptedRuntime::new(|_| ScriptedReply::complete("")));
        let config = KernelConfig::default().with_max_concurrent_tasks(0);
        assert!(Kernel::with_runtime(config, runtime).await.is_err());
    }

    #[tokio::test]
    async fn test_controller_failure_fails_goal_without_panicking() {
        let runtime = Arc::new(ScriptedRuntime::new(|_| ScriptedReply::fail("model offline")));
        let kernel = Kernel::with_runtime(KernelConfig::default().with_poll_interval_ms(1), runtime)
            .await
            .unwrap();

        let result = kernel.execute("anything").await;
        assert_eq!(result.status, GoalStatus::Failed);
        assert!(result.plan.is_none());
        assert!(result.error.unwrap().contains("model offline"));

        let snapshot = kernel.metrics().snapshot().await;
        assert_eq!(snapshot.goals_started, 1);
        assert_eq!(snapshot.goals_failed, 1);
    }

    #[tokio::test]
    async fn test_register_worker_keeps_existing_tools() {
        let runtime = Arc::new(ScriptedRuntime::new(|_| ScriptedReply::complete("")));
        let config = KernelConfig::default()
            .with_controller_agent_id("planner")
            .with_controller_timeout_ms(5_000)
            .with_mailbox(MailboxConfig {
                default_max_attempts: 1,
                ..MailboxConfig::default()
            });
        let kernel = Kernel::with_runtime(config, runtime.clone()).await.unwrap();
        assert_eq!(runtime.agent_ids().await, vec!["planner"]);

        let mut own = ToolSet::new();
        for tool in messaging_tools(kernel.mailbox().clone(), runtime.clone())
            .into_iter()
            .take(1)
        {
            own.insert(tool);
        }
        kernel
            .register_worker(
                WorkerProfile::new("critic-1", "critic", "You critique.").with_tools(own),
            )
            .await
            .unwrap();

        let critic = runtime.get_agent("critic-1").await.unwrap().unwrap();
        assert_eq!(critic.tools.names(), MESSAGING_TOOL_NAMES.to_vec());

        let sent = kernel
            .mailbox()
            .send(SendRequest::new("planner", "critic-1", serde_json::json!("hi")))
            .await
            .unwrap();
        assert_eq!(sent.max_attempts, 1);
    }
}
