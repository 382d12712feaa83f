//! Core type definitions for Troupe orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a single task inside a goal execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" | "done" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// A unit of work in a plan, executed by the worker that owns `role`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub role: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        role: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            role: role.into(),
            description: description.into(),
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_acceptance_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }
}

/// A validated task DAG for one goal
///
/// Wire format: `{"summary": "...", "tasks": [{"id", "title", "role",
/// "description", "dependsOn", "acceptanceCriteria"}]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(summary: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            summary: summary.into(),
            tasks,
        }
    }

    /// Look up a task by id
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Distinct roles in plan order
    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = Vec::new();
        for task in &self.tasks {
            if !roles.contains(&task.role.as_str()) {
                roles.push(task.role.as_str());
            }
        }
        roles
    }
}

/// Outcome of one task, owned and mutated by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub role: String,
    pub agent_id: Option<String>,
    pub status: TaskStatus,
    pub run_id: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// A result for a task that has not started yet
    pub fn pending(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            role: task.role.clone(),
            agent_id: None,
            status: TaskStatus::Pending,
            run_id: None,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    /// Wall time between start and finish, if both are known
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Final status of a goal execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Structured result of `Kernel::execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalResult {
    pub goal_id: String,
    pub goal: String,
    pub status: GoalStatus,
    pub plan: Option<Plan>,
    /// One entry per plan task, in plan order
    pub tasks: Vec<TaskResult>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GoalResult {
    pub fn is_success(&self) -> bool {
        self.status == GoalStatus::Completed
    }

    /// Look up the result for a task id
    pub fn task(&self, task_id: &str) -> Option<&TaskResult> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// Delivery state of a mailbox message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    InFlight,
    DeadLetter,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::InFlight => write!(f, "in_flight"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

/// A message between two workers, owned by the recipient's mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub topic: Option<String>,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Run that produced the message, if sent from inside a run
    pub run_id: Option<String>,
    pub status: MessageStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Message {
    /// Retry budget used up
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Outcome of a negative acknowledgment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackOutcome {
    pub requeued: bool,
    pub dead_lettered: bool,
}

impl NackOutcome {
    pub fn requeued() -> Self {
        Self {
            requeued: true,
            dead_lettered: false,
        }
    }

    pub fn dead_lettered() -> Self {
        Self {
            requeued: false,
            dead_lettered: true,
        }
    }

    /// Nothing matched; the call was a no-op
    pub fn not_found() -> Self {
        Self::default()
    }
}

/// Event types delivered to kernel subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "kernel.goal.started")]
    GoalStarted,
    #[serde(rename = "kernel.goal.planned")]
    GoalPlanned,
    #[serde(rename = "kernel.goal.completed")]
    GoalCompleted,
    #[serde(rename = "kernel.goal.failed")]
    GoalFailed,
    #[serde(rename = "kernel.task.started")]
    TaskStarted,
    #[serde(rename = "kernel.task.completed")]
    TaskCompleted,
    #[serde(rename = "kernel.task.failed")]
    TaskFailed,
    #[serde(rename = "agent.message")]
    MessageSent,
    #[serde(rename = "agent.message.acked")]
    MessageAcked,
    #[serde(rename = "agent.message.nacked")]
    MessageNacked,
    #[serde(rename = "agent.message.dead_letter")]
    MessageDeadLettered,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoalStarted => "kernel.goal.started",
            Self::GoalPlanned => "kernel.goal.planned",
            Self::GoalCompleted => "kernel.goal.completed",
            Self::GoalFailed => "kernel.goal.failed",
            Self::TaskStarted => "kernel.task.started",
            Self::TaskCompleted => "kernel.task.completed",
            Self::TaskFailed => "kernel.task.failed",
            Self::MessageSent => "agent.message",
            Self::MessageAcked => "agent.message.acked",
            Self::MessageNacked => "agent.message.nacked",
            Self::MessageDeadLettered => "agent.message.dead_letter",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable kernel event, fanned out to subscribers and never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: Option<String>,
    pub agent_id: Option<String>,
    pub payload: serde_json::Value,
}

impl RuntimeEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            run_id: None,
            agent_id: None,
            payload,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_parsing() {
        assert_eq!("completed".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert_eq!("DONE".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("exploded".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_task_wire_format_is_camel_case() {
        let task = Task::new("api", "Build API", "backend", "Write handlers")
            .with_depends_on(["schema"])
            .with_acceptance_criteria(["tests pass"]);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["dependsOn"][0], "schema");
        assert_eq!(json["acceptanceCriteria"][0], "tests pass");
    }

    #[test]
    fn test_event_kind_serializes_dotted_name() {
        let event = RuntimeEvent::new(EventKind::MessageDeadLettered, serde_json::json!({}))
            .with_agent_id("reviewer");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent.message.dead_letter");
        assert_eq!(json["agentId"], "reviewer");
        assert_eq!(EventKind::GoalPlanned.to_string(), "kernel.goal.planned");
    }

    #[test]
    fn test_plan_roles_are_distinct_in_order() {
        let plan = Plan::new(
            "site",
            vec![
                Task::new("a", "A", "designer", "d"),
                Task::new("b", "B", "coder", "d"),
                Task::new("c", "C", "designer", "d"),
            ],
        );
        assert_eq!(plan.roles(), vec!["designer", "coder"]);
    }

    #[test]
    fn test_nack_outcome_constructors() {
        assert_eq!(NackOutcome::not_found(), NackOutcome { requeued: false, dead_lettered: false });
        assert!(NackOutcome::dead_lettered().dead_lettered);
        assert!(NackOutcome::requeued().requeued);
    }
}
