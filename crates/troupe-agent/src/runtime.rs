//! Runtime abstraction
//!
//! The runtime owns model calls and tool loops. The kernel only dispatches a
//! prompt to an agent, polls the run and aborts it when a deadline passes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use troupe_core::fail_open::fail_open;
use troupe_core::{Result, TroupeError};

use crate::profile::WorkerProfile;

/// Metadata key naming why the kernel started a run
pub const META_KIND: &str = "kind";
/// Metadata key carrying the goal id
pub const META_GOAL_ID: &str = "goalId";
/// Metadata key carrying the task id for task runs
pub const META_TASK_ID: &str = "taskId";
/// Metadata key carrying the 1-based attempt number for task runs
pub const META_ATTEMPT: &str = "attempt";

/// Why the kernel dispatched a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Plan,
    PlanRepair,
    RolePrompt,
    Task,
    Summary,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::PlanRepair => "plan_repair",
            Self::RolePrompt => "role_prompt",
            Self::Task => "task",
            Self::Summary => "summary",
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "plan_repair" => Ok(Self::PlanRepair),
            "role_prompt" => Ok(Self::RolePrompt),
            "task" => Ok(Self::Task),
            "summary" => Ok(Self::Summary),
            _ => Err(format!("Invalid run kind: {}", s)),
        }
    }
}

/// Run status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// A single-turn run request for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub agent_id: String,
    pub parent_run_id: Option<String>,
    pub input: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ExecuteRequest {
    pub fn new(agent_id: impl Into<String>, input: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            agent_id: agent_id.into(),
            parent_run_id: None,
            input: input.into(),
            timeout_ms,
            metadata: HashMap::new(),
        }
    }

    pub fn with_parent_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(run_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_kind(self, kind: RunKind) -> Self {
        self.with_metadata(META_KIND, kind.as_str())
    }

    /// Why this run was dispatched, if the kernel tagged it
    pub fn kind(&self) -> Option<RunKind> {
        self.metadata.get(META_KIND).and_then(|k| k.parse().ok())
    }

    pub fn task_id(&self) -> Option<&str> {
        self.metadata.get(META_TASK_ID).map(String::as_str)
    }

    pub fn attempt(&self) -> Option<u32> {
        self.metadata.get(META_ATTEMPT).and_then(|a| a.parse().ok())
    }
}

/// Returned by [`Runtime::execute`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHandle {
    pub run_id: String,
    pub agent_id: String,
    pub status: RunStatus,
}

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl RunSnapshot {
    /// Convert a terminal snapshot into the run's output or an error
    pub fn into_output(self) -> Result<String> {
        match self.status {
            RunStatus::Completed => Ok(self.output.unwrap_or_default()),
            status => Err(TroupeError::RunFailed {
                reason: self
                    .error
                    .unwrap_or_else(|| format!("run ended with status {}", status)),
                run_id: self.run_id,
            }),
        }
    }
}

/// Worker execution engine (allows mocking in tests)
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start a run for an agent
    async fn execute(&self, request: ExecuteRequest) -> Result<RunHandle>;

    /// Ask the runtime to stop a run
    async fn abort(&self, run_id: &str) -> Result<()>;

    /// Current status of a run, `None` if the runtime does not know it
    async fn status(&self, run_id: &str) -> Result<Option<RunSnapshot>>;

    /// Register or replace an agent profile
    async fn upsert_agent(&self, profile: WorkerProfile) -> Result<()>;

    /// Look up an agent profile
    async fn get_agent(&self, agent_id: &str) -> Result<Option<WorkerProfile>>;

    /// Resolve the agent running in a tool-call session
    async fn agent_id_for_session(&self, session_id: &str) -> Result<Option<String>>;
}

/// Poll a run until it reaches a terminal status or the deadline passes
///
/// On timeout the run is aborted (best effort) and `RunTimeout` is returned.
#[instrument(skip(runtime))]
pub async fn wait_for_run(
    runtime: &dyn Runtime,
    run_id: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<RunSnapshot> {
    let deadline = Instant::now() + timeout;
    let poll_interval = poll_interval.max(Duration::from_millis(1));

    loop {
        match runtime.status(run_id).await? {
            Some(snapshot) if snapshot.status.is_terminal() => {
                debug!("Run {} settled as {}", run_id, snapshot.status);
                return Ok(snapshot);
            }
            Some(_) => {}
            None => {
                return Err(TroupeError::Runtime(format!(
                    "run {} is unknown to the runtime",
                    run_id
                )))
            }
        }

        let now = Instant::now();
        if now >= deadline {
            warn!("Run {} exceeded {}ms, aborting", run_id, timeout.as_millis());
            fail_open("run_abort", || runtime.abort(run_id)).await;
            return Err(TroupeError::RunTimeout {
                run_id: run_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedReply, ScriptedRuntime};

    #[test]
    fn test_request_metadata_helpers() {
        let request = ExecuteRequest::new("coder", "do it", 1_000)
            .with_kind(RunKind::Task)
            .with_metadata(META_TASK_ID, "api")
            .with_metadata(META_ATTEMPT, "2");
        assert_eq!(request.kind(), Some(RunKind::Task));
        assert_eq!(request.task_id(), Some("api"));
        assert_eq!(request.attempt(), Some(2));
    }

    #[test]
    fn test_failed_snapshot_into_output() {
        let snapshot = RunSnapshot {
            run_id: "run-1".to_string(),
            status: RunStatus::Failed,
            output: None,
            error: Some("tool crashed".to_string()),
        };
        let err = snapshot.into_output().unwrap_err();
        assert!(err.to_string().contains("tool crashed"));
    }

    #[tokio::test]
    async fn test_wait_returns_completed_output() {
        let runtime = ScriptedRuntime::new(|_| ScriptedReply::complete("done"));
        runtime
            .upsert_agent(WorkerProfile::new("coder", "coder", "prompt"))
            .await
            .unwrap();

        let handle = runtime
            .execute(ExecuteRequest::new("coder", "go", 1_000))
            .await
            .unwrap();
        let snapshot = wait_for_run(
            &runtime,
            &handle.run_id,
            Duration::from_secs(1),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.into_output().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_wait_times_out_and_aborts() {
        let runtime = ScriptedRuntime::new(|_| ScriptedReply::hang());
        runtime
            .upsert_agent(WorkerProfile::new("coder", "coder", "prompt"))
            .await
            .unwrap();

        let handle = runtime
            .execute(ExecuteRequest::new("coder", "go", 20))
            .await
            .unwrap();
        let err = wait_for_run(
            &runtime,
            &handle.run_id,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TroupeError::RunTimeout { .. }));
        assert_eq!(runtime.aborted_runs().await, vec![handle.run_id]);
    }

    #[tokio::test]
    async fn test_wait_unknown_run_is_error() {
        let runtime = ScriptedRuntime::new(|_| ScriptedReply::complete(""));
        let err = wait_for_run(
            &runtime,
            "run-missing",
            Duration::from_millis(10),
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TroupeError::Runtime(_)));
    }
}
