//! Scripted runtime for tests and dry runs
//!
//! Replies are produced by a caller-supplied closure, so a test decides per
//! request whether a run completes, fails, hangs or is rejected at dispatch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use troupe_core::{Result, TroupeError};
use uuid::Uuid;

use crate::profile::WorkerProfile;
use crate::runtime::{ExecuteRequest, RunHandle, RunSnapshot, RunStatus, Runtime};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Complete(String),
    Fail(String),
    Hang,
    Reject(String),
}

/// How a scripted run behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedReply {
    outcome: Outcome,
    delay: Duration,
}

impl ScriptedReply {
    /// Run completes with this output
    pub fn complete(output: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Complete(output.into()),
            delay: Duration::ZERO,
        }
    }

    /// Run fails with this error
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Fail(error.into()),
            delay: Duration::ZERO,
        }
    }

    /// Run never settles on its own
    pub fn hang() -> Self {
        Self {
            outcome: Outcome::Hang,
            delay: Duration::ZERO,
        }
    }

    /// `execute` itself returns an error
    pub fn reject(error: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Reject(error.into()),
            delay: Duration::ZERO,
        }
    }

    /// Keep the run in `running` for this long before it settles
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug)]
struct ScriptedRun {
    reply: ScriptedReply,
    ready_at: Instant,
    aborted: bool,
}

type Responder = Arc<dyn Fn(&ExecuteRequest) -> ScriptedReply + Send + Sync>;

/// In-process [`Runtime`] driven by a reply closure
///
/// Every run gets its own session whose id equals the run id.
pub struct ScriptedRuntime {
    responder: Responder,
    agents: RwLock<HashMap<String, WorkerProfile>>,
    runs: RwLock<HashMap<String, ScriptedRun>>,
    sessions: RwLock<HashMap<String, String>>,
    requests: RwLock<Vec<ExecuteRequest>>,
    aborted: RwLock<Vec<String>>,
}

impl ScriptedRuntime {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ExecuteRequest) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            agents: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            requests: RwLock::new(Vec::new()),
            aborted: RwLock::new(Vec::new()),
        }
    }

    /// Every request accepted so far, in dispatch order
    pub async fn requests(&self) -> Vec<ExecuteRequest> {
        self.requests.read().await.clone()
    }

    /// Run ids that received an abort
    pub async fn aborted_runs(&self) -> Vec<String> {
        self.aborted.read().await.clone()
    }

    /// Registered agent ids, sorted
    pub async fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Attach a session to an agent without starting a run
    pub async fn bind_session(&self, session_id: impl Into<String>, agent_id: impl Into<String>) {
        self.sessions
            .write()
            .await
            .insert(session_id.into(), agent_id.into());
    }
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    async fn execute(&self, request: ExecuteRequest) -> Result<RunHandle> {
        if !self.agents.read().await.contains_key(&request.agent_id) {
            return Err(TroupeError::UnknownAgent(request.agent_id.clone()));
        }

        let reply = (self.responder)(&request);
        if let Outcome::Reject(reason) = &reply.outcome {
            return Err(TroupeError::Runtime(reason.clone()));
        }

        let run_id = format!("run-{}", &Uuid::new_v4().simple().to_string()[..12]);
        debug!("Scripted run {} for agent {}", run_id, request.agent_id);

        let ready_at = Instant::now() + reply.delay;
        self.runs.write().await.insert(
            run_id.clone(),
            ScriptedRun {
                reply,
                ready_at,
                aborted: false,
            },
        );
        self.sessions
            .write()
            .await
            .insert(run_id.clone(), request.agent_id.clone());

        let handle = RunHandle {
            run_id,
            agent_id: request.agent_id.clone(),
            status: RunStatus::Running,
        };
        self.requests.write().await.push(request);
        Ok(handle)
    }

    async fn abort(&self, run_id: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| TroupeError::Runtime(format!("run {} is unknown", run_id)))?;
        run.aborted = true;
        self.aborted.write().await.push(run_id.to_string());
        Ok(())
    }

    async fn status(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let runs = self.runs.read().await;
        let Some(run) = runs.get(run_id) else {
            return Ok(None);
        };

        let running = RunSnapshot {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            output: None,
            error: None,
        };

        if run.aborted {
            return Ok(Some(RunSnapshot {
                status: RunStatus::Aborted,
                error: Some("aborted".to_string()),
                ..running
            }));
        }
        if Instant::now() < run.ready_at {
            return Ok(Some(running));
        }

        let snapshot = match &run.reply.outcome {
            Outcome::Complete(output) => RunSnapshot {
                status: RunStatus::Completed,
                output: Some(output.clone()),
                ..running
            },
            Outcome::Fail(error) => RunSnapshot {
                status: RunStatus::Failed,
                error: Some(error.clone()),
                ..running
            },
            Outcome::Hang | Outcome::Reject(_) => running,
        };
        Ok(Some(snapshot))
    }

    async fn upsert_agent(&self, profile: WorkerProfile) -> Result<()> {
        self.agents
            .write()
            .await
            .insert(profile.agent_id.clone(), profile);
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<WorkerProfile>> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn agent_id_for_session(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn runtime_with_agent(reply: ScriptedReply) -> ScriptedRuntime {
        let runtime = ScriptedRuntime::new(move |_| reply.clone());
        runtime
            .upsert_agent(WorkerProfile::new("coder", "coder", "You write code."))
            .await
            .unwrap();
        runtime
    }

    #[tokio::test]
    async fn test_unknown_agent_rejected() {
        let runtime = ScriptedRuntime::new(|_| ScriptedReply::complete("x"));
        let err = runtime
            .execute(ExecuteRequest::new("ghost", "hi", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn test_requests_are_recorded_with_parent() {
        let runtime = runtime_with_agent(ScriptedReply::complete("ok")).await;
        runtime
            .execute(ExecuteRequest::new("coder", "follow up", 10).with_parent_run_id("run-parent"))
            .await
            .unwrap();
        let requests = runtime.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].parent_run_id.as_deref(), Some("run-parent"));
    }

    #[tokio::test]
    async fn test_session_maps_to_agent() {
        let runtime = runtime_with_agent(ScriptedReply::complete("ok")).await;
        let handle = runtime
            .execute(ExecuteRequest::new("coder", "hi", 10))
            .await
            .unwrap();
        assert_eq!(
            runtime.agent_id_for_session(&handle.run_id).await.unwrap(),
            Some("coder".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_run_reports_error() {
        let runtime = runtime_with_agent(ScriptedReply::fail("boom")).await;
        let handle = runtime
            .execute(ExecuteRequest::new("coder", "hi", 10))
            .await
            .unwrap();
        let snapshot = runtime.status(&handle.run_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_delayed_run_reports_running_first() {
        let runtime =
            runtime_with_agent(ScriptedReply::complete("late").after(Duration::from_secs(60))).await;
        let handle = runtime
            .execute(ExecuteRequest::new("coder", "hi", 10))
            .await
            .unwrap();
        let snapshot = runtime.status(&handle.run_id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_reject_fails_dispatch() {
        let runtime = runtime_with_agent(ScriptedReply::reject("overloaded")).await;
        let err = runtime
            .execute(ExecuteRequest::new("coder", "hi", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::Runtime(_)));
        assert!(runtime.requests().await.is_empty());
    }
}
