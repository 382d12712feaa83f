//! Role to agent mapping, with on-demand workers for unknown roles

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};
use troupe_agent::{RunKind, WorkerProfile};
use troupe_core::{Result, TroupeError};
use troupe_planning::prompts::{build_role_prompt_request, default_role_prompt};
use uuid::Uuid;

use crate::kernel::Kernel;

/// Role names mapped to the agent serving them, owned by one kernel
#[derive(Default)]
pub struct RoleRegistry {
    agents: RwLock<HashMap<String, String>>,
    /// One gate per role being synthesized
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, role: impl Into<String>, agent_id: impl Into<String>) {
        self.agents
            .write()
            .await
            .insert(role.into(), agent_id.into());
    }

    pub async fn get(&self, role: &str) -> Option<String> {
        self.agents.read().await.get(role).cloned()
    }

    /// Known role names, sorted
    pub async fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.agents.read().await.keys().cloned().collect();
        roles.sort();
        roles
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.agents.read().await.clone()
    }

    async fn gate(&self, role: &str) -> Arc<Mutex<()>> {
        self.gates
            .lock()
            .await
            .entry(role.to_string())
            .or_default()
            .clone()
    }
}

/// Mint an agent id for a synthesized role: `dynamic-<slug>-<8 hex>`
pub fn dynamic_agent_id(role: &str) -> String {
    let mut slug = String::with_capacity(role.len());
    for c in role.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "role" } else { slug };

    let suffix = Uuid::new_v4().simple().to_string();
    format!("dynamic-{}-{}", slug, &suffix[..8])
}

impl Kernel {
    /// Agent serving `role`, creating a worker for it when none exists
    pub async fn resolve_agent_for_role(&self, role: &str) -> Result<String> {
        self.resolve_role(role, "").await
    }

    /// Resolve with the goal as context for the controller-written prompt
    ///
    /// Concurrent calls for the same role share one synthesis.
    #[instrument(skip(self, goal))]
    pub(crate) async fn resolve_role(&self, role: &str, goal: &str) -> Result<String> {
        let role = role.trim();
        if role.is_empty() {
            return Err(TroupeError::UnknownRole("empty role name".to_string()));
        }
        if let Some(agent_id) = self.roles.get(role).await {
            return Ok(agent_id);
        }

        let gate = self.roles.gate(role).await;
        let _held = gate.lock().await;
        if let Some(agent_id) = self.roles.get(role).await {
            return Ok(agent_id);
        }

        let request = build_role_prompt_request(role, goal);
        let system_prompt = match self.run_controller(RunKind::RolePrompt, None, request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("Controller returned an empty prompt for role {}", role);
                default_role_prompt(role)
            }
            Err(e) => {
                warn!("Role prompt for {} failed, using default: {}", role, e);
                default_role_prompt(role)
            }
        };

        let agent_id = dynamic_agent_id(role);
        self.register_worker(WorkerProfile::new(&agent_id, role, system_prompt))
            .await?;
        self.roles.insert(role, &agent_id).await;

        info!("Created worker {} for role {}", agent_id, role);
        Ok(agent_id)
    }
}
