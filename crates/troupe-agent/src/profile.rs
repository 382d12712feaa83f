//! Worker profiles

use crate::tools::ToolSet;

/// Identity, instructions and capabilities of one worker
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    pub agent_id: String,
    pub role: String,
    pub system_prompt: String,
    /// Tools the worker may call from inside a run
    pub tools: ToolSet,
    /// Overrides the kernel's `max_task_retries` for this worker
    pub max_retries: Option<u32>,
    /// Overrides the kernel's `task_timeout_ms` for this worker
    pub timeout_ms: Option<u64>,
}

impl WorkerProfile {
    pub fn new(
        agent_id: impl Into<String>,
        role: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            system_prompt: system_prompt.into(),
            tools: ToolSet::new(),
            max_retries: None,
            timeout_ms: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}
