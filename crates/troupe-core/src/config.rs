//! Configuration management for Troupe
//!
//! This module provides the kernel configuration: scheduling limits, retry and
//! timeout knobs, mailbox defaults and the pre-registered role templates.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Result, TroupeError};

/// Kernel configuration
///
/// Loaded from `.troupe/config.toml` in the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Agent that plans, repairs plans, writes role prompts and summarizes
    #[serde(default = "default_controller_agent_id")]
    pub controller_agent_id: String,

    /// Upper bound on tasks running at the same time
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Extra attempts per task after the first one fails
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,

    /// Stop launching new tasks once any task has failed
    #[serde(default)]
    pub fail_fast: bool,

    /// Controller repair rounds for an invalid plan
    #[serde(default = "default_max_plan_repair_attempts")]
    pub max_plan_repair_attempts: usize,

    /// Per-attempt deadline for a worker run
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Deadline for controller runs (plan, repair, role prompt, summary)
    #[serde(default = "default_controller_timeout_ms")]
    pub controller_timeout_ms: u64,

    /// Delay between run status polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Mailbox defaults
    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Roles known before any goal runs
    #[serde(default)]
    pub roles: Vec<RoleTemplate>,
}

/// Mailbox defaults applied when a caller leaves a field unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    #[serde(default = "default_lease_ms")]
    pub default_lease_ms: u64,

    #[serde(default = "default_receive_limit")]
    pub default_receive_limit: usize,

    #[serde(default = "default_dead_letter_list_limit")]
    pub dead_letter_list_limit: usize,
}

/// A worker profile registered at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTemplate {
    pub role: String,
    pub agent_id: String,
    pub system_prompt: String,
}

impl RoleTemplate {
    pub fn new(
        role: impl Into<String>,
        agent_id: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            agent_id: agent_id.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

// Default value providers
fn default_controller_agent_id() -> String {
    "controller".to_string()
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_task_retries() -> u32 {
    1
}

fn default_max_plan_repair_attempts() -> usize {
    2
}

fn default_task_timeout_ms() -> u64 {
    600_000
}

fn default_controller_timeout_ms() -> u64 {
    120_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_receive_limit() -> usize {
    10
}

fn default_dead_letter_list_limit() -> usize {
    50
}

impl KernelConfig {
    /// Load configuration from `.troupe/config.toml` or use defaults
    pub fn load_or_default(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".troupe/config.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            TroupeError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.troupe/config.toml`
    pub fn write_default(project_root: &Path) -> Result<()> {
        let config_dir = project_root.join(".troupe");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| TroupeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(TroupeError::Config(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.controller_agent_id.trim().is_empty() {
            return Err(TroupeError::Config(
                "controller_agent_id must not be empty".to_string(),
            ));
        }
        if self.mailbox.default_max_attempts == 0 {
            return Err(TroupeError::Config(
                "mailbox.default_max_attempts must be at least 1".to_string(),
            ));
        }
        for (idx, template) in self.roles.iter().enumerate() {
            if self.roles[..idx].iter().any(|r| r.role == template.role) {
                return Err(TroupeError::Config(format!(
                    "role {} is declared twice",
                    template.role
                )));
            }
            if template.agent_id == self.controller_agent_id {
                return Err(TroupeError::Config(format!(
                    "role {} reuses the controller agent id",
                    template.role
                )));
            }
        }
        Ok(())
    }

    pub fn with_controller_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.controller_agent_id = agent_id.into();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_max_task_retries(mut self, retries: u32) -> Self {
        self.max_task_retries = retries;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_max_plan_repair_attempts(mut self, attempts: usize) -> Self {
        self.max_plan_repair_attempts = attempts;
        self
    }

    pub fn with_task_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.task_timeout_ms = timeout_ms;
        self
    }

    pub fn with_controller_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.controller_timeout_ms = timeout_ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    pub fn with_mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = mailbox;
        self
    }

    pub fn with_role(mut self, template: RoleTemplate) -> Self {
        self.roles.push(template);
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            controller_agent_id: default_controller_agent_id(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_task_retries: default_max_task_retries(),
            fail_fast: false,
            max_plan_repair_attempts: default_max_plan_repair_attempts(),
            task_timeout_ms: default_task_timeout_ms(),
            controller_timeout_ms: default_controller_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            mailbox: MailboxConfig::default(),
            roles: Vec::new(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            default_lease_ms: default_lease_ms(),
            default_receive_limit: default_receive_limit(),
            dead_letter_list_limit: default_dead_letter_list_limit(),
        }
    }
}
