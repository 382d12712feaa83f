//! Unified error types for Troupe

use thiserror::Error;

/// Unified error type for all Troupe operations
#[derive(Error, Debug)]
pub enum TroupeError {
    // Plan errors
    #[error("Invalid plan: {0}")]
    PlanFormat(String),

    #[error("Plan repair exhausted after {attempts} attempts: {last_error}")]
    PlanRepairExhausted { attempts: usize, last_error: String },

    // Scheduling errors
    #[error("Scheduling deadlock, stuck tasks: {}", stuck.join(", "))]
    SchedulingDeadlock { stuck: Vec<String> },

    // Agent errors
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    // Runtime errors
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Run {run_id} failed: {reason}")]
    RunFailed { run_id: String, reason: String },

    #[error("Run {run_id} timed out after {timeout_ms}ms")]
    RunTimeout { run_id: String, timeout_ms: u64 },

    // Tool errors
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid input for tool {tool}: {reason}")]
    ToolInput { tool: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl TroupeError {
    /// Whether a task attempt that hit this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Runtime(_) | Self::RunFailed { .. } | Self::RunTimeout { .. }
        )
    }
}

/// Result type alias using TroupeError
pub type Result<T> = std::result::Result<T, TroupeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_message_names_tasks() {
        let err = TroupeError::SchedulingDeadlock {
            stuck: vec!["frontend".to_string(), "review".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Scheduling deadlock, stuck tasks: frontend, review"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_run_timeout_is_retryable() {
        let err = TroupeError::RunTimeout {
            run_id: "run-1".to_string(),
            timeout_ms: 50,
        };
        assert!(err.is_retryable());
    }
}
