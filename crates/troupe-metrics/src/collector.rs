//! Metric collection for the kernel

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Things the kernel counts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    GoalStarted,
    GoalCompleted,
    GoalFailed,
    PlanRepair,
    /// A task attempt was dispatched; `attempt` is 1-based
    TaskAttempt { role: String, attempt: u32 },
    TaskCompleted { role: String, duration_ms: u64 },
    TaskFailed { role: String, duration_ms: u64 },
    MessageSent,
    MessageAcked,
    MessageNacked,
    MessageDeadLettered,
}

/// Per-role task statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMetrics {
    pub attempts: u64,
    pub retries: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
}

impl RoleMetrics {
    /// Share of finished tasks that completed
    pub fn success_rate(&self) -> f32 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 1.0;
        }
        self.completed as f32 / finished as f32
    }
}

/// Kernel-wide metrics
pub struct KernelMetrics {
    goals_started: AtomicU64,
    goals_completed: AtomicU64,
    goals_failed: AtomicU64,
    plan_repairs: AtomicU64,
    task_attempts: AtomicU64,
    task_retries: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    messages_sent: AtomicU64,
    messages_acked: AtomicU64,
    messages_nacked: AtomicU64,
    messages_dead_lettered: AtomicU64,
    roles: RwLock<HashMap<String, RoleMetrics>>,
}

impl KernelMetrics {
    pub fn new() -> Self {
        Self {
            goals_started: AtomicU64::new(0),
            goals_completed: AtomicU64::new(0),
            goals_failed: AtomicU64::new(0),
            plan_repairs: AtomicU64::new(0),
            task_attempts: AtomicU64::new(0),
            task_retries: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_acked: AtomicU64::new(0),
            messages_nacked: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            roles: RwLock::new(HashMap::new()),
        }
    }

    /// Record an event
    pub async fn record(&self, event: MetricEvent) {
        debug!("metric: {:?}", event);

        match event {
            MetricEvent::GoalStarted => bump(&self.goals_started),
            MetricEvent::GoalCompleted => bump(&self.goals_completed),
            MetricEvent::GoalFailed => bump(&self.goals_failed),
            MetricEvent::PlanRepair => bump(&self.plan_repairs),
            MetricEvent::MessageSent => bump(&self.messages_sent),
            MetricEvent::MessageAcked => bump(&self.messages_acked),
            MetricEvent::MessageNacked => bump(&self.messages_nacked),
            MetricEvent::MessageDeadLettered => bump(&self.messages_dead_lettered),
            MetricEvent::TaskAttempt { role, attempt } => {
                bump(&self.task_attempts);
                if attempt > 1 {
                    bump(&self.task_retries);
                }
                let mut roles = self.roles.write().await;
                let stats = roles.entry(role).or_default();
                stats.attempts += 1;
                if attempt > 1 {
                    stats.retries += 1;
                }
            }
            MetricEvent::TaskCompleted { role, duration_ms } => {
                bump(&self.tasks_completed);
                let mut roles = self.roles.write().await;
                let stats = roles.entry(role).or_default();
                stats.completed += 1;
                stats.total_duration_ms += duration_ms;
            }
            MetricEvent::TaskFailed { role, duration_ms } => {
                bump(&self.tasks_failed);
                let mut roles = self.roles.write().await;
                let stats = roles.entry(role).or_default();
                stats.failed += 1;
                stats.total_duration_ms += duration_ms;
            }
        }
    }

    /// Statistics for one role
    pub async fn role(&self, role: &str) -> Option<RoleMetrics> {
        self.roles.read().await.get(role).cloned()
    }

    /// Point-in-time copy of every counter
    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            goals_started: load(&self.goals_started),
            goals_completed: load(&self.goals_completed),
            goals_failed: load(&self.goals_failed),
            plan_repairs: load(&self.plan_repairs),
            task_attempts: load(&self.task_attempts),
            task_retries: load(&self.task_retries),
            tasks_completed: load(&self.tasks_completed),
            tasks_failed: load(&self.tasks_failed),
            messages_sent: load(&self.messages_sent),
            messages_acked: load(&self.messages_acked),
            messages_nacked: load(&self.messages_nacked),
            messages_dead_lettered: load(&self.messages_dead_lettered),
            roles: self.roles.read().await.clone(),
        }
    }
}

impl Default for KernelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Serializable metrics summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub goals_started: u64,
    pub goals_completed: u64,
    pub goals_failed: u64,
    pub plan_repairs: u64,
    pub task_attempts: u64,
    pub task_retries: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub messages_sent: u64,
    pub messages_acked: u64,
    pub messages_nacked: u64,
    pub messages_dead_lettered: u64,
    pub roles: HashMap<String, RoleMetrics>,
}

impl MetricsSnapshot {
    /// Share of finished tasks that completed
    pub fn task_success_rate(&self) -> f32 {
        let finished = self.tasks_completed + self.tasks_failed;
        if finished == 0 {
            return 1.0;
        }
        self.tasks_completed as f32 / finished as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_metrics_by_role() {
        let metrics = KernelMetrics::new();

        metrics
            .record(MetricEvent::TaskAttempt {
                role: "coder".to_string(),
                attempt: 1,
            })
            .await;
        metrics
            .record(MetricEvent::TaskAttempt {
                role: "coder".to_string(),
                attempt: 2,
            })
            .await;
        metrics
            .record(MetricEvent::TaskCompleted {
                role: "coder".to_string(),
                duration_ms: 40,
            })
            .await;
        metrics
            .record(MetricEvent::TaskFailed {
                role: "reviewer".to_string(),
                duration_ms: 10,
            })
            .await;

        let coder = metrics.role("coder").await.unwrap();
        assert_eq!(coder.attempts, 2);
        assert_eq!(coder.retries, 1);
        assert_eq!(coder.completed, 1);
        assert_eq!(coder.total_duration_ms, 40);

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.task_attempts, 2);
        assert_eq!(snapshot.task_retries, 1);
        assert_eq!(snapshot.task_success_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_message_counters() {
        let metrics = KernelMetrics::new();
        metrics.record(MetricEvent::MessageSent).await;
        metrics.record(MetricEvent::MessageSent).await;
        metrics.record(MetricEvent::MessageDeadLettered).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.messages_dead_lettered, 1);
        assert_eq!(snapshot.messages_acked, 0);
    }

    #[test]
    fn test_empty_success_rate_is_one() {
        assert_eq!(MetricsSnapshot::default().task_success_rate(), 1.0);
        assert_eq!(RoleMetrics::default().success_rate(), 1.0);
    }
}
