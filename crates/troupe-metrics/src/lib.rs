//! # troupe-metrics
//!
//! Observability counters for the Troupe kernel.
//!
//! This crate provides:
//! - Global counters for goals, plan repairs, task attempts and messages
//! - Per-role task statistics
//! - Serializable snapshots for reporting

mod collector;

pub use collector::{KernelMetrics, MetricEvent, MetricsSnapshot, RoleMetrics};
