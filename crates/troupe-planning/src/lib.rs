//! Troupe Planning - goal plans as validated task DAGs
//!
//! This crate turns free-form controller output into a [`Plan`](troupe_core::Plan):
//! it finds the JSON inside the text, checks its shape, normalizes identifiers
//! and rejects cyclic or dangling dependency graphs. It also holds the prompt
//! templates the kernel sends to the controller and to workers.

pub mod dag;
pub mod plan;
pub mod prompts;

pub use dag::{execution_order, validate_plan};
pub use plan::{extract_json, parse_plan, plan_to_wire};
