//! # troupe-agent
//!
//! Everything the kernel needs to drive workers it does not own.
//!
//! Workers run inside an external [`Runtime`]: the kernel hands it a prompt,
//! gets back a run id and polls until the run settles. This crate defines:
//! - The [`Runtime`] trait and its request/response types
//! - [`wait_for_run`], the deadline-enforcing poll loop
//! - [`WorkerProfile`], a worker's identity, prompt and tool set
//! - The [`Tool`] trait and [`ToolSet`] that workers call through
//! - [`ScriptedRuntime`], an in-process runtime for tests and dry runs

mod profile;
mod runtime;
mod scripted;
mod tools;

pub use profile::WorkerProfile;
pub use runtime::{
    wait_for_run, ExecuteRequest, RunHandle, RunKind, RunSnapshot, RunStatus, Runtime,
    META_ATTEMPT, META_GOAL_ID, META_KIND, META_TASK_ID,
};
pub use scripted::{ScriptedReply, ScriptedRuntime};
pub use tools::{parse_tool_input, Tool, ToolContext, ToolDefinition, ToolSet};
