//! # troupe-orchestrator
//!
//! Goal execution for Troupe.
//!
//! This crate provides:
//! - The [`Kernel`], which plans a goal, runs its tasks and summarizes them
//! - Dependency-aware task scheduling with bounded concurrency and retries
//! - Role resolution, creating workers on demand for roles nobody registered
//! - A leased, at-least-once [`Mailbox`] between workers and the tools that expose it
//! - An [`EventBus`] for lifecycle events

mod events;
mod kernel;
mod mailbox;
pub mod messaging_tools;
mod roles;
mod scheduler;

pub use events::{EventBus, Listener, Subscription};
pub use kernel::{Kernel, CONTROLLER_PROMPT};
pub use mailbox::{Mailbox, SendRequest, MAX_DELAY_MS};
pub use messaging_tools::{messaging_tools, MessagingTool, MESSAGING_TOOL_NAMES};
pub use roles::{dynamic_agent_id, RoleRegistry};
