//! # troupe-core
//!
//! Core types for the Troupe orchestrator kernel.
//!
//! Troupe turns a natural-language goal into a plan of tasks, runs each task on a
//! role-specific worker and lets workers message each other through a leased
//! mailbox. This crate holds the pieces every other crate agrees on:
//!
//! - The data model (plans, tasks, task results, messages, runtime events)
//! - The unified error type
//! - Kernel configuration loaded from `.troupe/config.toml`
//! - A clock abstraction so time-dependent behavior is testable

pub mod clock;
pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KernelConfig, MailboxConfig, RoleTemplate};
pub use error::{Result, TroupeError};
pub use types::*;
