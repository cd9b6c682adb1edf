//! Task module - task rows, their state machine, and capability matching.
//!
//! - All status changes go through the closed transition table on `TaskStatus`
//! - Matching is a pure function so every store claims with the same rule

pub mod capability;
pub mod task;

pub use capability::{coverage, matches, rank_workers, WorkerFit};
pub use task::{NewTask, Priority, Task, TaskStatus, DEFAULT_MAX_RETRIES};
