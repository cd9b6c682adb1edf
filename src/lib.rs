//! # agent-dispatch
//!
//! Task orchestration and budget-gated dispatch for pools of agent workers.
//!
//! This library provides:
//! - A priority queue of tasks claimed atomically by capability-matched workers
//! - Per-resource spend ledgers with suspension and fallback substitution
//! - Failure accounting with re-queue, backoff and quarantine
//! - Workflow runs that close once every member task is terminal
//! - An HTTP API over all of the above
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API (axum)
//!        │
//!        ▼
//!   ┌────────────┐   events    ┌──────────┐
//!   │ Dispatcher │ ──────────► │ EventBus │
//!   │  (facade)  │ ──────────► │ TaskQueue│ (optional)
//!   └─────┬──────┘             └──────────┘
//!         │ one transaction per operation
//!         ▼
//!   ┌───────────────┐
//!   │ DispatchStore │  memory (row locks, skip-locked claims)
//!   │               │  sqlite (BEGIN IMMEDIATE)
//!   └───────────────┘
//! ```
//!
//! ## Modules
//! - `task`: task rows, the status state machine, capability matching
//! - `budget`: resource ledger and retry policy
//! - `store`: storage backends
//! - `dispatch`: the facade callers use

pub mod api;
pub mod budget;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod ids;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;
pub mod workflow;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use error::{DispatchError, Result};
