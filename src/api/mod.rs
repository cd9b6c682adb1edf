//! HTTP API for the dispatch engine.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/tasks` - Create a task
//! - `GET /api/tasks?status=` - List tasks, optionally by status
//! - `GET /api/tasks/{id}` - Get a task
//! - `POST /api/tasks/{id}/subtasks` - Create a successor task
//! - `POST /api/tasks/{id}/status` - Owner reports Done or Quarantined
//! - `POST /api/tasks/{id}/failure` - Owner reports a failure
//! - `GET /api/tasks/{id}/best-worker` - Advisory worker ranking
//! - `POST /api/workers` - Register a worker
//! - `GET /api/workers` - List workers
//! - `GET /api/workers/{id}` - Get a worker
//! - `POST /api/workers/{id}/claim` - Claim the next task
//! - `POST /api/workers/{id}/heartbeat` - Refresh `last_seen`
//! - `POST /api/workers/{id}/active` - Activate or deactivate a worker
//! - `POST /api/resources` - Register a metered resource
//! - `GET /api/resources/{id}` - Get a resource
//! - `POST /api/resources/{id}/charge` - Single charge attempt
//! - `POST /api/resources/{id}/charge-chain` - Charge, following fallbacks
//! - `POST /api/resources/{id}/increase` - Administrative budget increase
//! - `POST /api/runs` - Start a workflow run
//! - `GET /api/runs/{id}` - Get a workflow run

mod routes;
pub mod types;

pub use routes::{build_dispatcher, router, serve, AppState};
pub use types::*;
