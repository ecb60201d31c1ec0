//! Maestro gateway — the HTTP control plane of the plan orchestrator.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/plan` | Create a plan and release its first step |
//! | `GET`  | `/plan/{id}/events` | History replay (JSON) or live SSE |
//! | `POST` | `/plan/{id}/steps/{step_id}/approve` | Approve a held step |
//! | `POST` | `/plan/{id}/steps/{step_id}/reject` | Reject a held step |
//! | `POST` | `/chat` | Route a chat request to the configured provider |
//! | `GET`  | `/healthz` | Liveness probe |
//! | `GET`  | `/readyz` | Readiness with queue status |
//! | `GET`  | `/metrics` | Prometheus text exposition |

pub mod backend;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod sse;
pub mod state;
pub mod validate;

pub use error::{ApiError, ApiResult};
pub use server::{build_router, serve};
pub use state::AppState;
