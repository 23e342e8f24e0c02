//! tidepool-api — REST API for Tidepool.
//!
//! Provides axum route handlers for submitting fetch-and-merge jobs,
//! checking request sizes, polling results and cancelling jobs.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/data/status` | Service liveness |
//! | POST | `/data/` | Submit a request; returns the (possibly shared) job id |
//! | POST | `/data/check` | Per-dataset and total size estimate |
//! | GET | `/data/job/{id}?version=` | Poll a job (`2.0` JSON, `2.1` MessagePack) |
//! | POST | `/data/job/{id}/cancel` | Cancel a job with `{"signal": ...}` |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use tidepool_jobs::JobManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobManager,
}

/// Build the complete API router.
pub fn build_router(jobs: JobManager) -> Router {
    let state = ApiState { jobs };

    Router::new()
        .route("/data/status", get(handlers::service_status))
        .route("/data", post(handlers::submit_job))
        .route("/data/", post(handlers::submit_job))
        .route("/data/check", post(handlers::check_request))
        .route("/data/job/{id}", get(handlers::poll_job))
        .route("/data/job/{id}/cancel", post(handlers::cancel_job))
        .with_state(state)
}
