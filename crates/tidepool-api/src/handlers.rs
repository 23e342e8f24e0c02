//! REST API handlers.
//!
//! Each handler goes through `JobManager` and answers with the envelope
//! clients of the data service expect: `status` is `"success"` or
//! `"failed"` and `msg` carries a human-readable explanation.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tidepool_core::DataRequest;
use tidepool_jobs::{CancelOutcome, CancelSignal, JobError, JobView, ResolveError};
use tracing::{debug, warn};

use crate::ApiState;

/// Poll response version served when none is requested.
pub const DEFAULT_VERSION: &str = "2.0";
/// Poll response version encoded as MessagePack.
pub const MSGPACK_VERSION: &str = "2.1";
pub const MSGPACK_CONTENT_TYPE: &str = "application/x-msgpack";

/// HTTP status for a job error surfaced synchronously.
fn status_for(err: &JobError) -> StatusCode {
    match err {
        JobError::Request(_) | JobError::UnknownSignal(_) => StatusCode::BAD_REQUEST,
        JobError::Resolve(ResolveError::InvalidId(_)) => StatusCode::BAD_REQUEST,
        JobError::NotFound(_) | JobError::Resolve(ResolveError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_message(err: impl std::fmt::Display) -> String {
    format!("Error occured: {err}")
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub message: String,
}

/// GET /data/status
pub async fn service_status() -> impl IntoResponse {
    Json(ServiceStatus {
        status: "running".to_string(),
        message: "Data service is up.".to_string(),
    })
}

// ── Submission ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    pub job_uuid: Option<String>,
    pub result_url: Option<String>,
    pub msg: String,
}

impl SubmitResponse {
    fn failed(msg: String, status: StatusCode) -> Response {
        let body = Self {
            status: "failed".to_string(),
            job_uuid: None,
            result_url: None,
            msg,
        };
        (status, Json(body)).into_response()
    }
}

/// POST /data/
pub async fn submit_job(
    State(state): State<ApiState>,
    payload: Result<Json<DataRequest>, JsonRejection>,
) -> Response {
    let Json(data_request) = match payload {
        Ok(body) => body,
        Err(e) => return SubmitResponse::failed(error_message(e.body_text()), StatusCode::BAD_REQUEST),
    };
    let request = match data_request.to_fetch_request() {
        Ok(request) => request,
        Err(e) => return SubmitResponse::failed(error_message(e), StatusCode::BAD_REQUEST),
    };

    match state.jobs.submit(request) {
        Ok(submission) => {
            let id = submission.job_id;
            let msg = if submission.created {
                format!("Job {id} created.")
            } else {
                format!("Job {id} is already serving this request.")
            };
            let body = SubmitResponse {
                status: "success".to_string(),
                result_url: Some(format!("/data/job/{id}")),
                job_uuid: Some(id),
                msg,
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "job submission failed");
            SubmitResponse::failed(error_message(&e), status_for(&e))
        }
    }
}

// ── Size check ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataSize {
    pub total_size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: String,
    pub data_sizes: Option<std::collections::BTreeMap<String, DataSize>>,
    pub msg: String,
}

impl CheckResponse {
    fn failed(msg: String, status: StatusCode) -> Response {
        let body = Self {
            status: "failed".to_string(),
            data_sizes: None,
            msg,
        };
        (status, Json(body)).into_response()
    }
}

/// POST /data/check
///
/// The color axis is sized in place of `z`.
pub async fn check_request(
    State(state): State<ApiState>,
    payload: Result<Json<DataRequest>, JsonRejection>,
) -> Response {
    let Json(mut data_request) = match payload {
        Ok(body) => body,
        Err(e) => return CheckResponse::failed(error_message(e.body_text()), StatusCode::BAD_REQUEST),
    };
    data_request.z = std::mem::take(&mut data_request.color);
    let request = match data_request.to_fetch_request() {
        Ok(request) => request,
        Err(e) => return CheckResponse::failed(error_message(e), StatusCode::BAD_REQUEST),
    };

    match state.jobs.check_size(&request).await {
        Ok(report) => {
            let body = CheckResponse {
                status: "success".to_string(),
                msg: format!("Max data request: {}", report.human_total()),
                data_sizes: Some(
                    report
                        .data_sizes
                        .into_iter()
                        .map(|(id, total_size)| (id, DataSize { total_size }))
                        .collect(),
                ),
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(e) => {
            debug!(error = %e, "size check failed");
            CheckResponse::failed(error_message(&e), status_for(&e))
        }
    }
}

// ── Polling ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PollParams {
    pub version: Option<String>,
}

/// Body of a poll that could not be answered.
#[derive(Debug, Serialize)]
struct QueryFailure {
    status: &'static str,
    state: Option<()>,
    result: Option<()>,
    msg: String,
}

fn query_failure(msg: String) -> Response {
    let body = QueryFailure {
        status: "query-exception",
        state: None,
        result: None,
        msg: format!("Error occured during query: {msg}"),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// GET /data/job/{id}?version=
pub async fn poll_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<PollParams>,
) -> Response {
    let version = params.version.unwrap_or_else(|| DEFAULT_VERSION.to_string());
    if version != DEFAULT_VERSION && version != MSGPACK_VERSION {
        return (StatusCode::BAD_REQUEST, Json(format!("Version {version} is invalid"))).into_response();
    }

    let view: JobView = match state.jobs.status(&id) {
        Ok(view) => view,
        Err(e) => {
            warn!(job_id = %id, error = %e, "poll failed");
            return query_failure(e.to_string());
        }
    };

    if version == MSGPACK_VERSION {
        match rmp_serde::to_vec_named(&view) {
            Ok(bytes) => (StatusCode::OK, [(header::CONTENT_TYPE, MSGPACK_CONTENT_TYPE)], bytes).into_response(),
            Err(e) => query_failure(e.to_string()),
        }
    } else {
        (StatusCode::OK, Json(view)).into_response()
    }
}

// ── Cancellation ───────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelRequest {
    pub signal: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: String,
    pub signal: String,
    pub msg: String,
}

/// POST /data/job/{id}/cancel
pub async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> Response {
    let Json(CancelRequest { signal }) = match payload {
        Ok(body) => body,
        Err(e) => {
            let body = CancelResponse {
                status: "failed".to_string(),
                signal: String::new(),
                msg: error_message(e.body_text()),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    let outcome = signal
        .parse::<CancelSignal>()
        .and_then(|parsed| state.jobs.cancel(&id, parsed));
    match outcome {
        Ok(outcome) => {
            let body = CancelResponse {
                status: "success".to_string(),
                signal,
                msg: cancel_message(&id, outcome),
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(e) => {
            let status = status_for(&e);
            let body = CancelResponse {
                status: "failed".to_string(),
                signal,
                msg: error_message(&e),
            };
            (status, Json(body)).into_response()
        }
    }
}

/// A running job only stops at its next checkpoint and may finish first.
fn cancel_message(id: &str, outcome: CancelOutcome) -> String {
    match outcome {
        CancelOutcome::Requested => format!("Cancellation of job {id} requested."),
        CancelOutcome::Cancelled => format!("Job {id} successfully cancelled."),
        CancelOutcome::AlreadyFinished(job_state) => format!("Job {id} already {job_state}."),
    }
}
