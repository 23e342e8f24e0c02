//! Router-level tests: requests go through the full axum stack.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tidepool_api::build_router;
use tidepool_core::{Dataset, TidepoolConfig};
use tidepool_jobs::{JobContext, JobManager, MemoryCatalog};
use tidepool_pool::{InProcessProvisioner, PoolController};
use tidepool_state::StateStore;
use tower::ServiceExt;

fn test_router() -> Router {
    let config = TidepoolConfig::default();
    let catalog = MemoryCatalog::new();
    for (name, var, offset) in [("ctd", "temperature", 0), ("optode", "oxygen", 5)] {
        let time = (0..20).map(|i| (offset + i) * 1_000).collect();
        let values = (0..20).map(|i| f64::from(i) * 0.5).collect();
        catalog.insert(Dataset::new(name, time).with_variable(var, values).unwrap());
    }
    let ctx = JobContext::from_config(
        &config,
        StateStore::open_in_memory().unwrap(),
        Arc::new(catalog),
        PoolController::new(Arc::new(InProcessProvisioner::new(2)), Duration::from_secs(5)),
    )
    .unwrap();
    build_router(JobManager::new(ctx, &config.jobs))
}

fn submission(refs: &str) -> Value {
    json!({
        "ref": refs,
        "x": "time",
        "y": "temperature",
        "z": "",
        "color": "oxygen",
        "start_dt": "1970-01-01T00:00:00",
        "end_dt": "1970-01-01T00:00:19"
    })
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn body_json(resp: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

async fn poll_until_done(router: &Router, url: &str) -> Value {
    for _ in 0..500 {
        let resp = router.clone().oneshot(get(url)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        if !matches!(body["status"].as_str(), Some("pending" | "running")) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job at {url} never finished");
}

#[tokio::test]
async fn status_endpoint() {
    let resp = test_router().oneshot(get("/data/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await,
        json!({"status": "running", "message": "Data service is up."})
    );
}

#[tokio::test]
async fn submit_poll_and_cancel_lifecycle() {
    let router = test_router();

    let resp = router
        .clone()
        .oneshot(post("/data/", &submission("ctd,optode")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = body_json(resp).await;
    let id = body["job_uuid"].as_str().unwrap().to_string();
    let url = body["result_url"].as_str().unwrap().to_string();
    assert_eq!(url, format!("/data/job/{id}"));

    let done = poll_until_done(&router, &url).await;
    assert_eq!(done["status"], "success", "{done}");
    assert_eq!(done["state"], "succeeded");
    assert_eq!(done["result"]["count"], 20);
    assert_eq!(done["result"]["shaded"], false);
    assert_eq!(done["result"]["z"].as_array().unwrap().len(), 20);

    let resp = router
        .clone()
        .oneshot(post(&format!("{url}/cancel"), &json!({"signal": "SIGTERM"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = body_json(resp).await;
    assert_eq!(body["msg"], format!("Job {id} already succeeded."));

    // Finished jobs stay readable.
    let again = poll_until_done(&router, &url).await;
    assert_eq!(again, done);
}

#[tokio::test]
async fn reordered_submission_reuses_job() {
    let router = test_router();

    let first = body_json(
        router
            .clone()
            .oneshot(post("/data/", &submission("ctd,optode")))
            .await
            .unwrap(),
    )
    .await;
    let second = body_json(
        router
            .clone()
            .oneshot(post("/data", &submission("optode, ctd,ctd")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(first["job_uuid"], second["job_uuid"]);
}

#[tokio::test]
async fn poll_as_msgpack() {
    let router = test_router();
    let resp = router
        .oneshot(get("/data/job/unknown-id?version=2.1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/x-msgpack");

    let decoded: Value = rmp_serde::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(decoded["status"], "pending");
    assert_eq!(decoded["msg"], "Job unknown-id has not started.");
}

#[tokio::test]
async fn invalid_version_is_rejected() {
    let resp = test_router()
        .oneshot(get("/data/job/unknown-id?version=1.9"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_submission_is_rejected() {
    let resp = test_router()
        .oneshot(post("/data/", &json!({"ref": "ctd"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "failed");
    assert!(body["job_uuid"].is_null());
    assert!(body["result_url"].is_null());
}

#[tokio::test]
async fn check_sizes_each_dataset() {
    let resp = test_router()
        .oneshot(post("/data/check", &submission("ctd,optode")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = body_json(resp).await;
    // time + one projected variable, 20 samples each
    assert_eq!(body["data_sizes"]["ctd"]["total_size"], 320);
    assert_eq!(body["data_sizes"]["optode"]["total_size"], 320);
    assert_eq!(body["msg"], "Max data request: 640 B");
}

#[tokio::test]
async fn cancel_with_bad_signal() {
    let resp = test_router()
        .oneshot(post("/data/job/whatever/cancel", &json!({"signal": "SIGSTOP"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
