//! Control-plane surface tests: each endpoint drives the router directly
//! against the in-memory store and asserts the status-code mapping.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use conductor::api::{router, AppState};
use conductor::store::{JobState, JobStore, MemoryStore};

fn test_app() -> (Router, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let app = router(AppState {
        store: store.clone(),
    });
    (app, store)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec();

    (status, bytes)
}

async fn send_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn submit_job(app: &Router, payload: Value, max_attempts: i32) -> Uuid {
    let (status, body) = send_json(
        app,
        Method::POST,
        "/v1/jobs",
        Some(json!({
            "payload": payload,
            "max_attempts": max_attempts,
            "timeout_seconds": 5,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "PENDING");
    body["job_id"].as_str().unwrap().parse().unwrap()
}

async fn lease_one(app: &Router) -> Uuid {
    let (status, body) = send_json(
        app,
        Method::POST,
        "/internal/jobs/lease",
        Some(json!({
            "scheduler_id": Uuid::new_v4(),
            "lease_duration_seconds": 30,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["lease_expires_at"].is_string());
    body["job_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn submit_then_inspect_returns_the_payload_verbatim() {
    let (app, _store) = test_app();
    let job_id = submit_job(&app, json!({"x": 1}), 3).await;

    let (status, body) = send_json(&app, Method::GET, &format!("/v1/jobs/{job_id}"), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "PENDING");
    assert_eq!(body["payload"], json!({"x": 1}));
    assert_eq!(body["max_attempts"], 3);
    assert_eq!(body["current_attempt"], 0);
    assert!(body["last_error"].is_null());
}

#[tokio::test]
async fn submit_rejects_invalid_parameters() {
    let (app, _store) = test_app();

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/jobs",
        Some(json!({"payload": {}, "max_attempts": 0, "timeout_seconds": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/jobs",
        Some(json!({"payload": {}, "max_attempts": 1, "timeout_seconds": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Malformed body.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn inspect_maps_lookup_failures() {
    let (app, _store) = test_app();

    let (status, _) = send(&app, Method::GET, &format!("/v1/jobs/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::GET, "/v1/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_succeeds_then_conflicts() {
    let (app, store) = test_app();
    let job_id = submit_job(&app, json!({}), 1).await;

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/jobs/{job_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/jobs/{job_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
}

#[tokio::test]
async fn list_supports_state_filters() {
    let (app, _store) = test_app();
    let cancelled = submit_job(&app, json!({}), 1).await;
    submit_job(&app, json!({}), 1).await;
    send(
        &app,
        Method::POST,
        &format!("/v1/jobs/{cancelled}/cancel"),
        None,
    )
    .await;

    let (status, body) = send_json(&app, Method::GET, "/v1/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);

    let (status, body) = send_json(&app, Method::GET, "/v1/jobs?state=PENDING", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::GET, "/v1/jobs?state=BOGUS", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lease_endpoint_reports_no_work_with_no_content() {
    let (app, _store) = test_app();

    let (status, _) = send(
        &app,
        Method::POST,
        "/internal/jobs/lease",
        Some(json!({"scheduler_id": Uuid::new_v4(), "lease_duration_seconds": 30})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        Method::POST,
        "/internal/jobs/lease",
        Some(json!({"scheduler_id": Uuid::new_v4(), "lease_duration_seconds": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn internal_flow_drives_a_job_to_completion() {
    let (app, store) = test_app();
    let job_id = submit_job(&app, json!({"x": 1}), 3).await;

    let leased = lease_one(&app).await;
    assert_eq!(leased, job_id);

    let (status, body) = send_json(
        &app,
        Method::POST,
        &format!("/internal/jobs/{job_id}/start"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "RUNNING");

    let (status, body) = send_json(
        &app,
        Method::POST,
        &format!("/internal/jobs/{job_id}/complete"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "COMPLETED");

    // Completing twice is a conflict.
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/internal/jobs/{job_id}/complete"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert_eq!(store.lease_count(), 0);
}

#[tokio::test]
async fn fail_endpoint_applies_the_retry_policy() {
    let (app, _store) = test_app();
    let job_id = submit_job(&app, json!({}), 2).await;

    lease_one(&app).await;
    send(&app, Method::POST, &format!("/internal/jobs/{job_id}/start"), None).await;

    let (status, body) = send_json(
        &app,
        Method::POST,
        &format!("/internal/jobs/{job_id}/fail"),
        Some(json!({"error": "boom", "retryable": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "PENDING", "first failure is re-admitted");

    lease_one(&app).await;
    send(&app, Method::POST, &format!("/internal/jobs/{job_id}/start"), None).await;

    let (status, body) = send_json(
        &app,
        Method::POST,
        &format!("/internal/jobs/{job_id}/fail"),
        Some(json!({"error": "boom again", "retryable": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "FAILED", "budget spent");

    let (_, body) = send_json(&app, Method::GET, &format!("/v1/jobs/{job_id}"), None).await;
    assert_eq!(body["last_error"], "boom again");
    assert_eq!(body["current_attempt"], 1);
}

#[tokio::test]
async fn fail_endpoint_requires_an_error_message() {
    let (app, _store) = test_app();
    let job_id = submit_job(&app, json!({}), 1).await;

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/internal/jobs/{job_id}/fail"),
        Some(json!({"error": "", "retryable": false})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn recover_endpoint_accepts_asynchronously() {
    let (app, _store) = test_app();
    let (status, _) = send(&app, Method::POST, "/internal/jobs/recover", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn heartbeat_registers_the_worker() {
    let (app, store) = test_app();
    let worker_id = Uuid::new_v4();

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/internal/workers/{worker_id}/heartbeat"),
        Some(json!({"capacity": 4})),
    )
    .await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(store.worker_capacity(worker_id), Some(4));

    let (status, _) = send(&app, Method::POST, "/internal/workers/nope/heartbeat", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ops_endpoints_respond() {
    let (app, _store) = test_app();
    submit_job(&app, json!({}), 1).await;

    let (status, body) = send(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");

    let (status, _) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains(r#"conductor_jobs{state="PENDING"} 1"#));
    assert!(text.contains(r#"conductor_jobs{state="COMPLETED"} 0"#));
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let (app, _store) = test_app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.headers().contains_key("x-request-id"));
}
