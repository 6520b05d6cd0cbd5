mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use calendar_dispatch::create_app;
use calendar_dispatch::handlers::AppState;
use common::{dispatch_config, start, MockAdapter, TestPipeline};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

fn app(pipeline: &TestPipeline) -> Router {
    create_app(Arc::new(AppState {
        router: pipeline.dispatcher.router(),
        health: pipeline.dispatcher.health_checker(),
        config: pipeline.dispatcher.config().clone(),
    }))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, payload)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete_body(event_id: &str) -> Value {
    json!({
        "tool_name": "delete_event",
        "arguments": {"calendar_id": "primary", "event_id": event_id}
    })
}

#[tokio::test]
async fn health_reports_memory_store() {
    let pipeline = start(dispatch_config(), MockAdapter::succeeding());
    let app = app(&pipeline);

    let (status, body) = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"]["idempotency_store"]["backend"], "memory");
    assert_eq!(body["queue"]["capacity"], 16);
    assert_eq!(body["queue"]["workers"], 2);
}

#[tokio::test]
async fn submit_wait_and_resubmit() {
    let pipeline = start(dispatch_config(), MockAdapter::succeeding());
    let app = app(&pipeline);

    let (status, submitted) = send(&app, post_json("/tools/call", delete_body("e1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(submitted["origin"], "enqueued");
    let key = submitted["key"].as_str().unwrap().to_string();
    assert!(key.starts_with("idem:"));

    let (status, waited) = send(&app, post_json(&format!("/jobs/{}/wait", key), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(waited["status"]["status"], "succeeded");
    assert_eq!(waited["status"]["value"], json!({"deleted": true}));

    let (status, again) = send(&app, post_json("/tools/call", delete_body("e1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["origin"], "cached");
    assert_eq!(again["key"], key);

    let (status, current) = send(
        &app,
        Request::builder()
            .uri(format!("/jobs/{}", key))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current["status"]["status"], "succeeded");
    assert_eq!(pipeline.adapter.calls(), 1);
}

#[tokio::test]
async fn invalid_call_is_rejected() {
    let pipeline = start(dispatch_config(), MockAdapter::succeeding());
    let app = app(&pipeline);

    let (status, body) = send(
        &app,
        post_json(
            "/tools/call",
            json!({"tool_name": "delete_event", "arguments": {"calendar_id": "primary"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = send(
        &app,
        post_json("/tools/call", json!({"tool_name": "send_email", "arguments": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(pipeline.adapter.calls(), 0);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let pipeline = start(dispatch_config(), MockAdapter::succeeding());
    let app = app(&pipeline);

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/jobs/idem:does-not-exist")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);

    let (status, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/jobs/idem:does-not-exist")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_queue_returns_retry_after() {
    let mut config = dispatch_config();
    config.queue_capacity = 1;
    config.worker_count = 0;
    let pipeline = start(config, MockAdapter::succeeding());
    let app = app(&pipeline);

    let (status, _) = send(&app, post_json("/tools/call", delete_body("a"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(post_json("/tools/call", delete_body("b")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get("retry-after").unwrap(), "1");
}

#[tokio::test]
async fn wait_with_timeout_reports_pending() {
    let mut config = dispatch_config();
    config.worker_count = 0;
    let pipeline = start(config, MockAdapter::succeeding());
    let app = app(&pipeline);

    let (_, submitted) = send(&app, post_json("/tools/call", delete_body("slow"))).await;
    let key = submitted["key"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        post_json(&format!("/jobs/{}/wait?timeout_ms=50", key), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"]["status"], "pending");

    let (status, body) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/jobs/{}", key))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);
}

#[tokio::test]
async fn config_endpoint_exposes_durations() {
    let pipeline = start(dispatch_config(), MockAdapter::succeeding());
    let app = app(&pipeline);

    let (status, body) = send(
        &app,
        Request::builder().uri("/config").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue_capacity"], 16);
    assert_eq!(body["retry"]["base_delay"], "500ms");
    assert_eq!(body["sweep_interval"], Value::Null);
}
