use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tower::ServiceExt;

use dispatch_lite::broker::{BrokerSnapshot, Registry};
use dispatch_lite::dashboard::{router, DashboardState};
use dispatch_lite::protocol::JobRequest;

/// Registry with two workers on "queue", one of them busy, and one request
/// waiting on "render" which has no workers.
fn populated_snapshot() -> BrokerSnapshot {
    let now = Instant::now();
    let mut registry = Registry::new(Duration::from_secs(3), 16);
    registry.worker_ready(Bytes::from_static(b"w-1"), "queue".into(), "alpha".into(), now);
    registry.worker_ready(Bytes::from_static(b"w-2"), "queue".into(), "beta".into(), now);
    registry.client_request(
        Bytes::from_static(b"c-1"),
        "queue".into(),
        JobRequest::Execute {
            job_id: Bytes::from_static(b"42"),
            config: Bytes::from_static(b"{}"),
        },
    );
    registry.client_request(
        Bytes::from_static(b"c-1"),
        "render".into(),
        JobRequest::Execute {
            job_id: Bytes::from_static(b"43"),
            config: Bytes::from_static(b"{}"),
        },
    );
    registry.snapshot()
}

fn create_test_app(snapshot: BrokerSnapshot) -> (Router, watch::Sender<BrokerSnapshot>) {
    let (tx, rx) = watch::channel(snapshot);
    (router(DashboardState { snapshot: rx }), tx)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_on_empty_broker() {
    let (app, _tx) = create_test_app(BrokerSnapshot::empty());

    let (status, json) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["workers"], 0);
    assert_eq!(json["in_flight_jobs"], 0);
}

#[tokio::test]
async fn test_status_reports_whole_snapshot() {
    let (app, _tx) = create_test_app(populated_snapshot());

    let (status, json) = get_json(app, "/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["in_flight_jobs"], 1);
    assert_eq!(json["workers"].as_array().unwrap().len(), 2);
    assert_eq!(json["services"].as_array().unwrap().len(), 2);
    assert!(json["taken_at"].is_string());
}

#[tokio::test]
async fn test_workers_endpoint_shows_states() {
    let (app, _tx) = create_test_app(populated_snapshot());

    let (status, json) = get_json(app, "/api/workers").await;

    assert_eq!(status, StatusCode::OK);
    let workers = json.as_array().unwrap();
    let alpha = workers.iter().find(|w| w["name"] == "alpha").unwrap();
    let beta = workers.iter().find(|w| w["name"] == "beta").unwrap();

    // first READY worker takes the first request
    assert_eq!(alpha["state"], "busy");
    assert_eq!(alpha["job_id"], "42");
    assert_eq!(alpha["service"], "queue");
    assert_eq!(alpha["identity"], hex::encode("w-1"));
    assert_eq!(beta["state"], "ready");
    assert!(beta["job_id"].is_null());
}

#[tokio::test]
async fn test_services_endpoint_shows_backlog() {
    let (app, _tx) = create_test_app(populated_snapshot());

    let (status, json) = get_json(app, "/api/services").await;

    assert_eq!(status, StatusCode::OK);
    let services = json.as_array().unwrap();
    let queue = services.iter().find(|s| s["name"] == "queue").unwrap();
    let render = services.iter().find(|s| s["name"] == "render").unwrap();
    assert_eq!(queue["ready_workers"], 1);
    assert_eq!(queue["backlog"], 0);
    assert_eq!(render["ready_workers"], 0);
    assert_eq!(render["backlog"], 1);
}

#[tokio::test]
async fn test_dashboard_follows_published_snapshots() {
    let (app, tx) = create_test_app(BrokerSnapshot::empty());

    let (_, before) = get_json(app.clone(), "/health").await;
    assert_eq!(before["workers"], 0);

    tx.send(populated_snapshot()).unwrap();
    let (_, after) = get_json(app, "/health").await;
    assert_eq!(after["workers"], 2);
    assert_eq!(after["in_flight_jobs"], 1);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (app, _tx) = create_test_app(BrokerSnapshot::empty());

    let response = app
        .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_headers_present() {
    let (app, _tx) = create_test_app(BrokerSnapshot::empty());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("Origin", "http://example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key("access-control-allow-origin"));
}
