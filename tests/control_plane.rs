mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use recsys_worker::app::{ComponentRegistry, build_router};
use recsys_worker::observability::Telemetry;
use recsys_worker::streaming::InMemoryCorrectionSource;

use common::{FeatureRepo, NUM_USERS, pipeline};

fn router(repo: &FeatureRepo) -> Router {
    let telemetry = Telemetry::without_tracing().expect("telemetry");
    let orchestrator = pipeline(
        repo,
        repo.store(),
        Arc::new(InMemoryCorrectionSource::new()),
        telemetry.metrics(),
    );
    build_router(ComponentRegistry::new(telemetry, orchestrator))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::get(uri).body(Body::empty()).expect("request builds");
    let response = app.clone().oneshot(request).await.expect("request succeeds");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    (status, body.to_vec())
}

#[tokio::test]
async fn probes_report_live_and_ready() {
    let repo = FeatureRepo::new();
    let app = router(&repo);

    let (status, body) = get(&app, "/health/live").await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&body).expect("valid json");
    assert_eq!(payload["status"], "live");

    let (status, body) = get(&app, "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    let payload: Value = serde_json::from_slice(&body).expect("valid json");
    assert_eq!(payload["status"], "ready");
    assert_eq!(payload["running_runs"], 0);
}

#[tokio::test]
async fn readiness_degrades_without_a_registry() {
    let repo = FeatureRepo::new();
    let app = router(&repo);
    std::fs::remove_file(repo.path().join("registry.yaml")).expect("registry removed");

    let (status, body) = get(&app, "/health/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let payload: Value = serde_json::from_slice(&body).expect("valid json");
    assert_eq!(payload["status"], "degraded");
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let repo = FeatureRepo::new();
    let app = router(&repo);
    let (status, _) = get(&app, &format!("/v1/runs/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn triggered_run_completes_and_is_reported() {
    let repo = FeatureRepo::new();
    let app = router(&repo);

    let request = Request::post("/v1/runs").body(Body::empty()).expect("request builds");
    let response = app.clone().oneshot(request).await.expect("request succeeds");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let payload: Value = serde_json::from_slice(&body).expect("valid json");
    assert_eq!(payload["status"], "accepted");
    let run_id = payload["run_id"].as_str().expect("run id").to_string();

    let mut record = Value::Null;
    for _ in 0..200 {
        let (status, body) = get(&app, &format!("/v1/runs/{run_id}")).await;
        assert_eq!(status, StatusCode::OK);
        record = serde_json::from_slice(&body).expect("valid json");
        if record["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(record["status"], "succeeded", "{record}");
    assert_eq!(record["summary"]["users_embedded"], NUM_USERS);

    let (status, body) = get(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let rendered = String::from_utf8(body).expect("utf8 metrics");
    assert!(rendered.contains("recsys_runs_completed_total 1"));
    assert!(rendered.contains("recsys_stage_duration_seconds_count{stage=\"train_model\"} 1"));
}

#[tokio::test]
async fn overlapping_trigger_is_refused() {
    let repo = FeatureRepo::new();
    let app = router(&repo);

    let trigger = || Request::post("/v1/runs").body(Body::empty()).expect("request builds");
    let first = app.clone().oneshot(trigger()).await.expect("request succeeds");
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let body = axum::body::to_bytes(first.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let payload: Value = serde_json::from_slice(&body).expect("valid json");
    let run_id = payload["run_id"].as_str().expect("run id").to_string();

    let second = app.clone().oneshot(trigger()).await.expect("request succeeds");
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body = axum::body::to_bytes(second.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let payload: Value = serde_json::from_slice(&body).expect("valid json");
    assert!(payload["error"].as_str().expect("error").contains(&run_id));

    for _ in 0..200 {
        let (_, body) = get(&app, &format!("/v1/runs/{run_id}")).await;
        let record: Value = serde_json::from_slice(&body).expect("valid json");
        if record["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let third = app.clone().oneshot(trigger()).await.expect("request succeeds");
    assert_eq!(third.status(), StatusCode::ACCEPTED);
}
