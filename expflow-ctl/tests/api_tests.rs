//! Operator API Integration Tests
//!
//! Exercises the router in-process with `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use expflow_common::ControllerState;
use expflow_ctl::runner::InMemoryRunner;
use expflow_ctl::source::LocalSource;
use expflow_ctl::{build_router, AppState, ControllerOptions, FlowController};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_app() -> (Router, FlowController) {
    let source = LocalSource::from_json(r#"[{"name": "b1"}]"#, 2).unwrap();
    let runner = InMemoryRunner::new();
    let controller = FlowController::spawn(
        Arc::new(source),
        Arc::new(runner.clone()),
        ControllerOptions::default(),
    );
    let app = build_router(AppState::new(controller.clone(), runner));
    (app, controller)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_reports_state() {
    let (app, _controller) = test_app();

    let response = send(&app, "GET", "/health", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "expflow-ctl");
    assert_eq!(body["state"], "Uninitialized");
}

#[tokio::test]
async fn test_advance_then_status() {
    let (app, controller) = test_app();

    let response = send(&app, "POST", "/advance", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["outcome"], "requested");

    tokio::time::timeout(
        Duration::from_secs(5),
        controller.wait_for_state(ControllerState::ReadyForCalibration),
    )
    .await
    .unwrap()
    .unwrap();

    let response = send(&app, "GET", "/status", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["state"], "ReadyForCalibration");
    assert_eq!(body["participant_index"], 2);
    assert_eq!(body["pending_block"], "b1");
}

#[tokio::test]
async fn test_cancel_outside_block_reports_outcome() {
    let (app, _controller) = test_app();

    let response = send(&app, "POST", "/cancel", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["outcome"], "not_applicable");
    assert_eq!(body["state"], "Uninitialized");
}

#[tokio::test]
async fn test_goal_with_unknown_state_is_bad_request() {
    let (app, _controller) = test_app();

    let response = send(&app, "POST", "/goal", Some(json!({"state": "Dancing"}))).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_goal_is_accepted_and_driven() {
    let (app, controller) = test_app();

    let response = send(&app, "POST", "/goal", Some(json!({"state": "block_began"}))).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["target"], "BlockBegan");
    tokio::time::timeout(
        Duration::from_secs(5),
        controller.wait_for_state(ControllerState::BlockBegan),
    )
    .await
    .unwrap()
    .unwrap();

    // The participant finishes the only trial through the runner endpoints
    let response = send(&app, "POST", "/runner/end-trial", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["trial_number"], 1);
    assert_eq!(body["block_number"], 1);
}

#[tokio::test]
async fn test_end_trial_without_trial_is_conflict() {
    let (app, _controller) = test_app();

    let response = send(&app, "POST", "/runner/end-trial", None).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["error"]["code"], "RUNNER_CONFLICT");
}

#[tokio::test]
async fn test_calibration_complete_outside_calibration() {
    let (app, _controller) = test_app();

    let response = send(
        &app,
        "POST",
        "/calibration/complete",
        Some(json!({"parameters": {"gain": 1}})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["outcome"], "not_applicable");
}
