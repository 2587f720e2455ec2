use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use cms_agent_core::{OutcomeStatus, SchedulerState, ShutdownReport, scheduler};
use cms_agent_server::{create_app, infra::shutdown::drain_server};
use serde_json::{Value, json};
use tower::ServiceExt;

#[path = "support/mod.rs"]
mod support;

use support::build_test_app;

#[tokio::test]
async fn fresh_agent_reports_healthy() {
    let app = build_test_app(20).await.unwrap();

    let response = app.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["ready"], true);
    assert_eq!(body["live"], true);
    assert_eq!(body["record_count"], Value::Null);
    assert_eq!(body["last_error"], Value::Null);

    app.server.get("/health/ready").await.assert_status_ok();
}

#[tokio::test]
async fn stopped_scheduler_is_not_ready() {
    let app = build_test_app(20).await.unwrap();
    let handle = scheduler::spawn(app.agent().clone());
    assert_eq!(
        handle.shutdown(Duration::from_secs(5)).await,
        cms_agent_core::ShutdownReport::Clean
    );
    assert_eq!(app.agent().status().state, SchedulerState::Stopped);

    let response = app.server.get("/health").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["ready"], false);
    assert_eq!(body["live"], true);

    app.server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
    app.server.get("/health/live").await.assert_status_ok();
}

#[tokio::test]
async fn liveness_answers_through_plain_tower_service() {
    let app = build_test_app(20).await.unwrap();
    let router = create_app(app.state.clone());

    let response = router
        .oneshot(
            Request::builder()
                .uri("/health/live")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn check_reports_missing_checkpoint_as_stale() {
    let app = build_test_app(20).await.unwrap();

    let response = app.server.post("/api/v1/control/check").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["stale"], true);
    assert_eq!(body["freshness"], "stale");
    assert_eq!(app.provider.fetches(), 0);
}

#[tokio::test]
async fn update_publishes_and_status_reflects_it() {
    let app = build_test_app(20).await.unwrap();

    let response = app
        .server
        .post("/api/v1/control/update")
        .json(&json!({ "force": false }))
        .await;
    response.assert_status_ok();
    let outcome: Value = response.json();
    assert_eq!(outcome["status"], "updated");
    assert_eq!(outcome["checkpoint_after"]["record_count"], 20);
    assert_eq!(app.provider.fetches(), 1);

    let status: Value = app.server.get("/api/v1/status").await.json();
    assert_eq!(status["current_record_count"], 20);
    assert_eq!(status["data_valid"], true);
    assert_eq!(status["last_outcome"], "updated");
    assert_eq!(status["checkpoint"]["record_count"], 20);

    let legacy: Value = app.server.get("/status").await.json();
    assert_eq!(legacy["current_record_count"], 20);

    let again: Value = app.server.post("/api/v1/control/update").await.json();
    assert_eq!(again["status"], "up_to_date");
    assert_eq!(app.provider.fetches(), 1);
}

#[tokio::test]
async fn forced_update_fetches_even_when_fresh() {
    let app = build_test_app(20).await.unwrap();
    app.server.post("/api/v1/control/update").await.assert_status_ok();

    let outcome: Value = app
        .server
        .post("/api/v1/control/update")
        .json(&json!({ "force": true }))
        .await
        .json();
    assert_eq!(outcome["status"], "updated");
    assert_eq!(outcome["forced"], true);
    assert_eq!(app.provider.fetches(), 2);
}

#[tokio::test]
async fn too_few_records_are_invalid() {
    let app = build_test_app(3).await.unwrap();

    let outcome: Value = app.server.post("/api/v1/control/update").await.json();
    assert_eq!(outcome["status"], "invalid");

    let status: Value = app.server.get("/api/v1/status").await.json();
    assert!(status["last_error"].is_string());
    assert_eq!(status["checkpoint"], Value::Null);
}

#[tokio::test]
async fn validate_without_published_file_is_not_found() {
    let app = build_test_app(20).await.unwrap();

    let response = app.server.post("/api/v1/control/validate").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"]["status"], 404);
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("cms_full_dataset.json")
    );
}

#[tokio::test]
async fn validate_reports_published_file() {
    let app = build_test_app(20).await.unwrap();
    app.server.post("/api/v1/control/update").await.assert_status_ok();

    let response = app.server.post("/api/v1/control/validate").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["valid"], true);
    assert_eq!(body["record_count"], 20);
    assert!(body["file_size"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn deep_health_validates_published_file() {
    let app = build_test_app(20).await.unwrap();

    let body: Value = app.server.get("/health").await.json();
    assert!(body.get("file").is_none());

    let body: Value = app.server.get("/health?deep=true").await.json();
    assert_eq!(body["file"]["valid"], false);
    assert!(body["file"]["error"].is_string());

    app.server.post("/api/v1/control/update").await.assert_status_ok();
    let response = app.server.get("/health?deep=true").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["file"]["valid"], true);
    assert_eq!(body["file"]["record_count"], 20);
}

#[tokio::test]
async fn settings_patch_reschedules_and_rejects_bad_input() {
    let app = build_test_app(20).await.unwrap();

    let response = app
        .server
        .patch("/api/v1/control/settings")
        .json(&json!({ "poll_interval": "30m", "auto_update": true }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["poll_interval"], "30m");
    assert_eq!(body["poll_interval_secs"], 1800);
    assert_eq!(body["auto_update"], true);
    assert_eq!(
        app.agent().settings().poll_interval,
        Duration::from_secs(1800)
    );

    let zero = app
        .server
        .patch("/api/v1/control/settings")
        .json(&json!({ "poll_interval": "0s" }))
        .await;
    zero.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = zero.json();
    assert_eq!(body["error"]["status"], 400);

    app.server
        .patch("/api/v1/control/settings")
        .json(&json!({ "poll_interval": "soon" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let current: Value = app.server.get("/api/v1/control/settings").await.json();
    assert_eq!(current["poll_interval"], "30m");
}

#[tokio::test]
async fn metrics_are_exposed_as_text_and_json() {
    let app = build_test_app(20).await.unwrap();
    app.server.post("/api/v1/control/update").await.assert_status_ok();

    let response = app.server.get("/metrics").await;
    response.assert_status_ok();
    let content_type = response.header(header::CONTENT_TYPE);
    assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    let text = response.text();
    assert!(text.contains("cms_data_records 20\n"));
    assert!(text.contains("cms_data_valid 1\n"));
    assert!(text.contains("cms_agent_last_outcome{value=\"updated\"} 1"));

    let json: Value = app.server.get("/api/v1/metrics").await.json();
    assert_eq!(json["cms_data_records"], 20.0);
    assert_eq!(json["cms_agent_last_outcome"], "updated");
}

#[tokio::test]
async fn drain_past_grace_aborts_hung_manual_run() {
    let app = build_test_app(20).await.unwrap();
    app.provider.hang_fetches();

    let agent = app.agent().clone();
    let mut server = tokio::spawn(async move {
        agent.run(true).await;
        Ok::<(), std::io::Error>(())
    });
    while app.provider.fetches() == 0 {
        tokio::task::yield_now().await;
    }

    let report =
        drain_server(&mut server, app.agent(), Duration::from_millis(50)).await;
    assert_eq!(report, ShutdownReport::Unclean);

    let status = app.agent().status();
    assert_eq!(status.last_outcome, Some(OutcomeStatus::Failed));
    assert!(status.last_error.as_deref().unwrap().contains("abandoned"));
    assert!(app.agent().checkpoint().is_none());
}

#[tokio::test]
async fn idle_server_drains_cleanly() {
    let app = build_test_app(20).await.unwrap();
    let mut server = tokio::spawn(async { Ok::<(), std::io::Error>(()) });

    let report =
        drain_server(&mut server, app.agent(), Duration::from_secs(1)).await;
    assert_eq!(report, ShutdownReport::Clean);
    assert!(!app.agent().abort_token().is_cancelled());
}
