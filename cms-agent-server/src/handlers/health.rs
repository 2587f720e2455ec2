use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    /// Re-validate the published dataset file before answering.
    #[serde(default)]
    pub deep: bool,
}

/// Summary probe: 200 while ready, 503 otherwise. The body is returned in
/// both cases so operators can see why.
pub async fn health_handler(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> (StatusCode, Json<Value>) {
    let file = if query.deep {
        Some(match state.agent().validate_published().await {
            Ok(validation) => json!({
                "valid": validation.report.valid,
                "record_count": validation.report.record_count,
                "file_size_mb": validation.file_size_mb(),
            }),
            Err(err) => json!({ "valid": false, "error": err.to_string() }),
        })
    } else {
        None
    };

    let report = state.agent().health(Utc::now());
    let code = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let mut body = json!({
        "status": if report.ready { "healthy" } else { "unhealthy" },
        "record_count": report.record_count,
        "ready": report.ready,
        "live": report.live,
        "last_error": report.last_error,
        "state": report.state,
        "last_check": report.last_check,
        "data_valid": report.data_valid,
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    if let Some(file) = file {
        body["file"] = file;
    }
    (code, Json(body))
}

pub async fn live_handler() -> Json<Value> {
    Json(json!({ "live": true }))
}

pub async fn ready_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    let report = state.agent().health(Utc::now());
    let code = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "ready": report.ready, "state": report.state })))
}
