use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use cms_agent_core::{
    Freshness, Outcome, OutcomeStatus, ScheduleSettings, SettingsPatch,
    validation::FileValidation,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    AppState,
    infra::errors::{AppError, AppResult},
};

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub force: bool,
}

/// Runs the pipeline and returns its outcome. A run rejected because
/// another one holds the lock answers 409 with the `busy` outcome.
pub async fn update_handler(
    State(state): State<AppState>,
    request: Option<Json<UpdateRequest>>,
) -> (StatusCode, Json<Outcome>) {
    let force = request.map(|Json(body)| body.force).unwrap_or_default();
    info!(force, "update requested over http");

    let outcome = state.agent().run(force).await;
    let code = match outcome.status {
        OutcomeStatus::Busy => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    (code, Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub checked_at: DateTime<Utc>,
    pub stale: bool,
    #[serde(flatten)]
    pub freshness: Freshness,
}

pub async fn check_handler(State(state): State<AppState>) -> Json<CheckResponse> {
    let freshness = state.agent().check_for_updates().await;
    Json(CheckResponse {
        checked_at: Utc::now(),
        stale: freshness.is_stale(),
        freshness,
    })
}

pub async fn validate_handler(
    State(state): State<AppState>,
) -> AppResult<Json<FileValidation>> {
    let validation = state.agent().validate_published().await?;
    Ok(Json(validation))
}

/// Schedule as exposed over HTTP, with the interval in humantime form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsView {
    pub poll_interval: String,
    pub poll_interval_secs: u64,
    pub auto_update: bool,
}

impl From<ScheduleSettings> for SettingsView {
    fn from(settings: ScheduleSettings) -> Self {
        Self {
            poll_interval: humantime::format_duration(settings.poll_interval)
                .to_string(),
            poll_interval_secs: settings.poll_interval.as_secs(),
            auto_update: settings.auto_update,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsRequest {
    /// Humantime string such as `"30m"` or `"6h"`.
    pub poll_interval: Option<String>,
    pub auto_update: Option<bool>,
}

pub async fn get_settings_handler(
    State(state): State<AppState>,
) -> Json<SettingsView> {
    Json(state.agent().settings().into())
}

pub async fn patch_settings_handler(
    State(state): State<AppState>,
    Json(request): Json<SettingsRequest>,
) -> AppResult<Json<SettingsView>> {
    let poll_interval = request
        .poll_interval
        .as_deref()
        .map(|raw| {
            humantime::parse_duration(raw.trim()).map_err(|err| {
                AppError::bad_request(format!(
                    "invalid poll_interval `{raw}`: {err}"
                ))
            })
        })
        .transpose()?;

    let updated = state.agent().update_settings(SettingsPatch {
        poll_interval,
        auto_update: request.auto_update,
    })?;
    Ok(Json(updated.into()))
}
