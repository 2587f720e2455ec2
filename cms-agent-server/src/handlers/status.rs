use axum::{Json, extract::State};
use chrono::Utc;
use cms_agent_core::{AgentStatus, Checkpoint};
use serde::Serialize;

use crate::{AppState, handlers::control::SettingsView};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub dataset_id: String,
    #[serde(flatten)]
    pub status: AgentStatus,
    pub data_age_hours: Option<f64>,
    pub uptime_seconds: i64,
    pub settings: SettingsView,
    pub checkpoint: Option<Checkpoint>,
}

pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let agent = state.agent();
    let snapshot = agent.status();
    let now = Utc::now();

    Json(StatusResponse {
        dataset_id: agent.dataset_id().to_string(),
        data_age_hours: snapshot.data_age_hours(now),
        uptime_seconds: snapshot.uptime(now).num_seconds(),
        status: AgentStatus::clone(&snapshot),
        settings: agent.settings().into(),
        checkpoint: agent.checkpoint(),
    })
}
