use axum::{
    Json,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use cms_agent_core::{MetricValue, MetricsSnapshot};
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use crate::{AppState, infra::errors::AppError};

pub async fn prometheus_handler(
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let body = render_prometheus(&state.agent().metrics(Utc::now()))
        .map_err(|err| {
            AppError::internal(format!("failed to render metrics: {err}"))
        })?;
    let encoder = TextEncoder::new();
    Ok((
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        body,
    )
        .into_response())
}

pub async fn json_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.agent().metrics(Utc::now()))
}

/// Registers the snapshot in a fresh registry and encodes it. Numbers become
/// gauges; text values become a gauge fixed at 1 labelled with the value.
pub fn render_prometheus(
    metrics: &MetricsSnapshot,
) -> prometheus::Result<String> {
    let registry = Registry::new();
    for (name, value) in metrics {
        let opts = Opts::new(*name, help_for(name));
        match value {
            MetricValue::Number(number) => {
                let gauge = Gauge::with_opts(opts)?;
                gauge.set(*number);
                registry.register(Box::new(gauge))?;
            }
            MetricValue::Text(text) => {
                let gauge = GaugeVec::new(opts, &["value"])?;
                gauge.with_label_values(&[text.as_str()]).set(1.0);
                registry.register(Box::new(gauge))?;
            }
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|err| prometheus::Error::Msg(err.to_string()))
}

fn help_for(name: &str) -> String {
    match name {
        "cms_data_records" => "Records in the provider dataset at the last check".into(),
        "cms_data_previous_records" => "Record count before the last change".into(),
        "cms_data_age_hours" => "Hours since the published dataset was fetched".into(),
        "cms_data_valid" => "1 when the published dataset passed validation".into(),
        "cms_data_file_size_bytes" => "Size of the published dataset file in bytes".into(),
        "cms_data_file_size_mb" => "Size of the published dataset file in MiB".into(),
        "cms_agent_update_available" => "1 when the provider has newer data".into(),
        "cms_agent_uptime_seconds" => "Seconds since the agent started".into(),
        "cms_agent_last_check_timestamp" => "Unix time of the last freshness check".into(),
        "cms_agent_last_update_timestamp" => "Unix time of the last successful update".into(),
        "cms_agent_error" => "1 while the last operation left an error".into(),
        "cms_agent_anomaly" => "1 when the last update carried an anomaly".into(),
        "cms_agent_state" => "Scheduler state".into(),
        "cms_agent_last_outcome" => "Status of the last run".into(),
        "cms_agent_last_error" => "Last recorded error".into(),
        other => format!("CMS agent metric {other}"),
    }
}
